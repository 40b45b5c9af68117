use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use super::{DeviceStore, StoreError};
use crate::models::{ConnectionConfig, ConnectionState, MeterReading, ParameterRecord};

#[derive(Default)]
struct Tables {
    parameters: HashMap<(String, String), ParameterRecord>,
    states: HashMap<String, ConnectionState>,
    /* oldest reading at the front */
    readings: HashMap<String, VecDeque<MeterReading>>,
    devices: HashMap<String, ConnectionConfig>,
}

/// Volatile store, used for tests and for setups without a database
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        self.tables.lock().map_err(|_| StoreError::Poisoned)
    }
}

impl DeviceStore for MemoryStore {
    fn upsert_parameter(&self, record: &ParameterRecord) -> Result<(), StoreError> {
        let key = (record.device_id.clone(), record.name.clone());
        self.lock()?.parameters.insert(key, record.clone());
        Ok(())
    }

    fn parameter(&self, device_id: &str, name: &str) -> Result<Option<ParameterRecord>, StoreError> {
        let key = (device_id.to_string(), name.to_string());
        Ok(self.lock()?.parameters.get(&key).cloned())
    }

    fn upsert_connection_state(&self, state: &ConnectionState) -> Result<(), StoreError> {
        self.lock()?.states.insert(state.device_id.clone(), state.clone());
        Ok(())
    }

    fn connection_state(&self, device_id: &str) -> Result<Option<ConnectionState>, StoreError> {
        Ok(self.lock()?.states.get(device_id).cloned())
    }

    fn append_meter_reading(&self, reading: &MeterReading, cap: usize) -> Result<(), StoreError> {
        let mut tables = self.lock()?;
        let history = tables.readings.entry(reading.device_id.clone()).or_default();

        /* keep the history sorted by time, equal timestamps in arrival order */
        let pos = history.partition_point(|r| r.recorded_at <= reading.recorded_at);
        history.insert(pos, reading.clone());

        while history.len() > cap {
            history.pop_front();
        }
        Ok(())
    }

    fn meter_readings(&self, device_id: &str) -> Result<Vec<MeterReading>, StoreError> {
        let tables = self.lock()?;
        Ok(tables
            .readings
            .get(device_id)
            .map(|h| h.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn upsert_device(&self, config: &ConnectionConfig) -> Result<(), StoreError> {
        self.lock()?.devices.insert(config.device_id.clone(), config.clone());
        Ok(())
    }

    fn device(&self, device_id: &str) -> Result<Option<ConnectionConfig>, StoreError> {
        Ok(self.lock()?.devices.get(device_id).cloned())
    }
}
