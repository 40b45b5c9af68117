use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};

use super::{DeviceStore, StoreError};
use crate::models::{ConnectionConfig, ConnectionState, MeterReading, ParameterRecord, ParameterValue, ValueFormat};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    config JSON NOT NULL
);

CREATE TABLE IF NOT EXISTS parameters (
    device_id TEXT NOT NULL,
    name TEXT NOT NULL,
    value_kind TEXT NOT NULL,
    value JSON NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (device_id, name)
);

CREATE TABLE IF NOT EXISTS connection_states (
    device_id TEXT PRIMARY KEY,
    connected BOOLEAN NOT NULL,
    last_connected TEXT,
    last_disconnected TEXT,
    last_keep_alive TEXT,
    reconnect_attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS meter_readings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    device_id TEXT NOT NULL,
    meter_type TEXT NOT NULL,
    meter_index INTEGER NOT NULL,
    level REAL NOT NULL,
    recorded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_meter_readings_device ON meter_readings(device_id, recorded_at);
"#;

/// SQLite backed store, one connection guarded by a mutex
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
        ",
        )?;
        conn.execute_batch(SCHEMA)?;
        Ok(SqliteStore { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn value_columns(value: &ParameterValue) -> (&'static str, String) {
    (value.format().key(), value.to_json().to_string())
}

fn value_from_columns(kind: &str, raw: &str) -> Result<ParameterValue, StoreError> {
    let json: serde_json::Value = serde_json::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let format = ValueFormat::from_str(kind).ok_or_else(|| StoreError::Corrupt(format!("value kind {kind}")))?;
    match (format, json) {
        (ValueFormat::Value, serde_json::Value::Number(n)) => n.as_f64().map(ParameterValue::Value),
        (ValueFormat::Percentage, serde_json::Value::Number(n)) => n.as_f64().map(ParameterValue::Percentage),
        (ValueFormat::Text, serde_json::Value::String(s)) => Some(ParameterValue::Text(s)),
        _ => None,
    }
    .ok_or_else(|| StoreError::Corrupt(format!("{kind} value {raw}")))
}

impl DeviceStore for SqliteStore {
    fn upsert_parameter(&self, record: &ParameterRecord) -> Result<(), StoreError> {
        let (kind, value) = value_columns(&record.value);
        self.conn()?.execute(
            "INSERT INTO parameters (device_id, name, value_kind, value, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(device_id, name) DO UPDATE SET
                value_kind = excluded.value_kind,
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![record.device_id, record.name, kind, value, record.updated_at],
        )?;
        Ok(())
    }

    fn parameter(&self, device_id: &str, name: &str) -> Result<Option<ParameterRecord>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT value_kind, value, updated_at FROM parameters WHERE device_id = ?1 AND name = ?2",
                params![device_id, name],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, DateTime<Utc>>(2)?)),
            )
            .optional()?;

        match row {
            Some((kind, raw, updated_at)) => Ok(Some(ParameterRecord {
                device_id: device_id.to_string(),
                name: name.to_string(),
                value: value_from_columns(&kind, &raw)?,
                updated_at,
            })),
            None => Ok(None),
        }
    }

    fn upsert_connection_state(&self, state: &ConnectionState) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO connection_states
                (device_id, connected, last_connected, last_disconnected, last_keep_alive, reconnect_attempts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(device_id) DO UPDATE SET
                connected = excluded.connected,
                last_connected = excluded.last_connected,
                last_disconnected = excluded.last_disconnected,
                last_keep_alive = excluded.last_keep_alive,
                reconnect_attempts = excluded.reconnect_attempts",
            params![
                state.device_id,
                state.connected,
                state.last_connected,
                state.last_disconnected,
                state.last_keep_alive,
                state.reconnect_attempts
            ],
        )?;
        Ok(())
    }

    fn connection_state(&self, device_id: &str) -> Result<Option<ConnectionState>, StoreError> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT connected, last_connected, last_disconnected, last_keep_alive, reconnect_attempts
                 FROM connection_states WHERE device_id = ?1",
                [device_id],
                |row| {
                    Ok(ConnectionState {
                        device_id: device_id.to_string(),
                        connected: row.get(0)?,
                        last_connected: row.get(1)?,
                        last_disconnected: row.get(2)?,
                        last_keep_alive: row.get(3)?,
                        reconnect_attempts: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    fn append_meter_reading(&self, reading: &MeterReading, cap: usize) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO meter_readings (device_id, meter_type, meter_index, level, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![reading.device_id, reading.meter_type, reading.index, reading.level, reading.recorded_at],
        )?;
        let pruned = tx.execute(
            "DELETE FROM meter_readings WHERE device_id = ?1 AND id NOT IN (
                SELECT id FROM meter_readings WHERE device_id = ?1
                ORDER BY recorded_at DESC, id DESC LIMIT ?2
             )",
            params![reading.device_id, cap as i64],
        )?;
        tx.commit()?;

        if pruned > 0 {
            debug!("Pruned {} old meter readings of {}", pruned, reading.device_id);
        }
        Ok(())
    }

    fn meter_readings(&self, device_id: &str) -> Result<Vec<MeterReading>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT meter_type, meter_index, level, recorded_at FROM meter_readings
             WHERE device_id = ?1 ORDER BY recorded_at DESC, id DESC",
        )?;
        let rows = stmt.query_map([device_id], |row| {
            Ok(MeterReading {
                device_id: device_id.to_string(),
                meter_type: row.get(0)?,
                index: row.get(1)?,
                level: row.get(2)?,
                recorded_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn upsert_device(&self, config: &ConnectionConfig) -> Result<(), StoreError> {
        let json = serde_json::to_string(config).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.conn()?.execute(
            "INSERT INTO devices (device_id, config) VALUES (?1, ?2)
             ON CONFLICT(device_id) DO UPDATE SET config = excluded.config",
            params![config.device_id, json],
        )?;
        Ok(())
    }

    fn device(&self, device_id: &str) -> Result<Option<ConnectionConfig>, StoreError> {
        let conn = self.conn()?;
        let raw: Option<String> = conn
            .query_row("SELECT config FROM devices WHERE device_id = ?1", [device_id], |row| row.get(0))
            .optional()?;
        match raw {
            Some(raw) => serde_json::from_str(&raw).map(Some).map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }
}
