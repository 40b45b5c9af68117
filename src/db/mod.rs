use std::sync::Arc;

use log::{debug, error, info};
use thiserror::Error;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::config::DatabaseConfig;
use crate::models::{ConnectionConfig, ConnectionState, MeterReading, ParameterRecord};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[cfg(feature = "sqlite")]
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("unsupported database type {0}")]
    UnsupportedType(String),
}

/// Durable storage the links write their state into.
///
/// Everything is keyed by device id; parameters additionally by name.
pub trait DeviceStore: Send + Sync {
    fn upsert_parameter(&self, record: &ParameterRecord) -> Result<(), StoreError>;
    fn parameter(&self, device_id: &str, name: &str) -> Result<Option<ParameterRecord>, StoreError>;

    fn upsert_connection_state(&self, state: &ConnectionState) -> Result<(), StoreError>;
    fn connection_state(&self, device_id: &str) -> Result<Option<ConnectionState>, StoreError>;

    /// Append a reading and prune the device history down to the `cap`
    /// most recent readings.
    fn append_meter_reading(&self, reading: &MeterReading, cap: usize) -> Result<(), StoreError>;
    /// Readings of one device, most recent first
    fn meter_readings(&self, device_id: &str) -> Result<Vec<MeterReading>, StoreError>;

    fn upsert_device(&self, config: &ConnectionConfig) -> Result<(), StoreError>;
    fn device(&self, device_id: &str) -> Result<Option<ConnectionConfig>, StoreError>;
}

/// Open the store named by the configuration
pub fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn DeviceStore>, StoreError> {
    match config.dbtype.as_str() {
        "memory" => {
            info!("Using in-memory store, nothing survives a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            info!("Using sqlite store at {}", config.uri);
            Ok(Arc::new(SqliteStore::open(&config.uri)?))
        }
        other => Err(StoreError::UnsupportedType(other.to_string())),
    }
}

/// Writes queued by the links, applied in order by the persistence task
#[derive(Debug, Clone)]
pub enum StoreWrite {
    Parameter(ParameterRecord),
    ConnectionState(ConnectionState),
    MeterReading { reading: MeterReading, cap: usize },
}

/// PersistenceManager drains the write queue into a [`DeviceStore`]
pub struct PersistenceManager {
    store: Arc<dyn DeviceStore>,
    rx: Receiver<StoreWrite>,
}

impl PersistenceManager {
    pub fn new(store: Arc<dyn DeviceStore>) -> (Self, Sender<StoreWrite>) {
        let (tx, rx) = mpsc::channel(1024);
        return (PersistenceManager { store, rx }, tx);
    }

    /// Runs until every sender is gone. Store calls block, so the loop lives
    /// on the blocking pool.
    pub async fn start_thread(self) {
        info!("Persistence thread started");
        let result = tokio::task::spawn_blocking(move || self.run_blocking()).await;
        if let Err(e) = result {
            error!("Persistence thread died: {e:?}");
        }
    }

    fn run_blocking(mut self) {
        while let Some(write) = self.rx.blocking_recv() {
            if let Err(e) = apply(self.store.as_ref(), &write) {
                error!("Failed to persist {write:?}: {e}");
            }
        }
        info!("All writers gone, persistence thread exits");
    }
}

pub fn apply(store: &dyn DeviceStore, write: &StoreWrite) -> Result<(), StoreError> {
    match write {
        StoreWrite::Parameter(record) => {
            debug!("Storing parameter {} of {}", record.name, record.device_id);
            store.upsert_parameter(record)
        }
        StoreWrite::ConnectionState(state) => store.upsert_connection_state(state),
        StoreWrite::MeterReading { reading, cap } => store.append_meter_reading(reading, *cap),
    }
}
