//! Control-plane client for networked audio processors
//!
//! Keeps a JSON-RPC control channel and a UDP metering feed open per device,
//! matches responses to requests and stores what the devices report.

pub mod config;
pub mod db;
pub mod metering;
pub mod models;
pub mod protocol;
pub mod registry;
pub mod session;

// Re-export common types for easier access
pub use config::{Config, SessionConfig};
pub use db::{open_store, DeviceStore, PersistenceManager, StoreWrite};
pub use models::{ConnectionConfig, ConnectionStatus, MeterReading, ParameterRecord, ParameterValue, ValueFormat};
pub use protocol::Command;
pub use registry::SessionManager;
pub use session::{DeviceConnection, DeviceError, DeviceEvent};
