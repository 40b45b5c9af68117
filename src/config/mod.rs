use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::ConnectionConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no config found, tried {0}")]
    NotFound(String),
    #[error("unable to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn db_dbtype_default() -> String { return "sqlite".to_string() }
fn db_uri_default() -> String { return "dsplink.db".to_string() }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct DatabaseConfig {
    #[serde(default="db_dbtype_default")]
    pub dbtype: String,
    #[serde(default="db_uri_default")]
    pub uri: String,
}

fn connect_timeout_ms_default() -> u64 { return 5_000 }
fn command_timeout_ms_default() -> u64 { return 5_000 }
fn keep_alive_interval_secs_default() -> u64 { return 240 }
fn reconnect_base_delay_ms_default() -> u64 { return 5_000 }
fn reconnect_max_delay_ms_default() -> u64 { return 60_000 }
fn max_reconnect_attempts_default() -> u32 { return 10 }
fn meter_history_limit_default() -> usize { return 500 }
fn keep_alive_param_default() -> String { return "KeepAlive".to_string() }

/// Timing and retention knobs shared by every device link
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct SessionConfig {
    #[serde(default="connect_timeout_ms_default")]
    pub connect_timeout_ms: u64,
    #[serde(default="command_timeout_ms_default")]
    pub command_timeout_ms: u64,
    #[serde(default="keep_alive_interval_secs_default")]
    pub keep_alive_interval_secs: u64,
    #[serde(default="reconnect_base_delay_ms_default")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default="reconnect_max_delay_ms_default")]
    pub reconnect_max_delay_ms: u64,
    #[serde(default="max_reconnect_attempts_default")]
    pub max_reconnect_attempts: u32,
    /// Meter readings kept per device
    #[serde(default="meter_history_limit_default")]
    pub meter_history_limit: usize,
    /// Parameter polled by the keep-alive
    #[serde(default="keep_alive_param_default")]
    pub keep_alive_param: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout_ms: connect_timeout_ms_default(),
            command_timeout_ms: command_timeout_ms_default(),
            keep_alive_interval_secs: keep_alive_interval_secs_default(),
            reconnect_base_delay_ms: reconnect_base_delay_ms_default(),
            reconnect_max_delay_ms: reconnect_max_delay_ms_default(),
            max_reconnect_attempts: max_reconnect_attempts_default(),
            meter_history_limit: meter_history_limit_default(),
            keep_alive_param: keep_alive_param_default(),
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }
}

fn db_default() -> DatabaseConfig { return DatabaseConfig { dbtype: db_dbtype_default(), uri: db_uri_default() }}
fn devices_default() -> Vec<ConnectionConfig> { return Vec::new(); }

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
pub struct Config {
    #[serde(default="db_default")]
    pub db: DatabaseConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default="devices_default")]
    pub devices: Vec<ConnectionConfig>,
}

const CONFIG_CANDIDATES: [&str; 2] = ["config/dsplink.yaml", "dsplink.yaml"];

impl Config {
    /// Load the config from `DSPLINK_CONFIG`, `config/dsplink.yaml` or
    /// `dsplink.yaml`, first one found wins
    pub fn load() -> Result<Self, ConfigError> {
        let candidates: Vec<PathBuf> = match std::env::var("DSPLINK_CONFIG") {
            Ok(path) => vec![PathBuf::from(path)],
            Err(_) => CONFIG_CANDIDATES.iter().map(PathBuf::from).collect(),
        };

        for path in candidates.iter() {
            if path.exists() {
                return Self::load_from(path);
            }
            debug!("No config at {}", path.display());
        }

        let tried: Vec<String> = candidates.iter().map(|p| p.display().to_string()).collect();
        Err(ConfigError::NotFound(tried.join(", ")))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let config = Self::from_yaml(&contents)?;
        info!("Loaded config {} with {} devices", path.display(), config.devices.len());
        Ok(config)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let mut udp_ports = HashMap::new();
        for device in self.devices.iter() {
            if device.device_id.is_empty() {
                return Err(ConfigError::Invalid("device without device_id".to_string()));
            }
            if !seen.insert(device.device_id.as_str()) {
                return Err(ConfigError::Invalid(format!("device {} configured twice", device.device_id)));
            }
            /* port 0 picks a free port on bind and never collides */
            if device.metering_enabled && device.udp_port != 0 {
                if let Some(other) = udp_ports.insert(device.udp_port, device.device_id.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "devices {} and {} both meter on udp port {}",
                        other, device.device_id, device.udp_port
                    )));
                }
            }
        }

        if self.session.meter_history_limit == 0 {
            return Err(ConfigError::Invalid("meter_history_limit must be at least 1".to_string()));
        }
        if self.session.reconnect_max_delay_ms < self.session.reconnect_base_delay_ms {
            return Err(ConfigError::Invalid("reconnect_max_delay_ms is below reconnect_base_delay_ms".to_string()));
        }
        if self.session.keep_alive_interval_secs == 0 {
            return Err(ConfigError::Invalid("keep_alive_interval_secs must be at least 1".to_string()));
        }
        Ok(())
    }
}
