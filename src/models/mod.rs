use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn tcp_port_default() -> u16 { return 5321 }
fn udp_port_default() -> u16 { return 3131 }
fn auto_reconnect_default() -> bool { return true }
fn metering_enabled_default() -> bool { return true }
fn connect_on_start_default() -> bool { return true }

/// Where and how to reach one processor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Unique identifier of the device, used as key everywhere
    pub device_id: String,
    /// Human-readable name, only used for logging
    #[serde(default)]
    pub name: String,
    /// Hostname or IP address of the processor
    pub host: String,
    #[serde(default="tcp_port_default")]
    pub tcp_port: u16,
    /// Local port the meter datagrams are received on
    #[serde(default="udp_port_default")]
    pub udp_port: u16,
    #[serde(default="auto_reconnect_default")]
    pub auto_reconnect: bool,
    #[serde(default="metering_enabled_default")]
    pub metering_enabled: bool,
    #[serde(default="connect_on_start_default")]
    pub connect_on_start: bool,
}

impl ConnectionConfig {
    pub fn new(device_id: &str, host: &str, tcp_port: u16) -> Self {
        return ConnectionConfig {
            device_id: device_id.to_string(),
            name: device_id.to_string(),
            host: host.to_string(),
            tcp_port,
            udp_port: udp_port_default(),
            auto_reconnect: auto_reconnect_default(),
            metering_enabled: metering_enabled_default(),
            connect_on_start: connect_on_start_default(),
        };
    }

    pub fn with_udp_port(mut self, port: u16) -> Self {
        self.udp_port = port;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_metering(mut self, enabled: bool) -> Self {
        self.metering_enabled = enabled;
        self
    }

    pub fn tcp_addr(&self) -> String {
        return format!("{}:{}", self.host, self.tcp_port);
    }
}

/// The three shapes a parameter value can take on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ParameterValue {
    Value(f64),
    Percentage(f64),
    Text(String),
}

impl ParameterValue {
    pub fn format(&self) -> ValueFormat {
        match self {
            ParameterValue::Value(_) => ValueFormat::Value,
            ParameterValue::Percentage(_) => ValueFormat::Percentage,
            ParameterValue::Text(_) => ValueFormat::Text,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParameterValue::Value(v) | ParameterValue::Percentage(v) => Some(*v),
            ParameterValue::Text(_) => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParameterValue::Value(v) | ParameterValue::Percentage(v) => serde_json::Value::from(*v),
            ParameterValue::Text(s) => serde_json::Value::from(s.clone()),
        }
    }
}

/// Field key used for a value on the wire: `val`, `pct` or `str`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ValueFormat {
    #[serde(rename = "val")]
    Value,
    #[serde(rename = "pct")]
    Percentage,
    #[serde(rename = "str")]
    Text,
}

impl ValueFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "val" => Some(ValueFormat::Value),
            "pct" => Some(ValueFormat::Percentage),
            "str" => Some(ValueFormat::Text),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            ValueFormat::Value => "val",
            ValueFormat::Percentage => "pct",
            ValueFormat::Text => "str",
        }
    }
}

/// Last known value of a single parameter on a device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParameterRecord {
    pub device_id: String,
    pub name: String,
    pub value: ParameterValue,
    pub updated_at: DateTime<Utc>,
}

impl ParameterRecord {
    pub fn new(device_id: &str, name: &str, value: ParameterValue) -> Self {
        ParameterRecord {
            device_id: device_id.to_string(),
            name: name.to_string(),
            value,
            updated_at: Utc::now(),
        }
    }
}

/// One sample of a meter received over the metering feed
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeterReading {
    pub device_id: String,
    pub meter_type: String,
    pub index: u32,
    pub level: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted view of the link to a device, one per device
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionState {
    pub device_id: String,
    pub connected: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub last_keep_alive: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
}

impl ConnectionState {
    pub fn new(device_id: &str) -> Self {
        ConnectionState {
            device_id: device_id.to_string(),
            connected: false,
            last_connected: None,
            last_disconnected: None,
            last_keep_alive: None,
            reconnect_attempts: 0,
        }
    }

    pub fn mark_connected(&mut self) {
        self.connected = true;
        self.last_connected = Some(Utc::now());
        self.reconnect_attempts = 0;
    }

    pub fn mark_disconnected(&mut self) {
        self.connected = false;
        self.last_disconnected = Some(Utc::now());
    }
}

/// Lifecycle of a device connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
    /// Reconnect attempts ran out, the instance will not retry on its own
    Exhausted,
}

impl ConnectionStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Disconnected" => Some(ConnectionStatus::Disconnected),
            "Connecting" => Some(ConnectionStatus::Connecting),
            "Connected" => Some(ConnectionStatus::Connected),
            "ReconnectScheduled" => Some(ConnectionStatus::ReconnectScheduled),
            "Exhausted" => Some(ConnectionStatus::Exhausted),
            _ => None,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Disconnected => "Disconnected",
            ConnectionStatus::Connecting => "Connecting",
            ConnectionStatus::Connected => "Connected",
            ConnectionStatus::ReconnectScheduled => "ReconnectScheduled",
            ConnectionStatus::Exhausted => "Exhausted",
        };
        f.write_str(name)
    }
}
