//! One persistent link to one processor.
//!
//! A [`DeviceConnection`] is a cheap handle; the sockets, the framing buffer,
//! the pending requests and all timers live in a reactor task that processes
//! one event at a time. Callers talk to it through a command channel and get
//! their answers back through oneshot channels.

use std::net::SocketAddr;
use std::sync::Arc;

use log::debug;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::SessionConfig;
use crate::db::StoreWrite;
use crate::models::{ConnectionConfig, ConnectionStatus, MeterReading, ParameterRecord, ParameterValue, ValueFormat};
use crate::protocol::{decode_result, Command, ProtocolError};

pub mod backoff;
pub mod correlator;
mod reactor;
mod writer;

pub use backoff::ReconnectPolicy;
pub use correlator::Correlator;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("connecting to {addr} failed: {reason}")]
    Connection { addr: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("no response to command {id} within {timeout_ms} ms")]
    CommandTimeout { id: u64, timeout_ms: u64 },
    #[error("device rejected command: {0}")]
    Command(String),
    #[error("socket error: {0}")]
    Socket(String),
    #[error("gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("connection task has stopped")]
    Shutdown,
}

/// Everything a link reports to the outside world
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Connected { device_id: String },
    Disconnected { device_id: String, reason: String },
    ParameterUpdate(ParameterRecord),
    MeterUpdate(MeterReading),
    Error { device_id: String, error: DeviceError },
    /// Terminal, the link stops retrying on its own
    MaxReconnectAttemptsReached { device_id: String, attempts: u32 },
}

pub type CommandReply = oneshot::Sender<Result<Option<Value>, DeviceError>>;

pub(crate) enum ReactorCommand {
    Connect { reply: oneshot::Sender<Result<(), DeviceError>> },
    Disconnect { reply: oneshot::Sender<()> },
    Send { command: Command, expect_response: bool, reply: CommandReply },
    MeteringAddr { reply: oneshot::Sender<Option<SocketAddr>> },
}

const EVENT_CAPACITY: usize = 256;
const COMMAND_CAPACITY: usize = 256;

pub struct DeviceConnection {
    config: Arc<ConnectionConfig>,
    cmd_tx: mpsc::Sender<ReactorCommand>,
    events: broadcast::Sender<DeviceEvent>,
    status: watch::Receiver<ConnectionStatus>,
}

impl DeviceConnection {
    /// Create the link and spawn its reactor. Nothing is opened until
    /// [`connect`](Self::connect) is called. Must be called inside a tokio
    /// runtime.
    pub fn new(config: ConnectionConfig, session: SessionConfig, store: mpsc::Sender<StoreWrite>) -> Self {
        let config = Arc::new(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (status_tx, status) = watch::channel(ConnectionStatus::Disconnected);

        let reactor = reactor::Reactor::new(config.clone(), session, cmd_rx, events.clone(), status_tx, store);
        tokio::spawn(reactor.run());

        DeviceConnection { config, cmd_tx, events, status }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Watch status changes
    pub fn status_watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Open the control channel and, if enabled, the metering feed
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.request(ReactorCommand::Connect { reply }).await?;
        rx.await.map_err(|_| DeviceError::Shutdown)?
    }

    /// Close everything and reject all pending requests. Safe to call at any time.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.request(ReactorCommand::Disconnect { reply }).await.is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Send a command. With `expect_response` the call waits for the matching
    /// response and returns its result, otherwise it returns `None` once the
    /// frame is written.
    pub async fn send_command(&self, command: Command, expect_response: bool) -> Result<Option<Value>, DeviceError> {
        let (reply, rx) = oneshot::channel();
        self.request(ReactorCommand::Send { command, expect_response, reply }).await?;
        rx.await.map_err(|_| DeviceError::Shutdown)?
    }

    pub async fn get_parameter(&self, name: &str, format: ValueFormat) -> Result<ParameterValue, DeviceError> {
        let result = self.send_command(Command::get(name, format), true).await?.unwrap_or(Value::Null);
        decode_result(&result, Some(format))
            .ok_or_else(|| DeviceError::Protocol(ProtocolError::UnexpectedResult(result.to_string())))
    }

    pub async fn set_parameter(&self, name: &str, value: ParameterValue) -> Result<(), DeviceError> {
        self.send_command(Command::set(name, value), false).await.map(|_| ())
    }

    pub async fn bump_parameter(&self, name: &str, delta: ParameterValue) -> Result<(), DeviceError> {
        self.send_command(Command::bump(name, delta), false).await.map(|_| ())
    }

    /// Ask the device to push updates for `name`. Subscriptions are restored
    /// after a reconnect.
    pub async fn subscribe(&self, name: &str, format: ValueFormat) -> Result<(), DeviceError> {
        self.send_command(Command::subscribe(name, format), false).await.map(|_| ())
    }

    pub async fn unsubscribe(&self, name: &str, format: ValueFormat) -> Result<(), DeviceError> {
        self.send_command(Command::unsubscribe(name, format), false).await.map(|_| ())
    }

    /// Local address of the metering socket while it is bound
    pub async fn metering_addr(&self) -> Option<SocketAddr> {
        let (reply, rx) = oneshot::channel();
        self.request(ReactorCommand::MeteringAddr { reply }).await.ok()?;
        rx.await.ok().flatten()
    }

    async fn request(&self, command: ReactorCommand) -> Result<(), DeviceError> {
        self.cmd_tx.send(command).await.map_err(|_| {
            debug!("[{}] Reactor is gone", self.config.device_id);
            DeviceError::Shutdown
        })
    }
}
