use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior, Sleep};

use super::writer::{FrameWriter, WriteAck};
use super::{CommandReply, Correlator, DeviceError, DeviceEvent, ReactorCommand, ReconnectPolicy};
use crate::config::SessionConfig;
use crate::db::StoreWrite;
use crate::metering::MeteringListener;
use crate::models::{ConnectionConfig, ConnectionState, ConnectionStatus, ParameterRecord, ValueFormat};
use crate::protocol::{encode_command, encode_frame, parse_message, Command, FrameBuffer, Inbound, Method};

type ConnectFuture = Pin<Box<dyn Future<Output = Result<TcpStream, DeviceError>> + Send>>;

const READ_CHUNK: usize = 8192;

/// Owns everything belonging to one link. All state changes happen inside
/// [`Reactor::run`], one event at a time.
pub(crate) struct Reactor {
    config: Arc<ConnectionConfig>,
    session: SessionConfig,
    cmd_rx: mpsc::Receiver<ReactorCommand>,
    events: broadcast::Sender<DeviceEvent>,
    status: watch::Sender<ConnectionStatus>,
    store: mpsc::Sender<StoreWrite>,

    correlator: Correlator,
    frames: FrameBuffer,
    reader: Option<OwnedReadHalf>,
    writer: Option<FrameWriter>,
    write_failed: Option<oneshot::Receiver<String>>,
    connecting: Option<ConnectFuture>,
    connect_waiters: Vec<oneshot::Sender<Result<(), DeviceError>>>,
    keep_alive: Option<Interval>,
    reconnect: Option<Pin<Box<Sleep>>>,
    policy: ReconnectPolicy,
    metering: Option<MeteringListener>,
    /* param -> format, replayed after every reconnect */
    subscriptions: HashMap<String, ValueFormat>,
    state: ConnectionState,
}

impl Reactor {
    pub(crate) fn new(
        config: Arc<ConnectionConfig>,
        session: SessionConfig,
        cmd_rx: mpsc::Receiver<ReactorCommand>,
        events: broadcast::Sender<DeviceEvent>,
        status: watch::Sender<ConnectionStatus>,
        store: mpsc::Sender<StoreWrite>,
    ) -> Self {
        let policy = ReconnectPolicy::from_config(&session);
        let state = ConnectionState::new(&config.device_id);
        Reactor {
            config,
            session,
            cmd_rx,
            events,
            status,
            store,
            correlator: Correlator::new(),
            frames: FrameBuffer::new(),
            reader: None,
            writer: None,
            write_failed: None,
            connecting: None,
            connect_waiters: Vec::new(),
            keep_alive: None,
            reconnect: None,
            policy,
            metering: None,
            subscriptions: HashMap::new(),
            state,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("[{}] Reactor started", self.config.device_id);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let deadline = self.correlator.next_deadline();
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                read = read_some(&mut self.reader, &mut chunk) => {
                    match read {
                        Ok(0) => self.on_socket_lost("connection closed by peer".to_string()).await,
                        Ok(n) => self.on_bytes(&chunk[..n]).await,
                        Err(e) => self.on_socket_lost(e.to_string()).await,
                    }
                }
                reason = wait_write_failure(&mut self.write_failed) => {
                    self.write_failed = None;
                    self.on_socket_lost(reason).await;
                }
                result = wait_connect(&mut self.connecting) => {
                    self.connecting = None;
                    self.on_connect_result(result).await;
                }
                _ = tick(&mut self.keep_alive) => self.send_keep_alive().await,
                _ = wait_reconnect(&mut self.reconnect) => {
                    self.reconnect = None;
                    info!("[{}] Reconnect attempt {}", self.config.device_id, self.policy.attempts());
                    self.start_connect();
                }
                _ = sleep_until(deadline) => {
                    self.correlator.expire(Instant::now());
                }
            }
        }

        /* every handle is gone, nobody can observe us anymore */
        self.close_link();
        self.correlator.fail_all(DeviceError::Shutdown);
        debug!("[{}] Reactor exits", self.config.device_id);
    }

    async fn handle_command(&mut self, cmd: ReactorCommand) {
        match cmd {
            ReactorCommand::Connect { reply } => {
                let status = *self.status.borrow();
                match status {
                    ConnectionStatus::Connected => {
                        let _ = reply.send(Ok(()));
                    }
                    ConnectionStatus::Connecting => self.connect_waiters.push(reply),
                    ConnectionStatus::Disconnected | ConnectionStatus::ReconnectScheduled | ConnectionStatus::Exhausted => {
                        if status == ConnectionStatus::Exhausted {
                            self.policy.reset();
                        }
                        self.reconnect = None;
                        self.connect_waiters.push(reply);
                        self.start_connect();
                    }
                }
            }
            ReactorCommand::Disconnect { reply } => {
                self.disconnect().await;
                let _ = reply.send(());
            }
            ReactorCommand::Send { command, expect_response, reply } => {
                self.send(command, expect_response, reply);
            }
            ReactorCommand::MeteringAddr { reply } => {
                let _ = reply.send(self.metering.as_ref().map(|m| m.local_addr()));
            }
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    fn emit(&self, event: DeviceEvent) {
        /* no receivers is fine */
        let _ = self.events.send(event);
    }

    fn emit_error(&self, error: DeviceError) {
        self.emit(DeviceEvent::Error { device_id: self.config.device_id.clone(), error });
    }

    async fn persist(&mut self, write: StoreWrite) {
        if self.store.send(write).await.is_err() {
            debug!("[{}] Persistence is gone, dropping write", self.config.device_id);
        }
    }

    async fn persist_state(&mut self) {
        self.persist(StoreWrite::ConnectionState(self.state.clone())).await;
    }

    fn start_connect(&mut self) {
        let addr = self.config.tcp_addr();
        let timeout = self.session.connect_timeout();
        info!("[{}] Connecting to {}", self.config.device_id, addr);
        self.set_status(ConnectionStatus::Connecting);

        /* dropping this future on timeout or disconnect also drops the half open socket */
        self.connecting = Some(Box::pin(async move {
            match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(DeviceError::Connection { addr, reason: e.to_string() }),
                Err(_) => Err(DeviceError::Connection {
                    addr,
                    reason: format!("no handshake within {} ms", timeout.as_millis()),
                }),
            }
        }));
    }

    async fn on_connect_result(&mut self, result: Result<TcpStream, DeviceError>) {
        let stream = match result {
            Ok(s) => s,
            Err(e) => {
                warn!("[{}] {}", self.config.device_id, e);
                for waiter in self.connect_waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
                self.emit_error(e);
                self.set_status(ConnectionStatus::Disconnected);
                if self.config.auto_reconnect {
                    self.schedule_reconnect();
                }
                self.persist_state().await;
                return;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] Unable to set TCP_NODELAY: {}", self.config.device_id, e);
        }
        let device_ip = stream.peer_addr().map(|a| a.ip());
        let (reader, writer) = stream.into_split();
        /* a write that makes no progress for a command timeout counts as a dead socket */
        let (writer, write_failed) =
            FrameWriter::spawn(self.config.device_id.clone(), writer, self.session.command_timeout());
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.write_failed = Some(write_failed);
        self.frames.clear();

        self.policy.reset();
        self.state.mark_connected();

        let period = self.session.keep_alive_interval();
        let mut keep_alive = tokio::time::interval_at(Instant::now() + period, period);
        keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.keep_alive = Some(keep_alive);

        if self.config.metering_enabled {
            match device_ip {
                Ok(ip) => self.start_metering(ip).await,
                Err(e) => self.emit_error(DeviceError::Socket(format!("metering needs the device address: {e}"))),
            }
        }

        info!("[{}] Connected to {}", self.config.device_id, self.config.tcp_addr());
        self.set_status(ConnectionStatus::Connected);
        self.persist_state().await;
        self.emit(DeviceEvent::Connected { device_id: self.config.device_id.clone() });
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }

        self.restore_subscriptions();
    }

    async fn start_metering(&mut self, device_ip: IpAddr) {
        let listener = MeteringListener::bind(
            &self.config,
            device_ip,
            self.session.meter_history_limit,
            self.events.clone(),
            self.store.clone(),
        )
        .await;

        match listener {
            Ok(l) => self.metering = Some(l),
            Err(e) => {
                /* metering is optional, the control channel stays up */
                error!("[{}] Unable to bind metering port {}: {}", self.config.device_id, self.config.udp_port, e);
                self.emit_error(DeviceError::Socket(format!("metering bind on port {}: {}", self.config.udp_port, e)));
            }
        }
    }

    fn restore_subscriptions(&mut self) {
        if self.subscriptions.is_empty() {
            return;
        }
        debug!("[{}] Restoring {} subscriptions", self.config.device_id, self.subscriptions.len());
        let commands: Vec<Command> = self
            .subscriptions
            .iter()
            .map(|(param, format)| Command::subscribe(param, *format))
            .collect();
        for command in commands {
            if let Err(e) = self.queue_command(&command, None, None) {
                warn!("[{}] Unable to restore subscription {}: {}", self.config.device_id, command.param, e);
                break;
            }
        }
    }

    /// Drop sockets and timers belonging to an open or opening link
    fn close_link(&mut self) {
        self.connecting = None;
        self.keep_alive = None;
        self.reader = None;
        self.writer = None;
        self.write_failed = None;
        self.metering = None;
        self.frames.clear();
    }

    async fn disconnect(&mut self) {
        let previous = *self.status.borrow();
        self.reconnect = None;
        self.close_link();
        self.policy.reset();

        self.correlator.fail_all(DeviceError::ConnectionClosed);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(DeviceError::ConnectionClosed));
        }

        self.set_status(ConnectionStatus::Disconnected);
        if previous == ConnectionStatus::Disconnected {
            return;
        }

        info!("[{}] Disconnected on request", self.config.device_id);
        if previous == ConnectionStatus::Connected {
            self.state.mark_disconnected();
        }
        self.state.reconnect_attempts = 0;
        self.persist_state().await;
        self.emit(DeviceEvent::Disconnected {
            device_id: self.config.device_id.clone(),
            reason: "disconnect requested".to_string(),
        });
    }

    async fn on_socket_lost(&mut self, reason: String) {
        warn!("[{}] Link lost: {}", self.config.device_id, reason);
        self.close_link();
        self.correlator.fail_all(DeviceError::ConnectionClosed);

        self.state.mark_disconnected();
        self.set_status(ConnectionStatus::Disconnected);
        self.emit(DeviceEvent::Disconnected { device_id: self.config.device_id.clone(), reason: reason.clone() });
        self.emit_error(DeviceError::Socket(reason));

        if self.config.auto_reconnect {
            self.schedule_reconnect();
        }
        self.persist_state().await;
    }

    /// Arm the reconnect timer unless it is armed already or attempts ran out
    fn schedule_reconnect(&mut self) {
        if self.reconnect.is_some() {
            debug!("[{}] Reconnect already scheduled", self.config.device_id);
            return;
        }

        match self.policy.next_delay() {
            Some(delay) => {
                self.state.reconnect_attempts = self.policy.attempts();
                info!(
                    "[{}] Reconnecting in {} ms (attempt {}/{})",
                    self.config.device_id,
                    delay.as_millis(),
                    self.policy.attempts(),
                    self.session.max_reconnect_attempts
                );
                self.reconnect = Some(Box::pin(tokio::time::sleep(delay)));
                self.set_status(ConnectionStatus::ReconnectScheduled);
            }
            None => {
                let attempts = self.policy.attempts();
                error!("[{}] Giving up after {} reconnect attempts", self.config.device_id, attempts);
                self.set_status(ConnectionStatus::Exhausted);
                self.emit_error(DeviceError::ReconnectExhausted(attempts));
                self.emit(DeviceEvent::MaxReconnectAttemptsReached {
                    device_id: self.config.device_id.clone(),
                    attempts,
                });
            }
        }
    }

    fn send(&mut self, command: Command, expect_response: bool, reply: CommandReply) {
        if self.writer.is_none() {
            let _ = reply.send(Err(DeviceError::NotConnected));
            return;
        }

        match command.method {
            Method::Subscribe => {
                if let Some(format) = command.format {
                    self.subscriptions.insert(command.param.clone(), format);
                }
            }
            Method::Unsubscribe => {
                self.subscriptions.remove(&command.param);
            }
            _ => {}
        }

        if !expect_response {
            /* the writer answers once the frame is out */
            if let Err(e) = self.queue_command(&command, None, Some(WriteAck::new(reply))) {
                debug!("[{}] {:?} {} not queued: {}", self.config.device_id, command.method, command.param, e);
            }
            return;
        }

        /* the entry must exist before the frame leaves, answers can be fast */
        let id = self.correlator.register(reply, self.session.command_timeout());
        if let Err(e) = self.queue_command(&command, Some(id), None) {
            self.correlator.fail(id, e);
        }
    }

    /// Hand a command to the writer task. Never waits on the socket.
    fn queue_command(&self, command: &Command, id: Option<u64>, ack: Option<WriteAck>) -> Result<(), DeviceError> {
        let text = match encode_command(command, id) {
            Ok(t) => t,
            Err(e) => {
                if let Some(ack) = ack {
                    ack.fail(DeviceError::Protocol(e.clone()));
                }
                return Err(e.into());
            }
        };
        let writer = self.writer.as_ref().ok_or(DeviceError::NotConnected)?;
        trace!("[{}] >> {}", self.config.device_id, text);
        writer.queue(encode_frame(&text), ack)
    }

    async fn send_keep_alive(&mut self) {
        let id = self.correlator.next_id();
        let command = Command::get(&self.session.keep_alive_param, ValueFormat::Text);
        match self.queue_command(&command, Some(id), None) {
            Ok(()) => {
                debug!("[{}] Keep-alive {} queued", self.config.device_id, id);
                self.state.last_keep_alive = Some(Utc::now());
                self.persist_state().await;
            }
            /* only close/error events on the socket drive reconnects */
            Err(e) => warn!("[{}] Keep-alive {} failed: {}", self.config.device_id, id, e),
        }
    }

    async fn on_bytes(&mut self, data: &[u8]) {
        self.frames.extend(data);
        while let Some(frame) = self.frames.next_frame() {
            match frame {
                Ok(text) => self.on_frame(&text).await,
                Err(e) => warn!("[{}] Dropping frame: {}", self.config.device_id, e),
            }
        }
    }

    async fn on_frame(&mut self, text: &str) {
        trace!("[{}] << {}", self.config.device_id, text);
        let message = match parse_message(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("[{}] Dropping frame: {}", self.config.device_id, e);
                return;
            }
        };

        match message {
            Inbound::Response { id, outcome } => {
                self.correlator.resolve(id, outcome);
            }
            Inbound::Update(updates) => {
                for update in updates {
                    let record = ParameterRecord::new(&self.config.device_id, &update.param, update.value);
                    debug!("[{}] {} = {:?}", self.config.device_id, record.name, record.value);
                    self.persist(StoreWrite::Parameter(record.clone())).await;
                    self.emit(DeviceEvent::ParameterUpdate(record));
                }
            }
            Inbound::Other => debug!("[{}] Ignoring message {}", self.config.device_id, text),
        }
    }
}

async fn read_some(reader: &mut Option<OwnedReadHalf>, buf: &mut [u8]) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(buf).await,
        None => std::future::pending().await,
    }
}

async fn wait_write_failure(failed: &mut Option<oneshot::Receiver<String>>) -> String {
    match failed {
        Some(rx) => rx.await.unwrap_or_else(|_| "writer stopped".to_string()),
        None => std::future::pending().await,
    }
}

async fn wait_connect(connecting: &mut Option<ConnectFuture>) -> Result<TcpStream, DeviceError> {
    match connecting {
        Some(f) => f.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_reconnect(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(t) => t.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
