use std::sync::Arc;
use std::time::Duration;

use dsplink::db::{DeviceStore, MemoryStore};
use dsplink::{
    ConnectionConfig, ConnectionStatus, DeviceConnection, DeviceError, DeviceEvent, ParameterValue, PersistenceManager,
    SessionConfig, ValueFormat,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Plays the processor side of the control channel
struct MockDevice {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl MockDevice {
    async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        let (reader, writer) = stream.into_split();
        MockDevice { lines: BufReader::new(reader).lines(), writer }
    }

    async fn next_request(&mut self) -> Value {
        let line = timeout(WAIT, self.lines.next_line()).await.unwrap().unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn send(&mut self, message: Value) {
        let mut frame = message.to_string().into_bytes();
        frame.extend_from_slice(b"\r\n");
        self.writer.write_all(&frame).await.unwrap();
    }
}

fn fast_session() -> SessionConfig {
    SessionConfig {
        connect_timeout_ms: 1_000,
        command_timeout_ms: 2_000,
        reconnect_base_delay_ms: 50,
        reconnect_max_delay_ms: 200,
        max_reconnect_attempts: 3,
        ..SessionConfig::default()
    }
}

fn start_store() -> (Arc<MemoryStore>, tokio::sync::mpsc::Sender<dsplink::StoreWrite>) {
    let store = Arc::new(MemoryStore::new());
    let (manager, tx) = PersistenceManager::new(store.clone());
    tokio::spawn(manager.start_thread());
    (store, tx)
}

async fn setup(session: SessionConfig) -> (TcpListener, DeviceConnection, Arc<MemoryStore>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (store, tx) = start_store();
    let config = ConnectionConfig::new("dev", "127.0.0.1", port).with_metering(false);
    (listener, DeviceConnection::new(config, session, tx), store)
}

async fn wait_for_status(connection: &DeviceConnection, wanted: ConnectionStatus) {
    let mut watch = connection.status_watch();
    timeout(WAIT, watch.wait_for(|s| *s == wanted)).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_get_resolves_with_device_value() {
    let (listener, connection, _store) = setup(fast_session()).await;
    connection.connect().await.unwrap();
    assert!(connection.is_connected());
    let mut device = MockDevice::accept(&listener).await;

    let answer = tokio::spawn(async move {
        let request = device.next_request().await;
        assert_eq!(request["method"], "get");
        assert_eq!(request["params"]["param"], "SourceGain_0");
        assert_eq!(request["params"]["fmt"], "val");
        device.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"param": "SourceGain_0", "val": -6}})).await;
        device
    });

    let value = connection.get_parameter("SourceGain_0", ValueFormat::Value).await.unwrap();
    assert_eq!(value, ParameterValue::Value(-6.0));
    answer.await.unwrap();
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    let (listener, connection, _store) = setup(fast_session()).await;
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    let answer = tokio::spawn(async move {
        let first = device.next_request().await;
        let second = device.next_request().await;
        assert_ne!(first["id"], second["id"]);
        for request in [second, first] {
            let param = request["params"]["param"].as_str().unwrap().to_string();
            let val = if param == "ZoneGain_0" { -10 } else { -20 };
            device.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"param": param, "val": val}})).await;
        }
        device
    });

    let (a, b) = tokio::join!(
        connection.get_parameter("ZoneGain_0", ValueFormat::Value),
        connection.get_parameter("ZoneGain_1", ValueFormat::Value)
    );
    assert_eq!(a.unwrap(), ParameterValue::Value(-10.0));
    assert_eq!(b.unwrap(), ParameterValue::Value(-20.0));
    answer.await.unwrap();
}

#[tokio::test]
async fn test_timeout_keeps_connection_open() {
    let session = SessionConfig { command_timeout_ms: 150, ..fast_session() };
    let (listener, connection, _store) = setup(session).await;
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    let result = connection.get_parameter("ZoneMute_0", ValueFormat::Value).await;
    assert!(matches!(result, Err(DeviceError::CommandTimeout { timeout_ms: 150, .. })));
    assert!(connection.is_connected());

    /* a late answer is an orphan and must not disturb the next request */
    let late = device.next_request().await;
    device.send(json!({"jsonrpc": "2.0", "id": late["id"], "result": {"val": 1}})).await;

    let answer = tokio::spawn(async move {
        let request = device.next_request().await;
        device.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"val": 0}})).await;
        device
    });
    assert_eq!(connection.get_parameter("ZoneMute_0", ValueFormat::Value).await.unwrap(), ParameterValue::Value(0.0));
    answer.await.unwrap();
}

#[tokio::test]
async fn test_orphan_response_is_ignored() {
    let (listener, connection, _store) = setup(fast_session()).await;
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    device.send(json!({"jsonrpc": "2.0", "id": 999, "result": {"val": 3}})).await;
    device.send(json!({"jsonrpc": "2.0", "method": "hello"})).await;

    let answer = tokio::spawn(async move {
        let request = device.next_request().await;
        device.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"str": "Lobby"}})).await;
        device
    });
    let name = connection.get_parameter("ZoneName_0", ValueFormat::Text).await.unwrap();
    assert_eq!(name, ParameterValue::Text("Lobby".to_string()));
    assert!(connection.is_connected());
    answer.await.unwrap();
}

#[tokio::test]
async fn test_device_error_rejects_only_that_request() {
    let (listener, connection, _store) = setup(fast_session()).await;
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    let answer = tokio::spawn(async move {
        let request = device.next_request().await;
        device.send(json!({"jsonrpc": "2.0", "id": request["id"], "error": {"code": -32602, "message": "unknown param"}})).await;
        device
    });
    let result = connection.get_parameter("Bogus_0", ValueFormat::Value).await;
    assert_eq!(result, Err(DeviceError::Command("unknown param".to_string())));
    assert!(connection.is_connected());
    answer.await.unwrap();
}

#[tokio::test]
async fn test_socket_close_rejects_all_pending() {
    let session = SessionConfig { reconnect_base_delay_ms: 10_000, reconnect_max_delay_ms: 10_000, ..fast_session() };
    let (listener, connection, _store) = setup(session).await;
    let connection = Arc::new(connection);
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;
    let mut events = connection.subscribe_events();

    let mut calls = Vec::new();
    for i in 0..3 {
        let c = connection.clone();
        calls.push(tokio::spawn(async move { c.get_parameter(&format!("ZoneGain_{i}"), ValueFormat::Value).await }));
    }
    for _ in 0..3 {
        device.next_request().await;
    }
    drop(device);

    for call in calls {
        let result = timeout(WAIT, call).await.unwrap().unwrap();
        assert_eq!(result, Err(DeviceError::ConnectionClosed));
    }
    wait_for_status(&connection, ConnectionStatus::ReconnectScheduled).await;
    assert!(!connection.is_connected());

    let mut saw_disconnect = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), events.recv()).await {
        if matches!(event, DeviceEvent::Disconnected { .. }) {
            saw_disconnect = true;
        }
    }
    assert!(saw_disconnect);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let (listener, connection, _store) = setup(fast_session()).await;

    /* before any connect */
    connection.disconnect().await;
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);

    connection.connect().await.unwrap();
    let _device = MockDevice::accept(&listener).await;
    connection.disconnect().await;
    connection.disconnect().await;
    assert!(!connection.is_connected());
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);

    let result = connection.get_parameter("ZoneGain_0", ValueFormat::Value).await;
    assert_eq!(result, Err(DeviceError::NotConnected));
}

#[tokio::test]
async fn test_disconnect_cancels_scheduled_reconnect() {
    let session = SessionConfig { reconnect_base_delay_ms: 100, ..fast_session() };
    let (listener, connection, _store) = setup(session).await;
    connection.connect().await.unwrap();
    drop(MockDevice::accept(&listener).await);
    wait_for_status(&connection, ConnectionStatus::ReconnectScheduled).await;

    connection.disconnect().await;
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
    assert!(timeout(Duration::from_millis(400), listener.accept()).await.is_err());
}

#[tokio::test]
async fn test_exhaustion_is_signalled_once() {
    /* grab a free port and close it again so every connect is refused */
    let port = {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    };
    let session = SessionConfig {
        reconnect_base_delay_ms: 20,
        reconnect_max_delay_ms: 50,
        max_reconnect_attempts: 2,
        ..fast_session()
    };
    let (_store, tx) = start_store();
    let config = ConnectionConfig::new("dev", "127.0.0.1", port).with_metering(false);
    let connection = DeviceConnection::new(config, session, tx);
    let mut events = connection.subscribe_events();

    assert!(matches!(connection.connect().await, Err(DeviceError::Connection { .. })));
    wait_for_status(&connection, ConnectionStatus::Exhausted).await;

    let mut exhausted = 0;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(500), events.recv()).await {
        if let DeviceEvent::MaxReconnectAttemptsReached { attempts, .. } = event {
            assert_eq!(attempts, 2);
            exhausted += 1;
        }
    }
    assert_eq!(exhausted, 1);
    assert_eq!(connection.status(), ConnectionStatus::Exhausted);
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let (listener, connection, _store) = setup(fast_session()).await;
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    connection.subscribe("ZoneGain_0", ValueFormat::Value).await.unwrap();
    let request = device.next_request().await;
    assert_eq!(request["method"], "sub");
    assert!(request.get("id").is_none());
    drop(device);

    let mut device = MockDevice::accept(&listener).await;
    let replayed = device.next_request().await;
    assert_eq!(replayed["method"], "sub");
    assert_eq!(replayed["params"], json!({"param": "ZoneGain_0", "fmt": "val"}));
    wait_for_status(&connection, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn test_update_is_emitted_and_persisted() {
    let (listener, connection, store) = setup(fast_session()).await;
    let mut events = connection.subscribe_events();
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    device.send(json!({"jsonrpc": "2.0", "method": "update", "params": {"param": "ZoneGain_1", "val": -12.5}})).await;

    let record = loop {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            DeviceEvent::ParameterUpdate(record) => break record,
            _ => continue,
        }
    };
    assert_eq!(record.name, "ZoneGain_1");
    assert_eq!(record.value, ParameterValue::Value(-12.5));

    let stored = timeout(WAIT, async {
        loop {
            if let Some(r) = store.parameter("dev", "ZoneGain_1").unwrap() {
                return r;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(stored.value, ParameterValue::Value(-12.5));
    assert!(store.connection_state("dev").unwrap().unwrap().connected);
}

#[tokio::test]
async fn test_meter_datagrams_are_capped_in_history() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (store, tx) = start_store();
    let config = ConnectionConfig::new("dev", "127.0.0.1", port).with_metering(true).with_udp_port(0);
    let session = SessionConfig { meter_history_limit: 3, ..fast_session() };
    let connection = DeviceConnection::new(config, session, tx);
    let mut events = connection.subscribe_events();

    connection.connect().await.unwrap();
    let _device = MockDevice::accept(&listener).await;
    let meter_port = connection.metering_addr().await.unwrap().port();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    for i in 0..5 {
        let datagram = json!({"jsonrpc": "2.0", "method": "update", "params": {"param": format!("SourceMeter_{i}"), "val": -30 + i}});
        sender.send_to(datagram.to_string().as_bytes(), ("127.0.0.1", meter_port)).await.unwrap();
    }
    sender.send_to(b"not json", ("127.0.0.1", meter_port)).await.unwrap();

    let mut seen = 0;
    while seen < 5 {
        if let DeviceEvent::MeterUpdate(reading) = timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            assert_eq!(reading.meter_type, "SourceMeter");
            seen += 1;
        }
    }

    let history = timeout(WAIT, async {
        loop {
            let readings = store.meter_readings("dev").unwrap();
            if readings.len() == 3 && readings[0].index == 4 {
                return readings;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(history.iter().map(|r| r.index).collect::<Vec<_>>(), vec![4, 3, 2]);

    connection.disconnect().await;
    assert!(connection.metering_addr().await.is_none());
}

#[tokio::test]
async fn test_peer_that_stops_reading_cannot_stall_the_link() {
    let session = SessionConfig {
        command_timeout_ms: 200,
        reconnect_base_delay_ms: 10_000,
        reconnect_max_delay_ms: 10_000,
        ..fast_session()
    };
    let (listener, connection, _store) = setup(session).await;
    let connection = Arc::new(connection);
    connection.connect().await.unwrap();
    /* accepted but never read from */
    let _device = MockDevice::accept(&listener).await;

    let flood = {
        let c = connection.clone();
        tokio::spawn(async move { c.set_parameter("ZoneName_0", ParameterValue::Text("x".repeat(32 * 1024 * 1024))).await })
    };

    let get = timeout(Duration::from_secs(3), connection.get_parameter("ZoneGain_0", ValueFormat::Value)).await;
    assert!(get.unwrap().is_err());

    timeout(Duration::from_secs(3), connection.disconnect()).await.unwrap();
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);

    let flood = timeout(Duration::from_secs(3), flood).await.unwrap().unwrap();
    assert!(matches!(flood, Err(DeviceError::Socket(_)) | Err(DeviceError::ConnectionClosed)));
}

#[tokio::test]
async fn test_disconnect_rejects_pending_requests() {
    let (listener, connection, _store) = setup(fast_session()).await;
    let connection = Arc::new(connection);
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    let mut calls = Vec::new();
    for i in 0..3 {
        let c = connection.clone();
        calls.push(tokio::spawn(async move { c.get_parameter(&format!("SourceGain_{i}"), ValueFormat::Value).await }));
    }
    for _ in 0..3 {
        device.next_request().await;
    }

    connection.disconnect().await;
    for call in calls {
        let result = timeout(WAIT, call).await.unwrap().unwrap();
        assert_eq!(result, Err(DeviceError::ConnectionClosed));
    }
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_keep_alive_sent_on_interval() {
    let session = SessionConfig { keep_alive_interval_secs: 1, ..fast_session() };
    let (listener, connection, store) = setup(session).await;
    connection.connect().await.unwrap();
    let mut device = MockDevice::accept(&listener).await;

    let answer = tokio::spawn(async move {
        let request = device.next_request().await;
        device.send(json!({"jsonrpc": "2.0", "id": request["id"], "result": {"val": -3}})).await;
        (device, request["id"].as_u64().unwrap())
    });
    connection.get_parameter("ZoneGain_0", ValueFormat::Value).await.unwrap();
    let (mut device, get_id) = answer.await.unwrap();

    let keep_alive = device.next_request().await;
    assert_eq!(keep_alive["method"], "get");
    assert_eq!(keep_alive["params"], json!({"param": "KeepAlive", "fmt": "str"}));
    assert!(keep_alive["id"].as_u64().unwrap() > get_id);

    timeout(WAIT, async {
        loop {
            let state = store.connection_state("dev").unwrap();
            if state.map(|s| s.last_keep_alive.is_some()).unwrap_or(false) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(connection.is_connected());
}

#[tokio::test]
async fn test_metering_bind_failure_keeps_control_channel() {
    let taken = UdpSocket::bind("0.0.0.0:0").await.unwrap();
    let udp_port = taken.local_addr().unwrap().port();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (_store, tx) = start_store();
    let config = ConnectionConfig::new("dev", "127.0.0.1", port).with_metering(true).with_udp_port(udp_port);
    let connection = DeviceConnection::new(config, fast_session(), tx);
    let mut events = connection.subscribe_events();

    connection.connect().await.unwrap();
    let _device = MockDevice::accept(&listener).await;
    assert!(connection.is_connected());
    assert!(connection.metering_addr().await.is_none());

    let error = loop {
        match timeout(WAIT, events.recv()).await.unwrap().unwrap() {
            DeviceEvent::Error { error, .. } => break error,
            _ => continue,
        }
    };
    assert!(matches!(error, DeviceError::Socket(msg) if msg.contains("metering")));
}

#[tokio::test]
async fn test_handshake_timeout_is_a_connection_error() {
    /* unroutable, the handshake either times out or fails outright */
    let session = SessionConfig { connect_timeout_ms: 300, ..fast_session() };
    let (_store, tx) = start_store();
    let config = ConnectionConfig::new("dev", "10.255.255.1", 5321).with_metering(false).with_auto_reconnect(false);
    let connection = DeviceConnection::new(config, session, tx);

    let result = timeout(Duration::from_secs(3), connection.connect()).await.unwrap();
    assert!(matches!(result, Err(DeviceError::Connection { .. })));
    assert_eq!(connection.status(), ConnectionStatus::Disconnected);
}
