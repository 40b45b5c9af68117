use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::Utc;
use lazy_static::lazy_static;
use log::{debug, info, warn};
use regex::Regex;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc::Sender};
use tokio::task::JoinHandle;

use crate::db::StoreWrite;
use crate::models::{ConnectionConfig, MeterReading, ParameterValue};
use crate::protocol::{decode_updates, TERMINATOR_STR};
use crate::session::DeviceEvent;

lazy_static! {
    /* e.g. SourceMeter_3, ZoneMeter_0 */
    static ref METER_PARAM: Regex = Regex::new(r"^([A-Za-z]*Meter[A-Za-z]*)_(\d+)$").expect("meter pattern compiles");
}

/// Split a meter parameter name into meter type and index
pub fn parse_meter_param(param: &str) -> Option<(String, u32)> {
    let caps = METER_PARAM.captures(param)?;
    let index = caps.get(2)?.as_str().parse::<u32>().ok()?;
    Some((caps.get(1)?.as_str().to_string(), index))
}

/// Readings carried by one datagram. Anything that is not a meter update is
/// dropped, a datagram may bundle several terminator separated messages.
pub fn decode_datagram(device_id: &str, payload: &[u8]) -> Vec<MeterReading> {
    let text = match std::str::from_utf8(payload) {
        Ok(t) => t,
        Err(_) => {
            debug!("[{device_id}] Dropping non UTF-8 meter datagram");
            return Vec::new();
        }
    };

    let mut readings = Vec::new();
    for message in text.split(TERMINATOR_STR).map(str::trim).filter(|m| !m.is_empty()) {
        let json: Value = match serde_json::from_str(message) {
            Ok(v) => v,
            Err(e) => {
                debug!("[{device_id}] Dropping unparsable meter datagram: {e}");
                continue;
            }
        };

        if json.get("method").and_then(|m| m.as_str()) != Some("update") {
            continue;
        }
        let params = match json.get("params") {
            Some(p) => p,
            None => continue,
        };

        for update in decode_updates(params) {
            let (meter_type, index) = match parse_meter_param(&update.param) {
                Some(m) => m,
                None => continue,
            };
            let level = match update.value {
                ParameterValue::Value(v) | ParameterValue::Percentage(v) => v,
                ParameterValue::Text(_) => continue,
            };
            readings.push(MeterReading {
                device_id: device_id.to_string(),
                meter_type,
                index,
                level,
                recorded_at: Utc::now(),
            });
        }
    }
    return readings;
}

const RECV_RETRY_MIN: Duration = Duration::from_millis(10);
const RECV_RETRY_MAX: Duration = Duration::from_secs(1);

/// Pause after `failures` receive errors in a row, doubling up to a second
pub fn recv_retry_delay(failures: u32) -> Duration {
    let factor = 1u32 << failures.clamp(1, 8).saturating_sub(1);
    RECV_RETRY_MIN.saturating_mul(factor).min(RECV_RETRY_MAX)
}

/// Datagrams only count when they come from the device itself
pub fn is_from_device(device_ip: IpAddr, peer: IpAddr) -> bool {
    device_ip.to_canonical() == peer.to_canonical()
}

/// Receives the meter feed of one device on its own task. Datagrams from
/// any address other than `device_ip` are ignored.
///
/// The task is aborted when the listener is dropped.
pub struct MeteringListener {
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl MeteringListener {
    pub async fn bind(
        config: &ConnectionConfig,
        device_ip: IpAddr,
        history_limit: usize,
        events: broadcast::Sender<DeviceEvent>,
        store: Sender<StoreWrite>,
    ) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", config.udp_port)).await?;
        let local_addr = socket.local_addr()?;
        info!("[{}] Metering listener bound to {}", config.device_id, local_addr);

        let device_id = config.device_id.clone();
        let handle = tokio::spawn(async move {
            receive_loop(socket, device_id, device_ip, history_limit, events, store).await;
        });

        Ok(MeteringListener { handle, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for MeteringListener {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn receive_loop(
    socket: UdpSocket,
    device_id: String,
    device_ip: IpAddr,
    history_limit: usize,
    events: broadcast::Sender<DeviceEvent>,
    store: Sender<StoreWrite>,
) {
    let mut buf = vec![0u8; 65536];
    let mut failures: u32 = 0;
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(r) => {
                failures = 0;
                r
            }
            Err(e) => {
                /* ICMP errors surface here on some platforms, the socket stays usable */
                failures = failures.saturating_add(1);
                warn!("[{device_id}] Metering receive failed ({failures} in a row): {e}");
                tokio::time::sleep(recv_retry_delay(failures)).await;
                continue;
            }
        };

        if !is_from_device(device_ip, peer.ip()) {
            debug!("[{device_id}] Ignoring datagram from foreign host {peer}");
            continue;
        }

        let readings = decode_datagram(&device_id, &buf[..len]);
        if readings.is_empty() {
            debug!("[{device_id}] Ignored datagram from {peer}");
            continue;
        }

        for reading in readings {
            let _ = events.send(DeviceEvent::MeterUpdate(reading.clone()));
            if store.send(StoreWrite::MeterReading { reading, cap: history_limit }).await.is_err() {
                debug!("[{device_id}] Persistence is gone, reading not stored");
            }
        }
    }
}
