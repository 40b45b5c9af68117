use std::time::Duration;

use dsplink::{open_store, Config, DeviceConnection, DeviceEvent, PersistenceManager, SessionManager};
use log::{error, info, warn};
use tokio::sync::broadcast::error::RecvError;

fn log_events(connection: &DeviceConnection) {
    let mut events = connection.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(DeviceEvent::Connected { device_id }) => info!("[{device_id}] up"),
                Ok(DeviceEvent::Disconnected { device_id, reason }) => warn!("[{device_id}] down: {reason}"),
                Ok(DeviceEvent::ParameterUpdate(record)) => {
                    info!("[{}] {} = {}", record.device_id, record.name, record.value.to_json())
                }
                Ok(DeviceEvent::MeterUpdate(_)) => {}
                Ok(DeviceEvent::Error { device_id, error }) => warn!("[{device_id}] {error}"),
                Ok(DeviceEvent::MaxReconnectAttemptsReached { device_id, attempts }) => {
                    error!("[{device_id}] unreachable after {attempts} attempts")
                }
                Err(RecvError::Lagged(n)) => warn!("Event log skipped {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let default_filter = std::env::var("DSPLINK_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(default_filter));

    let config = Config::load()?;
    let store = open_store(&config.db)?;

    /* the config file is the source of truth for device settings */
    for device in config.devices.iter() {
        store.upsert_device(device)?;
    }

    let (persistence, store_tx) = PersistenceManager::new(store.clone());
    let persistence = tokio::spawn(persistence.start_thread());

    let sessions = SessionManager::new(store, store_tx, config.session.clone());
    for device in config.devices.iter().filter(|d| d.connect_on_start) {
        let connection = sessions.get_or_create(&device.device_id).await?;
        log_events(&connection);
        /* a failed first attempt is retried by the link itself */
        if let Err(e) = connection.connect().await {
            warn!("[{}] Initial connect failed: {}", device.device_id, e);
        }
    }

    info!("All devices started, now waiting for a signal to exit");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down");
    sessions.shutdown().await;
    drop(sessions);

    /* the queue drains once every link has let go of its sender */
    if tokio::time::timeout(Duration::from_secs(5), persistence).await.is_err() {
        warn!("Persistence did not drain in time");
    }
    Ok(())
}
