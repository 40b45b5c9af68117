//! Keeps one live [`DeviceConnection`] per device id.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc::Sender, Mutex};

use crate::config::SessionConfig;
use crate::db::{DeviceStore, StoreError, StoreWrite};
use crate::models::ConnectionConfig;
use crate::session::{DeviceConnection, DeviceEvent};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("no device configured with id {0}")]
    UnknownDevice(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store lookup was cancelled")]
    Cancelled,
}

type Sessions = Arc<Mutex<HashMap<String, Arc<DeviceConnection>>>>;

/// SessionManager hands out shared links, creating them on first use from
/// the device configuration held by the store.
pub struct SessionManager {
    store: Arc<dyn DeviceStore>,
    store_tx: Sender<StoreWrite>,
    session: SessionConfig,
    sessions: Sessions,
}

impl SessionManager {
    pub fn new(store: Arc<dyn DeviceStore>, store_tx: Sender<StoreWrite>, session: SessionConfig) -> Self {
        SessionManager { store, store_tx, session, sessions: Arc::new(Mutex::new(HashMap::new())) }
    }

    /// Existing link for `device_id`, or a new one built from the stored
    /// configuration. Creating does not connect.
    pub async fn get_or_create(&self, device_id: &str) -> Result<Arc<DeviceConnection>, RegistryError> {
        /* held across the lookup, two callers must not build two links */
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(device_id) {
            return Ok(existing.clone());
        }

        let config = self.lookup(device_id).await?;
        let connection = Arc::new(DeviceConnection::new(config, self.session.clone(), self.store_tx.clone()));
        info!("[{}] Session created", device_id);

        self.watch_exhaustion(&connection);
        sessions.insert(device_id.to_string(), connection.clone());
        return Ok(connection);
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<DeviceConnection>> {
        self.sessions.lock().await.get(device_id).cloned()
    }

    /// Disconnect and forget the link. Returns false if there was none.
    pub async fn remove(&self, device_id: &str) -> bool {
        let removed = self.sessions.lock().await.remove(device_id);
        match removed {
            Some(connection) => {
                connection.disconnect().await;
                info!("[{}] Session removed", device_id);
                true
            }
            None => false,
        }
    }

    /// Disconnect every link and empty the registry
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<DeviceConnection>> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().map(|(_, c)| c).collect()
        };
        info!("Shutting down {} sessions", drained.len());
        for connection in drained {
            connection.disconnect().await;
        }
    }

    pub async fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        ids.sort();
        return ids;
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.lock().await.is_empty()
    }

    async fn lookup(&self, device_id: &str) -> Result<ConnectionConfig, RegistryError> {
        let store = self.store.clone();
        let id = device_id.to_string();
        let found = tokio::task::spawn_blocking(move || store.device(&id))
            .await
            .map_err(|_| RegistryError::Cancelled)??;
        found.ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))
    }

    /// A link that gave up reconnecting leaves the registry, the next
    /// `get_or_create` starts over with a fresh one.
    fn watch_exhaustion(&self, connection: &Arc<DeviceConnection>) {
        let mut events = connection.subscribe_events();
        let weak: Weak<DeviceConnection> = Arc::downgrade(connection);
        let sessions = self.sessions.clone();
        let device_id = connection.device_id().to_string();

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::MaxReconnectAttemptsReached { attempts, .. }) => {
                        warn!("[{}] Evicting session after {} failed reconnects", device_id, attempts);
                        break;
                    }
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("[{}] Exhaustion watcher skipped {} events", device_id, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }

            let connection = match weak.upgrade() {
                Some(c) => c,
                None => return,
            };
            let evicted = {
                let mut sessions = sessions.lock().await;
                match sessions.get(&device_id) {
                    /* a newer link under the same id stays */
                    Some(current) if Arc::ptr_eq(current, &connection) => sessions.remove(&device_id).is_some(),
                    _ => false,
                }
            };
            if evicted {
                connection.disconnect().await;
            }
        });
    }
}
