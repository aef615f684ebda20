//! Keyed registry of transport connections with connection reuse and lazy
//! reconnect-on-demand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use url::Url;

use tether_shared::PoolError;

use super::connection::{ConnectionStatus, WsConnection};
use crate::config::ConnectionConfig;

/// Normalize an endpoint for use as a pool key.
///
/// Accepts `ws://`, `wss://`, `http://` and `https://` (mapped to their ws
/// equivalents) and bare `host:port` strings (assumed `ws://`).
pub fn normalize_endpoint(raw: &str) -> Result<String, PoolError> {
    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{raw}")
    };
    let with_scheme = if let Some(rest) = with_scheme.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = with_scheme.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        with_scheme
    };

    let parsed = Url::parse(&with_scheme).map_err(|_| PoolError::InvalidUrl(raw.to_string()))?;
    if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
        return Err(PoolError::InvalidUrl(raw.to_string()));
    }

    let mut normalized = parsed.to_string();
    if parsed.path() == "/" && parsed.query().is_none() {
        normalized = normalized.trim_end_matches('/').to_string();
    }
    Ok(normalized)
}

struct Slot {
    /// Serializes connection creation per key: a second caller while a
    /// connect is in flight awaits the same attempt instead of racing a
    /// duplicate socket.
    create: tokio::sync::Mutex<()>,
    conn: Mutex<Option<WsConnection>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            create: tokio::sync::Mutex::new(()),
            conn: Mutex::new(None),
        }
    }

    fn current(&self) -> Option<WsConnection> {
        self.conn.lock().expect("pool slot poisoned").clone()
    }
}

/// Registry mapping endpoint URL to at most one live transport connection.
pub struct ConnectionPool {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    config: ConnectionConfig,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

impl ConnectionPool {
    /// Create a pool whose connections use the given default configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        self.slots
            .lock()
            .expect("pool registry poisoned")
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Return the pooled connection for `url`, creating (or reconnecting)
    /// one and awaiting its handshake if needed. A failed handshake is
    /// returned to the caller without pool-side retries; once a connection
    /// has succeeded, its own reconnect logic takes over on later drops.
    pub async fn get_connection(&self, url: &str) -> Result<WsConnection, PoolError> {
        self.get_connection_with(url, self.config.clone()).await
    }

    /// Like [`Self::get_connection`] with an explicit configuration for a
    /// newly created connection.
    pub async fn get_connection_with(
        &self,
        url: &str,
        config: ConnectionConfig,
    ) -> Result<WsConnection, PoolError> {
        let key = normalize_endpoint(url)?;
        let slot = self.slot(&key);
        let _creating = slot.create.lock().await;

        if let Some(conn) = slot.current() {
            if conn.status().is_connected() {
                return Ok(conn);
            }
            crate::log_info!("pooled connection to {} is down, reconnecting", key);
            conn.connect().await?;
            return Ok(conn);
        }

        let conn = WsConnection::new(key.clone(), config);
        conn.connect().await?;
        {
            let mut stored = slot.conn.lock().expect("pool slot poisoned");
            *stored = Some(conn.clone());
        }
        crate::log_info!("pooled new connection to {}", key);
        Ok(conn)
    }

    /// Disconnect and evict the entry for `url`, if any.
    pub fn close_connection(&self, url: &str) -> Result<(), PoolError> {
        let key = normalize_endpoint(url)?;
        let slot = self.slots.lock().expect("pool registry poisoned").remove(&key);
        if let Some(slot) = slot {
            if let Some(conn) = slot.current() {
                conn.disconnect();
            }
        }
        Ok(())
    }

    /// Disconnect and clear every entry. Used at process teardown.
    pub fn close_all(&self) {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .lock()
            .expect("pool registry poisoned")
            .drain()
            .map(|(_, slot)| slot)
            .collect();
        for slot in slots {
            if let Some(conn) = slot.current() {
                conn.disconnect();
            }
        }
    }

    /// Status of the pooled connection for `url`, if one exists.
    pub fn connection_status(&self, url: &str) -> Option<ConnectionStatus> {
        let key = normalize_endpoint(url).ok()?;
        let slot = self.slots.lock().expect("pool registry poisoned").get(&key).cloned();
        slot.and_then(|slot| slot.current()).map(|conn| conn.status())
    }

    /// Snapshot of every pooled endpoint and its status.
    pub fn all_connections(&self) -> Vec<(String, ConnectionStatus)> {
        let slots: Vec<(String, Arc<Slot>)> = self
            .slots
            .lock()
            .expect("pool registry poisoned")
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        slots
            .into_iter()
            .filter_map(|(key, slot)| slot.current().map(|conn| (key, conn.status())))
            .collect()
    }
}
