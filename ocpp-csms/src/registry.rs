//! Live connection registry
//!
//! Authoritative in-memory map of device id -> connection. At most one
//! live connection per device id: registering a second connection for the
//! same id replaces and closes the first. A periodic sweep evicts
//! connections whose transport is no longer open or that have gone silent
//! past the staleness threshold - a safety net against half-closed sockets,
//! independent of any application heartbeat.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{Call, Envelope, ProtocolGeneration};
use crate::transport::{Transport, TransportError};

/// Collaborator notified when a device goes offline (connection removed or
/// evicted). Failures are logged, never fatal to teardown.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn device_offline(
        &self,
        device_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// One device's live transport session
pub struct Connection {
    device_id: String,
    generation: ProtocolGeneration,
    transport: Arc<dyn Transport>,
    remote_addr: SocketAddr,
    connected_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    metadata: RwLock<HashMap<String, String>>,
}

impl Connection {
    fn new(
        device_id: String,
        generation: ProtocolGeneration,
        transport: Arc<dyn Transport>,
        remote_addr: SocketAddr,
    ) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            generation,
            transport,
            remote_addr,
            connected_at: now,
            last_activity: RwLock::new(now),
            metadata: RwLock::new(HashMap::new()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn generation(&self) -> ProtocolGeneration {
        self.generation
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.last_activity.read()
    }

    /// Refresh the last-activity timestamp
    pub fn touch(&self) {
        *self.last_activity.write() = Utc::now();
    }

    /// How long the connection has been silent
    pub fn idle_for(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.last_activity())
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Send one frame; counts as activity
    pub async fn send(&self, frame: &str) -> Result<(), TransportError> {
        self.transport.send(frame).await?;
        self.touch();
        Ok(())
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn set_meta(&self, key: impl Into<String>, value: impl Into<String>) {
        self.metadata.write().insert(key.into(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<String> {
        self.metadata.read().get(key).cloned()
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        *self.last_activity.write() = at;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("device_id", &self.device_id)
            .field("generation", &self.generation)
            .field("remote_addr", &self.remote_addr)
            .field("connected_at", &self.connected_at)
            .finish()
    }
}

type RemovalHook = Box<dyn Fn(&str) + Send + Sync>;

/// Thread-safe registry of live connections
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<Connection>>,
    status_sink: Option<Arc<dyn StatusSink>>,
    on_removed: RwLock<Option<RemovalHook>>,
    stale_after: Duration,
}

impl ConnectionRegistry {
    pub fn new(stale_after: Duration, status_sink: Option<Arc<dyn StatusSink>>) -> Self {
        Self {
            connections: DashMap::new(),
            status_sink,
            on_removed: RwLock::new(None),
            stale_after,
        }
    }

    /// Install the hook invoked after every connection teardown, whatever
    /// removed it: explicit removal, a failed broadcast send, the receive
    /// loop exiting, or the eviction sweep. The server wires this to
    /// pending-command cancellation so no removal path leaves a caller
    /// waiting out the full timeout.
    pub fn set_on_removed(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_removed.write() = Some(Box::new(hook));
    }

    /// Store a new connection for `device_id`. An existing connection for
    /// the same id is replaced and closed best-effort.
    pub async fn register(
        &self,
        device_id: impl Into<String>,
        generation: ProtocolGeneration,
        transport: Arc<dyn Transport>,
        remote_addr: SocketAddr,
    ) -> Arc<Connection> {
        let device_id = device_id.into();
        let connection = Arc::new(Connection::new(
            device_id.clone(),
            generation,
            transport,
            remote_addr,
        ));

        let replaced = self.connections.insert(device_id.clone(), connection.clone());
        if let Some(old) = replaced {
            warn!(
                "replacing live connection for {} (old peer {})",
                device_id,
                old.remote_addr()
            );
            old.transport().close("replaced by new connection").await;
        }

        info!(
            "registered {} ({}, peer {})",
            device_id,
            generation,
            connection.remote_addr()
        );
        connection
    }

    pub fn get(&self, device_id: &str) -> Option<Arc<Connection>> {
        self.connections.get(device_id).map(|c| c.value().clone())
    }

    /// Refresh last-activity; no-op for unknown ids
    pub fn touch(&self, device_id: &str) {
        if let Some(connection) = self.connections.get(device_id) {
            connection.touch();
        }
    }

    /// Close and delete the connection for `device_id`. Returns whether an
    /// entry existed.
    pub async fn remove(&self, device_id: &str) -> bool {
        match self.connections.remove(device_id) {
            Some((_, connection)) => {
                self.teardown(&connection).await;
                true
            }
            None => false,
        }
    }

    /// Remove `device_id` only if the stored connection is exactly `conn`.
    ///
    /// The teardown path of a replaced connection's receive loop must not
    /// take down the replacement that is already registered under the same
    /// id.
    pub async fn remove_exact(&self, device_id: &str, conn: &Arc<Connection>) -> bool {
        let removed = self
            .connections
            .remove_if(device_id, |_, current| Arc::ptr_eq(current, conn));

        match removed {
            Some((_, connection)) => {
                self.teardown(&connection).await;
                true
            }
            None => false,
        }
    }

    async fn teardown(&self, connection: &Arc<Connection>) {
        connection.transport().close("connection removed").await;
        info!("removed {}", connection.device_id());

        if let Some(sink) = &self.status_sink {
            if let Err(e) = sink.device_offline(connection.device_id()).await {
                warn!(
                    "status sink failed for {}: {}",
                    connection.device_id(),
                    e
                );
            }
        }

        if let Some(hook) = self.on_removed.read().as_ref() {
            hook(connection.device_id());
        }
    }

    /// Point-in-time snapshot of every live connection
    pub fn list_all(&self) -> Vec<Arc<Connection>> {
        self.connections.iter().map(|c| c.value().clone()).collect()
    }

    pub fn list_by_generation(&self, generation: ProtocolGeneration) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .filter(|c| c.value().generation() == generation)
            .map(|c| c.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Best-effort fan-out of a fire-and-forget CALL. Each recipient gets a
    /// fresh correlation id; no reply is awaited. Connections that fail to
    /// send are removed. Returns the number of successful sends.
    pub async fn broadcast(
        &self,
        action: &str,
        payload: Value,
        generation: Option<ProtocolGeneration>,
    ) -> usize {
        let targets = match generation {
            Some(generation) => self.list_by_generation(generation),
            None => self.list_all(),
        };

        let mut sent = 0;
        for connection in targets {
            let call = Envelope::Call(Call::new(action, payload.clone()));
            let frame = match connection.generation().codec().encode(&call) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("broadcast encode failed for {}: {}", connection.device_id(), e);
                    continue;
                }
            };

            match connection.send(&frame).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    warn!(
                        "broadcast send failed for {}, removing: {}",
                        connection.device_id(),
                        e
                    );
                    self.remove_exact(connection.device_id(), &connection).await;
                }
            }
        }
        sent
    }

    /// One eviction pass: removes connections whose transport is closed or
    /// whose last activity is older than the staleness threshold. Returns
    /// the evicted device ids.
    pub async fn evict_stale(&self) -> Vec<String> {
        let stale_secs = self.stale_after.as_secs() as i64;
        let candidates: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|c| {
                let connection = c.value();
                !connection.is_open() || connection.idle_for().num_seconds() >= stale_secs
            })
            .map(|c| c.value().clone())
            .collect();

        let mut evicted = Vec::new();
        for connection in candidates {
            if self
                .remove_exact(connection.device_id(), &connection)
                .await
            {
                info!(
                    "evicted {} (open: {}, idle: {}s)",
                    connection.device_id(),
                    connection.is_open(),
                    connection.idle_for().num_seconds()
                );
                evicted.push(connection.device_id().to_string());
            }
        }
        evicted
    }

    /// Spawn the periodic eviction sweep. The task runs until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick fires immediately; skip it so a fresh registry is
            // not swept at startup.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let evicted = registry.evict_stale().await;
                if !evicted.is_empty() {
                    debug!("eviction sweep removed {} connection(s)", evicted.len());
                }
            }
        })
    }
}
