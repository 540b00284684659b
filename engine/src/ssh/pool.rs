//! Connection pool
//!
//! At most one live connection exists per `user@host`. Acquires for the same
//! key are serialized by a per-key dial lock, so a slow dial never blocks
//! lookups of other hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::ssh::{DialTarget, Dialer, ExecOutput, RemoteConnection};
use crate::workers::sweeper::Sweep;

/// Connection pool options
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Timeout for establishing a new connection
    pub connect_timeout: Duration,

    /// Connections unused for longer than this are evicted by the sweeper
    pub idle_timeout: Duration,

    /// Interval between idle sweeps
    pub sweep_interval: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),   // 10 minutes
            sweep_interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

// ===== ACTIVITY ===== //

/// Last use and in-flight command count of a connection or lease
#[derive(Debug)]
pub(crate) struct Activity {
    last_used: std::sync::Mutex<Instant>,
    in_flight: AtomicUsize,
}

impl Activity {
    pub(crate) fn new() -> Self {
        Self {
            last_used: std::sync::Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub(crate) fn touch(&self) {
        let mut last_used = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        *last_used = Instant::now();
    }

    pub(crate) fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst) > 0
    }

    fn begin(&self) -> InFlight<'_> {
        self.touch();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(self)
    }
}

/// Marks a command as running until dropped, including when the command
/// future is cancelled by a timeout
struct InFlight<'a>(&'a Activity);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.touch();
    }
}

// ===== CONNECTION ===== //

/// Handle on a pooled connection.
///
/// Clones share the same transport. The raw transport is never exposed;
/// commands go through [`crate::ssh::executor`].
#[derive(Clone)]
pub struct Connection {
    key: String,
    host: String,
    user: String,
    established_at: DateTime<Utc>,
    activity: Arc<Activity>,
    lease: Option<Arc<Activity>>,
    transport: Arc<dyn RemoteConnection>,
}

impl Connection {
    fn new(target: &DialTarget, transport: Arc<dyn RemoteConnection>) -> Self {
        Self {
            key: target.key(),
            host: target.host.clone(),
            user: target.user.clone(),
            established_at: Utc::now(),
            activity: Arc::new(Activity::new()),
            lease: None,
            transport,
        }
    }

    /// Handle on the same transport that also records its commands on `lease`
    pub(crate) fn with_lease(&self, lease: Arc<Activity>) -> Self {
        Self {
            lease: Some(lease),
            ..self.clone()
        }
    }

    /// Pool key, `user@host`
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Time since the connection was last used
    pub fn idle_for(&self) -> Duration {
        self.activity.last_used().elapsed()
    }

    /// True while a command is running on this connection through any handle
    pub fn is_busy(&self) -> bool {
        self.activity.is_busy()
    }

    fn is_idle_longer_than(&self, timeout: Duration) -> bool {
        !self.is_busy() && self.idle_for() > timeout
    }

    /// True if both handles share the same transport
    pub fn same_transport(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.transport, &other.transport)
    }

    pub(crate) async fn exec(
        &self,
        command: &str,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecOutput, EngineError> {
        let _running = self.activity.begin();
        let _leased = self.lease.as_deref().map(Activity::begin);
        self.transport.exec(command, stdin).await
    }

    /// Liveness probe: open and close a throwaway channel
    pub async fn probe(&self) -> Result<(), EngineError> {
        self.transport.probe().await
    }

    async fn close(&self) {
        self.transport.close().await;
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// Pool of live connections keyed by `user@host`
pub struct ConnectionPool {
    dialer: Arc<dyn Dialer>,
    options: PoolOptions,
    connections: RwLock<HashMap<String, Connection>>,
    dial_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ConnectionPool {
    pub fn new(dialer: Arc<dyn Dialer>, options: PoolOptions) -> Self {
        Self {
            dialer,
            options,
            connections: RwLock::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    async fn dial_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.dial_locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Return the pooled connection for the target, dialing if absent or dead.
    ///
    /// A cached connection that fails its liveness probe is evicted and
    /// redialed exactly once. Dial failures are returned as connectivity
    /// errors without retry.
    pub async fn acquire(&self, target: &DialTarget) -> Result<Connection, EngineError> {
        let key = target.key();
        let dial_lock = self.dial_lock(&key).await;
        let _guard = dial_lock.lock().await;

        let cached = self.connections.read().await.get(&key).cloned();
        if let Some(conn) = cached {
            match conn.probe().await {
                Ok(()) => {
                    conn.activity.touch();
                    debug!("Reusing pooled connection {}", key);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("Pooled connection {} failed liveness probe: {}", key, e);
                    self.evict(&key).await;
                }
            }
        }

        let transport = match tokio::time::timeout(self.options.connect_timeout, self.dialer.dial(target)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(EngineError::Connectivity(format!(
                    "dial {} timed out after {:?}",
                    key, self.options.connect_timeout
                )));
            }
        };

        let conn = Connection::new(target, transport);
        self.connections.write().await.insert(key.clone(), conn.clone());
        info!("Established connection {}", key);
        Ok(conn)
    }

    /// Remove and close the connection for `key`, if any
    pub async fn evict(&self, key: &str) -> bool {
        let removed = self.connections.write().await.remove(key);
        match removed {
            Some(conn) => {
                conn.close().await;
                debug!("Evicted connection {}", key);
                true
            }
            None => false,
        }
    }

    /// Evict `conn` if it is still the pooled connection for its key.
    ///
    /// A newer connection dialed under the same key is left alone.
    pub async fn evict_connection(&self, conn: &Connection) -> bool {
        let removed = {
            let mut connections = self.connections.write().await;
            match connections.get(conn.key()) {
                Some(current) if current.same_transport(conn) => connections.remove(conn.key()),
                _ => None,
            }
        };
        match removed {
            Some(current) => {
                current.close().await;
                debug!("Evicted connection {}", current.key());
                true
            }
            None => false,
        }
    }

    /// Evict connections idle longer than the configured timeout.
    ///
    /// A connection with a command in flight is never idle.
    pub async fn sweep_idle(&self) -> usize {
        let expired: Vec<Connection> = {
            let mut connections = self.connections.write().await;
            let keys: Vec<String> = connections
                .iter()
                .filter(|(_, c)| c.is_idle_longer_than(self.options.idle_timeout))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| connections.remove(k)).collect()
        };

        for conn in &expired {
            info!("Closing idle connection {} (idle {:?})", conn.key(), conn.idle_for());
            conn.close().await;
        }

        self.prune_dial_locks().await;
        expired.len()
    }

    async fn prune_dial_locks(&self) {
        let connections = self.connections.read().await;
        let mut locks = self.dial_locks.lock().await;
        locks.retain(|key, lock| connections.contains_key(key) || Arc::strong_count(lock) > 1);
    }

    /// Close every pooled connection
    pub async fn close_all(&self) {
        let drained: Vec<Connection> = self.connections.write().await.drain().map(|(_, c)| c).collect();
        for conn in drained {
            conn.close().await;
        }
    }

    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.connections.read().await.contains_key(key)
    }
}

#[async_trait]
impl Sweep for ConnectionPool {
    fn name(&self) -> &'static str {
        "connection pool"
    }

    async fn sweep(&self) -> usize {
        self.sweep_idle().await
    }
}
