//! Session manager
//!
//! A session is a time-boxed lease on a pooled connection bound to a caller
//! token. It stays valid while younger than `max_age`, used within
//! `max_idle`, and while its connection answers a liveness probe. Both a
//! lookup and any command run through the leased connection count as use.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::ssh::pool::{Activity, Connection, ConnectionPool};
use crate::ssh::{DialTarget, SshCredential};
use crate::utils::{generate_uuid, sha256_hash};
use crate::workers::sweeper::Sweep;

/// Session manager options
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Maximum session lifetime
    pub max_age: Duration,

    /// Maximum time between uses
    pub max_idle: Duration,

    /// Interval between invalid-session sweeps
    pub sweep_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(30 * 60),
            max_idle: Duration::from_secs(15 * 60),
            sweep_interval: Duration::from_secs(2 * 60),
        }
    }
}

/// A leased connection
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub vps_id: String,
    pub host: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    owner_digest: String,
    created: Instant,
    activity: Arc<Activity>,
    connection: Connection,
}

impl Session {
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// True if the session was created with this caller token
    pub fn is_owned_by(&self, caller_token: &SecretString) -> bool {
        self.owner_digest == sha256_hash(caller_token.expose_secret().as_bytes())
    }

    /// True while a command runs through this lease
    pub fn is_busy(&self) -> bool {
        self.activity.is_busy()
    }

    /// Time since the session was last looked up or ran a command
    pub fn idle_for(&self) -> Duration {
        self.activity.last_used().elapsed()
    }

    fn expiry_reason(&self, options: &SessionOptions, now: Instant) -> Option<&'static str> {
        if now.saturating_duration_since(self.created) >= options.max_age {
            Some("max age reached")
        } else if !self.is_busy()
            && now.saturating_duration_since(self.activity.last_used()) >= options.max_idle
        {
            Some("idle too long")
        } else {
            None
        }
    }
}

/// Table of live sessions
pub struct SessionManager {
    pool: Arc<ConnectionPool>,
    options: SessionOptions,
    sessions: Arc<RwLock<HashMap<String, Session>>>,
}

impl SessionManager {
    pub fn new(pool: Arc<ConnectionPool>, options: SessionOptions) -> Self {
        Self {
            pool,
            options,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Acquire a pooled connection and lease it under a new session id
    pub async fn create_session(
        &self,
        vps_id: &str,
        host: &str,
        port: u16,
        user: &str,
        credential: SshCredential,
        caller_token: &SecretString,
    ) -> Result<Session, EngineError> {
        let target = DialTarget::new(host, port, user, credential);
        let connection = self.pool.acquire(&target).await?;

        let activity = Arc::new(Activity::new());
        let session = Session {
            id: generate_uuid(),
            vps_id: vps_id.to_string(),
            host: host.to_string(),
            user: user.to_string(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
            owner_digest: sha256_hash(caller_token.expose_secret().as_bytes()),
            created: Instant::now(),
            connection: connection.with_lease(activity.clone()),
            activity,
        };

        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        info!("Created session {} for VPS {} ({}@{})", session.id, vps_id, user, host);
        Ok(session)
    }

    /// Look up a session, refreshing its last-use time.
    ///
    /// Expired or dead sessions are removed in the background and reported
    /// as not found.
    pub async fn get_session(&self, id: &str) -> Result<Session, EngineError> {
        let session = self
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("session {}", id)))?;

        let invalid = match session.expiry_reason(&self.options, Instant::now()) {
            Some(reason) => Some(reason.to_string()),
            None => session
                .connection
                .probe()
                .await
                .err()
                .map(|e| format!("liveness probe failed: {}", e)),
        };

        if let Some(reason) = invalid {
            debug!("Session {} is no longer valid: {}", id, reason);
            let sessions = self.sessions.clone();
            let pool = self.pool.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                remove_and_close(&sessions, &pool, &id).await;
            });
            return Err(EngineError::NotFound(format!("session {}", session.id)));
        }

        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(entry) => {
                entry.activity.touch();
                entry.last_used_at = Utc::now();
                Ok(entry.clone())
            }
            None => Err(EngineError::NotFound(format!("session {}", id))),
        }
    }

    /// End a lease, keeping the pooled connection for reuse
    pub async fn release_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            debug!("Released session {}", id);
        }
        removed
    }

    /// Remove invalid sessions and close their connections.
    ///
    /// Sessions with a command in flight are left for a later sweep.
    pub async fn sweep_invalid(&self) -> usize {
        let snapshot: Vec<Session> = self.sessions.read().await.values().cloned().collect();
        let now = Instant::now();

        let mut invalid = Vec::new();
        for session in snapshot {
            if session.is_busy() {
                debug!("Session {} is running a command, skipping", session.id);
            } else if let Some(reason) = session.expiry_reason(&self.options, now) {
                debug!("Session {} expired: {}", session.id, reason);
                invalid.push(session.id);
            } else if let Err(e) = session.connection.probe().await {
                warn!("Session {} connection is dead: {}", session.id, e);
                invalid.push(session.id);
            }
        }

        for id in &invalid {
            remove_and_close(&self.sessions, &self.pool, id).await;
        }
        invalid.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Remove a session and close its connection unless another session still
/// leases the same pooled connection or a command is running on it
async fn remove_and_close(
    sessions: &RwLock<HashMap<String, Session>>,
    pool: &ConnectionPool,
    id: &str,
) {
    let (removed, still_leased) = {
        let mut sessions = sessions.write().await;
        let removed = sessions.remove(id);
        let still_leased = removed
            .as_ref()
            .map(|s| {
                sessions
                    .values()
                    .any(|other| other.connection.same_transport(&s.connection))
            })
            .unwrap_or(false);
        (removed, still_leased)
    };

    if let Some(session) = removed {
        info!("Removed session {}", session.id);
        if !still_leased && !session.connection.is_busy() {
            pool.evict_connection(&session.connection).await;
        }
    }
}

#[async_trait]
impl Sweep for SessionManager {
    fn name(&self) -> &'static str {
        "session table"
    }

    async fn sweep(&self) -> usize {
        self.sweep_invalid().await
    }
}
