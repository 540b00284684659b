//! Latest-version cache

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Version cache entry
#[derive(Debug, Clone)]
pub struct VersionCacheEntry {
    pub version: String,
    pub fetched_at: DateTime<Utc>,
    expires_at: Instant,
}

impl VersionCacheEntry {
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.expires_at
    }
}

/// In-memory map of application ID to latest upstream version
pub struct VersionCache {
    entries: RwLock<HashMap<String, VersionCacheEntry>>,
    ttl: Duration,
    capacity: usize,
}

impl VersionCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            capacity,
        }
    }

    /// Fresh cached version, `None` if absent or expired
    pub fn get(&self, app_id: &str) -> Option<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries
            .get(app_id)
            .filter(|e| e.is_fresh())
            .map(|e| e.version.clone())
    }

    /// Cached entry regardless of expiry
    pub fn get_entry(&self, app_id: &str) -> Option<VersionCacheEntry> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(app_id).cloned()
    }

    /// Insert or replace the version for an application
    pub fn insert(&self, app_id: &str, version: String) {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());

        // Evict the entry closest to expiry if at capacity
        if entries.len() >= self.capacity && !entries.contains_key(app_id) {
            if let Some(oldest_id) = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(id, _)| id.clone())
            {
                entries.remove(&oldest_id);
            }
        }

        entries.insert(
            app_id.to_string(),
            VersionCacheEntry {
                version,
                fetched_at: Utc::now(),
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, app_id: &str) -> Option<VersionCacheEntry> {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(app_id)
    }

    pub fn keys(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
