//! Trust-on-first-use host key store
//!
//! The first fingerprint seen for a `host:port` is pinned; later connections
//! presenting a different key are rejected.

use std::collections::BTreeMap;

use tokio::sync::RwLock;
use tracing::{error, info};

use crate::errors::EngineError;
use crate::filesys::file::File;

/// Outcome of a host key check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyCheck {
    /// Fingerprint matches the pinned one
    Trusted,

    /// No fingerprint was pinned; this one is now
    FirstUse,

    /// Fingerprint differs from the pinned one
    Mismatch { expected: String },
}

impl HostKeyCheck {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, HostKeyCheck::Mismatch { .. })
    }
}

/// Pinned host key fingerprints, optionally persisted to a JSON file
pub struct HostKeyStore {
    file: Option<File>,
    pinned: RwLock<BTreeMap<String, String>>,
}

impl HostKeyStore {
    /// Store that only lives in memory
    pub fn in_memory() -> Self {
        Self {
            file: None,
            pinned: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open a persisted store, loading previously pinned keys
    pub async fn open(file: File) -> Result<Self, EngineError> {
        let pinned: BTreeMap<String, String> = file.read_json_or_default().await?;
        Ok(Self {
            file: Some(file),
            pinned: RwLock::new(pinned),
        })
    }

    /// Check `fingerprint` for `host:port`, pinning it on first use
    pub async fn verify(
        &self,
        host: &str,
        port: u16,
        fingerprint: &str,
    ) -> Result<HostKeyCheck, EngineError> {
        let entry = format!("{}:{}", host, port);
        let mut pinned = self.pinned.write().await;

        match pinned.get(&entry) {
            Some(expected) if expected == fingerprint => Ok(HostKeyCheck::Trusted),
            Some(expected) => {
                error!(
                    "Host key mismatch for {}: expected {}, got {}",
                    entry, expected, fingerprint
                );
                Ok(HostKeyCheck::Mismatch {
                    expected: expected.clone(),
                })
            }
            None => {
                info!("Pinning host key for {}: {}", entry, fingerprint);
                let mut next = pinned.clone();
                next.insert(entry, fingerprint.to_string());
                if let Some(file) = &self.file {
                    file.write_json(&next).await?;
                }
                *pinned = next;
                Ok(HostKeyCheck::FirstUse)
            }
        }
    }

    /// Forget the pinned key of a host, e.g. after the VPS was rebuilt
    pub async fn forget(&self, host: &str, port: u16) -> Result<(), EngineError> {
        let entry = format!("{}:{}", host, port);
        let mut pinned = self.pinned.write().await;
        if !pinned.contains_key(&entry) {
            return Ok(());
        }
        let mut next = pinned.clone();
        next.remove(&entry);
        if let Some(file) = &self.file {
            file.write_json(&next).await?;
        }
        *pinned = next;
        Ok(())
    }
}
