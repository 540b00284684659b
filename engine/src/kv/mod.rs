//! Key-value store collaborator
//!
//! The engine only needs string get/put/delete and prefix listing. No
//! multi-key transactions are assumed.

pub mod keys;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::EngineError;
use crate::filesys::file::File;

/// Generic string key-value store
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError>;

    async fn put(&self, key: &str, value: String) -> Result<(), EngineError>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), EngineError>;

    /// List all keys starting with `prefix`, in lexical order
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, EngineError>;
}

/// Typed JSON helpers on top of any [`KvStore`]
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>, EngineError> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Like [`KvStoreExt::get_json`] but a missing key is a `NotFound` error
    async fn require_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<T, EngineError> {
        self.get_json(key)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("key {}", key)))
    }

    async fn put_json<T: Serialize + Sync + ?Sized>(&self, key: &str, value: &T) -> Result<(), EngineError> {
        let raw = serde_json::to_string(value)?;
        self.put(key, raw).await
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// In-memory store, used in tests and single-process setups
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), EngineError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .entries
            .read()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Store persisted as a single JSON document, rewritten atomically on each change.
///
/// Memory only reflects a change once the document was written.
pub struct FileKvStore {
    file: File,
    entries: RwLock<BTreeMap<String, String>>,
}

impl FileKvStore {
    /// Open the store, loading existing entries if the file exists
    pub async fn open(file: File) -> Result<Self, EngineError> {
        let entries: BTreeMap<String, String> = file.read_json_or_default().await?;
        debug!("Loaded {} key-value entries from {:?}", entries.len(), file.path());
        Ok(Self {
            file,
            entries: RwLock::new(entries),
        })
    }

    async fn persist(&self, entries: &BTreeMap<String, String>) -> Result<(), EngineError> {
        self.file
            .write_json(entries)
            .await
            .map_err(|e| EngineError::StorageError(format!("{:?}: {}", self.file.path(), e)))
    }
}

#[async_trait]
impl KvStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, EngineError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), EngineError> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        next.insert(key.to_string(), value);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EngineError> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(key) {
            return Ok(());
        }
        let mut next = entries.clone();
        next.remove(key);
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, EngineError> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
