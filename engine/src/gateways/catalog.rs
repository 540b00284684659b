//! Application catalog

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::info;

use crate::errors::EngineError;
use crate::filesys::file::File;
use crate::models::catalog::CatalogEntry;

/// Read access to catalog entries
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get(&self, id: &str) -> Result<CatalogEntry, EngineError>;

    async fn list(&self) -> Result<Vec<CatalogEntry>, EngineError>;
}

/// Fixed set of entries
pub struct StaticCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl StaticCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.id.clone(), e)).collect(),
        }
    }

    /// Load entries from a JSON array file
    pub async fn load(file: &File) -> Result<Self, EngineError> {
        let entries: Vec<CatalogEntry> = file.read_json().await?;
        info!("Loaded {} catalog entries from {:?}", entries.len(), file.path());
        Ok(Self::new(entries))
    }
}

#[async_trait]
impl Catalog for StaticCatalog {
    async fn get(&self, id: &str) -> Result<CatalogEntry, EngineError> {
        self.entries
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("catalog entry {}", id)))
    }

    async fn list(&self) -> Result<Vec<CatalogEntry>, EngineError> {
        Ok(self.entries.values().cloned().collect())
    }
}
