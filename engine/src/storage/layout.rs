//! Storage layout configuration

use std::path::PathBuf;

use crate::filesys::file::File;

/// Where the engine keeps its local files
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,
}

impl StorageLayout {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// File-backed key-value store
    pub fn kv_file(&self) -> File {
        File::new(self.base_dir.join("kv.json"))
    }

    /// Trusted SSH host keys
    pub fn known_hosts_file(&self) -> File {
        File::new(self.base_dir.join("known_hosts.json"))
    }

    pub fn catalog_file(&self) -> File {
        File::new(self.base_dir.join("catalog.json"))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/var/lib/kubedeck")
    }
}
