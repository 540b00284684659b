//! Per-application run locks

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Serializes create/upgrade/delete runs of the same application ID.
///
/// Entries are held weakly and dropped once no run holds or waits on them.
#[derive(Default)]
pub struct AppLocks {
    locks: Mutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl AppLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `app_id`
    pub async fn lock(&self, app_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.retain(|_, weak| weak.strong_count() > 0);
            match locks.get(app_id).and_then(Weak::upgrade) {
                Some(lock) => lock,
                None => {
                    let lock = Arc::new(AsyncMutex::new(()));
                    locks.insert(app_id.to_string(), Arc::downgrade(&lock));
                    lock
                }
            }
        };
        lock.lock_owned().await
    }

    /// Number of IDs with a live lock
    pub fn len(&self) -> usize {
        let locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.values().filter(|weak| weak.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
