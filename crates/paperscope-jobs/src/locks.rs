//! Per-key async mutexes.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serializes work per string key while letting distinct keys proceed.
#[derive(Default)]
pub struct KeyedLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().await;
            // Drop idle entries: only the map holds them.
            map.retain(|_, lock| Arc::strong_count(lock) > 1);
            map.entry(key.to_string()).or_default().clone()
        };
        entry.lock_owned().await
    }

    /// Whether someone currently holds or awaits `key`.
    pub async fn is_busy(&self, key: &str) -> bool {
        self.inner
            .lock()
            .await
            .get(key)
            .is_some_and(|lock| Arc::strong_count(lock) > 1)
    }
}
