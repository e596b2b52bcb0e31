//! TTL memoization of read-side computations

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::refresh::RefreshCompleted;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// In-memory response cache. Entries expire lazily on read and the
/// whole cache drops at once on refresh completion or explicit clear.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> TtlCache<V> {
        TtlCache {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Cached value if present and unexpired, otherwise the awaited
    /// result of `compute`, stored under `key` for `ttl`. The lock is
    /// never held across the compute await.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let now = Instant::now();
        let hit = {
            let entries = self.entries.lock().expect("cache lock poisoned");
            entries
                .get(key)
                .filter(|e| e.expires_at > now)
                .map(|e| e.value.clone())
        };
        if let Some(value) = hit {
            return value;
        }
        let value = compute().await;
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        value
    }

    /// Flush the entire cache. Returns the number of evicted entries.
    pub fn invalidate_all(&self) -> usize {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        let evicted = entries.len();
        entries.clear();
        evicted
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        TtlCache::new()
    }
}

/// Wire the cache to the orchestrator's completion broadcast: every
/// successful refresh flushes it wholesale, only after the commit is
/// fully done. A lagged receiver flushes conservatively.
pub fn invalidate_on_refresh<V>(
    cache: Arc<TtlCache<V>>,
    mut completed: broadcast::Receiver<RefreshCompleted>,
) -> JoinHandle<()>
where
    V: Clone + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match completed.recv().await {
                Ok(event) => {
                    let evicted = cache.invalidate_all();
                    info!(run_id = %event.run_id, evicted, "cache invalidated after refresh");
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    cache.invalidate_all();
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
