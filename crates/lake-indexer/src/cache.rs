//! Time-bounded lookup cache.
//!
//! The map lock is only held to find or create a key's slot. Each slot is a
//! `OnceCell`, so concurrent misses for the same key construct the value once
//! while lookups of other keys proceed.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OnceCell, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted: Instant,
}

impl<V> Entry<V> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.inserted.elapsed() < ttl
    }
}

type Slot<V> = Arc<OnceCell<Entry<V>>>;

/// A slot is live while its value is being constructed or is still fresh.
fn is_live<V>(slot: &Slot<V>, ttl: Duration) -> bool {
    slot.get().map_or(true, |e| e.is_fresh(ttl))
}

/// A map whose entries expire `ttl` after insertion.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: RwLock<HashMap<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the fresh value for `key`, if any.
    pub async fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .and_then(|slot| slot.get())
            .filter(|e| e.is_fresh(self.ttl))
            .map(|e| e.value.clone())
    }

    async fn slot(&self, key: &K) -> Slot<V> {
        let mut entries = self.entries.write().await;
        match entries.get(key) {
            Some(slot) if is_live(slot, self.ttl) => Arc::clone(slot),
            _ => {
                let slot = Arc::new(OnceCell::new());
                entries.insert(key.clone(), Arc::clone(&slot));
                slot
            }
        }
    }

    /// Returns the cached value or constructs it with `init`.
    ///
    /// Failed initializations are not cached.
    ///
    /// # Errors
    ///
    /// Returns the initializer's error.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }

        let slot = self.slot(&key).await;
        let initialized = slot
            .get_or_try_init(|| async {
                let value = init().await?;
                Ok(Entry {
                    value,
                    inserted: Instant::now(),
                })
            })
            .await;
        match initialized {
            Ok(entry) => Ok(entry.value.clone()),
            Err(e) => {
                let mut entries = self.entries.write().await;
                if entries
                    .get(&key)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && !current.initialized())
                {
                    entries.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Drops the entry for `key`.
    pub async fn invalidate(&self, key: &K) {
        self.entries.write().await.remove(key);
    }

    /// Drops expired entries.
    pub async fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .await
            .retain(|_, slot| is_live(slot, ttl));
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Returns true if nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
