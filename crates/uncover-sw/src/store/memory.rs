//! In-process backend.

use futures::future::BoxFuture;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use super::{CacheBackend, CacheEntry, RequestKey};
use crate::{Result, ServiceWorkerError};

#[derive(Debug, Default)]
struct MemoryCache {
    entries: HashMap<RequestKey, CacheEntry>,
}

impl MemoryCache {
    fn size(&self) -> usize {
        self.entries.values().map(CacheEntry::size).sum()
    }
}

/// Stores kept in process memory, optionally bounded by a byte quota.
///
/// The quota only rejects writes; nothing is ever evicted to make room.
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    caches: RwLock<HashMap<String, MemoryCache>>,
    quota_bytes: Option<usize>,
}

impl MemoryCacheStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject writes that would push total usage over `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            caches: RwLock::new(HashMap::new()),
            quota_bytes: Some(quota_bytes),
        }
    }

    /// Total bytes held across all stores.
    pub async fn usage(&self) -> usize {
        self.caches.read().await.values().map(MemoryCache::size).sum()
    }
}

impl CacheBackend for MemoryCacheStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.caches
                .write()
                .await
                .entry(name.to_string())
                .or_default();
            Ok(())
        })
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.caches.read().await.contains_key(name)) })
    }

    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { Ok(self.caches.write().await.remove(name).is_some()) })
    }

    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>>> {
        Box::pin(async move {
            let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
            names.sort();
            Ok(names)
        })
    }

    fn get<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>>> {
        Box::pin(async move {
            Ok(self
                .caches
                .read()
                .await
                .get(name)
                .and_then(|cache| cache.entries.get(key))
                .cloned())
        })
    }

    fn put<'a>(&'a self, name: &'a str, entry: CacheEntry) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut caches = self.caches.write().await;
            let key = entry.key();

            if let Some(quota) = self.quota_bytes {
                let used: usize = caches.values().map(MemoryCache::size).sum();
                let replaced = caches
                    .get(name)
                    .and_then(|cache| cache.entries.get(&key))
                    .map_or(0, CacheEntry::size);
                let needed = used - replaced + entry.size();
                if needed > quota {
                    return Err(ServiceWorkerError::QuotaExceeded(format!(
                        "{} needs {needed} bytes, quota is {quota}",
                        entry.url
                    )));
                }
            }

            caches
                .entry(name.to_string())
                .or_default()
                .entries
                .insert(key, entry);
            Ok(())
        })
    }

    fn remove<'a>(&'a self, name: &'a str, key: &'a RequestKey) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            Ok(self
                .caches
                .write()
                .await
                .get_mut(name)
                .map_or(false, |cache| cache.entries.remove(key).is_some()))
        })
    }

    fn entry_keys<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<RequestKey>>> {
        Box::pin(async move {
            let caches = self.caches.read().await;
            let mut keys: Vec<RequestKey> = caches
                .get(name)
                .map(|cache| cache.entries.keys().cloned().collect())
                .unwrap_or_default();
            keys.sort();
            Ok(keys)
        })
    }
}
