//! Cache storage: the set of named buckets.

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::sync::RwLock;

use crate::cache::{Cache, CacheEntry, RequestKey};
use crate::ServiceWorkerError;

/// Named-bucket storage used by the worker.
///
/// Implementations provide atomic per-key `put` / `match_request`, and an
/// all-or-nothing `put_all`.
#[async_trait]
pub trait CacheStorage: Send + Sync {
    /// Open a bucket, creating it if absent. Returns true if it was created.
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Check if a bucket exists.
    async fn has(&self, name: &str) -> bool;

    /// All bucket names, oldest first.
    async fn keys(&self) -> Vec<String>;

    /// Delete a bucket. Returns false if it did not exist.
    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError>;

    /// Look up a request identity in one bucket.
    async fn match_request(&self, name: &str, key: &RequestKey) -> Option<CacheEntry>;

    /// Store one entry in an existing bucket.
    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError>;

    /// Store every entry in an existing bucket, or none of them.
    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError>;

    /// Number of entries in a bucket, if it exists.
    async fn entry_count(&self, name: &str) -> Option<usize>;
}

/// Buckets keyed by name, with creation order.
#[derive(Debug, Default)]
pub(crate) struct BucketSet {
    caches: HashMap<String, Cache>,
    next_seq: u64,
}

impl BucketSet {
    pub(crate) fn insert_loaded(&mut self, cache: Cache) {
        self.next_seq = self.next_seq.max(cache.created_seq + 1);
        self.caches.insert(cache.name.clone(), cache);
    }

    /// Returns true if the bucket was created.
    pub(crate) fn open(&mut self, name: &str) -> bool {
        if self.caches.contains_key(name) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.caches
            .insert(name.to_string(), Cache::with_entries(name, seq, Vec::new()));
        true
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Cache> {
        self.caches.get(name)
    }

    pub(crate) fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<Cache> {
        self.caches.remove(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        let mut caches: Vec<&Cache> = self.caches.values().collect();
        caches.sort_by_key(|c| c.created_seq);
        caches.into_iter().map(|c| c.name.clone()).collect()
    }

    pub(crate) fn bucket_or_not_found(&mut self, name: &str) -> Result<&mut Cache, ServiceWorkerError> {
        self.caches
            .get_mut(name)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("cache '{name}'")))
    }
}

/// In-memory [`CacheStorage`].
#[derive(Debug, Default)]
pub struct MemoryCacheStorage {
    buckets: RwLock<BucketSet>,
}

impl MemoryCacheStorage {
    /// Create new, empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheStorage for MemoryCacheStorage {
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.buckets.write().await.open(name))
    }

    async fn has(&self, name: &str) -> bool {
        self.buckets.read().await.has(name)
    }

    async fn keys(&self) -> Vec<String> {
        self.buckets.read().await.names()
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        Ok(self.buckets.write().await.remove(name).is_some())
    }

    async fn match_request(&self, name: &str, key: &RequestKey) -> Option<CacheEntry> {
        self.buckets
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), ServiceWorkerError> {
        let mut buckets = self.buckets.write().await;
        buckets.bucket_or_not_found(name)?.put(entry);
        Ok(())
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError> {
        let mut buckets = self.buckets.write().await;
        let cache = buckets.bucket_or_not_found(name)?;
        for entry in entries {
            cache.put(entry);
        }
        Ok(())
    }

    async fn entry_count(&self, name: &str) -> Option<usize> {
        self.buckets.read().await.get(name).map(Cache::len)
    }
}
