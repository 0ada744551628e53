//! Durable cache storage: one JSON file per bucket.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheEntry, RequestKey};
use crate::storage::{BucketSet, CacheStorage};
use crate::ServiceWorkerError;

const BUCKET_EXT: &str = "json";

#[derive(Deserialize)]
struct PersistedCache {
    name: String,
    created_seq: u64,
    entries: Vec<CacheEntry>,
}

#[derive(Serialize)]
struct PersistedCacheRef<'a> {
    name: &'a str,
    created_seq: u64,
    entries: Vec<&'a CacheEntry>,
}

/// [`CacheStorage`] that survives restarts.
///
/// Every mutation rewrites the affected bucket file through a temporary file
/// and a rename, so a crash leaves either the old or the new bucket on disk.
/// A mutation whose write fails is rolled back in memory.
#[derive(Debug)]
pub struct DiskCacheStorage {
    dir: PathBuf,
    buckets: RwLock<BucketSet>,
}

impl DiskCacheStorage {
    /// Open (creating if needed) a storage directory and load its buckets.
    ///
    /// Bucket files that cannot be read or parsed are skipped with a warning.
    pub async fn open_dir(dir: impl Into<PathBuf>) -> Result<Self, ServiceWorkerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create storage directory", &dir, e))?;

        let mut buckets = BucketSet::default();
        let mut read_dir = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| io_error("read storage directory", &dir, e))?;

        while let Some(dir_entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| io_error("read storage directory", &dir, e))?
        {
            let path = dir_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BUCKET_EXT) {
                continue;
            }
            match load_bucket(&path).await {
                Ok(cache) => {
                    debug!(cache = %cache.name, entries = cache.len(), "Loaded cache bucket");
                    buckets.insert_loaded(cache);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable cache bucket"),
            }
        }

        info!(dir = %dir.display(), buckets = buckets.names().len(), "Disk cache storage opened");

        Ok(Self {
            dir,
            buckets: RwLock::new(buckets),
        })
    }

    /// The storage directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn bucket_path(&self, name: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", urlencoding::encode(name), BUCKET_EXT))
    }

    async fn persist(&self, cache: &Cache) -> Result<(), ServiceWorkerError> {
        let path = self.bucket_path(&cache.name);
        let tmp = path.with_extension("tmp");

        let snapshot = PersistedCacheRef {
            name: &cache.name,
            created_seq: cache.created_seq,
            entries: cache.entries().collect(),
        };
        let data = serde_json::to_vec(&snapshot)
            .map_err(|e| ServiceWorkerError::CacheError(format!("serialize '{}': {e}", cache.name)))?;

        tokio::fs::write(&tmp, data)
            .await
            .map_err(|e| io_error("write bucket", &tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("replace bucket", &path, e))
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut buckets = self.buckets.write().await;
        if !buckets.open(name) {
            return Ok(false);
        }
        if let Some(cache) = buckets.get(name) {
            if let Err(e) = self.persist(cache).await {
                buckets.remove(name);
                return Err(e);
            }
        }
        Ok(true)
    }

    async fn has(&self, name: &str) -> bool {
        self.buckets.read().await.has(name)
    }

    async fn keys(&self) -> Vec<String> {
        self.buckets.read().await.names()
    }

    async fn delete(&self, name: &str) -> Result<bool, ServiceWorkerError> {
        let mut buckets = self.buckets.write().await;
        if !buckets.has(name) {
            return Ok(false);
        }

        let path = self.bucket_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("delete bucket", &path, e)),
        }
        buckets.remove(name);
        Ok(true)
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
        self.put_all(name, vec![entry]).await
    }

    async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), ServiceWorkerError> {
        let mut buckets = self.buckets.write().await;
        let cache = buckets.bucket_or_not_found(name)?;

        let mut replaced = Vec::with_capacity(entries.len());
        for entry in entries {
            replaced.push((entry.key.clone(), cache.match_request(&entry.key).cloned()));
            cache.put(entry);
        }

        if let Err(e) = self.persist(cache).await {
            for (key, previous) in replaced.into_iter().rev() {
                match previous {
                    Some(previous) => cache.put(previous),
                    None => {
                        cache.delete(&key);
                    }
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn entry_count(&self, name: &str) -> Option<usize> {
        self.buckets.read().await.get(name).map(Cache::len)
    }
}

async fn load_bucket(path: &Path) -> Result<Cache, ServiceWorkerError> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| io_error("read bucket", path, e))?;
    let persisted: PersistedCache = serde_json::from_slice(&data)
        .map_err(|e| ServiceWorkerError::CacheError(format!("parse {}: {e}", path.display())))?;
    Ok(Cache::with_entries(
        &persisted.name,
        persisted.created_seq,
        persisted.entries,
    ))
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> ServiceWorkerError {
    ServiceWorkerError::CacheError(format!("{action} {}: {err}", path.display()))
}
