//! The worker itself: lifecycle state and the install / activate / fetch
//! handlers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::try_join_all;
use http::{Method, StatusCode};
use pawkit_net::{Network, Request, Response};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, RequestKey};
use crate::config::WorkerConfig;
use crate::storage::CacheStorage;
use crate::ServiceWorkerError;

// ==================== Lifecycle ====================

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Install handler running.
    #[default]
    Installing,
    /// Installed, waiting to be activated.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Install failed, or replaced by a newer version.
    Redundant,
}

impl ServiceWorkerState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Installing | Installed | Activating | Activated, Redundant)
        )
    }
}

/// A service worker version as tracked by its registration.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    /// Unique ID.
    pub id: ServiceWorkerId,

    /// Version string (the bucket it owns).
    pub version: String,

    state: ServiceWorkerState,

    /// Time of last state change.
    pub state_changed_at: Instant,
}

impl ServiceWorker {
    /// Create a worker in the installing state.
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            version: version.into(),
            state: ServiceWorkerState::Installing,
            state_changed_at: Instant::now(),
        }
    }

    /// Current state.
    pub fn state(&self) -> ServiceWorkerState {
        self.state
    }

    /// Move to `next`, rejecting transitions the lifecycle does not allow.
    pub fn set_state(&mut self, next: ServiceWorkerState) -> Result<(), ServiceWorkerError> {
        if !self.state.can_transition_to(next) {
            return Err(ServiceWorkerError::StateError(format!(
                "worker {} cannot go from {:?} to {:?}",
                self.version, self.state, next
            )));
        }
        debug!(worker = self.id.raw(), version = %self.version, from = ?self.state, to = ?next, "State change");
        self.state = next;
        self.state_changed_at = Instant::now();
        Ok(())
    }

    /// Check if active.
    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }

    /// Check if redundant.
    pub fn is_redundant(&self) -> bool {
        self.state == ServiceWorkerState::Redundant
    }
}

// ==================== Handler results ====================

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Number of manifest entries stored.
    pub cached: usize,
    /// Activate without waiting for the previous version to release its pages.
    pub skip_waiting: bool,
}

/// Result of activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateOutcome {
    /// Stale buckets removed, oldest first.
    pub deleted: Vec<String>,
    /// Take control of already-open pages.
    pub claim_clients: bool,
}

/// Where a fetch response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    /// The cached root document, substituted for a failed HTML request.
    OfflineFallback,
}

/// A response produced by the worker.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub response: Response,
    pub source: ResponseSource,
}

/// What the worker did with an intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs the request itself.
    Passthrough,
    /// Answered by the worker.
    Respond(FetchResponse),
    /// Intercepted but no response is available; the request fails.
    NoResponse,
}

impl FetchOutcome {
    /// The response, if the worker produced one.
    pub fn response(&self) -> Option<&FetchResponse> {
        match self {
            FetchOutcome::Respond(response) => Some(response),
            _ => None,
        }
    }
}

// ==================== Worker ====================

/// Install, activate and fetch handlers for one worker version.
pub struct OfflineCacheWorker {
    config: Arc<WorkerConfig>,
    fallback_key: RequestKey,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    writes: Mutex<JoinSet<()>>,
}

impl OfflineCacheWorker {
    /// Bind handlers to a validated configuration.
    pub fn new(
        config: WorkerConfig,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let fallback_key = RequestKey::get(&config.offline_fallback_url()?);
        Ok(Self {
            config: Arc::new(config),
            fallback_key,
            storage,
            network,
            writes: Mutex::new(JoinSet::new()),
        })
    }

    /// The configuration this worker was started with.
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Version string, which is also the current bucket name.
    pub fn version(&self) -> &str {
        &self.config.cache_name
    }

    /// Precache the manifest into the current bucket.
    ///
    /// Every asset must fetch with a 2xx status or nothing is stored; a bucket
    /// created by a failed attempt is deleted again.
    pub async fn install(&self) -> Result<InstallOutcome, ServiceWorkerError> {
        let version = self.version();
        let urls = self.config.manifest.resolve(&self.config.scope)?;
        let created = self.storage.open(version).await?;

        info!(version, assets = urls.len(), "Caching app assets");

        let fetches = urls.into_iter().map(|url| async move {
            let request = Request::get(url);
            let response = self.network.fetch(&request).await.map_err(|e| {
                ServiceWorkerError::PrecacheFailed {
                    url: request.url.to_string(),
                    reason: e.to_string(),
                }
            })?;
            if !response.ok() {
                return Err(ServiceWorkerError::PrecacheFailed {
                    url: request.url.to_string(),
                    reason: format!("status {}", response.status),
                });
            }
            Ok(CacheEntry::from_response(RequestKey::for_request(&request), &response))
        });

        let stored = match try_join_all(fetches).await {
            Ok(entries) => {
                let count = entries.len();
                self.storage.put_all(version, entries).await.map(|()| count)
            }
            Err(e) => Err(e),
        };

        match stored {
            Ok(cached) => {
                info!(version, cached, "Install complete");
                Ok(InstallOutcome {
                    cached,
                    skip_waiting: self.config.skip_waiting,
                })
            }
            Err(e) => {
                warn!(version, error = %e, "Install failed");
                if created {
                    if let Err(cleanup) = self.storage.delete(version).await {
                        warn!(version, error = %cleanup, "Failed to discard partial cache");
                    }
                }
                Err(e)
            }
        }
    }

    /// Whether the current bucket holds every manifest entry, as left by a
    /// completed install.
    pub async fn is_precached(&self) -> Result<bool, ServiceWorkerError> {
        let version = self.version();
        if !self.storage.has(version).await {
            return Ok(false);
        }
        for url in self.config.manifest.resolve(&self.config.scope)? {
            if self.storage.match_request(version, &RequestKey::get(&url)).await.is_none() {
                debug!(version, url = %url, "Precache entry missing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Delete every bucket not named by this version.
    pub async fn activate(&self) -> Result<ActivateOutcome, ServiceWorkerError> {
        let version = self.version();
        let stale: Vec<String> = self
            .storage
            .keys()
            .await
            .into_iter()
            .filter(|name| name != version)
            .collect();

        let deletions = stale.iter().map(|name| async move {
            info!(cache = %name, "Deleting old cache");
            self.storage.delete(name).await
        });
        try_join_all(deletions).await?;

        info!(version, deleted = stale.len(), "Activated");
        Ok(ActivateOutcome {
            deleted: stale,
            claim_clients: true,
        })
    }

    /// Cache-first handling of one request.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        if request.method != Method::GET {
            return FetchOutcome::Passthrough;
        }

        let key = RequestKey::for_request(request);
        if let Some(response) = self.cached(&key).await {
            debug!(%key, "Cache hit");
            return FetchOutcome::Respond(FetchResponse {
                response,
                source: ResponseSource::Cache,
            });
        }

        debug!(%key, "Cache miss, fetching from network");
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.status == StatusCode::OK {
                    self.write_through(key, &response);
                } else {
                    debug!(%key, status = %response.status, "Not caching non-200 response");
                }
                FetchOutcome::Respond(FetchResponse {
                    response,
                    source: ResponseSource::Network,
                })
            }
            Err(e) => {
                debug!(%key, error = %e, "Network fetch failed");
                if request.accepts_html() {
                    if let Some(response) = self.cached(&self.fallback_key).await {
                        debug!(%key, fallback = %self.fallback_key, "Serving offline fallback");
                        return FetchOutcome::Respond(FetchResponse {
                            response,
                            source: ResponseSource::OfflineFallback,
                        });
                    }
                }
                FetchOutcome::NoResponse
            }
        }
    }

    async fn cached(&self, key: &RequestKey) -> Option<Response> {
        let entry = self.storage.match_request(self.version(), key).await?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(%key, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    /// Store a duplicate of `response` without making the caller wait.
    fn write_through(&self, key: RequestKey, response: &Response) {
        let entry = CacheEntry::from_response(key, response);
        let storage = Arc::clone(&self.storage);
        let version = self.config.cache_name.clone();

        let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
        // Reap finished writes so the set only holds pending ones.
        while writes.try_join_next().is_some() {}
        writes.spawn(async move {
            match storage.put(&version, entry).await {
                Ok(()) => debug!(version = %version, "Cached network response"),
                Err(e) => debug!(version = %version, error = %e, "Write-through failed"),
            }
        });
    }

    /// Wait for every write-through started so far. Returns how many were
    /// pending.
    pub async fn flush(&self) -> usize {
        let mut pending = {
            let mut writes = self.writes.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *writes)
        };

        let mut flushed = 0;
        while let Some(result) = pending.join_next().await {
            if let Err(e) = result {
                debug!(version = self.version(), error = %e, "Write-through task aborted");
            }
            flushed += 1;
        }
        flushed
    }
}

impl std::fmt::Debug for OfflineCacheWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineCacheWorker")
            .field("version", &self.config.cache_name)
            .field("scope", &self.config.scope.as_str())
            .field("assets", &self.config.manifest.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_worker_is_installing() {
        let worker = ServiceWorker::new("takecareofmydogs-v1.4.0");
        assert_eq!(worker.state(), ServiceWorkerState::Installing);
        assert!(!worker.is_active());
        assert!(!worker.is_redundant());
    }

    #[test]
    fn test_full_lifecycle() {
        let mut worker = ServiceWorker::new("v1");
        worker.set_state(ServiceWorkerState::Installed).unwrap();
        worker.set_state(ServiceWorkerState::Activating).unwrap();
        worker.set_state(ServiceWorkerState::Activated).unwrap();
        assert!(worker.is_active());

        worker.set_state(ServiceWorkerState::Redundant).unwrap();
        assert!(worker.is_redundant());
    }

    #[test]
    fn test_install_failure_goes_redundant() {
        let mut worker = ServiceWorker::new("v1");
        worker.set_state(ServiceWorkerState::Redundant).unwrap();
        assert!(worker.is_redundant());
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let mut worker = ServiceWorker::new("v1");
        assert!(matches!(
            worker.set_state(ServiceWorkerState::Activated),
            Err(ServiceWorkerError::StateError(_))
        ));
        assert_eq!(worker.state(), ServiceWorkerState::Installing);

        worker.set_state(ServiceWorkerState::Redundant).unwrap();
        assert!(worker.set_state(ServiceWorkerState::Installing).is_err());
        assert!(worker.set_state(ServiceWorkerState::Redundant).is_err());
    }

    #[test]
    fn test_worker_ids_unique() {
        let a = ServiceWorker::new("v1");
        let b = ServiceWorker::new("v1");
        assert_ne!(a.id, b.id);
    }
}
