//! Host runtime for the worker: registration, lifecycle ordering and request
//! routing for the pages in scope.

use std::sync::Arc;

use pawkit_net::{Network, Request};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WorkerConfig;
use crate::registration::{Client, ClientId, Clients, ServiceWorkerRegistration};
use crate::storage::CacheStorage;
use crate::worker::{
    FetchOutcome, FetchResponse, OfflineCacheWorker, ResponseSource, ServiceWorker,
    ServiceWorkerId, ServiceWorkerState,
};
use crate::ServiceWorkerError;

/// Lifecycle notifications for pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// A new version started installing.
    UpdateFound { version: String },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A page got a new controller (or lost it).
    ControllerChange {
        client_id: ClientId,
        version: Option<String>,
    },
}

/// Registers worker versions for one scope and routes page requests to the
/// active one.
///
/// Install and activate are serialized: a registration runs to completion
/// before the next one starts. Fetches are never blocked by a running
/// install; they go to whichever version is active at the time.
pub struct ServiceWorkerContainer {
    scope: Url,
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    lifecycle: Mutex<()>,
    registration: RwLock<ServiceWorkerRegistration>,
    waiting: Mutex<Option<Arc<OfflineCacheWorker>>>,
    active: RwLock<Option<Arc<OfflineCacheWorker>>>,
    clients: RwLock<Clients>,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a container for `scope`.
    pub fn new(
        scope: Url,
        storage: Arc<dyn CacheStorage>,
        network: Arc<dyn Network>,
    ) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        (
            Self {
                registration: RwLock::new(ServiceWorkerRegistration::new(scope.clone())),
                scope,
                storage,
                network,
                lifecycle: Mutex::new(()),
                waiting: Mutex::new(None),
                active: RwLock::new(None),
                clients: RwLock::new(Clients::new()),
                event_tx,
            },
            event_rx,
        )
    }

    /// The scope this container manages.
    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Register a worker version: install it, then activate it and claim the
    /// open pages.
    ///
    /// Registering the version that is already active is a no-op. If install
    /// fails the new version becomes redundant and the previous one stays in
    /// control; calling `register` again retries.
    pub async fn register(&self, config: WorkerConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.register_locked(config).await
    }

    /// Body of [`register`](Self::register). Callers hold the lifecycle lock.
    async fn register_locked(
        &self,
        config: WorkerConfig,
    ) -> Result<ServiceWorkerId, ServiceWorkerError> {
        self.check_scope(&config)?;

        if let Some(active) = self.active.read().await.as_ref() {
            if active.config() == &config {
                debug!(version = %config.cache_name, "Version already active");
                let registration = self.registration.read().await;
                if let Some(worker) = registration.active() {
                    return Ok(worker.id);
                }
            }
        }

        let handler = Arc::new(OfflineCacheWorker::new(
            config,
            Arc::clone(&self.storage),
            Arc::clone(&self.network),
        )?);
        let worker = ServiceWorker::new(handler.version());
        let worker_id = worker.id;

        {
            let mut registration = self.registration.write().await;
            if let Some(superseded) = registration.begin_install(worker) {
                self.emit_state(&superseded);
            }
        }
        info!(version = handler.version(), "Installing service worker");
        self.emit(ServiceWorkerEvent::UpdateFound {
            version: handler.version().to_string(),
        });
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id,
            version: handler.version().to_string(),
            new_state: ServiceWorkerState::Installing,
        });

        let outcome = match handler.install().await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(failed) = self.registration.write().await.install_failed() {
                    self.emit_state(&failed);
                }
                return Err(e);
            }
        };

        {
            let mut registration = self.registration.write().await;
            let superseded = registration.install_complete()?;
            if let Some(worker) = registration.waiting() {
                self.emit_state(worker);
            }
            if let Some(superseded) = superseded {
                self.emit_state(&superseded);
            }
        }
        *self.waiting.lock().await = Some(Arc::clone(&handler));

        if outcome.skip_waiting || !self.active_has_clients().await {
            self.activate_waiting().await?;
        } else {
            info!(version = handler.version(), "Installed; waiting for open pages to close");
        }

        Ok(worker_id)
    }

    /// Bring back a version whose precache survived a restart without
    /// fetching it again. Falls back to [`register`](Self::register) when the
    /// bucket is missing or does not hold every manifest entry.
    pub async fn resume(&self, config: WorkerConfig) -> Result<ServiceWorkerId, ServiceWorkerError> {
        let _lifecycle = self.lifecycle.lock().await;
        self.check_scope(&config)?;

        let handler = Arc::new(OfflineCacheWorker::new(
            config.clone(),
            Arc::clone(&self.storage),
            Arc::clone(&self.network),
        )?);
        if !handler.is_precached().await? {
            debug!(version = handler.version(), "No complete precache to resume");
            return self.register_locked(config).await;
        }

        let worker = ServiceWorker::new(handler.version());
        let worker_id = worker.id;
        info!(version = handler.version(), "Resuming cached worker version");

        {
            let mut registration = self.registration.write().await;
            if let Some(superseded) = registration.begin_install(worker) {
                self.emit_state(&superseded);
            }
            if let Some(superseded) = registration.install_complete()? {
                self.emit_state(&superseded);
            }
        }
        *self.waiting.lock().await = Some(handler);
        self.activate_waiting().await?;

        Ok(worker_id)
    }

    /// [`register`](Self::register), logging and swallowing failures. The
    /// pages keep working online-only.
    pub async fn register_or_log(&self, config: WorkerConfig) -> Option<ServiceWorkerId> {
        let version = config.cache_name.clone();
        match self.register(config).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(version = %version, error = %e, "Service worker registration failed");
                None
            }
        }
    }

    /// Remove the registration. Caches are left in place.
    pub async fn unregister(&self) -> bool {
        let _lifecycle = self.lifecycle.lock().await;

        let dropped = self.registration.write().await.unregister();
        for worker in &dropped {
            self.emit_state(worker);
        }
        *self.waiting.lock().await = None;
        *self.active.write().await = None;

        let mut clients = self.clients.write().await;
        let controlled: Vec<ClientId> = clients
            .match_all(false)
            .into_iter()
            .map(|c| c.id.clone())
            .collect();
        clients.release_all();
        for client_id in controlled {
            self.emit(ServiceWorkerEvent::ControllerChange {
                client_id,
                version: None,
            });
        }

        !dropped.is_empty()
    }

    /// Version of the active worker, if any.
    pub async fn active_version(&self) -> Option<String> {
        self.active
            .read()
            .await
            .as_ref()
            .map(|worker| worker.version().to_string())
    }

    /// Snapshot of the active worker's lifecycle record.
    pub async fn active_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.active().cloned()
    }

    /// Snapshot of the waiting worker's lifecycle record.
    pub async fn waiting_worker(&self) -> Option<ServiceWorker> {
        self.registration.read().await.waiting().cloned()
    }

    /// Track a page opened at `url`. Pages in scope are controlled by the
    /// active worker, if there is one.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = if url.as_str().starts_with(self.scope.as_str()) {
            self.active_version().await
        } else {
            None
        };
        self.clients.write().await.add(url, controller)
    }

    /// Forget a closed page. Closing the last page of the old version lets a
    /// waiting version activate.
    pub async fn close_client(&self, id: &ClientId) -> Result<(), ServiceWorkerError> {
        self.clients.write().await.remove(id);

        let _lifecycle = self.lifecycle.lock().await;
        if self.waiting.lock().await.is_some() && !self.active_has_clients().await {
            self.activate_waiting().await?;
        }
        Ok(())
    }

    /// Perform a request for a page.
    ///
    /// Requests from controlled pages go through the active worker; requests
    /// the worker passes through, and requests from uncontrolled pages, go
    /// straight to the network.
    pub async fn fetch(
        &self,
        client_id: &ClientId,
        request: &Request,
    ) -> Result<FetchResponse, ServiceWorkerError> {
        let controlled = self
            .clients
            .read()
            .await
            .get(client_id)
            .is_some_and(|c| c.controller.is_some());
        let handler = if controlled {
            self.active.read().await.clone()
        } else {
            None
        };

        if let Some(handler) = handler {
            match handler.handle_fetch(request).await {
                FetchOutcome::Respond(response) => return Ok(response),
                FetchOutcome::NoResponse => {
                    return Err(ServiceWorkerError::NetworkError(format!(
                        "no response for {} {}",
                        request.method, request.url
                    )))
                }
                FetchOutcome::Passthrough => {}
            }
        }

        let response = self
            .network
            .fetch(request)
            .await
            .map_err(|e| ServiceWorkerError::NetworkError(e.to_string()))?;
        Ok(FetchResponse {
            response,
            source: ResponseSource::Network,
        })
    }

    /// Wait for the active worker's pending cache writes. Hosts call this
    /// before shutting down.
    pub async fn flush(&self) -> usize {
        let active = self.active.read().await.clone();
        match active {
            Some(handler) => handler.flush().await,
            None => 0,
        }
    }

    /// Activate the waiting worker. Callers hold the lifecycle lock.
    async fn activate_waiting(&self) -> Result<(), ServiceWorkerError> {
        let Some(handler) = self.waiting.lock().await.take() else {
            return Ok(());
        };

        {
            let mut registration = self.registration.write().await;
            let worker = registration.begin_activation()?;
            self.emit_state(worker);
        }

        // A failed cleanup sweep does not stop the version from taking over;
        // the next activation sweeps again.
        let claim = match handler.activate().await {
            Ok(outcome) => outcome.claim_clients,
            Err(e) => {
                warn!(version = handler.version(), error = %e, "Activate handler failed");
                true
            }
        };

        {
            let mut registration = self.registration.write().await;
            let previous = registration.activation_complete()?;
            if let Some(worker) = registration.active() {
                self.emit_state(worker);
            }
            if let Some(previous) = previous {
                info!(version = %previous.version, "Previous worker is now redundant");
                self.emit_state(&previous);
            }
        }
        *self.active.write().await = Some(Arc::clone(&handler));

        if claim {
            let claimed = self.clients.write().await.claim(handler.version());
            debug!(version = handler.version(), clients = claimed.len(), "Claimed clients");
            for client_id in claimed {
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    version: Some(handler.version().to_string()),
                });
            }
        }

        Ok(())
    }

    fn check_scope(&self, config: &WorkerConfig) -> Result<(), ServiceWorkerError> {
        if config.scope != self.scope {
            return Err(ServiceWorkerError::RegistrationFailed(format!(
                "worker scope {} does not match {}",
                config.scope, self.scope
            )));
        }
        Ok(())
    }

    async fn active_has_clients(&self) -> bool {
        match self.active_version().await {
            Some(version) => self.clients.read().await.any_controlled_by(&version),
            None => false,
        }
    }

    fn emit_state(&self, worker: &ServiceWorker) {
        self.emit(ServiceWorkerEvent::StateChange {
            worker_id: worker.id,
            version: worker.version.clone(),
            new_state: worker.state(),
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        let _ = self.event_tx.send(event);
    }
}
