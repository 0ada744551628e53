//! Registration slots and the pages a worker controls.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use hashbrown::HashMap;
use url::Url;

use crate::worker::{ServiceWorker, ServiceWorkerState};
use crate::ServiceWorkerError;

// ==================== Registration ====================

/// The installing / waiting / active worker versions for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    /// Scope URL.
    pub scope: Url,

    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,

    /// Last time a version was registered.
    pub last_update_check: Option<Instant>,
}

impl ServiceWorkerRegistration {
    /// Create an empty registration.
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            last_update_check: None,
        }
    }

    pub fn installing(&self) -> Option<&ServiceWorker> {
        self.installing.as_ref()
    }

    pub fn waiting(&self) -> Option<&ServiceWorker> {
        self.waiting.as_ref()
    }

    pub fn active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref()
    }

    /// Start installing `worker`. A previous installing worker is superseded
    /// and returned as redundant.
    pub fn begin_install(&mut self, worker: ServiceWorker) -> Option<ServiceWorker> {
        self.last_update_check = Some(Instant::now());
        let superseded = self.installing.replace(worker);
        superseded.and_then(make_redundant)
    }

    /// Installing → installed (waiting). A previous waiting worker is
    /// superseded and returned as redundant.
    pub fn install_complete(&mut self) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let mut worker = self
            .installing
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no installing worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Installed)?;
        let superseded = self.waiting.replace(worker);
        Ok(superseded.and_then(make_redundant))
    }

    /// Installing → redundant. The previous active worker is untouched.
    pub fn install_failed(&mut self) -> Option<ServiceWorker> {
        self.installing.take().and_then(make_redundant)
    }

    /// Waiting → activating. The worker stays in the waiting slot until
    /// [`activation_complete`](Self::activation_complete).
    pub fn begin_activation(&mut self) -> Result<&ServiceWorker, ServiceWorkerError> {
        let worker = self
            .waiting
            .as_mut()
            .ok_or_else(|| ServiceWorkerError::StateError("no waiting worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activating)?;
        Ok(worker)
    }

    /// Activating → activated. The previously active worker becomes redundant
    /// and is returned.
    pub fn activation_complete(&mut self) -> Result<Option<ServiceWorker>, ServiceWorkerError> {
        let activating = matches!(
            self.waiting.as_ref().map(ServiceWorker::state),
            Some(ServiceWorkerState::Activating)
        );
        if !activating {
            return Err(ServiceWorkerError::StateError(
                "no activating worker".to_string(),
            ));
        }

        let mut worker = self
            .waiting
            .take()
            .ok_or_else(|| ServiceWorkerError::StateError("no activating worker".to_string()))?;
        worker.set_state(ServiceWorkerState::Activated)?;
        let previous = self.active.replace(worker);
        Ok(previous.and_then(make_redundant))
    }

    /// Mark every version redundant and clear the slots.
    pub fn unregister(&mut self) -> Vec<ServiceWorker> {
        [self.installing.take(), self.waiting.take(), self.active.take()]
            .into_iter()
            .flatten()
            .filter_map(make_redundant)
            .collect()
    }
}

fn make_redundant(mut worker: ServiceWorker) -> Option<ServiceWorker> {
    worker.set_state(ServiceWorkerState::Redundant).ok()?;
    Some(worker)
}

// ==================== Clients ====================

/// Identifier of a page in the worker's scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An open page.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client ID.
    pub id: ClientId,

    /// Page URL.
    pub url: Url,

    /// Version of the worker controlling the page, if any.
    pub controller: Option<String>,
}

/// Open pages in the worker's scope.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<ClientId, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened page, controlled by `controller` if given.
    pub fn add(&mut self, url: Url, controller: Option<String>) -> Client {
        let client = Client {
            id: ClientId::new(),
            url,
            controller,
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Get a client by ID.
    pub fn get(&self, id: &ClientId) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Forget a closed page.
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Clients, optionally including pages no worker controls.
    pub fn match_all(&self, include_uncontrolled: bool) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| include_uncontrolled || c.controller.is_some())
            .collect()
    }

    /// Whether any page is controlled by `version`.
    pub fn any_controlled_by(&self, version: &str) -> bool {
        self.clients
            .values()
            .any(|c| c.controller.as_deref() == Some(version))
    }

    /// Make `version` the controller of every page. Returns the pages whose
    /// controller changed.
    pub fn claim(&mut self, version: &str) -> Vec<ClientId> {
        self.clients
            .values_mut()
            .filter(|c| c.controller.as_deref() != Some(version))
            .map(|c| {
                c.controller = Some(version.to_string());
                c.id.clone()
            })
            .collect()
    }

    /// Drop every page's controller.
    pub fn release_all(&mut self) {
        for client in self.clients.values_mut() {
            client.controller = None;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
