//! Install, activate and version upgrades through the container.

mod common;

use std::sync::Arc;

use common::{config, memory_storage, scope, url, MockNetwork};
use http::StatusCode;
use pawkit_net::{Request, Response};
use pawkit_sw::{
    CacheEntry, CacheStorage, OfflineCacheWorker, RequestKey, ResponseSource,
    ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState,
};

const OLD: &str = "takecareofmydogs-v1.3.0";
const CURRENT: &str = "takecareofmydogs-v1.4.0";

#[tokio::test]
async fn install_caches_every_manifest_entry() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    let worker =
        OfflineCacheWorker::new(config(CURRENT, &["/", "/index.html"]), storage.clone(), network.clone())
            .unwrap();

    let outcome = worker.install().await.unwrap();
    assert_eq!(outcome.cached, 2);
    assert!(outcome.skip_waiting);
    assert_eq!(storage.entry_count(CURRENT).await, Some(2));
    assert_eq!(network.calls(), 2);

    let key = RequestKey::get(&url("/index.html"));
    let entry = storage.match_request(CURRENT, &key).await.unwrap();
    assert_eq!(entry.status, 200);
}

#[tokio::test]
async fn install_is_all_or_nothing() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    network.make_unreachable("/js/app.min.js");

    let worker = OfflineCacheWorker::new(
        config(CURRENT, &["/", "/index.html", "/js/app.min.js"]),
        storage.clone(),
        network,
    )
    .unwrap();

    let err = worker.install().await.unwrap_err();
    assert!(matches!(err, ServiceWorkerError::PrecacheFailed { ref url, .. } if url.ends_with("/js/app.min.js")));
    assert!(!storage.has(CURRENT).await);
}

#[tokio::test]
async fn install_fails_on_error_status() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    network.serve_status("/manifest.json", StatusCode::INTERNAL_SERVER_ERROR);

    let worker = OfflineCacheWorker::new(
        config(CURRENT, &["/", "/manifest.json"]),
        storage.clone(),
        network,
    )
    .unwrap();

    assert!(matches!(
        worker.install().await,
        Err(ServiceWorkerError::PrecacheFailed { .. })
    ));
    assert!(storage.keys().await.is_empty());
}

#[tokio::test]
async fn failed_reinstall_keeps_existing_bucket() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    let worker =
        OfflineCacheWorker::new(config(CURRENT, &["/"]), storage.clone(), network.clone()).unwrap();
    worker.install().await.unwrap();

    network.set_offline(true);
    assert!(worker.install().await.is_err());
    assert_eq!(storage.entry_count(CURRENT).await, Some(1));
}

#[tokio::test]
async fn activate_deletes_stale_buckets() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();

    storage.open(OLD).await.unwrap();
    let stale = Response::new(url("/"), StatusCode::OK, "<html>old</html>");
    storage
        .put(OLD, CacheEntry::from_response(RequestKey::get(&url("/")), &stale))
        .await
        .unwrap();
    storage.open("some-other-cache").await.unwrap();

    let worker =
        OfflineCacheWorker::new(config(CURRENT, &["/"]), storage.clone(), network).unwrap();
    worker.install().await.unwrap();
    let outcome = worker.activate().await.unwrap();

    assert_eq!(outcome.deleted, vec![OLD.to_string(), "some-other-cache".to_string()]);
    assert!(outcome.claim_clients);
    assert_eq!(storage.keys().await, vec![CURRENT.to_string()]);
}

#[tokio::test]
async fn activate_with_only_current_bucket_deletes_nothing() {
    let storage = memory_storage();
    let worker = OfflineCacheWorker::new(
        config(CURRENT, &["/"]),
        storage.clone(),
        MockNetwork::with_app_shell(),
    )
    .unwrap();
    worker.install().await.unwrap();

    assert!(worker.activate().await.unwrap().deleted.is_empty());
    assert!(storage.has(CURRENT).await);
}

#[tokio::test]
async fn upgrade_claims_open_pages() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    let (container, mut events) =
        ServiceWorkerContainer::new(scope(), storage.clone(), network.clone());

    container.register(config(OLD, &["/", "/index.html"])).await.unwrap();
    let page = container.open_client(url("/index.html")).await;
    assert_eq!(page.controller.as_deref(), Some(OLD));
    while events.try_recv().is_ok() {}

    container.register(config(CURRENT, &["/", "/index.html"])).await.unwrap();

    assert_eq!(container.active_version().await.as_deref(), Some(CURRENT));
    assert_eq!(storage.keys().await, vec![CURRENT.to_string()]);

    let mut saw_old_redundant = false;
    let mut claimed = None;
    while let Ok(event) = events.try_recv() {
        match event {
            ServiceWorkerEvent::StateChange {
                version,
                new_state: ServiceWorkerState::Redundant,
                ..
            } if version == OLD => saw_old_redundant = true,
            ServiceWorkerEvent::ControllerChange { client_id, version } => {
                claimed = Some((client_id, version))
            }
            _ => {}
        }
    }
    assert!(saw_old_redundant);
    assert_eq!(claimed, Some((page.id.clone(), Some(CURRENT.to_string()))));

    network.set_offline(true);
    let response = container
        .fetch(&page.id, &Request::get(url("/index.html")))
        .await
        .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);
}

#[tokio::test]
async fn upgrade_waits_for_open_pages_without_skip_waiting() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    let (container, _events) = ServiceWorkerContainer::new(scope(), storage.clone(), network);

    container.register(config(OLD, &["/", "/index.html"])).await.unwrap();
    let page = container.open_client(url("/")).await;

    let next = config(CURRENT, &["/", "/index.html"]).with_skip_waiting(false);
    container.register(next).await.unwrap();

    assert_eq!(container.active_version().await.as_deref(), Some(OLD));
    let waiting = container.waiting_worker().await.unwrap();
    assert_eq!(waiting.version, CURRENT);
    assert_eq!(waiting.state(), ServiceWorkerState::Installed);
    assert!(storage.has(OLD).await);
    assert!(storage.has(CURRENT).await);

    let response = container.fetch(&page.id, &Request::get(url("/index.html"))).await.unwrap();
    assert_eq!(response.source, ResponseSource::Cache);

    container.close_client(&page.id).await.unwrap();

    assert_eq!(container.active_version().await.as_deref(), Some(CURRENT));
    assert!(container.waiting_worker().await.is_none());
    assert_eq!(storage.keys().await, vec![CURRENT.to_string()]);
}

#[tokio::test]
async fn first_version_activates_without_skip_waiting() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    let (container, _events) = ServiceWorkerContainer::new(scope(), storage, network);

    container
        .register(config(CURRENT, &["/"]).with_skip_waiting(false))
        .await
        .unwrap();

    assert_eq!(container.active_version().await.as_deref(), Some(CURRENT));
    assert!(container.waiting_worker().await.is_none());
}

#[tokio::test]
async fn failed_upgrade_keeps_previous_version() {
    let storage = memory_storage();
    let network = MockNetwork::with_app_shell();
    let (container, _events) =
        ServiceWorkerContainer::new(scope(), storage.clone(), network.clone());

    container.register(config(OLD, &["/", "/index.html"])).await.unwrap();
    let page = container.open_client(url("/")).await;

    network.make_unreachable("/js/app.min.js");
    let result = container
        .register(config(CURRENT, &["/", "/index.html", "/js/app.min.js"]))
        .await;
    assert!(matches!(result, Err(ServiceWorkerError::PrecacheFailed { .. })));

    assert_eq!(container.active_version().await.as_deref(), Some(OLD));
    assert!(container.waiting_worker().await.is_none());
    assert_eq!(storage.keys().await, vec![OLD.to_string()]);

    network.set_offline(true);
    let response = container
        .fetch(&page.id, &Request::get(url("/")).accept("text/html"))
        .await
        .unwrap();
    assert_eq!(response.source, ResponseSource::Cache);

    // Registering again retries the install.
    network.set_offline(false);
    network.make_reachable("/js/app.min.js");
    container
        .register(config(CURRENT, &["/", "/index.html", "/js/app.min.js"]))
        .await
        .unwrap();
    assert_eq!(container.active_version().await.as_deref(), Some(CURRENT));
    assert_eq!(storage.keys().await, vec![CURRENT.to_string()]);
}

#[tokio::test]
async fn register_or_log_swallows_failures() {
    let network = MockNetwork::new();
    network.set_offline(true);
    let (container, _events) = ServiceWorkerContainer::new(scope(), memory_storage(), network);

    assert!(container.register_or_log(config(CURRENT, &["/"])).await.is_none());
    assert!(container.active_version().await.is_none());

    // Pages still load online-only, uncontrolled.
    let page = container.open_client(url("/")).await;
    assert!(page.controller.is_none());
}

#[tokio::test]
async fn controlled_page_gets_network_error_when_nothing_matches() {
    let network = MockNetwork::with_app_shell();
    let (container, _events) =
        ServiceWorkerContainer::new(scope(), memory_storage(), network.clone());
    container.register(config(CURRENT, &["/"])).await.unwrap();
    let page = container.open_client(url("/")).await;

    network.set_offline(true);
    let result = container
        .fetch(&page.id, &Request::get(url("/images/rocky.png")))
        .await;
    assert!(matches!(result, Err(ServiceWorkerError::NetworkError(_))));
}

#[tokio::test]
async fn shared_storage_handle_sees_worker_writes() {
    let storage = memory_storage();
    let shared: Arc<dyn CacheStorage> = storage.clone();
    let worker =
        OfflineCacheWorker::new(config(CURRENT, &["/"]), shared, MockNetwork::with_app_shell())
            .unwrap();
    worker.install().await.unwrap();

    assert_eq!(storage.entry_count(CURRENT).await, Some(1));
}
