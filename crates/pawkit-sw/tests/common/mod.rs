//! Shared fixtures for the worker integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use pawkit_net::{NetError, Network, Request, Response, Url};
use pawkit_sw::{AssetManifest, CacheStorage, MemoryCacheStorage, RequestKey, WorkerConfig};

pub const ORIGIN: &str = "https://takecareofmydogs.example/";

pub fn scope() -> Url {
    Url::parse(ORIGIN).unwrap()
}

pub fn url(path: &str) -> Url {
    scope().join(path).unwrap()
}

pub fn config(version: &str, assets: &[&str]) -> WorkerConfig {
    let manifest = AssetManifest::new(assets.iter().copied()).unwrap();
    WorkerConfig::new(version, scope(), manifest).unwrap()
}

/// In-process network keyed by URL path.
///
/// Unknown paths answer 404. Paths marked unreachable, and every path while
/// offline, fail with a connection error.
#[derive(Default)]
pub struct MockNetwork {
    routes: Mutex<HashMap<String, (StatusCode, &'static str, String)>>,
    unreachable: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A network serving the usual app shell.
    pub fn with_app_shell() -> Arc<Self> {
        let network = Self::new();
        network.serve("/", "text/html", "<html>home</html>");
        network.serve("/index.html", "text/html", "<html>index</html>");
        network.serve("/css/styles.min.css", "text/css", "body{}");
        network.serve("/js/app.min.js", "application/javascript", "init()");
        network
    }

    pub fn serve(&self, path: &str, content_type: &'static str, body: &str) {
        self.routes.lock().unwrap().insert(
            path.to_string(),
            (StatusCode::OK, content_type, body.to_string()),
        );
    }

    pub fn serve_status(&self, path: &str, status: StatusCode) {
        self.routes
            .lock()
            .unwrap()
            .insert(path.to_string(), (status, "text/plain", String::new()));
    }

    pub fn make_unreachable(&self, path: &str) {
        self.unreachable.lock().unwrap().insert(path.to_string());
    }

    pub fn make_reachable(&self, path: &str) {
        self.unreachable.lock().unwrap().remove(path);
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

#[async_trait]
impl Network for MockNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = request.url.path().to_string();

        if self.offline.load(Ordering::SeqCst) || self.unreachable.lock().unwrap().contains(&path) {
            return Err(NetError::ConnectionFailed(format!("{} unreachable", request.url)));
        }

        let route = self.routes.lock().unwrap().get(&path).cloned();
        let response = match route {
            Some((status, content_type, body)) => Response::new(request.url.clone(), status, body)
                .with_header(CONTENT_TYPE, HeaderValue::from_static(content_type)),
            None => Response::new(request.url.clone(), StatusCode::NOT_FOUND, "Not Found"),
        };
        Ok(response)
    }
}

pub fn memory_storage() -> Arc<MemoryCacheStorage> {
    Arc::new(MemoryCacheStorage::new())
}

/// Poll until `bucket` holds `path`; write-through caching is detached from
/// the response.
pub async fn wait_for_entry(storage: &dyn CacheStorage, bucket: &str, path: &str) -> bool {
    let key = RequestKey::get(&url(path));
    for _ in 0..100 {
        if storage.match_request(bucket, &key).await.is_some() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
