//! Worker configuration: version, asset manifest, scope and offline fallback.

use hashbrown::HashSet;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Ordered list of assets required for offline operation.
///
/// Entries are absolute URLs or paths relative to the worker scope. The list
/// belongs to one worker version: changing it means changing the version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetManifest {
    entries: Vec<String>,
}

impl AssetManifest {
    /// Create a manifest. Blank entries are rejected.
    pub fn new<I, S>(entries: I) -> Result<Self, ServiceWorkerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let entries: Vec<String> = entries.into_iter().map(Into::into).collect();
        if let Some(index) = entries.iter().position(|e| e.trim().is_empty()) {
            return Err(ServiceWorkerError::InvalidManifest(format!(
                "entry {index} is empty"
            )));
        }
        Ok(Self { entries })
    }

    /// The entries as written.
    pub fn paths(&self) -> &[String] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every entry against `scope`, in order.
    ///
    /// Two entries naming the same resource are an error, as is an entry that
    /// does not resolve to a URL.
    pub fn resolve(&self, scope: &Url) -> Result<Vec<Url>, ServiceWorkerError> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        let mut urls = Vec::with_capacity(self.entries.len());

        for entry in &self.entries {
            let mut url = scope.join(entry).map_err(|e| {
                ServiceWorkerError::InvalidManifest(format!("cannot resolve '{entry}': {e}"))
            })?;
            url.set_fragment(None);
            if !seen.insert(url.clone()) {
                return Err(ServiceWorkerError::InvalidManifest(format!(
                    "'{entry}' duplicates an earlier entry ({url})"
                )));
            }
            urls.push(url);
        }

        Ok(urls)
    }
}

/// Configuration bound to one worker version at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Version string; also the name of the bucket this worker owns.
    pub cache_name: String,

    /// Scope the worker controls; manifest paths resolve against it.
    pub scope: Url,

    /// Assets precached on install.
    pub manifest: AssetManifest,

    /// Document served to HTML requests that fail while offline.
    pub offline_fallback: String,

    /// Activate as soon as install completes, even while pages are still
    /// controlled by the previous version.
    pub skip_waiting: bool,
}

impl WorkerConfig {
    /// Default offline fallback: the root document.
    pub const DEFAULT_OFFLINE_FALLBACK: &'static str = "/";

    /// Create and validate a configuration.
    pub fn new(
        cache_name: impl Into<String>,
        scope: Url,
        manifest: AssetManifest,
    ) -> Result<Self, ServiceWorkerError> {
        let config = Self {
            cache_name: cache_name.into(),
            scope,
            manifest,
            offline_fallback: Self::DEFAULT_OFFLINE_FALLBACK.to_string(),
            skip_waiting: true,
        };
        config.validate()?;
        Ok(config)
    }

    /// Replace the offline fallback document.
    pub fn with_offline_fallback(
        mut self,
        path: impl Into<String>,
    ) -> Result<Self, ServiceWorkerError> {
        self.offline_fallback = path.into();
        self.validate()?;
        Ok(self)
    }

    /// Wait for controlled pages to close before activating when `false`.
    pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
        self.skip_waiting = skip_waiting;
        self
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.cache_name.trim().is_empty() {
            return Err(ServiceWorkerError::InvalidConfig(
                "cache version must not be empty".to_string(),
            ));
        }
        if self.scope.cannot_be_a_base() {
            return Err(ServiceWorkerError::InvalidConfig(format!(
                "scope {} cannot resolve relative paths",
                self.scope
            )));
        }
        self.manifest.resolve(&self.scope)?;
        self.offline_fallback_url()?;
        Ok(())
    }

    /// Absolute URL of the offline fallback document.
    pub fn offline_fallback_url(&self) -> Result<Url, ServiceWorkerError> {
        self.scope.join(&self.offline_fallback).map_err(|e| {
            ServiceWorkerError::InvalidConfig(format!(
                "offline fallback '{}': {e}",
                self.offline_fallback
            ))
        })
    }
}
