//! Host configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use pawkit_common::{LogConfig, LogFormat, PawKitError, Result};
use pawkit_net::LoaderConfig;
use pawkit_sw::{AssetManifest, WorkerConfig};
use serde::{Deserialize, Serialize};
use url::Url;

/// Assets the pet-care app needs offline.
const APP_ASSETS: &[&str] = &[
    "/",
    "/index.html",
    "/css/styles.min.css",
    "/js/main.min.js",
    "/manifest.json",
    // Dog photos
    "/images/murphy.jpg",
    "/images/lyla.jpg",
    "/images/gilda.jpg",
    // Medication and supplement images
    "/images/benadryl.jpg",
    "/images/cd.jpg",
    "/images/hip-and-joint.jpg",
    "/images/kd.jpg",
    "/images/lyla-bp.jpg",
    "/images/probiotics.jpg",
    "/images/skin-and-coat.jpg",
    // PWA icons
    "/icons/icon-192x192.png",
    "/icons/icon-512x512.png",
];

/// Host configuration, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Origin the worker is registered for; also its scope.
    pub origin: String,

    /// Worker version. Bump it whenever `assets` changes.
    pub version: String,

    /// Precache manifest.
    pub assets: Vec<String>,

    /// Document served to HTML requests that fail offline.
    pub offline_fallback: String,

    /// Directory holding the cache buckets.
    pub cache_dir: PathBuf,

    /// Activate a new version while pages of the previous one are open.
    pub skip_waiting: bool,

    /// Network timeout in seconds
    pub request_timeout_secs: u64,

    /// Logging settings
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level name ("info", "debug", ...)
    pub level: String,

    /// "pretty", "compact" or "json"
    pub format: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            origin: "https://takecareofmydogs.com/".to_string(),
            version: "takecareofmydogs-v1.4.0".to_string(),
            assets: APP_ASSETS.iter().map(|s| s.to_string()).collect(),
            offline_fallback: WorkerConfig::DEFAULT_OFFLINE_FALLBACK.to_string(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("pawkit"),
            skip_waiting: true,
            request_timeout_secs: 30,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl AppConfig {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pawkit")
            .join("config.json")
    }

    /// Load configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)?;
        serde_json::from_str(&contents).map_err(|e| {
            PawKitError::config_with_source(format!("Invalid configuration in {}", path.display()), e)
        })
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_string_pretty(self)
            .map_err(|e| PawKitError::config_with_source("Failed to serialize configuration", e))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, data)?;
        Ok(())
    }

    /// Parsed origin.
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| PawKitError::config_with_source(format!("Invalid origin '{}'", self.origin), e))
    }

    /// Worker configuration for this version.
    pub fn worker_config(&self) -> Result<WorkerConfig> {
        let manifest = AssetManifest::new(self.assets.iter().cloned())?;
        let config = WorkerConfig::new(self.version.clone(), self.origin_url()?, manifest)?
            .with_offline_fallback(self.offline_fallback.clone())?
            .with_skip_waiting(self.skip_waiting);
        Ok(config)
    }

    /// Network loader configuration.
    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            timeout: Duration::from_secs(self.request_timeout_secs),
            ..Default::default()
        }
    }

    /// Logging configuration.
    pub fn log_config(&self) -> Result<LogConfig> {
        let format: LogFormat = self.logging.format.parse()?;
        Ok(LogConfig::from_level(&self.logging.level)?.with_format(format))
    }
}
