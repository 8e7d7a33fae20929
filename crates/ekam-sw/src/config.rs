//! Controller configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ServiceWorkerError;

/// Generation key for the current deployment. Bump to invalidate old caches.
pub const DEFAULT_CACHE_NAME: &str = "ekam-cache-v5";

/// Document served when nothing else can be.
pub const OFFLINE_URL: &str = "/static/offline.html";

/// Application shell, cached at install.
pub const PRECACHE_ASSETS: &[&str] = &[
    "/",
    "/static/css/style.css",
    "/static/js/main.js",
    "/static/manifest.json",
    "/static/browserconfig.xml",
    OFFLINE_URL,
    // Icons
    "/static/icons/favicon-16.png",
    "/static/icons/favicon-32.png",
    "/static/icons/apple-touch-icon.png",
    "/static/icons/icon-192.png",
    "/static/icons/icon-512.png",
    "/static/icons/icon-512-maskable.png",
    // Core pages
    "/login",
    "/register",
    "/properties",
    "/a-propos",
    "/licence",
    // API endpoints
    "/api/properties",
    // Fallback images
    "/static/images/no-image.jpg",
];

/// Immutable controller configuration.
///
/// Every field has a default, so a config file only needs the keys it
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Name of the cache generation owned by this version.
    pub cache_name: String,

    /// Path of the offline fallback document.
    pub offline_url: String,

    /// Paths fetched and stored at install. Must contain `offline_url`.
    pub precache: Vec<String>,

    /// Deadline for every network fetch issued by the controller.
    pub network_timeout_ms: u64,

    /// URL schemes the controller intercepts.
    pub fetchable_schemes: Vec<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            offline_url: OFFLINE_URL.to_string(),
            precache: PRECACHE_ASSETS.iter().map(|s| s.to_string()).collect(),
            network_timeout_ms: 10_000,
            fetchable_schemes: vec!["http".to_string(), "https".to_string()],
        }
    }
}

impl ControllerConfig {
    /// Default configuration under a different generation key.
    pub fn with_cache_name(mut self, cache_name: impl Into<String>) -> Self {
        self.cache_name = cache_name.into();
        self
    }

    /// Replace the precache manifest. The offline document is appended if missing.
    pub fn with_precache<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = paths.into_iter().map(Into::into).collect();
        if !self.precache.contains(&self.offline_url) {
            self.precache.push(self.offline_url.clone());
        }
        self
    }

    /// Set the network deadline.
    pub fn with_network_timeout(mut self, timeout: Duration) -> Self {
        self.network_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Network deadline as a `Duration`.
    pub fn network_timeout(&self) -> Duration {
        Duration::from_millis(self.network_timeout_ms)
    }

    /// Whether requests with this scheme are intercepted.
    pub fn is_fetchable_scheme(&self, scheme: &str) -> bool {
        self.fetchable_schemes
            .iter()
            .any(|s| s.eq_ignore_ascii_case(scheme))
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), ServiceWorkerError> {
        if self.cache_name.trim().is_empty() {
            return Err(ServiceWorkerError::Config(
                "cache_name must not be empty".to_string(),
            ));
        }
        if !self.precache.contains(&self.offline_url) {
            return Err(ServiceWorkerError::Config(format!(
                "offline document {} is not in the precache manifest",
                self.offline_url
            )));
        }
        if self.network_timeout_ms == 0 {
            return Err(ServiceWorkerError::Config(
                "network_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, ServiceWorkerError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}
