//! Worker configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{ConfigError, ConfigResult};

/// Store identifier of the currently deployed build.
///
/// Bump on every deployment that changes cached asset contents.
pub const DEFAULT_CACHE_VERSION: &str = "uncovermarkets-v8-ui-updated";

/// Offline worker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Version string naming the current store
    pub version: String,

    /// Origin the worker controls; same-origin requests are served cache-first
    pub scope: Url,

    /// App shell URLs; install fails if any of them cannot be cached
    pub required_urls: Vec<String>,

    /// Third-party assets cached best-effort during install
    pub optional_urls: Vec<String>,

    /// Upper bound on each optional asset fetch, in seconds
    pub optional_timeout_secs: u64,

    /// Hostnames of the auth/storage provider, matched by exact suffix
    pub trusted_domains: Vec<String>,

    /// Document served when a same-origin fetch fails and nothing is stored
    pub fallback_document: String,

    /// Activate as soon as install succeeds instead of waiting for the
    /// previous version's clients to go away
    pub skip_waiting: bool,

    /// Outbound HTTP settings
    pub network: NetworkConfig,

    /// Push notification presentation
    pub notification: NotificationConfig,

    /// Background sync endpoints
    pub sync: SyncConfig,

    /// Where named stores are kept
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// User agent string
    pub user_agent: String,

    /// Per-request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum redirects followed per request
    pub max_redirects: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationConfig {
    /// Title used when the push payload carries none
    pub app_name: String,

    /// Body used when the push payload carries none
    pub default_body: String,

    pub icon: String,
    pub badge: String,

    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,

    pub tag: String,
    pub require_interaction: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Sync tag to endpoint path
    pub endpoints: BTreeMap<String, String>,

    /// Attempts the host scheduler makes per tag before giving up
    pub max_attempts: u32,

    /// Delay before the first replay, in milliseconds
    pub initial_backoff_ms: u64,
}

/// Backing store for named stores
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process memory; lost on restart
    Memory,
    /// SQLite database file
    Sqlite { path: PathBuf },
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_CACHE_VERSION.to_string(),
            scope: Url::parse("http://localhost:8080/").expect("static scope URL is valid"),
            required_urls: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
            ],
            optional_urls: vec![
                "https://cdn.quilljs.com/1.3.6/quill.snow.css".to_string(),
                "https://cdn.quilljs.com/1.3.6/quill.js".to_string(),
            ],
            optional_timeout_secs: 10,
            trusted_domains: vec![
                "firebaseio.com".to_string(),
                "googleapis.com".to_string(),
                "firebaseapp.com".to_string(),
            ],
            fallback_document: "/index.html".to_string(),
            skip_waiting: true,
            network: NetworkConfig::default(),
            notification: NotificationConfig::default(),
            sync: SyncConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("UncoverMarkets-SW/{}", env!("CARGO_PKG_VERSION")),
            timeout_secs: 30,
            max_redirects: 10,
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            app_name: "Uncover Markets".to_string(),
            default_body: "New notification from Uncover Markets".to_string(),
            icon: "/images/icon-192x192.png".to_string(),
            badge: "/images/badge-72x72.png".to_string(),
            vibrate: vec![100, 50, 100],
            tag: "notification".to_string(),
            require_interaction: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(
            "sync-newsletter".to_string(),
            "/api/newsletters/sync".to_string(),
        );
        endpoints.insert("sync-photos".to_string(), "/api/photos/sync".to_string());

        Self {
            endpoints,
            max_attempts: 3,
            initial_backoff_ms: 1_000,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("uncover-markets")
                .join("sw-cache.sqlite3"),
        }
    }
}

impl WorkerConfig {
    /// Load and validate a JSON config file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        debug!(path = %path.display(), "Loading worker config");
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a JSON config; missing fields take their defaults
    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants the worker relies on
    pub fn validate(&self) -> ConfigResult<()> {
        if self.version.trim().is_empty() {
            return Err(ConfigError::invalid("version must not be empty"));
        }

        if !matches!(self.scope.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(format!(
                "scope must be http(s), got {}",
                self.scope.scheme()
            )));
        }

        if !self.fallback_document.starts_with('/') {
            return Err(ConfigError::invalid(
                "fallback_document must be an absolute path",
            ));
        }

        for url in self.required_urls.iter().chain(&self.optional_urls) {
            self.resolve(url)?;
        }

        for path in self.sync.endpoints.values() {
            self.resolve(path)?;
        }

        if let Some(domain) = self
            .trusted_domains
            .iter()
            .find(|d| d.is_empty() || d.contains('/') || d.starts_with('.'))
        {
            return Err(ConfigError::invalid(format!(
                "trusted domain {domain:?} must be a bare hostname"
            )));
        }

        if self.network.timeout_secs == 0 {
            return Err(ConfigError::invalid("network.timeout_secs must be positive"));
        }

        Ok(())
    }

    /// Resolve a possibly relative URL against the scope
    pub fn resolve(&self, url: &str) -> ConfigResult<Url> {
        Ok(self.scope.join(url)?)
    }

    /// Root document of the application
    pub fn root_url(&self) -> Url {
        let mut root = self.scope.clone();
        root.set_path("/");
        root.set_query(None);
        root.set_fragment(None);
        root
    }

    /// URL of the last-resort document for failed same-origin fetches
    pub fn fallback_url(&self) -> ConfigResult<Url> {
        self.resolve(&self.fallback_document)
    }

    /// Endpoint a sync tag posts to, if the tag is known
    pub fn sync_endpoint(&self, tag: &str) -> Option<Url> {
        self.sync
            .endpoints
            .get(tag)
            .and_then(|path| self.resolve(path).ok())
    }

    pub fn optional_timeout(&self) -> Duration {
        Duration::from_secs(self.optional_timeout_secs)
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network.timeout_secs)
    }
}
