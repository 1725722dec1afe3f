//! Background sync.
//!
//! A sync tag names an endpoint that gets an empty JSON POST once
//! connectivity returns. [`SyncManager`] plays the host scheduler: it keeps
//! tags whose POST failed and replays them with backoff.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use http::header::CONTENT_TYPE;
use http::HeaderValue;
use tracing::{debug, info, warn};

use uncover_common::{retry_with_backoff, RetryConfig};
use uncover_core::{SyncConfig, WorkerConfig};
use uncover_net::{Fetcher, Request};

use crate::scope::ServiceWorkerScope;
use crate::{Result, ServiceWorkerError};

/// The POST a sync tag dispatches, or `None` for an unknown tag.
pub fn sync_request(config: &WorkerConfig, tag: &str) -> Option<Request> {
    let endpoint = config.sync_endpoint(tag)?;
    Some(
        Request::post(endpoint, None)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json")),
    )
}

/// Send a sync POST. Transport failures and non-2xx answers both fail, so
/// the tag stays pending.
pub(crate) async fn dispatch(fetcher: Arc<dyn Fetcher>, tag: String, request: Request) -> Result<()> {
    let response = fetcher
        .fetch(&request)
        .await
        .map_err(|e| ServiceWorkerError::SyncFailed(format!("{tag}: {e}")))?;

    if !response.ok() {
        return Err(ServiceWorkerError::SyncFailed(format!(
            "{tag}: {} answered {}",
            request.url, response.status
        )));
    }

    info!(tag = %tag, url = %request.url, "Background sync delivered");
    Ok(())
}

// ==================== Sync Manager ====================

/// Pending sync registrations.
pub struct SyncManager {
    pending: Mutex<BTreeSet<String>>,
    retry: RetryConfig,
}

impl SyncManager {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            pending: Mutex::new(BTreeSet::new()),
            retry: RetryConfig {
                max_attempts: config.max_attempts,
                initial_delay: Duration::from_millis(config.initial_backoff_ms),
                ..Default::default()
            },
        }
    }

    /// Register a tag. Registering a pending tag again is a no-op.
    pub fn register(&self, tag: impl Into<String>) {
        let tag = tag.into();
        debug!(tag = %tag, "Sync registered");
        self.lock().insert(tag);
    }

    /// Pending tags, sorted.
    pub fn pending(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    /// Fire every pending tag on `scope`, retrying each with backoff.
    ///
    /// Delivered tags are removed; the tags that still failed after every
    /// attempt are returned and stay pending.
    pub async fn replay(&self, scope: &ServiceWorkerScope) -> Vec<String> {
        let tags = self.pending();
        let mut failed = Vec::new();

        for tag in tags {
            let result = retry_with_backoff(&self.retry, || scope.handle_sync(&tag)).await;
            match result {
                Ok(()) => {
                    self.lock().remove(&tag);
                }
                Err(e) => {
                    warn!(tag = %tag, error = %e, "Sync still pending");
                    failed.push(tag);
                }
            }
        }

        failed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use uncover_net::{MockFetcher, MockRoute};

    #[test]
    fn test_sync_request_for_known_tags() {
        let config = WorkerConfig::default();

        let request = sync_request(&config, "sync-newsletter").unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.url.path(), "/api/newsletters/sync");
        assert_eq!(request.headers[CONTENT_TYPE], "application/json");
        assert!(request.body.is_none());

        let request = sync_request(&config, "sync-photos").unwrap();
        assert_eq!(request.url.path(), "/api/photos/sync");
    }

    #[test]
    fn test_unknown_tag() {
        assert!(sync_request(&WorkerConfig::default(), "sync-unknown").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_rejects_error_status() {
        let fetcher = Arc::new(MockFetcher::new());
        let config = WorkerConfig::default();
        let request = sync_request(&config, "sync-photos").unwrap();
        // unrouted: 404

        let err = dispatch(fetcher.clone(), "sync-photos".into(), request.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::SyncFailed(_)));

        fetcher.route(request.url.as_str(), MockRoute::ok(""));
        dispatch(fetcher, "sync-photos".into(), request).await.unwrap();
    }

    #[test]
    fn test_register_dedupes() {
        let manager = SyncManager::new(&SyncConfig::default());
        manager.register("sync-photos");
        manager.register("sync-newsletter");
        manager.register("sync-photos");
        assert_eq!(manager.pending(), vec!["sync-newsletter", "sync-photos"]);
    }
}
