//! Cache-first and network-first retrieval.
//!
//! Neither strategy ever fails: every path ends in a response, at worst a
//! synthesized 503. Store writes are best-effort and registered on the
//! event's lifetime so they finish even though the response goes out first.

use std::sync::Arc;

use http::StatusCode;
use tracing::{debug, warn};
use url::Url;

use uncover_net::{Fetcher, Request, Response};

use crate::lifetime::ExtendableEvent;
use crate::store::{CacheStorage, RequestKey};

pub const OFFLINE_BODY: &str = "Network error - offline";
pub const NO_CACHE_BODY: &str = "Network error - no cache available";

/// What a strategy needs: the current store, the network and the fallback
/// document.
#[derive(Clone)]
pub struct StrategyContext {
    pub cache_name: String,
    pub storage: CacheStorage,
    pub fetcher: Arc<dyn Fetcher>,
    pub fallback_document: Url,
}

impl StrategyContext {
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        match self.storage.cache(&self.cache_name).match_key(key).await {
            Ok(found) => found,
            Err(e) => {
                warn!(url = %key.url, error = %e, "Cache read failed, treating as miss");
                None
            }
        }
    }

    /// Store a copy of `response` once the caller has it. Failures (quota,
    /// disk) are logged and dropped.
    fn store_copy(&self, event: &ExtendableEvent, request: &Request, response: &Response) {
        let cache = self.storage.cache(&self.cache_name);
        let request = request.clone();
        let response = response.clone();

        event.wait_until(async move {
            match cache.put(&request, &response).await {
                Ok(()) => debug!(url = %request.url, cache = cache.name(), "Cached response"),
                Err(e) => warn!(url = %request.url, error = %e, "Failed to cache response"),
            }
            Ok(())
        });
    }
}

/// Serve from the store; go to the network only on a miss.
pub async fn cache_first(
    ctx: &StrategyContext,
    request: &Request,
    event: &ExtendableEvent,
) -> Response {
    if let Some(cached) = ctx.lookup(&RequestKey::for_request(request)).await {
        debug!(url = %request.url, "From cache");
        return cached;
    }

    match ctx.fetcher.fetch(request).await {
        Ok(response) => {
            if response.status == StatusCode::OK {
                ctx.store_copy(event, request, &response);
            }
            response
        }
        Err(e) => {
            warn!(url = %request.url, error = %e, "Fetch failed, falling back to app shell");

            if let Some(document) = ctx.lookup(&RequestKey::get(&ctx.fallback_document)).await {
                return document;
            }

            Response::synthesized(
                request.url.clone(),
                StatusCode::SERVICE_UNAVAILABLE,
                OFFLINE_BODY,
            )
        }
    }
}

/// Prefer the network; fall back to the stored copy of this exact request.
pub async fn network_first(
    ctx: &StrategyContext,
    request: &Request,
    event: &ExtendableEvent,
) -> Response {
    match ctx.fetcher.fetch(request).await {
        Ok(response) => {
            if response.status == StatusCode::OK {
                ctx.store_copy(event, request, &response);
            }
            response
        }
        Err(e) => {
            warn!(url = %request.url, error = %e, "Network unavailable, trying cache");

            if let Some(cached) = ctx.lookup(&RequestKey::for_request(request)).await {
                return cached;
            }

            Response::synthesized(
                request.url.clone(),
                StatusCode::SERVICE_UNAVAILABLE,
                NO_CACHE_BODY,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCacheStorage;
    use uncover_net::{MockFetcher, MockRoute};

    const SHELL: &str = "https://uncovermarkets.test/index.html";

    fn context(fetcher: Arc<MockFetcher>, storage: CacheStorage) -> StrategyContext {
        StrategyContext {
            cache_name: "v9".to_string(),
            storage,
            fetcher,
            fallback_document: Url::parse(SHELL).unwrap(),
        }
    }

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let fetcher = Arc::new(MockFetcher::new());
        let storage = CacheStorage::in_memory();
        let ctx = context(fetcher.clone(), storage.clone());

        let request = get("https://uncovermarkets.test/app.js");
        let stored = Response::new(request.url.clone(), StatusCode::OK, Default::default(), "v1");
        storage.open("v9").await.unwrap().put(&request, &stored).await.unwrap();

        let event = ExtendableEvent::new("fetch");
        let response = cache_first(&ctx, &request, &event).await;
        event.settle().await.unwrap();

        assert_eq!(response.text().unwrap(), "v1");
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_cache_first_miss_stores_200() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.route("https://uncovermarkets.test/app.js", MockRoute::ok("fresh"));
        let storage = CacheStorage::in_memory();
        let ctx = context(fetcher.clone(), storage.clone());

        let request = get("https://uncovermarkets.test/app.js");
        let event = ExtendableEvent::new("fetch");
        let response = cache_first(&ctx, &request, &event).await;
        assert_eq!(event.pending(), 1);
        event.settle().await.unwrap();

        assert_eq!(response.text().unwrap(), "fresh");
        let stored = storage.cache("v9").match_request(&request).await.unwrap();
        assert_eq!(stored.unwrap().text().unwrap(), "fresh");
    }

    #[tokio::test]
    async fn test_cache_first_does_not_store_errors() {
        let fetcher = Arc::new(MockFetcher::new());
        let storage = CacheStorage::in_memory();
        let ctx = context(fetcher, storage.clone());

        let request = get("https://uncovermarkets.test/missing.png");
        let event = ExtendableEvent::new("fetch");
        let response = cache_first(&ctx, &request, &event).await;

        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(event.pending(), 0);
        assert!(!storage.has("v9").await.unwrap());
    }

    #[tokio::test]
    async fn test_cache_first_offline_serves_shell() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_offline(true);
        let storage = CacheStorage::in_memory();
        let shell = get(SHELL);
        let shell_response =
            Response::new(shell.url.clone(), StatusCode::OK, Default::default(), "<html>");
        storage.open("v9").await.unwrap().put(&shell, &shell_response).await.unwrap();
        let ctx = context(fetcher, storage);

        let event = ExtendableEvent::new("fetch");
        let response = cache_first(&ctx, &get("https://uncovermarkets.test/about"), &event).await;

        assert_eq!(response.text().unwrap(), "<html>");
    }

    #[tokio::test]
    async fn test_cache_first_offline_without_shell_is_503() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_offline(true);
        let ctx = context(fetcher, CacheStorage::in_memory());

        let event = ExtendableEvent::new("fetch");
        let response = cache_first(&ctx, &get("https://uncovermarkets.test/about"), &event).await;

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.status_text(), "Service Unavailable");
        assert_eq!(response.text().unwrap(), OFFLINE_BODY);
    }

    #[tokio::test]
    async fn test_network_first_prefers_network() {
        let fetcher = Arc::new(MockFetcher::new());
        let url = "https://x.firebaseio.com/sections.json";
        fetcher.route(url, MockRoute::ok("new"));
        let storage = CacheStorage::in_memory();
        let request = get(url);
        let old = Response::new(request.url.clone(), StatusCode::OK, Default::default(), "old");
        storage.open("v9").await.unwrap().put(&request, &old).await.unwrap();
        let ctx = context(fetcher, storage.clone());

        let event = ExtendableEvent::new("fetch");
        let response = network_first(&ctx, &request, &event).await;
        event.settle().await.unwrap();

        assert_eq!(response.text().unwrap(), "new");
        let stored = storage.cache("v9").match_request(&request).await.unwrap();
        assert_eq!(stored.unwrap().text().unwrap(), "new");
    }

    #[tokio::test]
    async fn test_network_first_falls_back_to_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        let url = "https://cdn.quilljs.com/1.3.6/quill.js";
        fetcher.route(url, MockRoute::Fail);
        let storage = CacheStorage::in_memory();
        let request = get(url);
        let old = Response::new(request.url.clone(), StatusCode::OK, Default::default(), "quill");
        storage.open("v9").await.unwrap().put(&request, &old).await.unwrap();
        let ctx = context(fetcher, storage);

        let event = ExtendableEvent::new("fetch");
        let response = network_first(&ctx, &request, &event).await;

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.text().unwrap(), "quill");
    }

    #[tokio::test]
    async fn test_network_first_without_cache_is_503() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_offline(true);
        let ctx = context(fetcher, CacheStorage::in_memory());

        let event = ExtendableEvent::new("fetch");
        let response =
            network_first(&ctx, &get("https://cdn.quilljs.com/1.3.6/quill.js"), &event).await;

        assert_eq!(response.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.status_text(), "Service Unavailable");
        assert_eq!(response.text().unwrap(), NO_CACHE_BODY);
    }

    #[tokio::test]
    async fn test_quota_failure_still_returns_response() {
        let fetcher = Arc::new(MockFetcher::new());
        let url = "https://uncovermarkets.test/big.jpg";
        fetcher.route(url, MockRoute::ok(vec![0u8; 1024]));
        let storage = CacheStorage::new(Arc::new(MemoryCacheStorage::with_quota(64)));
        let ctx = context(fetcher, storage.clone());

        let request = get(url);
        let event = ExtendableEvent::new("fetch");
        let response = cache_first(&ctx, &request, &event).await;
        event.settle().await.unwrap();

        assert_eq!(response.body().len(), 1024);
        assert!(storage.cache("v9").match_request(&request).await.unwrap().is_none());
    }
}
