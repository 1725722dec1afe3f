//! Scripted [`Fetcher`] for tests and offline rehearsal.
//!
//! Routes are keyed by absolute URL. Unrouted URLs answer 404, like a static
//! server that does not know the path. Every request is recorded so callers
//! can assert whether the network was touched at all.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use tracing::trace;
use url::Url;

use crate::{Fetcher, NetError, Request, Response};

/// Scripted outcome for a URL.
#[derive(Debug, Clone)]
pub enum MockRoute {
    Respond {
        status: StatusCode,
        headers: Vec<(String, String)>,
        body: Bytes,
    },
    /// Transport failure.
    Fail,
    /// Clock expiry.
    Timeout,
}

impl MockRoute {
    /// 200 with the given body.
    pub fn ok(body: impl Into<Bytes>) -> Self {
        Self::Respond {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Bare status with an empty body.
    pub fn status(status: StatusCode) -> Self {
        Self::Respond {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add a response header (no-op on failure routes).
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let Self::Respond { headers, .. } = &mut self {
            headers.push((name.to_string(), value.to_string()));
        }
        self
    }
}

#[derive(Default)]
struct MockState {
    routes: HashMap<String, MockRoute>,
    log: Vec<(Method, Url)>,
    offline: bool,
}

/// In-memory [`Fetcher`] with scripted routes.
#[derive(Default)]
pub struct MockFetcher {
    state: Mutex<MockState>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome for a URL, replacing any previous route.
    pub fn route(&self, url: &str, route: MockRoute) -> &Self {
        self.lock().routes.insert(url.to_string(), route);
        self
    }

    /// While offline every request fails regardless of its route.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<(Method, Url)> {
        self.lock().log.clone()
    }

    /// Number of requests seen for a URL.
    pub fn hits(&self, url: &str) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|(_, u)| u.as_str() == url)
            .count()
    }

    pub fn clear_log(&self) {
        self.lock().log.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn respond(&self, request: &Request) -> Result<Response, NetError> {
        let mut state = self.lock();
        state.log.push((request.method.clone(), request.url.clone()));
        trace!(url = %request.url, method = %request.method, "Mock fetch");

        if state.offline {
            return Err(NetError::Offline);
        }

        match state.routes.get(request.url.as_str()) {
            Some(MockRoute::Respond {
                status,
                headers,
                body,
            }) => {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    let name = HeaderName::try_from(name.as_str())
                        .map_err(|e| NetError::RequestFailed(e.to_string()))?;
                    let value = HeaderValue::try_from(value.as_str())
                        .map_err(|e| NetError::RequestFailed(e.to_string()))?;
                    map.append(name, value);
                }
                Ok(Response::new(request.url.clone(), *status, map, body.clone()))
            }
            Some(MockRoute::Fail) => Err(NetError::RequestFailed(format!(
                "connection refused: {}",
                request.url
            ))),
            Some(MockRoute::Timeout) => Err(NetError::Timeout(
                request.timeout.unwrap_or(Duration::from_secs(30)),
            )),
            None => Ok(Response::new(
                request.url.clone(),
                StatusCode::NOT_FOUND,
                HeaderMap::new(),
                Bytes::new(),
            )),
        }
    }
}

impl Fetcher for MockFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        let result = self.respond(request);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(url: &str) -> Request {
        Request::get(Url::parse(url).unwrap())
    }

    #[tokio::test]
    async fn test_routed_response() {
        let fetcher = MockFetcher::new();
        fetcher.route(
            "https://uncovermarkets.test/app.js",
            MockRoute::ok("js").with_header("content-type", "text/javascript"),
        );

        let response = fetcher
            .fetch(&get("https://uncovermarkets.test/app.js"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.headers.get("content-type").unwrap(), "text/javascript");
        assert_eq!(fetcher.hits("https://uncovermarkets.test/app.js"), 1);
    }

    #[tokio::test]
    async fn test_unrouted_is_404() {
        let fetcher = MockFetcher::new();
        let response = fetcher
            .fetch(&get("https://uncovermarkets.test/missing"))
            .await
            .unwrap();
        assert_eq!(response.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_offline_overrides_routes() {
        let fetcher = MockFetcher::new();
        fetcher.route("https://uncovermarkets.test/", MockRoute::ok("home"));
        fetcher.set_offline(true);

        let err = fetcher
            .fetch(&get("https://uncovermarkets.test/"))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Offline));
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_route() {
        let fetcher = MockFetcher::new();
        fetcher.route("https://cdn.example.test/lib.js", MockRoute::Timeout);

        let err = fetcher
            .fetch(&get("https://cdn.example.test/lib.js").timeout(Duration::from_secs(2)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
