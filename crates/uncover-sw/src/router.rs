//! Request classification and strategy selection.

use http::Method;
use tracing::trace;
use url::{Origin, Url};

use uncover_net::Request;

/// Where a request is headed, relative to the worker's scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Same origin as the scope: the app's own static assets.
    SameOrigin,
    /// Cross-origin host on the trusted API list (auth/storage provider).
    TrustedApi,
    /// Any other cross-origin host (CDNs and the like).
    CrossOrigin,
}

/// Strategy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted; the default network path handles it.
    Passthrough,
    CacheFirst,
    NetworkFirst,
}

/// Picks one strategy per request. Stateless apart from its configuration.
#[derive(Debug, Clone)]
pub struct Router {
    origin: Origin,
    trusted_domains: Vec<String>,
}

impl Router {
    pub fn new(scope: &Url, trusted_domains: &[String]) -> Self {
        Self {
            origin: scope.origin(),
            trusted_domains: trusted_domains
                .iter()
                .map(|d| d.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Classify a URL. Same-origin is full origin equality (scheme, host and
    /// port), not a string prefix test.
    pub fn classify(&self, url: &Url) -> RequestClass {
        if url.origin() == self.origin {
            return RequestClass::SameOrigin;
        }

        match url.host_str() {
            Some(host) if self.is_trusted(host) => RequestClass::TrustedApi,
            _ => RequestClass::CrossOrigin,
        }
    }

    /// Exact-suffix hostname match: `h` matches `d` when `h == d` or `h`
    /// ends with `.d`.
    pub fn is_trusted(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.trusted_domains.iter().any(|domain| {
            host == *domain
                || (host.len() > domain.len()
                    && host.ends_with(domain.as_str())
                    && host.as_bytes()[host.len() - domain.len() - 1] == b'.')
        })
    }

    pub fn route(&self, request: &Request) -> Route {
        if request.method != Method::GET || !request.is_http() {
            trace!(url = %request.url, method = %request.method, "Not intercepted");
            return Route::Passthrough;
        }

        let route = match self.classify(&request.url) {
            RequestClass::SameOrigin => Route::CacheFirst,
            RequestClass::TrustedApi | RequestClass::CrossOrigin => Route::NetworkFirst,
        };
        trace!(url = %request.url, ?route, "Routed request");
        route
    }
}
