//! Named stores of request/response pairs.
//!
//! [`CacheStorage`] is the process-wide handle (the `caches` global) over a
//! [`CacheBackend`]. [`Cache`] is a handle on one named store. Entries are
//! whole-value replaced on write, so concurrent writers for the same key
//! converge on the last completed write.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::{join_all, BoxFuture};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use uncover_core::StorageConfig;
use uncover_net::{Fetcher, Request, Response};

use crate::{Result, ServiceWorkerError};

mod memory;
mod sqlite;

pub use memory::MemoryCacheStorage;
pub use sqlite::SqliteCacheStorage;

// ==================== Entries ====================

/// Lookup key of a stored response: method plus absolute URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self {
            method: Method::GET.to_string(),
            url: url.to_string(),
        }
    }

    pub fn for_request(request: &Request) -> Self {
        Self {
            method: request.method.to_string(),
            url: request.url.to_string(),
        }
    }
}

/// A cached request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in wire order. Values are raw bytes so obs-text
    /// survives the trip.
    pub headers: Vec<(String, Vec<u8>)>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: i64,
}

impl CacheEntry {
    /// Snapshot a response under `key`.
    pub fn from_response(key: &RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status.as_u16(),
            headers,
            body: response.body().to_vec(),
            cached_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Bytes this entry occupies for quota accounting.
    pub fn size(&self) -> usize {
        self.body.len()
            + self.url.len()
            + self
                .headers
                .iter()
                .map(|(n, v)| n.len() + v.len())
                .sum::<usize>()
    }

    /// Rebuild a response from the snapshot.
    pub fn to_response(&self) -> Result<Response> {
        let url = Url::parse(&self.url)?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            let value = HeaderValue::from_bytes(value)
                .map_err(|e| ServiceWorkerError::CacheError(e.to_string()))?;
            headers.append(name, value);
        }

        Ok(Response::new(
            url,
            status,
            headers,
            Bytes::from(self.body.clone()),
        ))
    }
}

// ==================== Backend ====================

/// Storage engine behind [`CacheStorage`].
///
/// Writing into a store that does not exist creates it.
pub trait CacheBackend: Send + Sync {
    /// Create the store if it does not exist.
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<()>>;

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Delete a whole store. Returns whether it existed.
    fn delete<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<bool>>;

    /// Names of all stores, sorted.
    fn keys(&self) -> BoxFuture<'_, Result<Vec<String>>>;

    fn get<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, Result<Option<CacheEntry>>>;

    fn put<'a>(&'a self, name: &'a str, entry: CacheEntry) -> BoxFuture<'a, Result<()>>;

    /// Remove one entry. Returns whether it existed.
    fn remove<'a>(&'a self, name: &'a str, key: &'a RequestKey) -> BoxFuture<'a, Result<bool>>;

    /// Keys of all entries in a store, sorted.
    fn entry_keys<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Vec<RequestKey>>>;
}

// ==================== Cache Storage ====================

/// Cache storage (caches global).
#[derive(Clone)]
pub struct CacheStorage {
    backend: Arc<dyn CacheBackend>,
}

impl CacheStorage {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self { backend }
    }

    /// Memory-backed storage without a quota.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCacheStorage::new()))
    }

    /// Build the backend a config asks for.
    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        match config {
            StorageConfig::Memory => Ok(Self::in_memory()),
            StorageConfig::Sqlite { path } => {
                Ok(Self::new(Arc::new(SqliteCacheStorage::open(path)?)))
            }
        }
    }

    /// Open a cache (creates if doesn't exist).
    pub async fn open(&self, name: &str) -> Result<Cache> {
        self.backend.open(name).await?;
        Ok(Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        })
    }

    /// Handle on a store without creating it. Reads of a missing store find
    /// nothing; the first write creates it.
    pub fn cache(&self, name: &str) -> Cache {
        Cache {
            name: name.to_string(),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Check if cache exists.
    pub async fn has(&self, name: &str) -> Result<bool> {
        self.backend.has(name).await
    }

    /// Delete a cache.
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let existed = self.backend.delete(name).await?;
        if existed {
            debug!(cache = name, "Deleted cache");
        }
        Ok(existed)
    }

    /// Get all cache names.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.backend.keys().await
    }
}

// ==================== Cache ====================

/// Handle on one named store.
#[derive(Clone)]
pub struct Cache {
    name: String,
    backend: Arc<dyn CacheBackend>,
}

impl Cache {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Match a request.
    pub async fn match_request(&self, request: &Request) -> Result<Option<Response>> {
        self.match_key(&RequestKey::for_request(request)).await
    }

    pub async fn match_key(&self, key: &RequestKey) -> Result<Option<Response>> {
        match self.backend.get(&self.name, key).await? {
            Some(entry) => entry.to_response().map(Some),
            None => Ok(None),
        }
    }

    /// Store a response for a request. Only GET requests can be stored.
    pub async fn put(&self, request: &Request, response: &Response) -> Result<()> {
        if request.method != Method::GET {
            return Err(ServiceWorkerError::StateError(format!(
                "Cannot cache {} request for {}",
                request.method, request.url
            )));
        }
        let key = RequestKey::for_request(request);
        self.backend
            .put(&self.name, CacheEntry::from_response(&key, response))
            .await
    }

    /// Fetch a URL and store it; non-2xx responses are an error.
    pub async fn add(&self, fetcher: &dyn Fetcher, url: &Url) -> Result<()> {
        let request = Request::get(url.clone());
        let response = fetch_ok(fetcher, &request).await?;
        self.put(&request, &response).await
    }

    /// Fetch every URL, then store them all. Nothing is stored unless every
    /// fetch succeeds.
    pub async fn add_all(&self, fetcher: &dyn Fetcher, urls: &[Url]) -> Result<()> {
        let requests: Vec<Request> = urls.iter().cloned().map(Request::get).collect();
        let responses = join_all(requests.iter().map(|r| fetch_ok(fetcher, r))).await;

        let mut fetched = Vec::with_capacity(responses.len());
        for (request, response) in requests.iter().zip(responses) {
            fetched.push((request, response?));
        }

        for (request, response) in fetched {
            self.put(request, &response).await?;
        }
        Ok(())
    }

    /// Delete entry.
    pub async fn delete(&self, request: &Request) -> Result<bool> {
        self.backend
            .remove(&self.name, &RequestKey::for_request(request))
            .await
    }

    /// Get all keys.
    pub async fn keys(&self) -> Result<Vec<RequestKey>> {
        self.backend.entry_keys(&self.name).await
    }
}

async fn fetch_ok(fetcher: &dyn Fetcher, request: &Request) -> Result<Response> {
    let response = fetcher.fetch(request).await?;
    if !response.ok() {
        warn!(url = %request.url, status = %response.status, "Refusing to cache error response");
        return Err(ServiceWorkerError::BadStatus {
            url: request.url.to_string(),
            status: response.status.as_u16(),
        });
    }
    Ok(response)
}
