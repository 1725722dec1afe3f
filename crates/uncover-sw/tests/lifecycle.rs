//! Install / activate across versions, control messages and sync replay.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use http::StatusCode;
use url::Url;

use uncover_core::{StorageConfig, SyncConfig, WorkerConfig};
use uncover_net::{Fetcher, MockFetcher, MockRoute, NetError, Request, Response};
use uncover_sw::{
    CacheBackend, CacheEntry, CacheStorage, MemoryCacheStorage, RequestKey,
    ServiceWorkerContainer, ServiceWorkerError, ServiceWorkerEvent, ServiceWorkerState,
    SqliteCacheStorage, SyncManager,
};

const ORIGIN: &str = "https://uncovermarkets.test";
const QUILL_CSS: &str = "https://cdn.quilljs.com/1.3.6/quill.snow.css";
const QUILL_JS: &str = "https://cdn.quilljs.com/1.3.6/quill.js";

fn config(version: &str) -> WorkerConfig {
    WorkerConfig {
        version: version.to_string(),
        scope: Url::parse(&format!("{ORIGIN}/")).unwrap(),
        optional_timeout_secs: 1,
        storage: StorageConfig::Memory,
        ..Default::default()
    }
}

fn local(path: &str) -> String {
    format!("{ORIGIN}{path}")
}

fn shell_fetcher() -> Arc<MockFetcher> {
    let fetcher = Arc::new(MockFetcher::new());
    fetcher.route(&local("/"), MockRoute::ok("<html>home"));
    fetcher.route(&local("/index.html"), MockRoute::ok("<html>shell"));
    fetcher.route(&local("/manifest.json"), MockRoute::ok("{}"));
    fetcher.route(QUILL_CSS, MockRoute::ok(".ql-editor{}"));
    fetcher.route(QUILL_JS, MockRoute::ok("var Quill;"));
    fetcher
}

fn required_keys() -> Vec<RequestKey> {
    let mut keys: Vec<RequestKey> = ["/", "/index.html", "/manifest.json"]
        .iter()
        .map(|p| RequestKey::get(&Url::parse(&local(p)).unwrap()))
        .collect();
    keys.sort();
    keys
}

/// Fetcher that never answers for one URL.
struct StallingFetcher {
    inner: Arc<MockFetcher>,
    stalled: String,
}

impl Fetcher for StallingFetcher {
    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, NetError>> {
        if request.url.as_str() == self.stalled {
            return Box::pin(async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(NetError::Timeout(Duration::from_secs(3600)))
            });
        }
        self.inner.fetch(request)
    }
}

/// Memory backend whose store deletion always fails.
struct UndeletableStorage {
    inner: MemoryCacheStorage,
}

impl CacheBackend for UndeletableStorage {
    fn open<'a>(&'a self, name: &'a str) -> BoxFuture<'a, uncover_sw::Result<()>> {
        self.inner.open(name)
    }

    fn has<'a>(&'a self, name: &'a str) -> BoxFuture<'a, uncover_sw::Result<bool>> {
        self.inner.has(name)
    }

    fn delete<'a>(&'a self, _name: &'a str) -> BoxFuture<'a, uncover_sw::Result<bool>> {
        Box::pin(async { Err(ServiceWorkerError::CacheError("disk".into())) })
    }

    fn keys(&self) -> BoxFuture<'_, uncover_sw::Result<Vec<String>>> {
        self.inner.keys()
    }

    fn get<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, uncover_sw::Result<Option<CacheEntry>>> {
        self.inner.get(name, key)
    }

    fn put<'a>(&'a self, name: &'a str, entry: CacheEntry) -> BoxFuture<'a, uncover_sw::Result<()>> {
        self.inner.put(name, entry)
    }

    fn remove<'a>(
        &'a self,
        name: &'a str,
        key: &'a RequestKey,
    ) -> BoxFuture<'a, uncover_sw::Result<bool>> {
        self.inner.remove(name, key)
    }

    fn entry_keys<'a>(&'a self, name: &'a str) -> BoxFuture<'a, uncover_sw::Result<Vec<RequestKey>>> {
        self.inner.entry_keys(name)
    }
}

#[tokio::test]
async fn upgrade_evicts_previous_version() {
    let storage = CacheStorage::in_memory();
    let (container, _events) = ServiceWorkerContainer::new(storage.clone());
    let fetcher = shell_fetcher();

    let v8 = container.register(config("v8"), fetcher.clone()).await.unwrap();
    v8.install().await.unwrap();
    assert_eq!(storage.keys().await.unwrap(), vec!["v8"]);

    let v9 = container.register(config("v9"), fetcher).await.unwrap();
    v9.install().await.unwrap();

    assert_eq!(storage.keys().await.unwrap(), vec!["v9"]);
    assert_eq!(v9.state().await, ServiceWorkerState::Activated);
    assert_eq!(v8.state().await, ServiceWorkerState::Redundant);

    let mut keys = storage.cache("v9").keys().await.unwrap();
    keys.retain(|k| k.url.starts_with(ORIGIN));
    assert_eq!(keys, required_keys());
}

#[tokio::test]
async fn failed_eviction_still_activates_new_version() {
    let storage = CacheStorage::new(Arc::new(UndeletableStorage {
        inner: MemoryCacheStorage::new(),
    }));
    let (container, _events) = ServiceWorkerContainer::new(storage.clone());
    let fetcher = shell_fetcher();

    let v8 = container.register(config("v8"), fetcher.clone()).await.unwrap();
    v8.install().await.unwrap();

    let v9 = container.register(config("v9"), fetcher).await.unwrap();
    v9.install().await.unwrap();

    assert_eq!(v8.state().await, ServiceWorkerState::Redundant);
    assert_eq!(v9.state().await, ServiceWorkerState::Activated);
    assert_eq!(container.active_version().await.as_deref(), Some("v9"));
    assert_eq!(storage.keys().await.unwrap(), vec!["v8", "v9"]);

    let shell = v9
        .handle_fetch(&Request::get(Url::parse(&local("/index.html")).unwrap()))
        .await
        .expect("activated worker intercepts");
    assert_eq!(shell.status, StatusCode::OK);
}

#[tokio::test]
async fn activation_leaves_only_current_store() {
    let storage = CacheStorage::in_memory();
    for stale in ["uncovermarkets-v6", "uncovermarkets-v7", "scratch"] {
        storage.open(stale).await.unwrap();
    }
    let (container, _events) = ServiceWorkerContainer::new(storage.clone());

    let scope = container.register(config("v9"), shell_fetcher()).await.unwrap();
    scope.install().await.unwrap();

    assert_eq!(storage.keys().await.unwrap(), vec!["v9"]);
}

#[tokio::test]
async fn missing_required_asset_fails_install() {
    let storage = CacheStorage::in_memory();
    let (container, mut events) = ServiceWorkerContainer::new(storage.clone());

    let fetcher = shell_fetcher();
    let v8 = container.register(config("v8"), fetcher.clone()).await.unwrap();
    v8.install().await.unwrap();

    fetcher.route(&local("/manifest.json"), MockRoute::status(StatusCode::NOT_FOUND));
    let v9 = container.register(config("v9"), fetcher).await.unwrap();
    let err = v9.install().await.unwrap_err();

    assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));
    assert_eq!(v9.state().await, ServiceWorkerState::Redundant);
    assert_eq!(v8.state().await, ServiceWorkerState::Activated);
    assert_eq!(container.active_version().await.as_deref(), Some("v8"));
    assert_eq!(storage.keys().await.unwrap(), vec!["v8"]);

    let mut redundant = false;
    while let Ok(event) = events.try_recv() {
        if let ServiceWorkerEvent::StateChange {
            version,
            new_state: ServiceWorkerState::Redundant,
            ..
        } = event
        {
            redundant |= version == "v9";
        }
    }
    assert!(redundant);
}

#[tokio::test]
async fn unreachable_required_asset_fails_install() {
    let (container, _events) = ServiceWorkerContainer::new(CacheStorage::in_memory());
    let fetcher = shell_fetcher();
    fetcher.route(&local("/"), MockRoute::Fail);

    let scope = container.register(config("v9"), fetcher).await.unwrap();
    assert!(scope.install().await.is_err());
    assert!(container.active_version().await.is_none());
}

#[tokio::test]
async fn optional_asset_timeout_does_not_block_activation() {
    let storage = CacheStorage::in_memory();
    let (container, _events) = ServiceWorkerContainer::new(storage.clone());
    let fetcher = Arc::new(StallingFetcher {
        inner: shell_fetcher(),
        stalled: QUILL_JS.to_string(),
    });

    let scope = container.register(config("v9"), fetcher).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), scope.install())
        .await
        .expect("install must not wait for the stalled asset")
        .unwrap();

    assert_eq!(scope.state().await, ServiceWorkerState::Activated);
    let cache = storage.cache("v9");
    let css = RequestKey::get(&Url::parse(QUILL_CSS).unwrap());
    let js = RequestKey::get(&Url::parse(QUILL_JS).unwrap());
    assert!(cache.match_key(&css).await.unwrap().is_some());
    assert!(cache.match_key(&js).await.unwrap().is_none());
}

#[tokio::test]
async fn failing_optional_asset_is_skipped() {
    let (container, _events) = ServiceWorkerContainer::new(CacheStorage::in_memory());
    let fetcher = shell_fetcher();
    fetcher.route(QUILL_CSS, MockRoute::Timeout);
    fetcher.route(QUILL_JS, MockRoute::status(StatusCode::BAD_GATEWAY));

    let scope = container.register(config("v9"), fetcher).await.unwrap();
    scope.install().await.unwrap();
    assert_eq!(scope.state().await, ServiceWorkerState::Activated);
}

#[tokio::test]
async fn clear_cache_message_deletes_every_store() {
    let storage = CacheStorage::in_memory();
    let (container, _events) = ServiceWorkerContainer::new(storage.clone());
    let scope = container.register(config("v9"), shell_fetcher()).await.unwrap();
    scope.install().await.unwrap();

    scope.handle_message(r#"{"type":"CLEAR_CACHE"}"#).await.unwrap();
    assert!(storage.keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn cache_urls_message_is_best_effort() {
    let storage = CacheStorage::in_memory();
    let (container, _events) = ServiceWorkerContainer::new(storage.clone());
    let fetcher = shell_fetcher();
    fetcher.route(&local("/images/hero.jpg"), MockRoute::ok(vec![1u8, 2, 3]));
    let scope = container.register(config("v9"), fetcher).await.unwrap();
    scope.install().await.unwrap();

    scope
        .handle_message(r#"{"type":"CACHE_URLS","payload":["/images/hero.jpg","/images/gone.jpg"]}"#)
        .await
        .unwrap();

    let cache = storage.cache("v9");
    let hero = RequestKey::get(&Url::parse(&local("/images/hero.jpg")).unwrap());
    let gone = RequestKey::get(&Url::parse(&local("/images/gone.jpg")).unwrap());
    assert!(cache.match_key(&hero).await.unwrap().is_some());
    assert!(cache.match_key(&gone).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_and_malformed_messages() {
    let (container, _events) = ServiceWorkerContainer::new(CacheStorage::in_memory());
    let scope = container.register(config("v9"), shell_fetcher()).await.unwrap();
    scope.install().await.unwrap();

    scope.handle_message(r#"{"type":"REFRESH_PRICES"}"#).await.unwrap();
    assert!(matches!(
        scope.handle_message("{type: SKIP_WAITING}").await,
        Err(ServiceWorkerError::InvalidMessage(_))
    ));
}

#[tokio::test]
async fn sync_replays_until_delivered() {
    let (container, _events) = ServiceWorkerContainer::new(CacheStorage::in_memory());
    let fetcher = shell_fetcher();
    let scope = container.register(config("v9"), fetcher.clone()).await.unwrap();
    scope.install().await.unwrap();

    let manager = SyncManager::new(&SyncConfig {
        max_attempts: 2,
        initial_backoff_ms: 1,
        ..Default::default()
    });
    manager.register("sync-newsletter");
    manager.register("sync-photos");

    fetcher.set_offline(true);
    let failed = manager.replay(&scope).await;
    assert_eq!(failed, vec!["sync-newsletter", "sync-photos"]);
    assert_eq!(fetcher.hits(&local("/api/photos/sync")), 2);

    fetcher.set_offline(false);
    fetcher.route(&local("/api/newsletters/sync"), MockRoute::ok(""));
    fetcher.route(&local("/api/photos/sync"), MockRoute::ok(""));
    assert!(manager.replay(&scope).await.is_empty());
    assert!(manager.pending().is_empty());
}

#[tokio::test]
async fn sqlite_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sw-cache.sqlite3");

    {
        let storage = CacheStorage::new(Arc::new(SqliteCacheStorage::open(&path).unwrap()));
        let (container, _events) = ServiceWorkerContainer::new(storage);
        let scope = container.register(config("v9"), shell_fetcher()).await.unwrap();
        scope.install().await.unwrap();
    }

    let storage = CacheStorage::new(Arc::new(SqliteCacheStorage::open(&path).unwrap()));
    assert_eq!(storage.keys().await.unwrap(), vec!["v9"]);

    let shell = RequestKey::get(&Url::parse(&local("/index.html")).unwrap());
    let response = storage.cache("v9").match_key(&shell).await.unwrap().unwrap();
    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text().unwrap(), "<html>shell");
}
