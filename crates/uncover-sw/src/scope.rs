//! Worker scope: the event handlers of one deployed version.
//!
//! A [`ServiceWorkerContainer`] holds what all versions on an origin share
//! (registration, clients, notifications, storage). Registering a
//! [`WorkerConfig`] yields a [`ServiceWorkerScope`] whose methods are the
//! worker's event handlers. Each handler builds an [`ExtendableEvent`],
//! hangs its asynchronous work on it and settles it before returning.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use url::Url;

use uncover_common::with_timeout;
use uncover_core::WorkerConfig;
use uncover_net::{Fetcher, Request, Response};

use crate::clients::{Client, ClientMatchOptions, ClientType, Clients};
use crate::lifecycle::{Registration, ServiceWorker, ServiceWorkerId, ServiceWorkerState};
use crate::lifetime::ExtendableEvent;
use crate::message::ControlMessage;
use crate::push::{ClickOutcome, Notification, PushPayload};
use crate::router::{Route, Router};
use crate::store::{Cache, CacheStorage};
use crate::strategy::{cache_first, network_first, StrategyContext};
use crate::sync;
use crate::{Result, ServiceWorkerError};

/// Events broadcast to the embedding application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerEvent {
    /// Worker changed state.
    StateChange {
        version: String,
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by `version`.
    ControllerChange { client_id: String, version: String },
    NotificationShown { id: String, title: String },
    NotificationClosed { id: String },
}

// ==================== Container ====================

/// Per-origin state shared by every registered version.
#[derive(Clone)]
pub struct ServiceWorkerContainer {
    registration: Arc<RwLock<Registration>>,
    clients: Arc<RwLock<Clients>>,
    notifications: Arc<RwLock<Vec<Notification>>>,
    storage: CacheStorage,
    event_tx: mpsc::UnboundedSender<ServiceWorkerEvent>,
}

impl ServiceWorkerContainer {
    /// Create a container over `storage`, plus the receiving end of its
    /// event channel.
    pub fn new(storage: CacheStorage) -> (Self, mpsc::UnboundedReceiver<ServiceWorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let container = Self {
            registration: Arc::new(RwLock::new(Registration::new())),
            clients: Arc::new(RwLock::new(Clients::new())),
            notifications: Arc::new(RwLock::new(Vec::new())),
            storage,
            event_tx,
        };
        (container, event_rx)
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    /// Register a new version and put it into the installing slot.
    pub async fn register(
        &self,
        config: WorkerConfig,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<ServiceWorkerScope> {
        config.validate()?;

        let router = Router::new(&config.scope, &config.trusted_domains);
        let strategy = StrategyContext {
            cache_name: config.version.clone(),
            storage: self.storage.clone(),
            fetcher,
            fallback_document: config.fallback_url()?,
        };

        let worker = ServiceWorker::new(config.version.clone());
        let id = worker.id;
        let displaced = self.registration.write().await.start_install(worker);

        info!(version = %config.version, scope = %config.scope, "Registered service worker");
        if let Some(old) = displaced {
            self.emit_state(&old.version, old.id, ServiceWorkerState::Redundant);
        }
        self.emit_state(&config.version, id, ServiceWorkerState::Installing);

        Ok(ServiceWorkerScope {
            id,
            config: Arc::new(config),
            router,
            strategy,
            container: self.clone(),
        })
    }

    /// Version of the active worker, if any.
    pub async fn active_version(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .active_version()
            .map(str::to_string)
    }

    /// Open an application window. It is controlled by the active version,
    /// if there is one, like a page load under an active worker.
    pub async fn open_client(&self, url: Url) -> Client {
        let controller = self.active_version().await;
        let mut client = Client::window(url);
        client.controller = controller;
        self.clients.write().await.add(client.clone());
        client
    }

    pub async fn close_client(&self, id: &str) -> Option<Client> {
        self.clients.write().await.remove(id)
    }

    /// Every client, controlled or not, sorted by ID.
    pub async fn clients(&self) -> Vec<Client> {
        let options = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::All,
            controller: None,
        };
        self.clients
            .read()
            .await
            .match_all(&options)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Notifications currently shown.
    pub async fn notifications(&self) -> Vec<Notification> {
        self.notifications.read().await.clone()
    }

    /// Mark every worker redundant. Stores are left in place.
    pub async fn unregister(&self) {
        let mut registration = self.registration.write().await;
        let workers: Vec<(String, ServiceWorkerId)> =
            [&registration.installing, &registration.waiting, &registration.active]
                .into_iter()
                .flatten()
                .map(|w| (w.version.clone(), w.id))
                .collect();
        registration.unregister();
        drop(registration);

        for (version, id) in workers {
            self.emit_state(&version, id, ServiceWorkerState::Redundant);
        }
    }

    async fn show_notification(&self, notification: Notification) {
        info!(id = %notification.id, title = %notification.title, "Showing notification");
        self.emit(ServiceWorkerEvent::NotificationShown {
            id: notification.id.clone(),
            title: notification.title.clone(),
        });
        self.notifications.write().await.push(notification);
    }

    async fn close_notification(&self, id: &str) -> Result<Notification> {
        let mut notifications = self.notifications.write().await;
        let index = notifications
            .iter()
            .position(|n| n.id == id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("notification {id}")))?;
        let closed = notifications.remove(index);
        drop(notifications);

        self.emit(ServiceWorkerEvent::NotificationClosed { id: id.to_string() });
        Ok(closed)
    }

    /// Focus a window already showing `root`, or open one.
    async fn focus_or_open(&self, root: Url, version: String) -> Result<ClickOutcome> {
        let mut clients = self.clients.write().await;
        let options = ClientMatchOptions {
            include_uncontrolled: true,
            client_type: ClientType::Window,
            controller: None,
        };
        let existing = clients
            .match_all(&options)
            .into_iter()
            .find(|c| c.url == root)
            .map(|c| c.id.clone());

        match existing {
            Some(id) => {
                clients.focus(&id)?;
                debug!(client = %id, "Focused existing window");
                Ok(ClickOutcome::Focused(id))
            }
            None => {
                let client = clients.open_window(root, Some(version.clone()));
                drop(clients);
                debug!(client = %client.id, url = %client.url, "Opened new window");
                self.emit(ServiceWorkerEvent::ControllerChange {
                    client_id: client.id.clone(),
                    version,
                });
                Ok(ClickOutcome::Opened(client.id))
            }
        }
    }

    fn emit_state(&self, version: &str, worker_id: ServiceWorkerId, new_state: ServiceWorkerState) {
        debug!(version, ?new_state, "Worker state changed");
        self.emit(ServiceWorkerEvent::StateChange {
            version: version.to_string(),
            worker_id,
            new_state,
        });
    }

    fn emit(&self, event: ServiceWorkerEvent) {
        // Nobody listening is fine.
        let _ = self.event_tx.send(event);
    }
}

// ==================== Scope ====================

/// Event handlers of one registered version.
pub struct ServiceWorkerScope {
    id: ServiceWorkerId,
    config: Arc<WorkerConfig>,
    router: Router,
    strategy: StrategyContext,
    container: ServiceWorkerContainer,
}

impl ServiceWorkerScope {
    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn version(&self) -> &str {
        &self.config.version
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn container(&self) -> &ServiceWorkerContainer {
        &self.container
    }

    /// Current state of this version.
    pub async fn state(&self) -> ServiceWorkerState {
        self.container.registration.read().await.state_of(self.id)
    }

    // ---------- Lifecycle ----------

    /// Install event: populate store V.
    ///
    /// Every required URL must be fetched with a 2xx status and stored, or the
    /// install fails and this version becomes redundant. Optional URLs are
    /// then fetched best-effort, each bounded by the optional timeout. On
    /// success the worker waits for activation, or activates right away if
    /// the waiting gate is open.
    pub async fn install(&self) -> Result<()> {
        let state = self.state().await;
        if state != ServiceWorkerState::Installing {
            return Err(ServiceWorkerError::StateError(format!(
                "cannot install a worker in state {state:?}"
            )));
        }

        let version = self.version().to_string();
        let storage = &self.container.storage;
        let existed = storage.has(&version).await?;
        info!(version = %version, "Installing");

        let event = ExtendableEvent::new("install");
        let populated = self.populate(&event).await;
        let result = match populated {
            Ok(()) => event.settle().await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            error!(version = %version, error = %e, "Install failed");
            let failed = self
                .container
                .registration
                .write()
                .await
                .install_failed(self.id, &e.to_string());
            if !existed {
                if let Err(cleanup) = storage.delete(&version).await {
                    warn!(version = %version, error = %cleanup, "Could not remove partial store");
                }
            }
            if failed.is_some() {
                self.container
                    .emit_state(&version, self.id, ServiceWorkerState::Redundant);
            }
            return Err(match e {
                ServiceWorkerError::InstallFailed(_) => e,
                other => ServiceWorkerError::InstallFailed(other.to_string()),
            });
        }

        self.container
            .registration
            .write()
            .await
            .install_complete(self.id)?;
        self.container
            .emit_state(&version, self.id, ServiceWorkerState::Installed);
        info!(version = %version, "Installed");

        if self.config.skip_waiting {
            self.skip_waiting().await
        } else {
            self.try_activate().await
        }
    }

    /// Resolve the asset lists and hang the population on `event`.
    async fn populate(&self, event: &ExtendableEvent) -> Result<()> {
        let required = self
            .config
            .required_urls
            .iter()
            .map(|u| self.config.resolve(u))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let optional = self
            .config
            .optional_urls
            .iter()
            .map(|u| self.config.resolve(u))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let cache = self.container.storage.open(self.version()).await?;
        let fetcher = Arc::clone(&self.strategy.fetcher);
        let timeout = self.config.optional_timeout();

        event.wait_until(async move {
            cache.add_all(fetcher.as_ref(), &required).await?;
            debug!(count = required.len(), "Cached required assets");

            join_all(
                optional
                    .iter()
                    .map(|url| add_best_effort(&cache, fetcher.as_ref(), url, Some(timeout))),
            )
            .await;
            Ok(())
        });
        Ok(())
    }

    /// Skip the waiting gate and activate if already installed.
    pub async fn skip_waiting(&self) -> Result<()> {
        self.container
            .registration
            .write()
            .await
            .set_skip_waiting(self.id)?;
        debug!(version = %self.version(), "Skip waiting requested");
        self.try_activate().await
    }

    /// Activate when this version is waiting and the gate is open.
    async fn try_activate(&self) -> Result<()> {
        let open = {
            let registration = self.container.registration.read().await;
            let active_controls = match registration.active_version() {
                Some(active) => self.container.clients.read().await.controlled_by(active),
                None => false,
            };
            registration.can_activate(self.id, active_controls)
        };

        if open {
            self.activate().await
        } else {
            debug!(version = %self.version(), "Waiting for clients of the active version");
            Ok(())
        }
    }

    /// Activate event: delete every store other than this version's and
    /// claim all window clients.
    pub async fn activate(&self) -> Result<()> {
        let version = self.version().to_string();
        let replaced = self
            .container
            .registration
            .write()
            .await
            .begin_activate(self.id)?;

        if let Some(old) = replaced {
            self.container
                .emit_state(&old.version, old.id, ServiceWorkerState::Redundant);
        }
        self.container
            .emit_state(&version, self.id, ServiceWorkerState::Activating);
        info!(version = %version, "Activating");

        // Eviction is best-effort; the replaced worker is already redundant.
        let event = ExtendableEvent::new("activate");
        let names = match self.container.storage.keys().await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "Failed to list caches, skipping eviction");
                Vec::new()
            }
        };
        for name in names {
            if name == version {
                continue;
            }
            let storage = self.container.storage.clone();
            event.wait_until(async move {
                info!(cache = %name, "Deleting old cache");
                if let Err(e) = storage.delete(&name).await {
                    warn!(cache = %name, error = %e, "Failed to delete old cache");
                }
                Ok(())
            });
        }

        let container = self.container.clone();
        let claimant = version.clone();
        event.wait_until(async move {
            let changed = container.clients.write().await.claim(&claimant);
            for client_id in changed {
                container.emit(ServiceWorkerEvent::ControllerChange {
                    client_id,
                    version: claimant.clone(),
                });
            }
            Ok(())
        });

        if let Err(e) = event.settle().await {
            warn!(version = %version, error = %e, "Activate event work failed");
        }

        self.container
            .registration
            .write()
            .await
            .finish_activate(self.id)?;
        self.container
            .emit_state(&version, self.id, ServiceWorkerState::Activated);
        info!(version = %version, "Activated");
        Ok(())
    }

    // ---------- Fetch ----------

    /// Fetch event. `None` means the request is not intercepted and the
    /// caller should perform it itself.
    pub async fn handle_fetch(&self, request: &Request) -> Option<Response> {
        let event = ExtendableEvent::new("fetch");
        let response = self.respond(request, &event).await;
        if let Err(e) = event.settle().await {
            warn!(url = %request.url, error = %e, "Fetch event work failed");
        }
        response
    }

    /// Route a request, leaving its store writes on `event`.
    pub async fn respond(&self, request: &Request, event: &ExtendableEvent) -> Option<Response> {
        if self.state().await != ServiceWorkerState::Activated {
            return None;
        }

        match self.router.route(request) {
            Route::Passthrough => None,
            Route::CacheFirst => Some(cache_first(&self.strategy, request, event).await),
            Route::NetworkFirst => Some(network_first(&self.strategy, request, event).await),
        }
    }

    // ---------- Messages ----------

    /// Message event carrying a JSON control message.
    pub async fn handle_message(&self, raw: &str) -> Result<()> {
        let message = ControlMessage::parse(raw)?;
        let event = ExtendableEvent::new("message");

        match message {
            ControlMessage::SkipWaiting => self.skip_waiting().await?,
            ControlMessage::ClearCache => {
                for name in self.container.storage.keys().await? {
                    let storage = self.container.storage.clone();
                    event.wait_until(async move {
                        storage.delete(&name).await?;
                        Ok(())
                    });
                }
                info!("Clearing all caches");
            }
            ControlMessage::CacheUrls(urls) => {
                let urls: Vec<Url> = urls
                    .iter()
                    .filter_map(|raw| match self.config.resolve(raw) {
                        Ok(url) => Some(url),
                        Err(e) => {
                            warn!(url = %raw, error = %e, "Skipping unresolvable URL");
                            None
                        }
                    })
                    .collect();
                let cache = self.container.storage.cache(self.version());
                let fetcher = Arc::clone(&self.strategy.fetcher);
                event.wait_until(async move {
                    join_all(
                        urls.iter()
                            .map(|url| add_best_effort(&cache, fetcher.as_ref(), url, None)),
                    )
                    .await;
                    Ok(())
                });
            }
            ControlMessage::Unknown(kind) => {
                warn!(kind = %kind, "Ignoring unknown message type");
            }
        }

        event.settle().await
    }

    // ---------- Sync ----------

    /// Sync event for `tag`. Unknown tags are logged and succeed.
    pub async fn handle_sync(&self, tag: &str) -> Result<()> {
        let Some(request) = sync::sync_request(&self.config, tag) else {
            warn!(tag, "Unknown sync tag");
            return Ok(());
        };

        let event = ExtendableEvent::new("sync");
        event.wait_until(sync::dispatch(
            Arc::clone(&self.strategy.fetcher),
            tag.to_string(),
            request,
        ));
        event.settle().await
    }

    // ---------- Push ----------

    /// Push event: show a notification built from the payload.
    pub async fn handle_push(&self, data: Option<&[u8]>) -> Result<Notification> {
        let notification =
            Notification::from_push(PushPayload::parse(data), &self.config.notification);

        let event = ExtendableEvent::new("push");
        let container = self.container.clone();
        let shown = notification.clone();
        event.wait_until(async move {
            container.show_notification(shown).await;
            Ok(())
        });
        event.settle().await?;

        Ok(notification)
    }

    /// Notification click: close it, then focus or open the root window.
    pub async fn handle_notification_click(&self, notification_id: &str) -> Result<ClickOutcome> {
        self.container.close_notification(notification_id).await?;

        let event = ExtendableEvent::new("notificationclick");
        let (tx, rx) = oneshot::channel();
        let container = self.container.clone();
        let root = self.config.root_url();
        let version = self.version().to_string();
        event.wait_until(async move {
            let outcome = container.focus_or_open(root, version).await?;
            let _ = tx.send(outcome);
            Ok(())
        });
        event.settle().await?;

        rx.await.map_err(|_| {
            ServiceWorkerError::StateError("notification click produced no window".to_string())
        })
    }
}

/// Fetch and store one URL, logging instead of failing.
async fn add_best_effort(
    cache: &Cache,
    fetcher: &dyn Fetcher,
    url: &Url,
    timeout: Option<std::time::Duration>,
) {
    let result = match timeout {
        Some(limit) => match with_timeout(limit, || cache.add(fetcher, url)).await {
            Ok(inner) => inner,
            Err(e) => Err(ServiceWorkerError::NetworkError(e.to_string())),
        },
        None => cache.add(fetcher, url).await,
    };

    match result {
        Ok(()) => debug!(url = %url, "Cached optional asset"),
        Err(e) => warn!(url = %url, error = %e, "Failed to cache optional asset"),
    }
}
