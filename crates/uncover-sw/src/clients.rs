//! Clients API: the application windows a worker can control.

use hashbrown::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use url::Url;

use crate::{Result, ServiceWorkerError};

/// A client (open application instance).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client ID.
    pub id: String,

    /// Client URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Version of the worker controlling this client, if any.
    pub controller: Option<String>,
}

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

impl Client {
    /// A window client at `url`, not controlled by any worker.
    pub fn window(url: Url) -> Self {
        Self {
            id: format!("client-{}", client_id()),
            url,
            client_type: ClientType::Window,
            focused: false,
            controller: None,
        }
    }

    /// Focus the client.
    pub fn focus(&mut self) -> Result<()> {
        if self.client_type != ClientType::Window {
            return Err(ServiceWorkerError::StateError(
                "Can only focus window clients".to_string(),
            ));
        }
        self.focused = true;
        Ok(())
    }
}

/// Options for `Clients::match_all`.
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    /// Also return clients not controlled by `controller`.
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
    /// Version whose controlled clients are wanted.
    pub controller: Option<String>,
}

/// Clients registry shared by all versions on an origin.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a client by ID.
    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    /// Match clients, sorted by ID.
    pub fn match_all(&self, options: &ClientMatchOptions) -> Vec<&Client> {
        let mut matched: Vec<&Client> = self
            .clients
            .values()
            .filter(|c| {
                options.include_uncontrolled
                    || options.controller.is_none()
                    || c.controller == options.controller
            })
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Whether any client is controlled by `version`.
    pub fn controlled_by(&self, version: &str) -> bool {
        self.clients
            .values()
            .any(|c| c.controller.as_deref() == Some(version))
    }

    /// Open a focused window controlled by `controller`.
    pub fn open_window(&mut self, url: Url, controller: Option<String>) -> Client {
        let client = Client {
            focused: true,
            controller,
            ..Client::window(url)
        };
        self.clients.insert(client.id.clone(), client.clone());
        client
    }

    /// Focus a client by ID.
    pub fn focus(&mut self, id: &str) -> Result<Client> {
        let client = self
            .clients
            .get_mut(id)
            .ok_or_else(|| ServiceWorkerError::NotFound(format!("client {id}")))?;
        client.focus()?;
        Ok(client.clone())
    }

    /// Make `version` the controller of every window client.
    ///
    /// Returns the IDs of clients whose controller changed.
    pub fn claim(&mut self, version: &str) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.client_type == ClientType::Window)
            .filter(|c| c.controller.as_deref() != Some(version))
            .map(|c| {
                c.controller = Some(version.to_string());
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Add a client.
    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    /// Remove a client.
    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

fn client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    format!("{:016x}-{:04x}", nanos, COUNTER.fetch_add(1, Ordering::Relaxed))
}
