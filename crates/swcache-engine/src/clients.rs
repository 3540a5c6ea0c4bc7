//! Open client windows of the hosting application.
//!
//! The engine never owns windows. It enumerates them, asks the runtime to
//! focus or open one, and claims control over them at activation.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

use crate::{EngineError, Result};

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    All,
}

/// A client (open page) of the hosting application.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientWindow {
    /// Client ID.
    pub id: String,

    /// Current URL.
    pub url: Url,

    /// Client type.
    pub client_type: ClientType,

    /// Whether focused.
    pub focused: bool,

    /// Whether this engine generation controls it.
    pub controlled: bool,
}

impl ClientWindow {
    /// An uncontrolled, unfocused window.
    pub fn window(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            client_type: ClientType::Window,
            focused: false,
            controlled: false,
        }
    }

    /// Only window clients can take focus.
    pub fn can_focus(&self) -> bool {
        self.client_type == ClientType::Window
    }

    pub fn is_same_origin(&self, origin: &Url) -> bool {
        self.url.origin() == origin.origin()
    }
}

/// Options for [`ClientRegistry::match_all`].
#[derive(Debug, Clone, Default)]
pub struct ClientMatchOptions {
    pub include_uncontrolled: bool,
    pub client_type: ClientType,
}

impl ClientMatchOptions {
    /// Every window, controlled or not.
    pub fn all_windows() -> Self {
        Self {
            include_uncontrolled: true,
            client_type: ClientType::Window,
        }
    }
}

/// Runtime API over open clients.
#[async_trait]
pub trait ClientRegistry: Send + Sync {
    /// Matching clients, in the runtime's preferred order.
    async fn match_all(&self, options: &ClientMatchOptions) -> Result<Vec<ClientWindow>>;

    /// Focus a client, returning its updated state.
    async fn focus(&self, id: &str) -> Result<ClientWindow>;

    /// Open a new top-level window.
    async fn open_window(&self, url: &Url) -> Result<ClientWindow>;

    /// Take control of every client inside `scope`. Returns the IDs that
    /// were not already controlled.
    async fn claim(&self, scope: &Url) -> Result<Vec<String>>;
}

/// In-process client list, kept in insertion order.
#[derive(Debug, Default)]
pub struct WindowClients {
    clients: RwLock<Vec<ClientWindow>>,
}

impl WindowClients {
    /// Create new clients manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client.
    pub async fn add(&self, client: ClientWindow) {
        let mut clients = self.clients.write().await;
        clients.retain(|c| c.id != client.id);
        clients.push(client);
    }

    /// Get a client by ID.
    pub async fn get(&self, id: &str) -> Option<ClientWindow> {
        self.clients.read().await.iter().find(|c| c.id == id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }
}

fn next_client_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    format!("client-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
}

#[async_trait]
impl ClientRegistry for WindowClients {
    async fn match_all(&self, options: &ClientMatchOptions) -> Result<Vec<ClientWindow>> {
        Ok(self
            .clients
            .read()
            .await
            .iter()
            .filter(|c| options.include_uncontrolled || c.controlled)
            .filter(|c| match options.client_type {
                ClientType::All => true,
                t => c.client_type == t,
            })
            .cloned()
            .collect())
    }

    async fn focus(&self, id: &str) -> Result<ClientWindow> {
        let mut clients = self.clients.write().await;
        let target = clients
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| EngineError::Client(format!("no client with id {}", id)))?;
        if !target.can_focus() {
            return Err(EngineError::Client(
                "Can only focus window clients".to_string(),
            ));
        }

        let mut focused = None;
        for client in clients.iter_mut() {
            client.focused = client.id == id;
            if client.focused {
                focused = Some(client.clone());
            }
        }
        debug!(client = %id, "Client focused");
        focused.ok_or_else(|| EngineError::Client(format!("no client with id {}", id)))
    }

    async fn open_window(&self, url: &Url) -> Result<ClientWindow> {
        let client = ClientWindow {
            focused: true,
            ..ClientWindow::window(next_client_id(), url.clone())
        };

        let mut clients = self.clients.write().await;
        for other in clients.iter_mut() {
            other.focused = false;
        }
        clients.push(client.clone());
        debug!(client = %client.id, url = %url, "Window opened");
        Ok(client)
    }

    async fn claim(&self, scope: &Url) -> Result<Vec<String>> {
        let mut claimed = Vec::new();
        for client in self.clients.write().await.iter_mut() {
            let in_scope =
                client.is_same_origin(scope) && client.url.path().starts_with(scope.path());
            if in_scope && !client.controlled {
                client.controlled = true;
                claimed.push(client.id.clone());
            }
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_open_window_focuses_it() {
        let clients = WindowClients::new();
        clients
            .add(ClientWindow {
                focused: true,
                ..ClientWindow::window("a", url("https://kjfc.example/"))
            })
            .await;

        let opened = clients.open_window(&url("https://kjfc.example/games/42")).await.unwrap();
        assert!(opened.focused);
        assert_eq!(opened.client_type, ClientType::Window);
        assert!(!clients.get("a").await.unwrap().focused);
        assert_eq!(clients.len().await, 2);
    }

    #[tokio::test]
    async fn test_match_all_respects_controlled_filter() {
        let clients = WindowClients::new();
        clients.add(ClientWindow::window("a", url("https://kjfc.example/"))).await;
        clients
            .add(ClientWindow {
                controlled: true,
                ..ClientWindow::window("b", url("https://kjfc.example/table"))
            })
            .await;

        let controlled = clients.match_all(&ClientMatchOptions::default()).await.unwrap();
        assert_eq!(controlled.len(), 1);
        assert_eq!(controlled[0].id, "b");

        let all = clients.match_all(&ClientMatchOptions::all_windows()).await.unwrap();
        assert_eq!(
            all.iter().map(|c| c.id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[tokio::test]
    async fn test_focus_rejects_workers_and_unknown_ids() {
        let clients = WindowClients::new();
        clients
            .add(ClientWindow {
                client_type: ClientType::Worker,
                ..ClientWindow::window("w", url("https://kjfc.example/worker.js"))
            })
            .await;

        assert!(matches!(clients.focus("w").await, Err(EngineError::Client(_))));
        assert!(matches!(clients.focus("nope").await, Err(EngineError::Client(_))));
    }

    #[tokio::test]
    async fn test_claim_only_takes_same_origin_clients_once() {
        let clients = WindowClients::new();
        clients.add(ClientWindow::window("a", url("https://kjfc.example/"))).await;
        clients.add(ClientWindow::window("b", url("https://elsewhere.example/"))).await;

        let scope = url("https://kjfc.example/");
        assert_eq!(clients.claim(&scope).await.unwrap(), vec!["a".to_string()]);
        assert!(clients.claim(&scope).await.unwrap().is_empty());
        assert!(clients.get("a").await.unwrap().controlled);
        assert!(!clients.get("b").await.unwrap().controlled);
    }
}
