//! Pages the controller may control.

use hashbrown::HashMap;
use url::Url;

use crate::registration::ServiceWorkerId;

/// Client type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientType {
    #[default]
    Window,
    Worker,
    SharedWorker,
}

/// A page or worker that issues requests.
#[derive(Debug, Clone)]
pub struct Client {
    pub id: String,
    pub url: Url,
    pub client_type: ClientType,
    /// Controller currently serving this client.
    pub controller: Option<ServiceWorkerId>,
}

impl Client {
    /// A window client with no controller.
    pub fn window(id: impl Into<String>, url: Url) -> Self {
        Self {
            id: id.into(),
            url,
            client_type: ClientType::Window,
            controller: None,
        }
    }
}

/// Clients API.
#[derive(Debug, Default)]
pub struct Clients {
    clients: HashMap<String, Client>,
}

impl Clients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    /// Number of clients with any controller.
    pub fn controlled_count(&self) -> usize {
        self.clients
            .values()
            .filter(|c| c.controller.is_some())
            .count()
    }

    /// Take control of every client inside `scope`.
    ///
    /// Returns the ids whose controller changed.
    pub fn claim(&mut self, controller: ServiceWorkerId, scope: &Url) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.url.as_str().starts_with(scope.as_str()))
            .filter(|c| c.controller != Some(controller))
            .map(|c| {
                c.controller = Some(controller);
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }

    /// Detach every client from `controller`.
    pub fn release(&mut self, controller: ServiceWorkerId) {
        for client in self.clients.values_mut() {
            if client.controller == Some(controller) {
                client.controller = None;
            }
        }
    }
}
