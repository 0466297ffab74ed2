//! Open pages served by the worker.

use hashbrown::HashMap;
use url::Url;

/// A client (open page or view).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    pub id: String,
    pub url: Url,
    /// Cache version of the worker controlling this client, if any.
    pub controller: Option<String>,
}

/// Clients known to the host.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, Client>,
    next_id: u64,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page that is not controlled yet.
    pub fn open(&mut self, url: Url) -> Client {
        self.next_id += 1;
        let client = Client {
            id: format!("client-{}", self.next_id),
            url,
            controller: None,
        };
        self.add(client.clone());
        client
    }

    pub fn add(&mut self, client: Client) {
        self.clients.insert(client.id.clone(), client);
    }

    pub fn remove(&mut self, id: &str) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn get(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn controlled_by(&self, version: &str) -> Vec<&Client> {
        self.clients
            .values()
            .filter(|c| c.controller.as_deref() == Some(version))
            .collect()
    }

    /// Take control of every client.
    ///
    /// Returns the ids whose controller changed, sorted.
    pub fn claim(&mut self, version: &str) -> Vec<String> {
        let mut changed: Vec<String> = self
            .clients
            .values_mut()
            .filter(|c| c.controller.as_deref() != Some(version))
            .map(|c| {
                c.controller = Some(version.to_string());
                c.id.clone()
            })
            .collect();
        changed.sort();
        changed
    }
}
