/// Registries of live GATT links
///
/// `SessionRegistry` tracks client-role sessions (remote GATT servers we have
/// fully discovered); `ClientRegistry` tracks server-role peers (remote GATT
/// clients connected to us), by identity only. Both are keyed by normalized
/// address and keep insertion order for positional iteration.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::gatt::Session;
use super::platform::{GattClientPlatform, GattServerPlatform};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("Entry already registered for {0}")]
    Duplicate(String),
}

/// Map plus insertion-ordered key index
#[derive(Debug)]
struct OrderedMap<V> {
    entries: HashMap<String, V>,
    order: Vec<String>,
}

impl<V: Clone> OrderedMap<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, key: String, value: V) -> Result<(), RegistryError> {
        if self.entries.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        self.order.push(key.clone());
        self.entries.insert(key, value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Option<V> {
        let value = self.entries.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).cloned()
    }

    fn get_by_position(&self, index: usize) -> Option<V> {
        self.order
            .get(index)
            .and_then(|key| self.entries.get(key))
            .cloned()
    }

    fn values(&self) -> Vec<V> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .cloned()
            .collect()
    }

    fn drain(&mut self) -> Vec<V> {
        let drained = self.values();
        self.entries.clear();
        self.order.clear();
        drained
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Client-role sessions, one per remote address
pub struct SessionRegistry {
    sessions: Mutex<OrderedMap<Session>>,
    platform: Arc<dyn GattClientPlatform>,
}

impl SessionRegistry {
    pub fn new(platform: Arc<dyn GattClientPlatform>) -> Self {
        Self {
            sessions: Mutex::new(OrderedMap::new()),
            platform,
        }
    }

    /// Register a discovered session. Never overwrites an existing entry.
    pub fn insert(&self, session: Session) -> Result<(), RegistryError> {
        let address = session.remote_address.clone();
        self.sessions.lock().insert(address.clone(), session)?;
        debug!(address = %address, "Session registered");
        Ok(())
    }

    pub fn remove(&self, address: &str) -> Option<Session> {
        let removed = self.sessions.lock().remove(address);
        if removed.is_some() {
            debug!(address, "Session removed");
        }
        removed
    }

    pub fn find(&self, address: &str) -> Option<Session> {
        self.sessions.lock().get(address)
    }

    /// Session at `index` in registration order
    pub fn find_by_position(&self, index: usize) -> Option<Session> {
        self.sessions.lock().get_by_position(index)
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn addresses(&self) -> Vec<String> {
        self.sessions.lock().order.clone()
    }

    /// Drop every session, releasing its client handle and link first
    pub async fn clear(&self) {
        // Drain under the lock, release through the platform without it
        let drained = self.sessions.lock().drain();
        for session in drained {
            if let Err(e) = self.platform.destroy_client(session.client).await {
                warn!(address = %session.remote_address, "Failed to destroy GATT client: {}", e);
            }
            if let Err(e) = self.platform.disconnect(&session.remote_address).await {
                warn!(address = %session.remote_address, "Failed to disconnect: {}", e);
            }
        }
    }
}

/// Server-role peers connected to our GATT server
pub struct ClientRegistry {
    clients: Mutex<OrderedMap<()>>,
    platform: Arc<dyn GattServerPlatform>,
}

impl ClientRegistry {
    pub fn new(platform: Arc<dyn GattServerPlatform>) -> Self {
        Self {
            clients: Mutex::new(OrderedMap::new()),
            platform,
        }
    }

    pub fn insert(&self, address: &str) -> Result<(), RegistryError> {
        self.clients.lock().insert(address.to_string(), ())
    }

    pub fn remove(&self, address: &str) -> bool {
        self.clients.lock().remove(address).is_some()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.clients.lock().entries.contains_key(address)
    }

    pub fn count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.clients.lock().order.clone()
    }

    /// Disconnect and forget every connected client
    pub async fn disconnect_all(&self) {
        let addresses = {
            let mut clients = self.clients.lock();
            let addresses = clients.order.clone();
            clients.drain();
            addresses
        };
        for address in addresses {
            if let Err(e) = self.platform.disconnect_client(&address).await {
                warn!(address = %address, "Failed to disconnect GATT client: {}", e);
            }
        }
    }
}
