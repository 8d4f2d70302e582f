//! In-memory BLE stack for tests
//!
//! `SimulatedPlatform` implements the client, server and adapter-control
//! platform traits against shared in-memory state. Tests script it from the
//! outside: register peers, deliver advertisements, fire connection and
//! write-request callbacks, and complete or reject characteristic writes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::transport::ble::gatt::{
    CharacteristicHandle, ClientHandle, GattCharacteristic, GattServiceDefinition, ScanResult,
    ServiceHandle, GATT_REQUEST_CHARACTERISTIC_UUID, GATT_RESPONSE_CHARACTERISTIC_UUID,
    GATT_SERVICE_UUID,
};
use crate::transport::ble::platform::{
    AdapterControl, AdapterStateCallback, ConnectionStateCallback, GattClientPlatform,
    GattServerPlatform, NotifyCallback, PlatformError, ScanCallback, WriteCallback,
    WriteRequestCallback,
};

/// How `write_characteristic` completes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteMode {
    /// Completion callback fires successfully before the call returns
    #[default]
    AutoComplete,
    /// Completion is held until `complete_write`
    Manual,
    /// The write request itself is refused
    Reject,
}

/// How `connect` behaves for a known peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectMode {
    /// Connection-state callback fires (connected) before the call returns
    #[default]
    Immediate,
    /// Request accepted; the test fires the callback itself
    Manual,
    /// Request refused
    Reject,
}

/// GATT database exposed by a simulated remote server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerProfile {
    Complete,
    MissingService,
    MissingRequestCharacteristic,
    MissingResponseCharacteristic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub characteristic: CharacteristicHandle,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRecord {
    pub address: String,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

type SharedScan = Arc<dyn Fn(ScanResult) + Send + Sync>;
type SharedNotify = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;
type SharedConnection = Arc<dyn Fn(String, bool) + Send + Sync>;
type SharedWriteRequest = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;
type SharedAdapterState = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Default)]
struct ClientSide {
    write_mode: WriteMode,
    connect_mode: ConnectMode,
    writes: Vec<WriteRecord>,
    staged: HashMap<CharacteristicHandle, Vec<u8>>,
    pending_writes: Vec<Option<(CharacteristicHandle, WriteCallback)>>,
    scan_callback: Option<SharedScan>,
    scanning: bool,
    scan_stop_delay: Duration,
    scan_start_calls: usize,
    scan_stop_calls: usize,
    peers: HashMap<String, PeerProfile>,
    profile_connected: HashSet<String>,
    connect_calls: Vec<String>,
    disconnect_calls: Vec<String>,
    next_handle: u64,
    clients: HashMap<ClientHandle, String>,
    destroyed_clients: Vec<ClientHandle>,
    services: HashMap<ServiceHandle, String>,
    characteristics: HashMap<CharacteristicHandle, (String, GattCharacteristic)>,
    subscriptions: HashMap<CharacteristicHandle, SharedNotify>,
    connection_callback: Option<SharedConnection>,
}

impl ClientSide {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

#[derive(Default)]
struct ServerSide {
    definition: Option<GattServiceDefinition>,
    running: bool,
    advertising: bool,
    advertising_starts: usize,
    notifications: Vec<NotificationRecord>,
    failing_notify: HashSet<String>,
    disconnect_calls: Vec<String>,
    connection_callback: Option<SharedConnection>,
    write_request_callback: Option<SharedWriteRequest>,
}

struct AdapterSide {
    enabled: bool,
    local_address: String,
    callback: Option<SharedAdapterState>,
}

/// Scriptable in-memory implementation of every platform trait
pub struct SimulatedPlatform {
    client: Mutex<ClientSide>,
    server: Mutex<ServerSide>,
    adapter: Mutex<AdapterSide>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            client: Mutex::new(ClientSide::default()),
            server: Mutex::new(ServerSide::default()),
            adapter: Mutex::new(AdapterSide {
                enabled: true,
                local_address: "00:11:22:33:44:55".to_string(),
                callback: None,
            }),
        }
    }

    // ========================================================================
    // Client side scripting
    // ========================================================================

    /// Make a remote GATT server reachable at `address`
    pub fn add_peer(&self, address: &str, profile: PeerProfile) {
        self.client.lock().peers.insert(address.to_string(), profile);
    }

    pub fn set_profile_connected(&self, address: &str, connected: bool) {
        let mut client = self.client.lock();
        if connected {
            client.profile_connected.insert(address.to_string());
        } else {
            client.profile_connected.remove(address);
        }
    }

    pub fn set_write_mode(&self, mode: WriteMode) {
        self.client.lock().write_mode = mode;
    }

    pub fn set_connect_mode(&self, mode: ConnectMode) {
        self.client.lock().connect_mode = mode;
    }

    /// Make `scan_stop` take `delay` before the scan actually stops
    pub fn set_scan_stop_delay(&self, delay: Duration) {
        self.client.lock().scan_stop_delay = delay;
    }

    /// Deliver an advertisement to the running scan. Returns `false` when no
    /// scan is running.
    pub fn advertise(&self, result: ScanResult) -> bool {
        let callback = {
            let client = self.client.lock();
            if !client.scanning {
                return false;
            }
            client.scan_callback.clone()
        };
        match callback {
            Some(callback) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    /// Fire the client-side connection-state callback
    pub fn emit_connection_state(&self, address: &str, connected: bool) -> bool {
        let callback = {
            let mut client = self.client.lock();
            if connected {
                client.profile_connected.insert(address.to_string());
            } else {
                client.profile_connected.remove(address);
            }
            client.connection_callback.clone()
        };
        match callback {
            Some(callback) => {
                callback(address.to_string(), connected);
                true
            }
            None => false,
        }
    }

    /// Send a notification from the peer's response characteristic
    pub fn notify_from_peer(&self, address: &str, value: &[u8]) -> bool {
        let callback = {
            let client = self.client.lock();
            client
                .characteristics
                .iter()
                .filter(|(_, (owner, kind))| {
                    owner == address && *kind == GattCharacteristic::Response
                })
                .find_map(|(handle, _)| client.subscriptions.get(handle).cloned())
        };
        match callback {
            Some(callback) => {
                callback(address.to_string(), value.to_vec());
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, characteristic: CharacteristicHandle) -> bool {
        self.client.lock().subscriptions.contains_key(&characteristic)
    }

    pub fn is_scanning(&self) -> bool {
        self.client.lock().scanning
    }

    pub fn scan_start_calls(&self) -> usize {
        self.client.lock().scan_start_calls
    }

    pub fn scan_stop_calls(&self) -> usize {
        self.client.lock().scan_stop_calls
    }

    pub fn connect_calls(&self) -> Vec<String> {
        self.client.lock().connect_calls.clone()
    }

    pub fn disconnect_calls(&self) -> Vec<String> {
        self.client.lock().disconnect_calls.clone()
    }

    pub fn destroyed_clients(&self) -> Vec<ClientHandle> {
        self.client.lock().destroyed_clients.clone()
    }

    /// Every write issued so far, in order
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.client.lock().writes.clone()
    }

    /// Writes addressed to the request characteristic of `address`
    pub fn writes_to(&self, address: &str) -> Vec<Vec<u8>> {
        let client = self.client.lock();
        client
            .writes
            .iter()
            .filter(|w| {
                client
                    .characteristics
                    .get(&w.characteristic)
                    .map(|(owner, _)| owner == address)
                    .unwrap_or(false)
            })
            .map(|w| w.value.clone())
            .collect()
    }

    /// Wait until at least `count` manual writes have been issued
    pub async fn wait_for_pending_writes(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let issued = self.client.lock().pending_writes.len();
            if issued >= count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {} pending writes",
                count
            );
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Index of the first uncompleted manual write on `characteristic`
    pub fn pending_write_index(&self, characteristic: CharacteristicHandle) -> Option<usize> {
        self.client
            .lock()
            .pending_writes
            .iter()
            .position(|entry| matches!(entry, Some((handle, _)) if *handle == characteristic))
    }

    /// Complete the manual write at `index`. Returns `false` if it was
    /// already completed or never issued.
    pub fn complete_write(&self, index: usize, result: Result<(), PlatformError>) -> bool {
        let entry = {
            let mut client = self.client.lock();
            client.pending_writes.get_mut(index).and_then(Option::take)
        };
        match entry {
            Some((_, callback)) => {
                callback(result);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Server side scripting
    // ========================================================================

    /// A remote GATT client connects to (or leaves) our server
    pub fn emit_client_connection(&self, address: &str, connected: bool) -> bool {
        let callback = self.server.lock().connection_callback.clone();
        match callback {
            Some(callback) => {
                callback(address.to_string(), connected);
                true
            }
            None => false,
        }
    }

    /// A remote GATT client writes our request characteristic
    pub fn emit_write_request(&self, address: &str, value: &[u8]) -> bool {
        let callback = self.server.lock().write_request_callback.clone();
        match callback {
            Some(callback) => {
                callback(address.to_string(), value.to_vec());
                true
            }
            None => false,
        }
    }

    pub fn fail_notify_for(&self, address: &str) {
        self.server
            .lock()
            .failing_notify
            .insert(address.to_string());
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.server.lock().notifications.clone()
    }

    pub fn server_definition(&self) -> Option<GattServiceDefinition> {
        self.server.lock().definition.clone()
    }

    pub fn is_server_running(&self) -> bool {
        self.server.lock().running
    }

    pub fn is_advertising(&self) -> bool {
        self.server.lock().advertising
    }

    pub fn advertising_starts(&self) -> usize {
        self.server.lock().advertising_starts
    }

    pub fn server_disconnect_calls(&self) -> Vec<String> {
        self.server.lock().disconnect_calls.clone()
    }

    // ========================================================================
    // Adapter scripting
    // ========================================================================

    /// Change the enabled flag without notifying anyone
    pub fn set_enabled(&self, enabled: bool) {
        self.adapter.lock().enabled = enabled;
    }

    /// Change the enabled flag and fire the adapter-state callback
    pub fn emit_adapter_state(&self, enabled: bool) -> bool {
        let callback = {
            let mut adapter = self.adapter.lock();
            adapter.enabled = enabled;
            adapter.callback.clone()
        };
        match callback {
            Some(callback) => {
                callback(enabled);
                true
            }
            None => false,
        }
    }

    pub fn set_local_address(&self, address: &str) {
        self.adapter.lock().local_address = address.to_string();
    }
}

#[async_trait]
impl GattClientPlatform for SimulatedPlatform {
    async fn scan_start(&self, on_result: ScanCallback) -> Result<(), PlatformError> {
        let mut client = self.client.lock();
        client.scan_start_calls += 1;
        client.scanning = true;
        client.scan_callback = Some(Arc::from(on_result));
        Ok(())
    }

    async fn scan_stop(&self) -> Result<(), PlatformError> {
        let delay = self.client.lock().scan_stop_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut client = self.client.lock();
        client.scan_stop_calls += 1;
        client.scanning = false;
        client.scan_callback = None;
        Ok(())
    }

    async fn connect(&self, address: &str, _auto_connect: bool) -> Result<(), PlatformError> {
        let callback = {
            let mut client = self.client.lock();
            client.connect_calls.push(address.to_string());
            if !client.peers.contains_key(address) {
                return Err(PlatformError::NotFound(address.to_string()));
            }
            match client.connect_mode {
                ConnectMode::Reject => {
                    return Err(PlatformError::Rejected("connect refused".to_string()))
                }
                ConnectMode::Manual => None,
                ConnectMode::Immediate => {
                    client.profile_connected.insert(address.to_string());
                    client.connection_callback.clone()
                }
            }
        };
        if let Some(callback) = callback {
            callback(address.to_string(), true);
        }
        Ok(())
    }

    async fn disconnect(&self, address: &str) -> Result<(), PlatformError> {
        let mut client = self.client.lock();
        client.disconnect_calls.push(address.to_string());
        client.profile_connected.remove(address);
        Ok(())
    }

    async fn is_profile_connected(&self, address: &str) -> Result<bool, PlatformError> {
        Ok(self.client.lock().profile_connected.contains(address))
    }

    async fn create_client(&self, address: &str) -> Result<ClientHandle, PlatformError> {
        let mut client = self.client.lock();
        if !client.peers.contains_key(address) {
            return Err(PlatformError::NotFound(address.to_string()));
        }
        let handle = ClientHandle(client.mint());
        client.clients.insert(handle, address.to_string());
        Ok(handle)
    }

    async fn destroy_client(&self, handle: ClientHandle) -> Result<(), PlatformError> {
        let mut client = self.client.lock();
        client.clients.remove(&handle);
        client.destroyed_clients.push(handle);
        Ok(())
    }

    async fn discover_service(
        &self,
        handle: ClientHandle,
        uuid: &Uuid,
    ) -> Result<ServiceHandle, PlatformError> {
        let mut client = self.client.lock();
        let address = client
            .clients
            .get(&handle)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(handle.to_string()))?;
        let profile = client.peers.get(&address).copied();
        if *uuid != GATT_SERVICE_UUID || profile == Some(PeerProfile::MissingService) {
            return Err(PlatformError::NotFound(format!("service {}", uuid)));
        }
        let service = ServiceHandle(client.mint());
        client.services.insert(service, address);
        Ok(service)
    }

    async fn discover_characteristic(
        &self,
        service: ServiceHandle,
        uuid: &Uuid,
    ) -> Result<CharacteristicHandle, PlatformError> {
        let mut client = self.client.lock();
        let address = client
            .services
            .get(&service)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(service.to_string()))?;
        let profile = client.peers.get(&address).copied();
        let kind = if *uuid == GATT_REQUEST_CHARACTERISTIC_UUID
            && profile != Some(PeerProfile::MissingRequestCharacteristic)
        {
            GattCharacteristic::Request
        } else if *uuid == GATT_RESPONSE_CHARACTERISTIC_UUID
            && profile != Some(PeerProfile::MissingResponseCharacteristic)
        {
            GattCharacteristic::Response
        } else {
            return Err(PlatformError::NotFound(format!("characteristic {}", uuid)));
        };
        let handle = CharacteristicHandle(client.mint());
        client.characteristics.insert(handle, (address, kind));
        Ok(handle)
    }

    async fn set_characteristic_value(
        &self,
        characteristic: CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        self.client
            .lock()
            .staged
            .insert(characteristic, value.to_vec());
        Ok(())
    }

    async fn write_characteristic(
        &self,
        characteristic: CharacteristicHandle,
        on_complete: WriteCallback,
    ) -> Result<(), PlatformError> {
        let immediate = {
            let mut client = self.client.lock();
            if client.write_mode == WriteMode::Reject {
                return Err(PlatformError::Rejected("write refused".to_string()));
            }
            let value = client
                .staged
                .get(&characteristic)
                .cloned()
                .unwrap_or_default();
            client.writes.push(WriteRecord {
                characteristic,
                value,
            });
            match client.write_mode {
                WriteMode::Manual => {
                    client
                        .pending_writes
                        .push(Some((characteristic, on_complete)));
                    None
                }
                _ => Some(on_complete),
            }
        };
        if let Some(on_complete) = immediate {
            on_complete(Ok(()));
        }
        Ok(())
    }

    async fn subscribe_notifications(
        &self,
        characteristic: CharacteristicHandle,
        on_notify: NotifyCallback,
    ) -> Result<(), PlatformError> {
        self.client
            .lock()
            .subscriptions
            .insert(characteristic, Arc::from(on_notify));
        Ok(())
    }

    async fn unsubscribe_notifications(
        &self,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError> {
        self.client.lock().subscriptions.remove(&characteristic);
        Ok(())
    }

    fn set_on_connection_state_changed(&self, callback: ConnectionStateCallback) {
        self.client.lock().connection_callback = Some(Arc::from(callback));
    }
}

#[async_trait]
impl GattServerPlatform for SimulatedPlatform {
    async fn start_server(&self, definition: &GattServiceDefinition) -> Result<(), PlatformError> {
        let mut server = self.server.lock();
        server.definition = Some(definition.clone());
        server.running = true;
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), PlatformError> {
        self.server.lock().running = false;
        Ok(())
    }

    async fn start_advertising(&self) -> Result<(), PlatformError> {
        let mut server = self.server.lock();
        server.advertising = true;
        server.advertising_starts += 1;
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), PlatformError> {
        self.server.lock().advertising = false;
        Ok(())
    }

    async fn notify(
        &self,
        address: &str,
        characteristic: &Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError> {
        let mut server = self.server.lock();
        if server.failing_notify.contains(address) {
            return Err(PlatformError::Io(format!("notify to {} failed", address)));
        }
        server.notifications.push(NotificationRecord {
            address: address.to_string(),
            characteristic: *characteristic,
            value: value.to_vec(),
        });
        Ok(())
    }

    async fn disconnect_client(&self, address: &str) -> Result<(), PlatformError> {
        self.server
            .lock()
            .disconnect_calls
            .push(address.to_string());
        Ok(())
    }

    fn set_on_client_connection_state_changed(&self, callback: ConnectionStateCallback) {
        self.server.lock().connection_callback = Some(Arc::from(callback));
    }

    fn set_on_write_requested(&self, callback: WriteRequestCallback) {
        self.server.lock().write_request_callback = Some(Arc::from(callback));
    }
}

#[async_trait]
impl AdapterControl for SimulatedPlatform {
    async fn is_enabled(&self) -> Result<bool, PlatformError> {
        Ok(self.adapter.lock().enabled)
    }

    async fn local_address(&self) -> Result<String, PlatformError> {
        Ok(self.adapter.lock().local_address.clone())
    }

    fn set_on_adapter_state_changed(&self, callback: AdapterStateCallback) {
        self.adapter.lock().callback = Some(Arc::from(callback));
    }
}
