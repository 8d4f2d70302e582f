/// Platform BLE stack abstraction
///
/// The vendor radio stack is consumed through these traits. Implementers wrap
/// the actual platform calls (BlueZ, CoreBluetooth, an RTOS BLE host, ...).
/// Asynchronous completions are delivered by invoking the callbacks handed
/// in here, typically from the platform's own event thread; the adapter only
/// enqueues work from inside them and never blocks that thread.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use super::gatt::{
    CharacteristicHandle, ClientHandle, GattServiceDefinition, ScanResult, ServiceHandle,
};
use crate::transport::abstraction::BleError;

/// Errors reported by a platform binding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlatformError {
    #[error("Operation not supported by this platform")]
    NotSupported,
    #[error("Bluetooth adapter is not enabled")]
    NotEnabled,
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Rejected by stack: {0}")]
    Rejected(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<PlatformError> for BleError {
    fn from(err: PlatformError) -> Self {
        match err {
            PlatformError::NotSupported => BleError::NotSupported(err.to_string()),
            other => BleError::Failed(other.to_string()),
        }
    }
}

/// Delivered once per advertisement while a scan is running
pub type ScanCallback = Box<dyn Fn(ScanResult) + Send + Sync>;

/// Delivered exactly once when a characteristic write completes
pub type WriteCallback = Box<dyn FnOnce(Result<(), PlatformError>) + Send>;

/// Delivered per notification: `(remote_address, value)`
pub type NotifyCallback = Box<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Delivered on link changes: `(remote_address, connected)`
pub type ConnectionStateCallback = Box<dyn Fn(String, bool) + Send + Sync>;

/// Delivered when a GATT client writes our request characteristic: `(remote_address, value)`
pub type WriteRequestCallback = Box<dyn Fn(String, Vec<u8>) + Send + Sync>;

/// Delivered when the local adapter is switched on (`true`) or off (`false`)
pub type AdapterStateCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Central/GATT-client half of the platform stack
#[async_trait]
pub trait GattClientPlatform: Send + Sync {
    /// Start LE scanning, delivering every advertisement to `on_result`
    async fn scan_start(&self, on_result: ScanCallback) -> Result<(), PlatformError>;

    /// Stop LE scanning
    async fn scan_stop(&self) -> Result<(), PlatformError>;

    /// Request a GATT connection. Completion arrives through the
    /// connection-state callback.
    async fn connect(&self, address: &str, auto_connect: bool) -> Result<(), PlatformError>;

    /// Tear down the GATT connection to `address`
    async fn disconnect(&self, address: &str) -> Result<(), PlatformError>;

    /// Whether the GATT profile is already connected to `address`
    async fn is_profile_connected(&self, address: &str) -> Result<bool, PlatformError>;

    /// Create a GATT client instance bound to `address`
    async fn create_client(&self, address: &str) -> Result<ClientHandle, PlatformError>;

    /// Release a GATT client instance
    async fn destroy_client(&self, client: ClientHandle) -> Result<(), PlatformError>;

    /// Resolve a remote service by UUID
    async fn discover_service(
        &self,
        client: ClientHandle,
        uuid: &Uuid,
    ) -> Result<ServiceHandle, PlatformError>;

    /// Resolve a characteristic under a service by UUID
    async fn discover_characteristic(
        &self,
        service: ServiceHandle,
        uuid: &Uuid,
    ) -> Result<CharacteristicHandle, PlatformError>;

    /// Stage the value for the next write on `characteristic`
    async fn set_characteristic_value(
        &self,
        characteristic: CharacteristicHandle,
        value: &[u8],
    ) -> Result<(), PlatformError>;

    /// Issue a write-with-response of the staged value; `on_complete`
    /// fires once the peer acknowledges or the stack gives up
    async fn write_characteristic(
        &self,
        characteristic: CharacteristicHandle,
        on_complete: WriteCallback,
    ) -> Result<(), PlatformError>;

    /// Enable notifications on `characteristic`
    async fn subscribe_notifications(
        &self,
        characteristic: CharacteristicHandle,
        on_notify: NotifyCallback,
    ) -> Result<(), PlatformError>;

    /// Disable notifications on `characteristic`
    async fn unsubscribe_notifications(
        &self,
        characteristic: CharacteristicHandle,
    ) -> Result<(), PlatformError>;

    /// Register the connection state callback (replaces any previous one)
    fn set_on_connection_state_changed(&self, callback: ConnectionStateCallback);
}

/// Peripheral/GATT-server half of the platform stack
#[async_trait]
pub trait GattServerPlatform: Send + Sync {
    /// Register the transport service and its characteristics, then start serving
    async fn start_server(&self, definition: &GattServiceDefinition) -> Result<(), PlatformError>;

    /// Unregister the service and stop serving
    async fn stop_server(&self) -> Result<(), PlatformError>;

    async fn start_advertising(&self) -> Result<(), PlatformError>;

    async fn stop_advertising(&self) -> Result<(), PlatformError>;

    /// Send a notification of `characteristic` with `value` to one connected client
    async fn notify(
        &self,
        address: &str,
        characteristic: &Uuid,
        value: &[u8],
    ) -> Result<(), PlatformError>;

    /// Drop the link to a connected client
    async fn disconnect_client(&self, address: &str) -> Result<(), PlatformError>;

    fn set_on_client_connection_state_changed(&self, callback: ConnectionStateCallback);

    fn set_on_write_requested(&self, callback: WriteRequestCallback);
}

/// Local adapter control shared by both roles
#[async_trait]
pub trait AdapterControl: Send + Sync {
    async fn is_enabled(&self) -> Result<bool, PlatformError>;

    /// Local Bluetooth address of this device
    async fn local_address(&self) -> Result<String, PlatformError>;

    fn set_on_adapter_state_changed(&self, callback: AdapterStateCallback);
}
