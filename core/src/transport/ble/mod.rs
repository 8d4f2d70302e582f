/// BLE GATT transport
///
/// Carries opaque payloads between devices over two characteristics of one
/// GATT service: clients write requests, servers notify responses.
///
/// - **gatt**: wire UUIDs, platform handles, `Session`, `ScanResult`
/// - **platform**: traits the vendor BLE stack is consumed through
/// - **registry**: live client-role sessions and server-role clients
/// - **device_cache** / **pending**: per-scan-cycle bookkeeping
/// - **scanner**: multicast-driven scan state machine
/// - **connection**: connect, discover, register, replay
/// - **write_sync**: write-with-response with a bounded wait
/// - **client** / **server**: the two role runtimes
/// - **adapter**: `LeTransport`, the facade over both roles
///
/// The radio itself lives behind the platform traits, so everything here is
/// testable without hardware.

pub mod adapter;
pub mod client;
pub mod connection;
pub mod device_cache;
pub mod gatt;
pub mod pending;
pub mod platform;
pub mod registry;
pub mod scanner;
pub mod server;
pub mod write_sync;

pub use adapter::{LePlatforms, LeTransport};
pub use client::LeClient;
pub use connection::ConnectionOrchestrator;
pub use device_cache::DiscoveredDeviceCache;
pub use gatt::{
    normalize_address, CharacteristicHandle, ClientHandle, GattCharacteristic,
    GattServiceDefinition, ScanResult, ServiceHandle, Session, GATT_REQUEST_CHARACTERISTIC_UUID,
    GATT_RESPONSE_CHARACTERISTIC_UUID, GATT_SERVICE_UUID,
};
pub use pending::{PendingPayload, PendingSendQueue};
pub use platform::{
    AdapterControl, AdapterStateCallback, ConnectionStateCallback, GattClientPlatform,
    GattServerPlatform, NotifyCallback, PlatformError, ScanCallback, WriteCallback,
    WriteRequestCallback,
};
pub use registry::{ClientRegistry, RegistryError, SessionRegistry};
pub use scanner::{ScanController, ScanDecision, ScanState};
pub use server::LeServer;
pub use write_sync::WriteSynchronizer;
