// OCF BLE adapter core
#![allow(clippy::empty_line_after_doc_comments)]
//
// GATT client and server roles that move opaque OCF payloads over the
// OIC transport service, on top of a callback-driven platform BLE stack.

pub mod config;
pub mod transport;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use config::{BleAdapterConfig, ConfigError, LeRole};
pub use transport::abstraction::{BleError, ConnectionStateHandler, LeEventListener};
pub use transport::ble::{
    AdapterControl, GattClientPlatform, GattServerPlatform, LeClient, LePlatforms, LeServer,
    LeTransport, PlatformError, ScanResult, ScanState, GATT_REQUEST_CHARACTERISTIC_UUID,
    GATT_RESPONSE_CHARACTERISTIC_UUID, GATT_SERVICE_UUID,
};
