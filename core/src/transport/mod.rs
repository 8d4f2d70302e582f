// Transport module: BLE GATT connectivity adapter

pub mod abstraction;
pub mod ble;

pub use abstraction::{BleError, ConnectionStateHandler, LeEventListener, LinkRole, ListenerSlot};
pub use ble::{LeClient, LePlatforms, LeServer, LeTransport};
