/// GATT service definition for the OIC BLE transport
///
/// This module holds the wire contract shared by client and server roles (the
/// service and characteristic UUIDs), the opaque platform handles, and the
/// `Session` record describing one fully discovered GATT connection.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::transport::abstraction::BleError;

/// OIC GATT transport service UUID
pub const GATT_SERVICE_UUID: Uuid = Uuid::from_u128(0xADE3D529_C784_4F63_A987_EB69F70EE816);

/// Request characteristic: client → server writes
pub const GATT_REQUEST_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xAD7B334F_4637_4B86_90B6_9D787F03D218);

/// Response characteristic: server → client notifications
pub const GATT_RESPONSE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0xE9241982_4580_42C4_8831_95048216B256);

/// GATT characteristic roles in the transport service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GattCharacteristic {
    /// Written by the client to carry requests
    Request,
    /// Notified by the server to carry responses
    Response,
}

impl GattCharacteristic {
    /// Well-known UUID of this characteristic
    pub fn uuid(&self) -> Uuid {
        match self {
            GattCharacteristic::Request => GATT_REQUEST_CHARACTERISTIC_UUID,
            GattCharacteristic::Response => GATT_RESPONSE_CHARACTERISTIC_UUID,
        }
    }
}

/// Service layout registered by the server role and resolved by the client role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattServiceDefinition {
    pub service: Uuid,
    pub request_characteristic: Uuid,
    pub response_characteristic: Uuid,
}

impl Default for GattServiceDefinition {
    fn default() -> Self {
        Self {
            service: GATT_SERVICE_UUID,
            request_characteristic: GATT_REQUEST_CHARACTERISTIC_UUID,
            response_characteristic: GATT_RESPONSE_CHARACTERISTIC_UUID,
        }
    }
}

macro_rules! platform_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

platform_handle!(
    /// Platform GATT client instance bound to one remote address
    ClientHandle
);
platform_handle!(
    /// Remote service resolved under a client handle
    ServiceHandle
);
platform_handle!(
    /// Remote characteristic resolved under a service handle
    CharacteristicHandle
);

/// An established client-role GATT connection with its resolved handles
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Normalized remote address (unique key)
    pub remote_address: String,
    pub client: ClientHandle,
    pub service: ServiceHandle,
    /// Characteristic we write requests to
    pub request_characteristic: CharacteristicHandle,
    /// Characteristic the server notifies responses on
    pub response_characteristic: CharacteristicHandle,
}

/// One advertisement seen during a scan cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Remote device address as reported by the platform
    pub address: String,
    /// Service UUIDs carried in the advertisement
    pub service_uuids: Vec<Uuid>,
    /// RSSI in dBm, when reported
    pub rssi: Option<i16>,
    /// Advertised local name, when present
    pub local_name: Option<String>,
}

impl ScanResult {
    pub fn new(address: impl Into<String>, service_uuids: Vec<Uuid>) -> Self {
        Self {
            address: address.into(),
            service_uuids,
            rssi: None,
            local_name: None,
        }
    }

    pub fn advertises(&self, service: &Uuid) -> bool {
        self.service_uuids.iter().any(|uuid| uuid == service)
    }
}

/// Normalize a remote address so lookups are case-insensitive.
///
/// Returns `InvalidParam` for an empty address.
pub fn normalize_address(address: &str) -> Result<String, BleError> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(BleError::InvalidParam("remote address is empty".to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_uuids_match_oic_contract() {
        assert_eq!(
            GATT_SERVICE_UUID.to_string(),
            "ade3d529-c784-4f63-a987-eb69f70ee816"
        );
        assert_eq!(
            GattCharacteristic::Request.uuid().to_string(),
            "ad7b334f-4637-4b86-90b6-9d787f03d218"
        );
        assert_eq!(
            GattCharacteristic::Response.uuid().to_string(),
            "e9241982-4580-42c4-8831-95048216b256"
        );
    }

    #[test]
    fn test_default_service_definition() {
        let def = GattServiceDefinition::default();
        assert_eq!(def.service, GATT_SERVICE_UUID);
        assert_ne!(def.request_characteristic, def.response_characteristic);
    }

    #[test]
    fn test_normalize_address() {
        assert_eq!(
            normalize_address(" aa:bb:cc:dd:ee:ff ").unwrap(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert!(matches!(
            normalize_address("   "),
            Err(BleError::InvalidParam(_))
        ));
    }

    #[test]
    fn test_scan_result_advertises() {
        let result = ScanResult::new("AA:BB:CC:DD:EE:FF", vec![GATT_SERVICE_UUID]);
        assert!(result.advertises(&GATT_SERVICE_UUID));
        assert!(!result.advertises(&GATT_REQUEST_CHARACTERISTIC_UUID));
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(ClientHandle(7).to_string(), "ClientHandle#7");
    }
}
