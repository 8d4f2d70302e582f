// Adapter configuration
//
// Timeouts, worker-pool size, queue bound and the GATT layout. Serialized as
// JSON; every field has a default so partial files load.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::transport::ble::gatt::{
    GattServiceDefinition, GATT_REQUEST_CHARACTERISTIC_UUID, GATT_RESPONSE_CHARACTERISTIC_UUID,
    GATT_SERVICE_UUID,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Which GATT roles the adapter runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeRole {
    /// Central: scans for and writes to remote GATT servers
    Client,
    /// Peripheral: hosts the GATT service and notifies connected clients
    Server,
    Dual,
}

impl LeRole {
    pub fn runs_client(&self) -> bool {
        matches!(self, LeRole::Client | LeRole::Dual)
    }

    pub fn runs_server(&self) -> bool {
        matches!(self, LeRole::Server | LeRole::Dual)
    }
}

impl std::str::FromStr for LeRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "client" => Ok(LeRole::Client),
            "server" => Ok(LeRole::Server),
            "dual" => Ok(LeRole::Dual),
            other => Err(ConfigError::Invalid(format!("unknown role '{}'", other))),
        }
    }
}

impl std::fmt::Display for LeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeRole::Client => write!(f, "client"),
            LeRole::Server => write!(f, "server"),
            LeRole::Dual => write!(f, "dual"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BleAdapterConfig {
    pub role: LeRole,
    /// Idle time after the last multicast before scanning stops
    pub scan_timeout_ms: u64,
    /// Bound on waiting for one write-with-response completion
    pub write_timeout_ms: u64,
    /// Bound on waiting for an on-demand session during unicast
    pub connect_timeout_ms: u64,
    /// Passed through to the platform connect request
    pub auto_connect: bool,
    /// Connect to a peer without a session when unicasting to it
    pub connect_on_unicast: bool,
    /// Concurrent connect/discover tasks
    pub max_workers: usize,
    /// Bound on buffered multicast payloads
    pub max_pending_payloads: usize,
    pub service_uuid: Uuid,
    pub request_characteristic_uuid: Uuid,
    pub response_characteristic_uuid: Uuid,
}

impl Default for BleAdapterConfig {
    fn default() -> Self {
        Self {
            role: LeRole::Client,
            scan_timeout_ms: 30_000,
            write_timeout_ms: 10_000,
            connect_timeout_ms: 10_000,
            auto_connect: false,
            connect_on_unicast: true,
            max_workers: 4,
            max_pending_payloads: 64,
            service_uuid: GATT_SERVICE_UUID,
            request_characteristic_uuid: GATT_REQUEST_CHARACTERISTIC_UUID,
            response_characteristic_uuid: GATT_RESPONSE_CHARACTERISTIC_UUID,
        }
    }
}

impl BleAdapterConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scan_timeout_ms == 0 {
            return Err(ConfigError::Invalid("scan_timeout_ms must be non-zero".into()));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("write_timeout_ms must be non-zero".into()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be non-zero".into(),
            ));
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Invalid("max_workers must be at least 1".into()));
        }
        if self.max_pending_payloads == 0 {
            return Err(ConfigError::Invalid(
                "max_pending_payloads must be at least 1".into(),
            ));
        }
        if self.service_uuid == self.request_characteristic_uuid
            || self.service_uuid == self.response_characteristic_uuid
            || self.request_characteristic_uuid == self.response_characteristic_uuid
        {
            return Err(ConfigError::Invalid(
                "service and characteristic UUIDs must be distinct".into(),
            ));
        }
        Ok(())
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn service_definition(&self) -> GattServiceDefinition {
        GattServiceDefinition {
            service: self.service_uuid,
            request_characteristic: self.request_characteristic_uuid,
            response_characteristic: self.response_characteristic_uuid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_are_valid() {
        let config = BleAdapterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scan_timeout(), Duration::from_secs(30));
        assert_eq!(config.write_timeout(), Duration::from_secs(10));
        assert_eq!(config.service_definition(), GattServiceDefinition::default());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            BleAdapterConfig::from_json(r#"{"role": "dual", "write_timeout_ms": 250}"#)
                .expect("parse");
        assert_eq!(config.role, LeRole::Dual);
        assert_eq!(config.write_timeout_ms, 250);
        assert_eq!(config.max_workers, 4);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = BleAdapterConfig::from_json(r#"{"scan_timeout_ms": 0}"#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_duplicate_uuids_rejected() {
        let config = BleAdapterConfig {
            response_characteristic_uuid: GATT_REQUEST_CHARACTERISTIC_UUID,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_json_is_parse_error() {
        assert!(matches!(
            BleAdapterConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.json");
        let config = BleAdapterConfig {
            role: LeRole::Server,
            max_pending_payloads: 8,
            ..Default::default()
        };

        config.save(&path).expect("save");
        assert_eq!(BleAdapterConfig::load(&path).expect("load"), config);
    }

    #[test]
    fn test_role_parsing() {
        assert_eq!("Client".parse::<LeRole>().unwrap(), LeRole::Client);
        assert!(LeRole::Dual.runs_client() && LeRole::Dual.runs_server());
        assert!(!LeRole::Server.runs_client());
        assert!("mesh".parse::<LeRole>().is_err());
    }
}
