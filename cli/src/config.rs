// Configuration management for the ocfble CLI
//
// Cross-platform config stored in:
// - macOS: ~/Library/Application Support/ocfble/config.json
// - Linux: ~/.config/ocfble/config.json
// - Windows: %APPDATA%\ocfble\config.json

use anyhow::{Context, Result};
use ocfble_core::{BleAdapterConfig, LeRole};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Settings handed to the transport
    pub adapter: BleAdapterConfig,

    /// How long `send`/`multicast` keep listening for responses, in seconds
    pub response_wait_secs: u64,

    /// Default duration of a plain `scan`, in seconds
    pub scan_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            // The desktop binding has no GATT server
            adapter: BleAdapterConfig {
                role: LeRole::Client,
                ..Default::default()
            },
            response_wait_secs: 3,
            scan_secs: 10,
        }
    }
}

impl Config {
    /// Get the config directory path (cross-platform)
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("ocfble");

        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;

        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Load config from the default location, creating it on first use
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            let config: Config =
                serde_json::from_str(&contents).context("Failed to parse config file")?;
            config
                .adapter
                .validate()
                .context("Invalid adapter settings in config file")?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.adapter.validate().context("Refusing to save invalid config")?;
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;
        Ok(())
    }

    /// Update one key in memory. The result is validated, not saved.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut adapter = self.adapter.clone();
        match key {
            "role" => adapter.role = value.parse().context("Invalid role")?,
            "scan_timeout_ms" => adapter.scan_timeout_ms = value.parse().context("Invalid number")?,
            "write_timeout_ms" => {
                adapter.write_timeout_ms = value.parse().context("Invalid number")?
            }
            "connect_timeout_ms" => {
                adapter.connect_timeout_ms = value.parse().context("Invalid number")?
            }
            "auto_connect" => adapter.auto_connect = value.parse().context("Invalid boolean value")?,
            "connect_on_unicast" => {
                adapter.connect_on_unicast = value.parse().context("Invalid boolean value")?
            }
            "max_workers" => adapter.max_workers = value.parse().context("Invalid number")?,
            "max_pending_payloads" => {
                adapter.max_pending_payloads = value.parse().context("Invalid number")?
            }
            "service_uuid" => adapter.service_uuid = value.parse().context("Invalid UUID")?,
            "request_characteristic_uuid" => {
                adapter.request_characteristic_uuid = value.parse().context("Invalid UUID")?
            }
            "response_characteristic_uuid" => {
                adapter.response_characteristic_uuid = value.parse().context("Invalid UUID")?
            }
            "response_wait_secs" => {
                self.response_wait_secs = value.parse().context("Invalid number")?
            }
            "scan_secs" => self.scan_secs = value.parse().context("Invalid number")?,
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        adapter.validate()?;
        self.adapter = adapter;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        let adapter = &self.adapter;
        vec![
            ("role".to_string(), adapter.role.to_string()),
            ("scan_timeout_ms".to_string(), adapter.scan_timeout_ms.to_string()),
            ("write_timeout_ms".to_string(), adapter.write_timeout_ms.to_string()),
            ("connect_timeout_ms".to_string(), adapter.connect_timeout_ms.to_string()),
            ("auto_connect".to_string(), adapter.auto_connect.to_string()),
            ("connect_on_unicast".to_string(), adapter.connect_on_unicast.to_string()),
            ("max_workers".to_string(), adapter.max_workers.to_string()),
            ("max_pending_payloads".to_string(), adapter.max_pending_payloads.to_string()),
            ("service_uuid".to_string(), adapter.service_uuid.to_string()),
            (
                "request_characteristic_uuid".to_string(),
                adapter.request_characteristic_uuid.to_string(),
            ),
            (
                "response_characteristic_uuid".to_string(),
                adapter.response_characteristic_uuid.to_string(),
            ),
            ("response_wait_secs".to_string(), self.response_wait_secs.to_string()),
            ("scan_secs".to_string(), self.scan_secs.to_string()),
        ]
    }
}
