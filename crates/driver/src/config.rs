//! Driver configuration management

use anyhow::{Context, Result, anyhow};
use protocol::{DeviceLayout, SupportedDevice};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub limits: LimitSettings,
    #[serde(default)]
    pub buffers: BufferSettings,
    /// Extra supported devices on top of the built-in table
    ///
    /// # Example Configuration
    /// ```toml
    /// [[devices]]
    /// vendor_id = "0x0af0"
    /// product_id = "0x9300"
    /// layout = "query"
    /// ```
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
    /// Do not create network functions
    #[serde(default)]
    pub disable_net: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            disable_net: false,
        }
    }
}

impl DriverSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Capacities of the port index spaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    #[serde(default = "LimitSettings::default_serial_ports")]
    pub serial_ports: usize,
    #[serde(default = "LimitSettings::default_net_devices")]
    pub net_devices: usize,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            serial_ports: Self::default_serial_ports(),
            net_devices: Self::default_net_devices(),
        }
    }
}

impl LimitSettings {
    fn default_serial_ports() -> usize {
        256
    }

    fn default_net_devices() -> usize {
        10
    }
}

/// Receive slot counts and transmit watchdog
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSettings {
    #[serde(default = "BufferSettings::default_net_rx_slots")]
    pub net_rx_slots: usize,
    #[serde(default = "BufferSettings::default_bulk_rx_slots")]
    pub bulk_rx_slots: usize,
    #[serde(default = "BufferSettings::default_tx_timeout_secs")]
    pub tx_timeout_secs: u64,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            net_rx_slots: Self::default_net_rx_slots(),
            bulk_rx_slots: Self::default_bulk_rx_slots(),
            tx_timeout_secs: Self::default_tx_timeout_secs(),
        }
    }
}

impl BufferSettings {
    fn default_net_rx_slots() -> usize {
        4
    }

    fn default_bulk_rx_slots() -> usize {
        2
    }

    fn default_tx_timeout_secs() -> u64 {
        10
    }

    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_secs)
    }
}

/// Extra supported device (IDs as `0x`-prefixed hex strings)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub vendor_id: String,
    pub product_id: String,
    pub layout: DeviceLayout,
}

impl DeviceEntry {
    pub fn to_supported(&self) -> Result<SupportedDevice> {
        Ok(SupportedDevice {
            vendor_id: DriverConfig::parse_hex_id(&self.vendor_id, "vendor_id")?,
            product_id: DriverConfig::parse_hex_id(&self.product_id, "product_id")?,
            layout: self.layout,
        })
    }
}

impl DriverConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/hso-modem/driver.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DriverConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Load from a user-supplied path, expanding `~`
    pub fn load_from(path: &str) -> Result<Self> {
        let path_buf = PathBuf::from(shellexpand::tilde(path).as_ref());
        Self::load(Some(path_buf))
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hso-modem").join("driver.toml")
        } else {
            PathBuf::from(".config/hso-modem/driver.toml")
        }
    }

    /// Configured extra devices
    pub fn extra_devices(&self) -> Result<Vec<SupportedDevice>> {
        self.devices.iter().map(DeviceEntry::to_supported).collect()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.driver.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.driver.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.limits.serial_ports == 0 || self.limits.net_devices == 0 {
            return Err(anyhow!("Port index capacities must be non-zero"));
        }
        if self.buffers.net_rx_slots == 0 {
            return Err(anyhow!("net_rx_slots must be non-zero"));
        }
        if self.buffers.bulk_rx_slots < 2 {
            return Err(anyhow!(
                "bulk_rx_slots must be at least 2, got {}",
                self.buffers.bulk_rx_slots
            ));
        }
        if self.buffers.tx_timeout_secs == 0 {
            return Err(anyhow!("tx_timeout_secs must be non-zero"));
        }

        self.extra_devices()?;
        Ok(())
    }

    /// Parse a hex ID (VID or PID)
    fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
        if !id.starts_with("0x") && !id.starts_with("0X") {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x0af0')",
                name,
                id
            ));
        }

        let hex_part = &id[2..];
        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DriverConfig::default();
        assert_eq!(config.driver.log_level, "info");
        assert_eq!(config.limits.serial_ports, 256);
        assert_eq!(config.limits.net_devices, 10);
        assert_eq!(config.buffers.net_rx_slots, 4);
        assert_eq!(config.buffers.tx_timeout(), Duration::from_secs(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_hex_id() {
        assert_eq!(DriverConfig::parse_hex_id("0x0af0", "vid").unwrap(), 0x0af0);
        assert_eq!(DriverConfig::parse_hex_id("0XD033", "pid").unwrap(), 0xd033);
        assert!(DriverConfig::parse_hex_id("0af0", "vid").is_err());
        assert!(DriverConfig::parse_hex_id("0x", "vid").is_err());
        assert!(DriverConfig::parse_hex_id("0x12345", "vid").is_err());
        assert!(DriverConfig::parse_hex_id("0xGHIJ", "vid").is_err());
    }

    #[test]
    fn test_validate_limits() {
        let mut config = DriverConfig::default();
        config.buffers.bulk_rx_slots = 1;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.limits.net_devices = 0;
        assert!(config.validate().is_err());

        let mut config = DriverConfig::default();
        config.driver.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DriverConfig = toml::from_str(
            r#"
            [driver]
            disable_net = true

            [[devices]]
            vendor_id = "0x0af0"
            product_id = "0x9300"
            layout = "icon321"
            "#,
        )
        .unwrap();

        assert!(config.driver.disable_net);
        assert_eq!(config.driver.log_level, "info");
        assert_eq!(config.buffers.bulk_rx_slots, 2);

        let extra = config.extra_devices().unwrap();
        assert_eq!(extra[0].product_id, 0x9300);
        assert_eq!(extra[0].layout, DeviceLayout::Icon321);
    }
}
