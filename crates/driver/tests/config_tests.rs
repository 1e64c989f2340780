//! Integration tests for configuration parsing
//!
//! Covers the driver configuration file:
//! - Full and minimal files
//! - Extra device entries and their layouts
//! - Save/load through the filesystem
//! - Invalid configuration handling

use driver::DriverConfig;
use protocol::DeviceLayout;
use std::time::Duration;

mod parsing {
    use super::*;

    const MINIMAL_CONFIG: &str = r#"
[driver]
log_level = "info"
"#;

    const FULL_CONFIG: &str = r#"
[driver]
log_level = "debug"
disable_net = true

[limits]
serial_ports = 32
net_devices = 2

[buffers]
net_rx_slots = 8
bulk_rx_slots = 3
tx_timeout_secs = 4

[[devices]]
vendor_id = "0x0af0"
product_id = "0x9300"
layout = "query"

[[devices]]
vendor_id = "0x1e0e"
product_id = "0x0001"
layout = "icon321"
"#;

    #[test]
    fn test_parse_minimal_config() {
        let config: DriverConfig = toml::from_str(MINIMAL_CONFIG).unwrap();

        assert_eq!(config.driver.log_level, "info");
        assert!(!config.driver.disable_net);
        assert_eq!(config.limits.serial_ports, 256);
        assert_eq!(config.limits.net_devices, 10);
        assert_eq!(config.buffers.net_rx_slots, 4);
        assert_eq!(config.buffers.bulk_rx_slots, 2);
        assert!(config.devices.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_empty_config() {
        let config: DriverConfig = toml::from_str("").unwrap();
        assert_eq!(config.driver.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let config: DriverConfig = toml::from_str(FULL_CONFIG).unwrap();

        assert_eq!(config.driver.log_level, "debug");
        assert!(config.driver.disable_net);
        assert_eq!(config.limits.serial_ports, 32);
        assert_eq!(config.limits.net_devices, 2);
        assert_eq!(config.buffers.net_rx_slots, 8);
        assert_eq!(config.buffers.bulk_rx_slots, 3);
        assert_eq!(config.buffers.tx_timeout(), Duration::from_secs(4));
        assert!(config.validate().is_ok());

        let extra = config.extra_devices().unwrap();
        assert_eq!(extra.len(), 2);
        assert_eq!(extra[0].vendor_id, 0x0af0);
        assert_eq!(extra[0].product_id, 0x9300);
        assert_eq!(extra[0].layout, DeviceLayout::Query);
        assert_eq!(extra[1].vendor_id, 0x1e0e);
        assert_eq!(extra[1].layout, DeviceLayout::Icon321);
    }

    #[test]
    fn test_layout_variants() {
        for (name, layout) in [
            ("default", DeviceLayout::Default),
            ("icon321", DeviceLayout::Icon321),
            ("query", DeviceLayout::Query),
        ] {
            let text = format!(
                "[[devices]]\nvendor_id = \"0x0af0\"\nproduct_id = \"0x0001\"\nlayout = \"{}\"\n",
                name
            );
            let config: DriverConfig = toml::from_str(&text).unwrap();
            assert_eq!(config.devices[0].layout, layout, "layout {}", name);
        }
    }

    #[test]
    fn test_unknown_layout_rejected() {
        let text = r#"
[[devices]]
vendor_id = "0x0af0"
product_id = "0x0001"
layout = "fancy"
"#;
        assert!(toml::from_str::<DriverConfig>(text).is_err());
    }
}

mod validation {
    use super::*;

    #[test]
    fn test_invalid_log_level() {
        let config: DriverConfig = toml::from_str("[driver]\nlog_level = \"verbose\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("verbose"));
    }

    #[test]
    fn test_zero_capacities_rejected() {
        let config: DriverConfig = toml::from_str("[limits]\nserial_ports = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: DriverConfig = toml::from_str("[limits]\nnet_devices = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_buffer_limits() {
        let config: DriverConfig = toml::from_str("[buffers]\nbulk_rx_slots = 1\n").unwrap();
        assert!(config.validate().is_err());

        let config: DriverConfig = toml::from_str("[buffers]\nnet_rx_slots = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: DriverConfig = toml::from_str("[buffers]\ntx_timeout_secs = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_device_ids_rejected() {
        for (vid, pid) in [
            ("0af0", "0x6711"),
            ("0x0af0", "6711"),
            ("0x", "0x6711"),
            ("0x0af0", "0x123456"),
            ("0xzz", "0x6711"),
        ] {
            let text = format!(
                "[[devices]]\nvendor_id = \"{}\"\nproduct_id = \"{}\"\nlayout = \"default\"\n",
                vid, pid
            );
            let config: DriverConfig = toml::from_str(&text).unwrap();
            assert!(config.validate().is_err(), "{}:{} accepted", vid, pid);
        }
    }
}

mod files {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("driver.toml");

        let mut config = DriverConfig::default();
        config.driver.log_level = "trace".to_string();
        config.limits.serial_ports = 16;
        config.buffers.net_rx_slots = 2;
        config.save(&path).unwrap();
        assert!(path.exists());

        let loaded = DriverConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.driver.log_level, "trace");
        assert_eq!(loaded.limits.serial_ports, 16);
        assert_eq!(loaded.buffers.net_rx_slots, 2);
    }

    #[test]
    fn test_load_from_path_string() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driver.toml");
        fs::write(
            &path,
            "[driver]\nlog_level = \"warn\"\n\n[[devices]]\nvendor_id = \"0x0af0\"\nproduct_id = \"0x7a05\"\nlayout = \"query\"\n",
        )
        .unwrap();

        let config = DriverConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(config.driver.log_level, "warn");
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("driver.toml");
        fs::write(&path, "[buffers]\nbulk_rx_slots = 0\n").unwrap();
        assert!(DriverConfig::load(Some(path)).is_err());

        let path = dir.path().join("broken.toml");
        fs::write(&path, "[driver\nlog_level = ").unwrap();
        assert!(DriverConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        assert!(DriverConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }
}
