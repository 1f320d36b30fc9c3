//! Configuration management for Helios
//!
//! This module handles loading, validation, and management of the application
//! configuration from YAML files. Every section has defaults so a partial file
//! (or no file at all) yields a runnable configuration.

mod defaults;

use crate::error::{HeliosError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Modbus transport configuration (TCP and optional RTU link)
    pub modbus: ModbusConfig,

    /// Device discovery configuration
    pub discovery: DiscoveryConfig,

    /// Polling state machine timings
    pub polling: PollingConfig,

    /// Fronius Solar API client configuration
    pub solar_api: SolarApiConfig,

    /// D-Bus export configuration
    pub dbus: DbusConfig,

    /// Logging configuration
    pub logging: LoggingConfig,

    /// Path of the JSON settings store
    pub settings_file: String,
}

/// Modbus transport parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModbusConfig {
    /// TCP port used for SunSpec probing and polling (typically 502)
    pub tcp_port: u16,

    /// Default per-request timeout in milliseconds
    pub request_timeout_ms: u64,

    /// Per-request timeout used by SunSpec polling sessions
    pub sunspec_timeout_ms: u64,

    /// TCP connect timeout in milliseconds
    pub connect_timeout_ms: u64,

    /// Maximum number of TCP exchanges in flight per connection
    pub tcp_pipeline_depth: usize,

    /// Optional serial link; its units are probed by SunSpec
    pub rtu: Option<RtuConfig>,
}

/// Modbus RTU serial link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtuConfig {
    /// Serial device path, e.g. /dev/ttyUSB0
    pub device: String,

    /// Baud rate
    #[serde(default = "defaults::rtu_baud_rate")]
    pub baud_rate: u32,

    /// Unit ids to probe on the bus
    #[serde(default = "defaults::rtu_unit_ids")]
    pub unit_ids: Vec<u8>,

    /// Response timeout in milliseconds
    #[serde(default = "defaults::rtu_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

/// Discovery orchestrator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Addresses probed first, before any subnet scan
    pub ip_addresses: Vec<String>,

    /// Only probe the priority list, never scan local subnets
    pub priority_only: bool,

    /// Restart the scan while configured devices are missing
    pub auto_scan: bool,

    /// Maximum number of candidates probed concurrently
    pub max_concurrent_probes: usize,

    /// Probe Fronius hosts over SunSpec before falling back to HTTP only
    pub sunspec_enabled: bool,

    /// Always identify Fronius devices by their SunSpec serial number
    pub id_by_serial: bool,

    /// Send the Fronius UDP logger broadcast at the start of each scan
    pub udp_enabled: bool,

    /// Delay before an automatic rescan, in milliseconds
    pub rescan_delay_ms: u64,

    /// Total budget for one SunSpec probe, in milliseconds
    pub sunspec_probe_timeout_ms: u64,
}

/// Polling state machine timings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Idle time between successful SunSpec cycles (ms)
    pub idle_interval_ms: u64,

    /// Idle time after a failed cycle (ms)
    pub retry_interval_ms: u64,

    /// Idle time between Solar API cycles (ms)
    pub solar_api_interval_ms: u64,

    /// Consecutive errors before the device is reported disconnected
    pub retry_threshold: u32,

    /// Re-write interval for an active power limit (ms)
    pub power_limit_refresh_ms: u64,

    /// Interval for persisting the per-phase energy baseline (s)
    pub energy_save_interval_s: u64,
}

/// Fronius Solar API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolarApiConfig {
    /// HTTP port of the Fronius data manager
    pub port: u16,

    /// HTTP request timeout in milliseconds
    pub timeout_ms: u64,
}

/// D-Bus export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DbusConfig {
    /// Export discovered inverters on the bus
    pub enabled: bool,

    /// Fail fast on startup if the bus is unavailable
    pub require: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (TRACE, DEBUG, INFO, WARNING, ERROR)
    pub level: String,

    /// Optional console level override
    pub console_level: Option<String>,

    /// Optional file level override
    pub file_level: Option<String>,

    /// Path to log file (or directory); empty disables file logging
    pub file: String,

    /// Number of rotated files to keep
    pub backup_count: u32,

    /// Whether to log to console
    pub console_output: bool,

    /// Whether to use JSON format
    pub json_format: bool,
}

impl ModbusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn sunspec_timeout(&self) -> Duration {
        Duration::from_millis(self.sunspec_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from the first default location that exists
    pub fn load() -> Result<Self> {
        let default_paths = [
            "helios_config.yaml",
            "/data/helios_config.yaml",
            "/etc/helios/config.yaml",
        ];

        for path in &default_paths {
            if Path::new(path).exists() {
                return Self::from_file(path);
            }
        }

        Ok(Config::default())
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.modbus.tcp_port == 0 {
            return Err(HeliosError::validation(
                "modbus.tcp_port",
                "Port must be greater than 0",
            ));
        }

        if self.modbus.request_timeout_ms == 0 || self.modbus.sunspec_timeout_ms == 0 {
            return Err(HeliosError::validation(
                "modbus.request_timeout_ms",
                "Timeouts must be greater than 0",
            ));
        }

        if self.modbus.tcp_pipeline_depth == 0 {
            return Err(HeliosError::validation(
                "modbus.tcp_pipeline_depth",
                "Must be at least 1",
            ));
        }

        if let Some(rtu) = &self.modbus.rtu {
            if rtu.device.is_empty() {
                return Err(HeliosError::validation(
                    "modbus.rtu.device",
                    "Serial device cannot be empty",
                ));
            }
            if rtu.baud_rate == 0 {
                return Err(HeliosError::validation(
                    "modbus.rtu.baud_rate",
                    "Must be greater than 0",
                ));
            }
            if rtu.unit_ids.iter().any(|&u| u == 0 || u > 247) {
                return Err(HeliosError::validation(
                    "modbus.rtu.unit_ids",
                    "Unit ids must be in 1..=247",
                ));
            }
        }

        for ip in &self.discovery.ip_addresses {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(HeliosError::validation(
                    "discovery.ip_addresses".to_string(),
                    format!("Invalid IP address: {}", ip),
                ));
            }
        }

        if self.discovery.max_concurrent_probes == 0 {
            return Err(HeliosError::validation(
                "discovery.max_concurrent_probes",
                "Must be greater than 0",
            ));
        }

        if self.polling.idle_interval_ms == 0 || self.polling.solar_api_interval_ms == 0 {
            return Err(HeliosError::validation(
                "polling.idle_interval_ms",
                "Must be greater than 0",
            ));
        }

        if self.polling.retry_threshold == 0 {
            return Err(HeliosError::validation(
                "polling.retry_threshold",
                "Must be greater than 0",
            ));
        }

        if self.solar_api.port == 0 {
            return Err(HeliosError::validation(
                "solar_api.port",
                "Port must be greater than 0",
            ));
        }

        if self.settings_file.is_empty() {
            return Err(HeliosError::validation(
                "settings_file",
                "Path cannot be empty",
            ));
        }

        crate::logging::parse_log_level(&self.logging.level).map_err(|_| {
            HeliosError::validation(
                "logging.level".to_string(),
                format!("Unknown level: {}", self.logging.level),
            )
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.modbus.tcp_port, 502);
        assert_eq!(config.modbus.request_timeout_ms, 1000);
        assert_eq!(config.modbus.sunspec_timeout_ms, 5000);
        assert_eq!(config.modbus.tcp_pipeline_depth, 1);
        assert_eq!(config.discovery.max_concurrent_probes, 10);
        assert_eq!(config.polling.retry_threshold, 5);
        assert_eq!(config.solar_api.port, 80);
        assert_eq!(config.settings_file, "/data/helios_settings.json");
        assert!(config.modbus.rtu.is_none());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.modbus.tcp_port = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.discovery.ip_addresses = vec!["not-an-ip".to_string()];
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            HeliosError::Validation { ref field, .. } if field == "discovery.ip_addresses"
        ));

        config = Config::default();
        config.modbus.rtu = Some(RtuConfig {
            device: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            unit_ids: vec![0],
            response_timeout_ms: 1000,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "discovery:\n  ip_addresses: [\"192.168.1.20\"]\n  priority_only: true\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.discovery.ip_addresses, vec!["192.168.1.20"]);
        assert!(config.discovery.priority_only);
        assert!(config.discovery.sunspec_enabled);
        assert_eq!(config.polling.idle_interval_ms, 1000);
    }

    #[test]
    fn test_rtu_section_defaults() {
        let yaml = "modbus:\n  rtu:\n    device: /dev/ttyUSB0\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let rtu = config.modbus.rtu.unwrap();
        assert_eq!(rtu.baud_rate, 9600);
        assert_eq!(rtu.unit_ids, vec![126, 1]);
    }
}
