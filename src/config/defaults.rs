use super::*;

pub(super) fn rtu_baud_rate() -> u32 {
    9600
}

pub(super) fn rtu_unit_ids() -> Vec<u8> {
    vec![126, 1]
}

pub(super) fn rtu_response_timeout_ms() -> u64 {
    1000
}

impl Default for ModbusConfig {
    fn default() -> Self {
        Self {
            tcp_port: 502,
            request_timeout_ms: 1000,
            sunspec_timeout_ms: 5000,
            connect_timeout_ms: 5000,
            tcp_pipeline_depth: 1,
            rtu: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ip_addresses: Vec::new(),
            priority_only: false,
            auto_scan: true,
            max_concurrent_probes: 10,
            sunspec_enabled: true,
            id_by_serial: false,
            udp_enabled: true,
            rescan_delay_ms: 5000,
            sunspec_probe_timeout_ms: 25_000,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            idle_interval_ms: 1000,
            retry_interval_ms: 5000,
            solar_api_interval_ms: 5000,
            retry_threshold: 5,
            power_limit_refresh_ms: 60_000,
            energy_save_interval_s: 600,
        }
    }
}

impl Default for SolarApiConfig {
    fn default() -> Self {
        Self {
            port: 80,
            timeout_ms: 5000,
        }
    }
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            console_level: None,
            file_level: None,
            file: "/var/log/helios/helios.log".to_string(),
            backup_count: 5,
            console_output: true,
            json_format: false,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            modbus: ModbusConfig::default(),
            discovery: DiscoveryConfig::default(),
            polling: PollingConfig::default(),
            solar_api: SolarApiConfig::default(),
            dbus: DbusConfig::default(),
            logging: LoggingConfig::default(),
            settings_file: "/data/helios_settings.json".to_string(),
        }
    }
}
