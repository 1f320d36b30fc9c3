//! Identify the inverters behind one candidate host

use super::registry::DeviceRegistry;
use crate::config::Config;
use crate::device::{
    BROKEN_DEVICE_TYPE, DeviceInfo, PLACEHOLDER_UNIQUE_ID, ProtocolType, fix_unique_id, product,
    sanitize_id,
};
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use crate::modbus::{ModbusTcpClient, ModbusTransport, TcpClientSettings};
use crate::solar_api::{InverterInfo, SolarApiClient};
use crate::sunspec::SunSpecDetector;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;

/// Unit ids tried on hosts without a Solar API (SMA/SolarEdge/ABB default first)
pub const DIRECT_PROBE_UNITS: [u8; 2] = [126, 1];

/// Probe parameters derived from the configuration
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub solar_api_port: u16,
    pub solar_api_timeout: Duration,
    pub modbus_port: u16,
    pub modbus: TcpClientSettings,
    pub sunspec_budget: Duration,
    pub sunspec_enabled: bool,
    pub id_by_serial: bool,
}

impl ProbeSettings {
    pub fn from_config(config: &Config, solar_api_port: u16) -> Self {
        Self {
            solar_api_port,
            solar_api_timeout: Duration::from_millis(config.solar_api.timeout_ms),
            modbus_port: config.modbus.tcp_port,
            modbus: TcpClientSettings::from_config(&config.modbus),
            sunspec_budget: Duration::from_millis(config.discovery.sunspec_probe_timeout_ms),
            sunspec_enabled: config.discovery.sunspec_enabled,
            id_by_serial: config.discovery.id_by_serial,
        }
    }
}

/// Runs the HTTP and SunSpec probes for candidate hosts
pub struct DeviceDetector {
    settings: ProbeSettings,
    sunspec: SunSpecDetector,
    /// Unique ids already warned about for DT 255
    warned: Mutex<HashSet<String>>,
    logger: StructuredLogger,
}

impl DeviceDetector {
    pub fn new(settings: ProbeSettings) -> Self {
        Self {
            sunspec: SunSpecDetector::new(settings.sunspec_budget),
            settings,
            warned: Mutex::new(HashSet::new()),
            logger: get_logger("detector"),
        }
    }

    pub fn settings(&self) -> &ProbeSettings {
        &self.settings
    }

    /// Detect inverters on `host`, skipping units the registry already manages
    pub async fn probe_host(
        &self,
        host: &str,
        registry: &AsyncMutex<DeviceRegistry>,
    ) -> Vec<DeviceInfo> {
        let client = match SolarApiClient::with_timeout(
            host,
            self.settings.solar_api_port,
            self.settings.solar_api_timeout,
        ) {
            Ok(client) => client,
            Err(e) => {
                self.logger
                    .debug(&format!("Cannot create HTTP client for {}: {}", host, e));
                return Vec::new();
            }
        };

        match client.get_inverter_info().await {
            Ok(inverters) => {
                let mut found = Vec::new();
                for inverter in inverters {
                    if let Some(info) =
                        self.probe_fronius(&client, host, &inverter, registry).await
                    {
                        found.push(info);
                    }
                }
                found
            }
            Err(e) => {
                self.logger.debug(&format!("No Solar API on {}: {}", host, e));
                if !self.settings.sunspec_enabled {
                    return Vec::new();
                }
                self.probe_sunspec_direct(host, registry).await
            }
        }
    }

    async fn probe_fronius(
        &self,
        client: &SolarApiClient,
        host: &str,
        inverter: &InverterInfo,
        registry: &AsyncMutex<DeviceRegistry>,
    ) -> Option<DeviceInfo> {
        let logger = get_logger_with_context(
            LogContext::new("detector").with_location(format!("{}:{}", host, inverter.id)),
        );
        if inverter.device_type == BROKEN_DEVICE_TYPE {
            if let Ok(mut warned) = self.warned.lock()
                && warned.insert(inverter.unique_id.clone())
            {
                logger.warn(&format!(
                    "Inverter {} reports device type 255, firmware update required",
                    inverter.unique_id
                ));
            }
            return None;
        }
        let Ok(unit) = u8::try_from(inverter.id) else {
            logger.debug("Solar API device id out of Modbus range");
            return None;
        };
        if registry.lock().await.is_managed(host, unit) {
            return None;
        }

        if self.settings.sunspec_enabled
            && let Some(mut info) = self.probe_sunspec(host, unit).await
        {
            info.device_type = inverter.device_type;
            let unique_id = if inverter.unique_id == PLACEHOLDER_UNIQUE_ID
                || self.settings.id_by_serial
            {
                info.serial_number.clone()
            } else {
                inverter.unique_id.clone()
            };
            info.unique_id = fix_unique_id(inverter.device_type, &unique_id, inverter.id);
            return Some(info);
        }

        // HTTP only
        let mut info = DeviceInfo::new(host, self.settings.solar_api_port, unit);
        info.protocol = ProtocolType::SolarApi;
        info.product_id = product::FRONIUS;
        info.product_name = format!("Fronius {}", inverter.custom_name)
            .trim()
            .to_string();
        info.device_type = inverter.device_type;
        info.unique_id = fix_unique_id(inverter.device_type, &inverter.unique_id, inverter.id);
        info.phase_count = match client.get_three_phase_data(inverter.id).await {
            Ok(_) => 3,
            Err(_) => 1,
        };
        logger.info(&format!(
            "Using Solar API for {} ({} phase(s))",
            info.unique_id, info.phase_count
        ));
        Some(info)
    }

    async fn probe_sunspec(&self, host: &str, unit: u8) -> Option<DeviceInfo> {
        let transport = ModbusTcpClient::new(host, self.settings.modbus_port, self.settings.modbus);
        let result = self
            .sunspec
            .detect(&transport, host, self.settings.modbus_port, unit)
            .await;
        transport.close();
        result
    }

    async fn probe_sunspec_direct(
        &self,
        host: &str,
        registry: &AsyncMutex<DeviceRegistry>,
    ) -> Vec<DeviceInfo> {
        let transport = ModbusTcpClient::new(host, self.settings.modbus_port, self.settings.modbus);
        let found = self
            .probe_units(
                &transport,
                host,
                self.settings.modbus_port,
                &DIRECT_PROBE_UNITS,
                registry,
            )
            .await;
        transport.close();
        found
    }

    /// Walk the given units over an existing transport (used for RTU links)
    pub async fn probe_units(
        &self,
        transport: &dyn ModbusTransport,
        host: &str,
        port: u16,
        units: &[u8],
        registry: &AsyncMutex<DeviceRegistry>,
    ) -> Vec<DeviceInfo> {
        let mut found = Vec::new();
        for &unit in units {
            if registry.lock().await.is_managed(host, unit) {
                continue;
            }
            let Some(mut info) = self.sunspec.detect(transport, host, port, unit).await else {
                continue;
            };
            info.unique_id = sanitize_id(&info.serial_number);
            if info.unique_id.is_empty() {
                self.logger
                    .debug(&format!("Ignoring {}: no serial number", info.location()));
                continue;
            }
            found.push(info);
        }
        found
    }
}
