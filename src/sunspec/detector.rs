use super::{BASE_ADDRESSES, END_MODEL, SUNSPEC_MARKER, scale_factor, scaled_value, string_value};
use crate::device::{DeviceInfo, ProtocolType, product, product_id_for_manufacturer};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::{ModbusException, ModbusTransport};
use std::time::Duration;

const COMMON_MODEL_LEN: u16 = 66;
const NAMEPLATE_LEN: u16 = 26;
const DER_CAPACITY_LEN: u16 = 50;
const AC_TYPE_LEN: u16 = 3;
const CONTROLS_SF_OFFSET: u16 = 23;
const DER_CONTROLS_SF_OFFSET: u16 = 54;

/// Walks the SunSpec model list of one unit to fingerprint the device
#[derive(Debug, Clone)]
pub struct SunSpecDetector {
    budget: Duration,
}

impl Default for SunSpecDetector {
    fn default() -> Self {
        Self::new(Duration::from_secs(25))
    }
}

impl SunSpecDetector {
    /// `budget` bounds the whole walk, not individual requests
    pub fn new(budget: Duration) -> Self {
        Self { budget }
    }

    /// Detect a SunSpec inverter at `unit`. Returns `None` when the unit is
    /// not SunSpec, is not an inverter, or the walk ran out of time.
    pub async fn detect(
        &self,
        transport: &dyn ModbusTransport,
        host: &str,
        port: u16,
        unit: u8,
    ) -> Option<DeviceInfo> {
        let logger = get_logger_with_context(
            LogContext::new("sunspec_detector").with_location(format!("{}:{}", host, unit)),
        );
        let walk = Walk {
            transport,
            info: DeviceInfo::new(host, port, unit),
            logger: &logger,
        };
        match tokio::time::timeout(self.budget, walk.run()).await {
            Ok(result) => result,
            Err(_) => {
                logger.debug("SunSpec detection timed out");
                None
            }
        }
    }
}

struct Walk<'a> {
    transport: &'a dyn ModbusTransport,
    info: DeviceInfo,
    logger: &'a StructuredLogger,
}

impl Walk<'_> {
    async fn read(&self, start: u16, count: u16) -> Option<Vec<u16>> {
        match self
            .transport
            .read_holding_registers(self.info.unit_id, start, count)
            .await
        {
            Ok(values) if values.len() == usize::from(count) => Some(values),
            Ok(values) => {
                self.logger.debug(&format!(
                    "Short reply at {}: {} of {} registers",
                    start,
                    values.len(),
                    count
                ));
                None
            }
            Err(e) => {
                self.logger.debug(&format!("Read at {} failed: {}", start, e));
                None
            }
        }
    }

    async fn find_base(&self) -> Option<u16> {
        for base in BASE_ADDRESSES {
            match self
                .transport
                .read_holding_registers(self.info.unit_id, base, 2)
                .await
            {
                Ok(values) if values == SUNSPEC_MARKER => return Some(base),
                Ok(_) => {}
                // Nothing listens; no point trying the other bases
                Err(e) if e.exception == ModbusException::TcpError => return None,
                Err(_) => {}
            }
        }
        None
    }

    async fn run(mut self) -> Option<DeviceInfo> {
        let base = self.find_base().await?;
        self.logger
            .debug(&format!("SunSpec marker found at {}", base));

        let mut current = u32::from(base) + 2;
        while let Ok(register) = u16::try_from(current) {
            let Some(header) = self.read(register, 2).await else {
                break;
            };
            let (model, length) = (header[0], header[1]);
            let next = current + 2 + u32::from(length);

            let keep_going = match model {
                1 => {
                    if self.info.product_id != 0 {
                        // Second device in an aggregated map
                        false
                    } else {
                        self.read_common(register).await
                    }
                }
                101..=103 | 111..=113 => {
                    self.info.protocol = if model > 103 {
                        ProtocolType::SunSpecFloat
                    } else {
                        ProtocolType::SunSpecIntSf
                    };
                    self.info.phase_count = (model % 10) as u8;
                    self.info.inverter_model_offset = register;
                    true
                }
                701 => {
                    // A 1xx model takes precedence
                    if self.info.phase_count > 0 {
                        true
                    } else {
                        self.read_ac_type(register).await
                    }
                }
                120 => {
                    if self.info.max_power > 0.0 {
                        true
                    } else {
                        self.read_nameplate(register).await
                    }
                }
                702 => {
                    if self.info.max_power > 0.0 {
                        true
                    } else {
                        self.read_der_capacity(register).await
                    }
                }
                123 => self.read_control_scale(register, 123, CONTROLS_SF_OFFSET).await,
                704 => {
                    // Model 123 is preferred when both are present
                    if self.info.control_model != 0 {
                        true
                    } else {
                        self.read_control_scale(register, 704, DER_CONTROLS_SF_OFFSET)
                            .await
                    }
                }
                END_MODEL => false,
                _ => true,
            };
            if !keep_going {
                break;
            }
            current = next;
        }

        if !self.info.product_name.is_empty()
            && self.info.phase_count > 0
            && self.info.unit_id > 0
        {
            self.logger.info(&format!(
                "Detected {} ({:?}, {} phase(s), serial {})",
                self.info.product_name,
                self.info.protocol,
                self.info.phase_count,
                self.info.serial_number
            ));
            Some(self.info)
        } else {
            None
        }
    }

    async fn read_common(&mut self, register: u16) -> bool {
        let Some(values) = self.read(register, COMMON_MODEL_LEN).await else {
            return false;
        };
        let manufacturer = string_value(&values, 2, 16);
        let model = string_value(&values, 18, 16);
        self.info.product_id = product_id_for_manufacturer(&manufacturer);
        self.info.product_name = format!("{} {}", manufacturer, model);
        if self.info.product_id == product::FRONIUS {
            // Fronius reports the data manager version in the options field
            self.info.data_manager_version = string_value(&values, 34, 8);
        }
        self.info.firmware_version = string_value(&values, 42, 8);
        self.info.serial_number = string_value(&values, 50, 16);
        self.info.unique_id = self.info.serial_number.clone();
        true
    }

    async fn read_ac_type(&mut self, register: u16) -> bool {
        let Some(values) = self.read(register, AC_TYPE_LEN).await else {
            return false;
        };
        self.info.protocol = ProtocolType::SunSpec2018;
        self.info.inverter_model_offset = register;
        self.info.phase_count = (values[2].min(2) + 1) as u8;
        true
    }

    async fn read_nameplate(&mut self, register: u16) -> bool {
        let Some(values) = self.read(register, NAMEPLATE_LEN).await else {
            return false;
        };
        self.info.max_power = scaled_value(&values, 3, 1, 4, false);
        self.info.storage_capacity = scaled_value(&values, 21, 1, 22, false);
        true
    }

    async fn read_der_capacity(&mut self, register: u16) -> bool {
        let Some(values) = self.read(register, DER_CAPACITY_LEN).await else {
            return false;
        };
        self.info.max_power = scaled_value(&values, 2, 1, 45, false);
        true
    }

    async fn read_control_scale(&mut self, register: u16, model: u16, sf_offset: u16) -> bool {
        self.info.control_offset = register;
        self.info.control_model = model;
        let Some(values) = self.read(register.saturating_add(sf_offset), 1).await else {
            return false;
        };
        let scale = 100.0 / scale_factor(&values, 0);
        self.info.power_limit_scale = if scale.is_finite() { scale } else { 0.0 };
        true
    }
}
