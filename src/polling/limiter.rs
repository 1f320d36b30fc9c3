//! Vendor power-limit backends

use crate::device::{DeviceInfo, product};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::modbus::{
    ModbusResult, ModbusTransport, decode_32bit_float, encode_32bit_float, encode_u32,
};

/// SunSpec model 123 immediate controls
const MODEL_CONTROLS: u16 = 123;

/// Reversion timeout written along with a model 123 limit (s)
const REVERT_TIMEOUT_S: u16 = 120;

mod solaredge {
    pub const ENABLE_DYNAMIC_POWER: u16 = 0xF300;
    pub const COMMAND_TIMEOUT: u16 = 0xF310;
    pub const FALLBACK_ACTIVE_POWER: u16 = 0xF312;
    pub const MAX_ACTIVE_POWER: u16 = 0xF304;
    pub const RAMP_UP: u16 = 0xF318;
    pub const RAMP_DOWN: u16 = 0xF31A;
    pub const ACTIVE_POWER_LIMIT: u16 = 0xF322;
}

/// Device-specific power limiting
///
/// `pct` is always a fraction in `0.0..=1.0` of the rated power.
#[async_trait::async_trait]
pub trait PowerLimiter: Send + Sync {
    /// Called after every (re)connect, before the first telemetry read
    async fn on_connected(
        &mut self,
        _transport: &dyn ModbusTransport,
        _info: &mut DeviceInfo,
    ) -> ModbusResult<()> {
        Ok(())
    }

    async fn apply_power_limit(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &DeviceInfo,
        pct: f64,
    ) -> ModbusResult<()>;

    async fn reset_power_limit(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &DeviceInfo,
    ) -> ModbusResult<()>;

    /// Whether limit requests should be accepted at all
    fn supports_limiting(&self, info: &DeviceInfo) -> bool;
}

/// Pick the limiter for a detected device
pub fn select_limiter(info: &DeviceInfo) -> Box<dyn PowerLimiter> {
    let logger = get_logger_with_context(
        LogContext::new("limiter").with_device(&info.unique_id),
    );
    match info.product_id {
        product::SOLAREDGE => Box::new(SolarEdgeLimiter { logger }),
        product::SMA if info.control_model != 0 => Box::new(SmaLimiter { logger }),
        _ if info.control_model != 0 => Box::new(SunSpecLimiter { logger }),
        _ => Box::new(NoLimiter),
    }
}

fn limit_register_value(pct: f64, scale: f64) -> u16 {
    (pct.clamp(0.0, 1.0) * scale).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Swap to low word first
fn little_endian_words(words: [u16; 2]) -> [u16; 2] {
    [words[1], words[0]]
}

/// Immediate controls via SunSpec model 123 or 704 (Fronius, ABB, generic)
pub struct SunSpecLimiter {
    logger: StructuredLogger,
}

#[async_trait::async_trait]
impl PowerLimiter for SunSpecLimiter {
    async fn apply_power_limit(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &DeviceInfo,
        pct: f64,
    ) -> ModbusResult<()> {
        let value = limit_register_value(pct, info.power_limit_scale);
        self.logger.debug(&format!("Writing power limit {}", value));
        if info.control_model == MODEL_CONTROLS {
            transport
                .write_multiple_registers(
                    info.unit_id,
                    info.control_offset + 5,
                    &[value, 0, REVERT_TIMEOUT_S, 0, 1],
                )
                .await
        } else {
            transport
                .write_multiple_registers(info.unit_id, info.control_offset + 14, &[1, value])
                .await
        }
    }

    async fn reset_power_limit(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &DeviceInfo,
    ) -> ModbusResult<()> {
        let enable = if info.control_model == MODEL_CONTROLS { 9 } else { 14 };
        transport
            .write_single_register(info.unit_id, info.control_offset + enable, 0)
            .await
            .map(|_| ())
    }

    fn supports_limiting(&self, info: &DeviceInfo) -> bool {
        info.power_limit_scale >= 100.0
    }
}

/// SMA keeps the enable flag under its own control; only the percentage is written
pub struct SmaLimiter {
    logger: StructuredLogger,
}

impl SmaLimiter {
    fn registers(info: &DeviceInfo) -> (u16, u16) {
        if info.control_model == MODEL_CONTROLS {
            (info.control_offset + 9, info.control_offset + 5)
        } else {
            (info.control_offset + 14, info.control_offset + 15)
        }
    }
}

#[async_trait::async_trait]
impl PowerLimiter for SmaLimiter {
    async fn on_connected(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &mut DeviceInfo,
    ) -> ModbusResult<()> {
        let (enable, _) = Self::registers(info);
        let values = transport
            .read_holding_registers(info.unit_id, enable, 1)
            .await?;
        self.logger.info(&format!(
            "Power limit enable register: {}",
            values.first().copied().unwrap_or_default()
        ));
        Ok(())
    }

    async fn apply_power_limit(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &DeviceInfo,
        pct: f64,
    ) -> ModbusResult<()> {
        let (_, limit) = Self::registers(info);
        transport
            .write_single_register(
                info.unit_id,
                limit,
                limit_register_value(pct, info.power_limit_scale),
            )
            .await
            .map(|_| ())
    }

    async fn reset_power_limit(
        &mut self,
        _transport: &dyn ModbusTransport,
        _info: &DeviceInfo,
    ) -> ModbusResult<()> {
        Ok(())
    }

    fn supports_limiting(&self, info: &DeviceInfo) -> bool {
        info.power_limit_scale >= 100.0
    }
}

/// SolarEdge dynamic power control (vendor registers, 32-bit values low word first)
pub struct SolarEdgeLimiter {
    logger: StructuredLogger,
}

impl SolarEdgeLimiter {
    async fn write_float(
        transport: &dyn ModbusTransport,
        unit: u8,
        register: u16,
        value: f32,
    ) -> ModbusResult<()> {
        transport
            .write_multiple_registers(
                unit,
                register,
                &little_endian_words(encode_32bit_float(value)),
            )
            .await
    }
}

#[async_trait::async_trait]
impl PowerLimiter for SolarEdgeLimiter {
    async fn on_connected(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &mut DeviceInfo,
    ) -> ModbusResult<()> {
        let unit = info.unit_id;
        let words = transport
            .read_holding_registers(unit, solaredge::MAX_ACTIVE_POWER, 2)
            .await?;
        if words.len() == 2
            && let Ok(max) = decode_32bit_float(&[words[1], words[0]])
            && max.is_finite()
            && max != 0.0
        {
            info.max_power = f64::from(max);
            self.logger
                .info(&format!("Max active power {} W", info.max_power));
        }

        use solaredge::*;
        Self::write_float(transport, unit, RAMP_UP, 100.0).await?;
        Self::write_float(transport, unit, RAMP_DOWN, -1.0).await?;
        Self::write_float(transport, unit, FALLBACK_ACTIVE_POWER, 100.0).await?;
        transport
            .write_multiple_registers(unit, COMMAND_TIMEOUT, &little_endian_words(encode_u32(120)))
            .await?;
        transport
            .write_single_register(unit, ENABLE_DYNAMIC_POWER, 1)
            .await?;
        Ok(())
    }

    async fn apply_power_limit(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &DeviceInfo,
        pct: f64,
    ) -> ModbusResult<()> {
        let value = (pct.clamp(0.0, 1.0) * 100.0) as f32;
        Self::write_float(transport, info.unit_id, solaredge::ACTIVE_POWER_LIMIT, value).await
    }

    async fn reset_power_limit(
        &mut self,
        transport: &dyn ModbusTransport,
        info: &DeviceInfo,
    ) -> ModbusResult<()> {
        Self::write_float(transport, info.unit_id, solaredge::ACTIVE_POWER_LIMIT, 100.0).await
    }

    fn supports_limiting(&self, _info: &DeviceInfo) -> bool {
        true
    }
}

/// Devices without a usable control model
pub struct NoLimiter;

#[async_trait::async_trait]
impl PowerLimiter for NoLimiter {
    async fn apply_power_limit(
        &mut self,
        _transport: &dyn ModbusTransport,
        _info: &DeviceInfo,
        _pct: f64,
    ) -> ModbusResult<()> {
        Ok(())
    }

    async fn reset_power_limit(
        &mut self,
        _transport: &dyn ModbusTransport,
        _info: &DeviceInfo,
    ) -> ModbusResult<()> {
        Ok(())
    }

    fn supports_limiting(&self, _info: &DeviceInfo) -> bool {
        false
    }
}
