//! Decoding of SunSpec inverter model blocks into live measurements

use super::{float_value, scaled_value};
use crate::device::{DeviceInfo, ProtocolType};
use crate::solar_api::{CommonInverterData, ThreePhaseData};

/// SunSpec operating states (model 101..113 `St`, model 701 `InvSt` + 1)
pub mod state {
    pub const OFF: u16 = 1;
    pub const SLEEPING: u16 = 2;
    pub const STARTING: u16 = 3;
    pub const MPPT: u16 = 4;
    pub const THROTTLED: u16 = 5;
    pub const SHUTTING_DOWN: u16 = 6;
    pub const FAULT: u16 = 7;
    pub const STANDBY: u16 = 8;
}

/// Number of registers read per poll for a protocol
pub fn block_len(protocol: ProtocolType) -> u16 {
    match protocol {
        ProtocolType::SunSpecFloat => 62,
        ProtocolType::SunSpec2018 => 121,
        ProtocolType::SunSpecIntSf | ProtocolType::SolarApi => 52,
    }
}

/// Map a SunSpec operating state onto the Fronius status code
pub fn map_operating_state(sunspec_state: u16) -> Option<i32> {
    match sunspec_state {
        state::OFF => Some(0),
        state::SLEEPING | state::SHUTTING_DOWN | state::STANDBY => Some(8),
        state::STARTING => Some(3),
        state::MPPT => Some(11),
        state::THROTTLED => Some(12),
        state::FAULT => Some(10),
        _ => None,
    }
}

/// Fronius sends 36 zero registers followed by state 7 during SolarNet timeouts
pub fn is_fronius_null_frame(values: &[u16]) -> bool {
    match values.get(2..39) {
        Some(window) => window[..36].iter().all(|&v| v == 0) && window[36] == 7,
        None => false,
    }
}

/// Measurements decoded from one model block
#[derive(Debug, Clone, PartialEq)]
pub struct SunSpecSample {
    /// `None` when power decoded as NaN
    pub common: Option<CommonInverterData>,
    /// Present for multi-phase devices
    pub three_phase: Option<ThreePhaseData>,
    /// Fronius status code, `None` for unknown states
    pub status_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Sample(SunSpecSample),
    /// Fronius null frame; the sample is dropped
    NullFrame,
    /// The block belongs to a different model than the one detected
    ModelChanged { model: u16 },
    /// Wrong length or otherwise unusable
    Invalid(String),
}

/// Decode the inverter model block read at `info.inverter_model_offset`
pub fn decode_block(info: &DeviceInfo, values: &[u16]) -> Decoded {
    let expected = usize::from(block_len(info.protocol));
    if values.len() != expected {
        return Decoded::Invalid(format!(
            "expected {} registers, got {}",
            expected,
            values.len()
        ));
    }
    if let Some(model) = model_mismatch(info, values) {
        return Decoded::ModelChanged { model };
    }
    match info.protocol {
        ProtocolType::SunSpecIntSf => {
            // Only Solar API inverters carry a Fronius device type
            if info.device_type != 0 && is_fronius_null_frame(values) {
                return Decoded::NullFrame;
            }
            Decoded::Sample(decode_int_sf(info, values))
        }
        ProtocolType::SunSpecFloat => Decoded::Sample(decode_float(info, values)),
        ProtocolType::SunSpec2018 => Decoded::Sample(decode_2018(info, values)),
        ProtocolType::SolarApi => Decoded::Invalid("not a SunSpec device".to_string()),
    }
}

fn model_mismatch(info: &DeviceInfo, values: &[u16]) -> Option<u16> {
    let model = values[0];
    let matches = match info.protocol {
        ProtocolType::SunSpec2018 => {
            model == 701 && values[2].min(2) + 1 == u16::from(info.phase_count)
        }
        _ => {
            let protocol = if model > 103 {
                ProtocolType::SunSpecFloat
            } else {
                ProtocolType::SunSpecIntSf
            };
            matches!(model, 101..=103 | 111..=113)
                && protocol == info.protocol
                && model % 10 == u16::from(info.phase_count)
        }
    };
    (!matches).then_some(model)
}

fn common(power: f64, current: f64, voltage: f64, energy: f64) -> CommonInverterData {
    CommonInverterData {
        ac_power: power,
        ac_current: current,
        ac_voltage: voltage,
        total_energy: energy,
        ..CommonInverterData::default()
    }
}

fn decode_int_sf(info: &DeviceInfo, values: &[u16]) -> SunSpecSample {
    let power = scaled_value(values, 14, 1, 15, true);
    let mut sample = SunSpecSample {
        common: None,
        three_phase: None,
        status_code: map_operating_state(values[38]),
    };
    if power.is_finite() {
        // Phase A voltage stands in for the aggregate
        sample.common = Some(common(
            power,
            scaled_value(values, 2, 1, 6, false),
            scaled_value(values, 10, 1, 13, false),
            scaled_value(values, 24, 2, 26, false),
        ));
        if info.phase_count > 1 {
            sample.three_phase = Some(ThreePhaseData {
                ac_current: [3, 4, 5].map(|o| scaled_value(values, o, 1, 6, false)),
                ac_voltage: [10, 11, 12].map(|o| scaled_value(values, o, 1, 13, false)),
            });
        }
    }
    sample
}

fn decode_float(info: &DeviceInfo, values: &[u16]) -> SunSpecSample {
    let power = float_value(values, 22);
    let mut sample = SunSpecSample {
        common: None,
        three_phase: None,
        status_code: map_operating_state(values[48]),
    };
    if power.is_finite() {
        sample.common = Some(common(
            power,
            float_value(values, 2),
            float_value(values, 16),
            float_value(values, 32),
        ));
        if info.phase_count > 1 {
            sample.three_phase = Some(ThreePhaseData {
                ac_current: [4, 6, 8].map(|o| float_value(values, o)),
                ac_voltage: [16, 18, 20].map(|o| float_value(values, o)),
            });
        }
    }
    sample
}

fn decode_2018(info: &DeviceInfo, values: &[u16]) -> SunSpecSample {
    let power = scaled_value(values, 10, 1, 116, true);
    let mut sample = SunSpecSample {
        common: None,
        three_phase: None,
        // The 2018 enumeration starts at 0
        status_code: map_operating_state(values[4].saturating_add(1)),
    };
    if power.is_finite() {
        sample.common = Some(common(
            power,
            scaled_value(values, 14, 1, 113, true),
            scaled_value(values, 16, 1, 114, false),
            scaled_value(values, 19, 4, 120, false),
        ));
        if info.phase_count > 1 {
            sample.three_phase = Some(ThreePhaseData {
                ac_current: [45, 68, 91].map(|o| scaled_value(values, o, 1, 113, true)),
                ac_voltage: [47, 70, 93].map(|o| scaled_value(values, o, 1, 114, false)),
            });
        }
    }
    sample
}
