//! SunSpec register-model support
//!
//! Numeric decoding helpers shared by the model walker (`detector`) and the
//! live telemetry decoder (`telemetry`).

mod detector;
pub mod telemetry;

pub use detector::SunSpecDetector;

use crate::modbus::{decode_32bit_float, decode_string};

/// "SunS" marker at the start of a SunSpec register map
pub const SUNSPEC_MARKER: [u16; 2] = [0x5375, 0x6e53];

/// Candidate base registers, tried in order
pub const BASE_ADDRESSES: [u16; 3] = [40000, 50000, 0];

/// Model id terminating the model list
pub const END_MODEL: u16 = 0xFFFF;

/// Scale factor register value meaning "not implemented"
const SF_NOT_IMPLEMENTED: u16 = 0x8000;

/// `10^sf`, or NaN when the scale factor is not implemented
pub fn scale_factor(values: &[u16], sf_offset: usize) -> f64 {
    match values.get(sf_offset) {
        Some(&SF_NOT_IMPLEMENTED) | None => f64::NAN,
        Some(&sf) => 10f64.powi(i32::from(sf as i16)),
    }
}

/// Decode a 16, 32 or 64-bit integer point scaled by the factor at `sf_offset`
///
/// Not-implemented sentinels decode as NaN: `0x8000..` for signed points,
/// all ones for unsigned ones.
pub fn scaled_value(
    values: &[u16],
    offset: usize,
    size: usize,
    sf_offset: usize,
    signed: bool,
) -> f64 {
    let scale = scale_factor(values, sf_offset);
    if !scale.is_finite() {
        return f64::NAN;
    }
    let Some(words) = values.get(offset..offset + size) else {
        return f64::NAN;
    };
    let raw = words
        .iter()
        .fold(0u64, |acc, &w| (acc << 16) | u64::from(w));
    let bits = 16 * size as u32;
    let sign_bit = 1u64 << (bits - 1);
    let all_ones = if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    };

    let value = if signed {
        if raw == sign_bit {
            return f64::NAN;
        }
        // Sign-extend to 64 bits
        let shift = 64 - bits;
        ((raw << shift) as i64 >> shift) as f64
    } else {
        if raw == all_ones {
            return f64::NAN;
        }
        raw as f64
    };
    value * scale
}

/// Big-endian IEEE 754 float at `offset`, NaN when out of range
pub fn float_value(values: &[u16], offset: usize) -> f64 {
    values
        .get(offset..offset + 2)
        .and_then(|words| decode_32bit_float(words).ok())
        .map_or(f64::NAN, f64::from)
}

/// String of `len` registers at `offset`, NULs stripped
pub fn string_value(values: &[u16], offset: usize, len: usize) -> String {
    let end = (offset + len).min(values.len());
    values
        .get(offset..end)
        .map(decode_string)
        .unwrap_or_default()
}
