//! Shared data model for discovered inverters

use serde::{Deserialize, Serialize};
use std::fmt;

/// Victron product ids for PV inverters
pub mod product {
    pub const FRONIUS: u16 = 0xA142;
    pub const SMA: u16 = 0xA143;
    pub const SUNSPEC: u16 = 0xA144;
    pub const ABB: u16 = 0xA145;
    pub const SOLAREDGE: u16 = 0xA146;
}

/// Fronius Solar API unique id placeholder reported by some firmware (2^24 - 1)
pub const PLACEHOLDER_UNIQUE_ID: &str = "16777215";

/// Fronius device type reported by data managers with broken firmware
pub const BROKEN_DEVICE_TYPE: i32 = 255;

/// How telemetry is retrieved from a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    /// Fronius Solar API over HTTP
    SolarApi,
    /// SunSpec models 101..103 (integer values with scale factors)
    SunSpecIntSf,
    /// SunSpec models 111..113 (IEEE 754 floats)
    SunSpecFloat,
    /// SunSpec 2018 (IEEE 1547) model 701
    SunSpec2018,
}

impl ProtocolType {
    pub fn is_sunspec(self) -> bool {
        !matches!(self, ProtocolType::SolarApi)
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProtocolType::SolarApi => "solar_api",
            ProtocolType::SunSpecIntSf => "sunspec_int_sf",
            ProtocolType::SunSpecFloat => "sunspec_float",
            ProtocolType::SunSpec2018 => "sunspec_2018",
        };
        f.write_str(s)
    }
}

/// Phase a single-phase inverter is connected to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum InverterPhase {
    /// Multi-phase inverter, or a single-phase one wired split-phase
    MultiPhase = 0,
    #[default]
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl InverterPhase {
    /// Zero-based phase index, `None` for multi-phase
    pub fn index(self) -> Option<usize> {
        match self {
            InverterPhase::MultiPhase => None,
            InverterPhase::L1 => Some(0),
            InverterPhase::L2 => Some(1),
            InverterPhase::L3 => Some(2),
        }
    }
}

impl From<InverterPhase> for i32 {
    fn from(p: InverterPhase) -> Self {
        p as i32
    }
}

impl TryFrom<i32> for InverterPhase {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(InverterPhase::MultiPhase),
            1 => Ok(InverterPhase::L1),
            2 => Ok(InverterPhase::L2),
            3 => Ok(InverterPhase::L3),
            other => Err(format!("invalid phase: {}", other)),
        }
    }
}

/// Where the inverter is connected relative to the Multi/Quattro
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum InverterPosition {
    #[default]
    Input1 = 0,
    Output = 1,
    Input2 = 2,
}

impl From<InverterPosition> for i32 {
    fn from(p: InverterPosition) -> Self {
        p as i32
    }
}

impl TryFrom<i32> for InverterPosition {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        match v {
            0 => Ok(InverterPosition::Input1),
            1 => Ok(InverterPosition::Output),
            2 => Ok(InverterPosition::Input2),
            other => Err(format!("invalid position: {}", other)),
        }
    }
}

/// Descriptor of a discovered device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub host: String,
    pub port: u16,
    /// Modbus unit id, or the Solar API device id
    pub unit_id: u8,
    pub unique_id: String,
    pub product_id: u16,
    pub product_name: String,
    /// Fronius `DT`, 0 when unknown
    pub device_type: i32,
    pub phase_count: u8,
    pub protocol: ProtocolType,
    /// Register of the inverter model header (SunSpec only)
    pub inverter_model_offset: u16,
    /// Register of the immediate-control model header, 0 if absent
    pub control_offset: u16,
    /// 123 or 704, 0 if absent
    pub control_model: u16,
    /// Max rated power in W, NaN when unknown
    pub max_power: f64,
    /// Storage capacity in Wh, NaN when unknown
    pub storage_capacity: f64,
    /// Scale applied to a 0..1 limit fraction, 0 when limiting is unsupported
    pub power_limit_scale: f64,
    pub firmware_version: String,
    pub serial_number: String,
    pub data_manager_version: String,
}

impl DeviceInfo {
    pub fn new(host: impl Into<String>, port: u16, unit_id: u8) -> Self {
        Self {
            host: host.into(),
            port,
            unit_id,
            unique_id: String::new(),
            product_id: 0,
            product_name: String::new(),
            device_type: 0,
            phase_count: 0,
            protocol: ProtocolType::SolarApi,
            inverter_model_offset: 0,
            control_offset: 0,
            control_model: 0,
            max_power: f64::NAN,
            storage_capacity: f64::NAN,
            power_limit_scale: 0.0,
            firmware_version: String::new(),
            serial_number: String::new(),
            data_manager_version: String::new(),
        }
    }

    /// Settings and registry key
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            unique_id: self.unique_id.clone(),
            product_id: self.product_id,
        }
    }

    /// "host:unit" location used for logging and registry lookups
    pub fn location(&self) -> String {
        format!("{}:{}", self.host, self.unit_id)
    }

    pub fn same_address(&self, other: &DeviceInfo) -> bool {
        self.host == other.host && self.port == other.port && self.unit_id == other.unit_id
    }
}

/// Stable identity of a device across reconnects
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    pub unique_id: String,
    pub product_id: u16,
}

/// Map a SunSpec manufacturer string to a product id
pub fn product_id_for_manufacturer(manufacturer: &str) -> u16 {
    match manufacturer {
        "Fronius" => product::FRONIUS,
        "SMA" => product::SMA,
        "ABB" | "FIMER" => product::ABB,
        m if m.starts_with("SolarEdge") => product::SOLAREDGE,
        _ => product::SUNSPEC,
    }
}

/// Replace every character outside `[A-Za-z0-9_]` with `_`
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Normalise a Fronius unique id into `{device_type}_{id}`
///
/// Non-alphanumeric characters become `_`. An id without any alphanumeric
/// character is replaced by `T{device_id}`.
pub fn fix_unique_id(device_type: i32, unique_id: &str, device_id: i32) -> String {
    let body = if unique_id.chars().any(|c| c.is_ascii_alphanumeric()) {
        sanitize_id(unique_id)
    } else {
        format!("T{}", device_id)
    };
    format!("{}_{}", device_type, body)
}

/// Electrical values of one phase, or the aggregate. NaN means unknown.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PhaseMeasurement {
    pub current: f64,
    pub voltage: f64,
    pub power: f64,
    /// Cumulative forward energy in kWh
    pub energy: f64,
}

impl Default for PhaseMeasurement {
    fn default() -> Self {
        Self {
            current: f64::NAN,
            voltage: f64::NAN,
            power: f64::NAN,
            energy: f64::NAN,
        }
    }
}

impl PhaseMeasurement {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
