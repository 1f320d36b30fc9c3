use serde::{Deserialize, Serialize};

/// One entry of `GetInverterInfo.cgi`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InverterInfo {
    /// Solar API device id (the key of `Body/Data`)
    pub id: i32,
    /// Fronius device type (`DT`)
    pub device_type: i32,
    pub unique_id: String,
    pub custom_name: String,
    pub error_code: i32,
    pub status_code: i32,
}

/// `CommonInverterData` collection. Energy values are in Wh; absent numbers are NaN.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonInverterData {
    pub ac_power: f64,
    pub ac_current: f64,
    pub ac_voltage: f64,
    pub ac_frequency: f64,
    pub dc_current: f64,
    pub dc_voltage: f64,
    pub day_energy: f64,
    pub year_energy: f64,
    pub total_energy: f64,
    pub status_code: Option<i32>,
    pub error_code: Option<i32>,
}

impl Default for CommonInverterData {
    fn default() -> Self {
        Self {
            ac_power: f64::NAN,
            ac_current: f64::NAN,
            ac_voltage: f64::NAN,
            ac_frequency: f64::NAN,
            dc_current: f64::NAN,
            dc_voltage: f64::NAN,
            day_energy: f64::NAN,
            year_energy: f64::NAN,
            total_energy: f64::NAN,
            status_code: None,
            error_code: None,
        }
    }
}

/// `3PInverterData` collection, indexed L1..L3
#[derive(Debug, Clone, PartialEq)]
pub struct ThreePhaseData {
    pub ac_current: [f64; 3],
    pub ac_voltage: [f64; 3],
}

impl Default for ThreePhaseData {
    fn default() -> Self {
        Self {
            ac_current: [f64::NAN; 3],
            ac_voltage: [f64::NAN; 3],
        }
    }
}

/// `CumulationInverterData` and system scope data; energy in Wh
#[derive(Debug, Clone, PartialEq)]
pub struct CumulationData {
    pub ac_power: f64,
    pub day_energy: f64,
    pub year_energy: f64,
    pub total_energy: f64,
}

impl Default for CumulationData {
    fn default() -> Self {
        Self {
            ac_power: f64::NAN,
            day_energy: f64::NAN,
            year_energy: f64::NAN,
            total_energy: f64::NAN,
        }
    }
}
