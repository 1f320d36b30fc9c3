//! Fronius Solar API (v1) HTTP client
//!
//! Every reply is wrapped in a `Head/Status` + `Body/Data` envelope. The
//! envelope is checked by `parse_envelope`; the typed decoders below only
//! look at `Body/Data`.

mod types;

pub use types::{CommonInverterData, CumulationData, InverterInfo, ThreePhaseData};

use crate::error::{HeliosError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::Mutex;

const INVERTER_INFO_PATH: &str = "/solar_api/v1/GetInverterInfo.cgi";
const REALTIME_PATH: &str = "/solar_api/v1/GetInverterRealtimeData.cgi";

/// Client for one Fronius data manager
pub struct SolarApiClient {
    http: reqwest::Client,
    base_url: String,
    host: String,
    /// One outstanding request per data manager
    request_lock: Mutex<()>,
    logger: StructuredLogger,
}

impl SolarApiClient {
    /// Create a client with the default 5 s timeout
    pub fn new(host: &str, port: u16) -> Result<Self> {
        Self::with_timeout(host, port, Duration::from_secs(5))
    }

    pub fn with_timeout(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: format!("http://{}:{}", host, port),
            host: host.to_string(),
            request_lock: Mutex::new(()),
            logger: get_logger_with_context(
                LogContext::new("solar_api").with_location(format!("{}:{}", host, port)),
            ),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// List the inverters known to the data manager
    pub async fn get_inverter_info(&self) -> Result<Vec<InverterInfo>> {
        let data = self.get(INVERTER_INFO_PATH, &[]).await?;
        Ok(parse_inverter_info(&data))
    }

    pub async fn get_common_data(&self, device_id: i32) -> Result<CommonInverterData> {
        let data = self
            .get_device_collection(device_id, "CommonInverterData")
            .await?;
        Ok(parse_common_data(&data))
    }

    pub async fn get_three_phase_data(&self, device_id: i32) -> Result<ThreePhaseData> {
        let data = self
            .get_device_collection(device_id, "3PInverterData")
            .await?;
        Ok(parse_three_phase_data(&data))
    }

    pub async fn get_cumulation_data(&self, device_id: i32) -> Result<CumulationData> {
        let data = self
            .get_device_collection(device_id, "CumulationInverterData")
            .await?;
        Ok(parse_cumulation_data(&data))
    }

    /// Aggregate values over all inverters of the data manager
    ///
    /// With `Scope=System` every field is an object keyed by device id; the
    /// values are summed.
    pub async fn get_system_data(&self) -> Result<CumulationData> {
        let data = self.get(REALTIME_PATH, &[("Scope", "System")]).await?;
        Ok(parse_system_data(&data))
    }

    async fn get_device_collection(&self, device_id: i32, collection: &str) -> Result<Value> {
        let id = device_id.to_string();
        self.get(
            REALTIME_PATH,
            &[
                ("Scope", "Device"),
                ("DeviceId", id.as_str()),
                ("DataCollection", collection),
            ],
        )
        .await
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<Value> {
        let _guard = self.request_lock.lock().await;
        let url = format!("{}{}", self.base_url, path);
        self.logger.trace(&format!("GET {} {:?}", url, query));

        let resp = self
            .http
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| HeliosError::network(e.to_string()))?;
        let body = resp
            .text()
            .await
            .map_err(|e| HeliosError::network(e.to_string()))?;

        parse_envelope(&body).inspect_err(|e| {
            self.logger.debug(&format!("Solar API request failed: {}", e));
        })
    }
}

/// Walk a `/`-separated path through nested objects
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/').try_fold(value, |v, key| v.get(key))
}

fn number_at(data: &Value, path: &str) -> f64 {
    get_by_path(data, path)
        .and_then(Value::as_f64)
        .unwrap_or(f64::NAN)
}

fn int_at(data: &Value, path: &str) -> Option<i32> {
    get_by_path(data, path)
        .and_then(Value::as_i64)
        .and_then(|v| i32::try_from(v).ok())
}

/// Check `Head/Status` and return `Body/Data`
pub fn parse_envelope(body: &str) -> Result<Value> {
    let root: Value = serde_json::from_str(body).unwrap_or(Value::Null);
    let Some(status) = get_by_path(&root, "Head/Status") else {
        return Err(HeliosError::network("Reply message has no status"));
    };
    let Some(code) = status.get("Code").and_then(Value::as_i64) else {
        return Err(HeliosError::network("Reply message has no status"));
    };
    if code != 0 {
        let reason = status
            .get("Reason")
            .and_then(Value::as_str)
            .filter(|r| !r.is_empty())
            .map_or_else(|| format!("Solar API error code {}", code), str::to_string);
        return Err(HeliosError::api(reason));
    }
    Ok(get_by_path(&root, "Body/Data")
        .cloned()
        .unwrap_or(Value::Null))
}

pub fn parse_inverter_info(data: &Value) -> Vec<InverterInfo> {
    let Some(devices) = data.as_object() else {
        return Vec::new();
    };
    devices
        .iter()
        .filter_map(|(key, device)| {
            let id = key.trim().parse::<i32>().ok()?;
            let unique_id = match device.get("UniqueID") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => String::new(),
            };
            Some(InverterInfo {
                id,
                device_type: int_at(device, "DT").unwrap_or(0),
                unique_id,
                custom_name: device
                    .get("CustomName")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                error_code: int_at(device, "ErrorCode").unwrap_or(0),
                status_code: int_at(device, "StatusCode").unwrap_or(0),
            })
        })
        .collect()
}

pub fn parse_common_data(data: &Value) -> CommonInverterData {
    CommonInverterData {
        ac_power: number_at(data, "PAC/Value"),
        ac_current: number_at(data, "IAC/Value"),
        ac_voltage: number_at(data, "UAC/Value"),
        ac_frequency: number_at(data, "FAC/Value"),
        dc_current: number_at(data, "IDC/Value"),
        dc_voltage: number_at(data, "UDC/Value"),
        day_energy: number_at(data, "DAY_ENERGY/Value"),
        year_energy: number_at(data, "YEAR_ENERGY/Value"),
        total_energy: number_at(data, "TOTAL_ENERGY/Value"),
        status_code: int_at(data, "DeviceStatus/StatusCode"),
        error_code: int_at(data, "DeviceStatus/ErrorCode"),
    }
}

pub fn parse_three_phase_data(data: &Value) -> ThreePhaseData {
    ThreePhaseData {
        ac_current: ["IAC_L1", "IAC_L2", "IAC_L3"]
            .map(|k| number_at(data, &format!("{}/Value", k))),
        ac_voltage: ["UAC_L1", "UAC_L2", "UAC_L3"]
            .map(|k| number_at(data, &format!("{}/Value", k))),
    }
}

pub fn parse_cumulation_data(data: &Value) -> CumulationData {
    CumulationData {
        ac_power: number_at(data, "PAC/Value"),
        day_energy: number_at(data, "DAY_ENERGY/Value"),
        year_energy: number_at(data, "YEAR_ENERGY/Value"),
        total_energy: number_at(data, "TOTAL_ENERGY/Value"),
    }
}

pub fn parse_system_data(data: &Value) -> CumulationData {
    let sum = |field: &str| -> f64 {
        match get_by_path(data, &format!("{}/Values", field)).and_then(Value::as_object) {
            Some(values) if !values.is_empty() => values.values().filter_map(Value::as_f64).sum(),
            _ => number_at(data, &format!("{}/Value", field)),
        }
    };
    CumulationData {
        ac_power: sum("PAC"),
        day_energy: sum("DAY_ENERGY"),
        year_energy: sum("YEAR_ENERGY"),
        total_energy: sum("TOTAL_ENERGY"),
    }
}
