//! Bus tree of one PV inverter

use tokio::sync::mpsc;

use crate::device::{InverterPhase, InverterPosition, sanitize_id};
use crate::error::Result;
use crate::polling::{InverterSnapshot, UpdaterCommand};

use super::service::DbusService;
use super::shared::BusWrite;
use super::util::{TextFormat, as_number};

pub const PROCESS_NAME: &str = "helios";

/// A published path: how to read it from a snapshot and how to render it
pub struct InverterPath {
    pub path: &'static str,
    pub format: TextFormat,
    pub writable: bool,
    pub value: fn(&InverterSnapshot) -> serde_json::Value,
}

const NONE: TextFormat = TextFormat::new("", 0);
const AMPS: TextFormat = TextFormat::new("A", 1);
const VOLTS: TextFormat = TextFormat::new("V", 0);
const WATTS: TextFormat = TextFormat::new("W", 0);
const KWH: TextFormat = TextFormat::new("kWh", 2);

/// NaN is published as invalid
fn number(v: f64) -> serde_json::Value {
    if v.is_finite() {
        serde_json::json!(v)
    } else {
        serde_json::Value::Null
    }
}

fn code(v: Option<i32>) -> serde_json::Value {
    v.map_or(serde_json::Value::Null, |c| serde_json::json!(c))
}

const fn item(
    path: &'static str,
    format: TextFormat,
    value: fn(&InverterSnapshot) -> serde_json::Value,
) -> InverterPath {
    InverterPath {
        path,
        format,
        writable: false,
        value,
    }
}

const fn setting(
    path: &'static str,
    format: TextFormat,
    value: fn(&InverterSnapshot) -> serde_json::Value,
) -> InverterPath {
    InverterPath {
        path,
        format,
        writable: true,
        value,
    }
}

pub static INVERTER_PATHS: &[InverterPath] = &[
    item("/Connected", NONE, |s| serde_json::json!(i32::from(s.connected))),
    item("/StatusCode", NONE, |s| code(s.status_code)),
    item("/ErrorCode", NONE, |s| code(s.error_code)),
    item("/Ac/Power", WATTS, |s| number(s.mean.power)),
    item("/Ac/Current", AMPS, |s| number(s.mean.current)),
    item("/Ac/Voltage", VOLTS, |s| number(s.mean.voltage)),
    item("/Ac/Energy/Forward", KWH, |s| number(s.mean.energy)),
    item("/Ac/L1/Current", AMPS, |s| number(s.phases[0].current)),
    item("/Ac/L1/Voltage", VOLTS, |s| number(s.phases[0].voltage)),
    item("/Ac/L1/Power", WATTS, |s| number(s.phases[0].power)),
    item("/Ac/L1/Energy/Forward", KWH, |s| number(s.phases[0].energy)),
    item("/Ac/L2/Current", AMPS, |s| number(s.phases[1].current)),
    item("/Ac/L2/Voltage", VOLTS, |s| number(s.phases[1].voltage)),
    item("/Ac/L2/Power", WATTS, |s| number(s.phases[1].power)),
    item("/Ac/L2/Energy/Forward", KWH, |s| number(s.phases[1].energy)),
    item("/Ac/L3/Current", AMPS, |s| number(s.phases[2].current)),
    item("/Ac/L3/Voltage", VOLTS, |s| number(s.phases[2].voltage)),
    item("/Ac/L3/Power", WATTS, |s| number(s.phases[2].power)),
    item("/Ac/L3/Energy/Forward", KWH, |s| number(s.phases[2].energy)),
    setting("/Ac/PowerLimit", WATTS, |s| number(s.power_limit)),
    item("/Ac/MaxPower", WATTS, |s| number(s.max_power_limit)),
    item("/ProductName", NONE, |s| serde_json::json!(s.info.product_name)),
    item("/ProductId", NONE, |s| serde_json::json!(s.info.product_id)),
    item("/Serial", NONE, |s| {
        if s.info.serial_number.is_empty() {
            serde_json::json!(s.info.unique_id)
        } else {
            serde_json::json!(s.info.serial_number)
        }
    }),
    item("/FirmwareVersion", NONE, |s| serde_json::json!(s.info.firmware_version)),
    item("/DataManagerVersion", NONE, |s| {
        serde_json::json!(s.info.data_manager_version)
    }),
    setting("/Position", NONE, |s| serde_json::json!(i32::from(s.position))),
    setting("/Phase", NONE, |s| serde_json::json!(i32::from(s.phase))),
    setting("/CustomName", NONE, |s| serde_json::json!(s.custom_name)),
    item("/FroniusDeviceType", NONE, |s| serde_json::json!(s.info.device_type)),
    item("/DeviceInstance", NONE, |s| serde_json::json!(s.device_instance)),
    item("/Mgmt/ProcessName", NONE, |_| serde_json::json!(PROCESS_NAME)),
    item("/Mgmt/ProcessVersion", NONE, |_| serde_json::json!(env!("APP_VERSION"))),
    item("/Mgmt/Connection", NONE, |s| {
        serde_json::json!(format!(
            "{} - {} ({})",
            s.info.host, s.info.unit_id, s.info.protocol
        ))
    }),
];

pub fn inverter_service_name(unique_id: &str) -> String {
    format!("com.victronenergy.pvinverter.pv_{}", sanitize_id(unique_id))
}

/// Build the (not yet started) service of an inverter with every path of
/// `INVERTER_PATHS` declared
pub async fn inverter_service(
    snapshot: &InverterSnapshot,
) -> Result<(DbusService, mpsc::UnboundedReceiver<BusWrite>)> {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let mut service = DbusService::new(inverter_service_name(&snapshot.info.unique_id), writes_tx)?;
    for entry in INVERTER_PATHS {
        service
            .ensure_item(entry.path, (entry.value)(snapshot), entry.format, entry.writable)
            .await?;
    }
    Ok((service, writes_rx))
}

pub async fn publish_snapshot(
    service: &mut DbusService,
    snapshot: &InverterSnapshot,
) -> Result<()> {
    service
        .update_paths(
            INVERTER_PATHS
                .iter()
                .map(|entry| (entry.path.to_string(), (entry.value)(snapshot))),
        )
        .await
}

/// Session command for a bus write, `None` for unusable values
pub fn command_for_write(write: &BusWrite) -> Option<UpdaterCommand> {
    match write.path.as_str() {
        "/Ac/PowerLimit" => as_number(&write.value).map(UpdaterCommand::SetPowerLimit),
        "/CustomName" => write
            .value
            .as_str()
            .map(|name| UpdaterCommand::SetCustomName(name.to_string())),
        "/Position" => as_number(&write.value)
            .and_then(|p| InverterPosition::try_from(p as i32).ok())
            .map(UpdaterCommand::SetPosition),
        "/Phase" => as_number(&write.value)
            .and_then(|p| InverterPhase::try_from(p as i32).ok())
            .map(UpdaterCommand::SetPhase),
        _ => None,
    }
}
