//! Gateway service: scan control and progress

use tokio::sync::mpsc;

use crate::discovery::ScanStatus;
use crate::error::Result;

use super::inverter::PROCESS_NAME;
use super::service::DbusService;
use super::shared::BusWrite;
use super::util::{TextFormat, as_number};

pub const GATEWAY_SERVICE_NAME: &str = "com.victronenergy.fronius";

pub const AUTO_DETECT: &str = "/AutoDetect";
pub const SCAN_PROGRESS: &str = "/ScanProgress";

pub async fn gateway_service() -> Result<(DbusService, mpsc::UnboundedReceiver<BusWrite>)> {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let mut service = DbusService::new(GATEWAY_SERVICE_NAME, writes_tx)?;
    service
        .ensure_item(AUTO_DETECT, serde_json::json!(0), TextFormat::default(), true)
        .await?;
    service
        .ensure_item(SCAN_PROGRESS, serde_json::json!(0), TextFormat::new("%", 0), false)
        .await?;
    service
        .ensure_item(
            "/Mgmt/ProcessName",
            serde_json::json!(PROCESS_NAME),
            TextFormat::default(),
            false,
        )
        .await?;
    service
        .ensure_item(
            "/Mgmt/ProcessVersion",
            serde_json::json!(env!("APP_VERSION")),
            TextFormat::default(),
            false,
        )
        .await?;
    Ok((service, writes_rx))
}

pub async fn publish_status(service: &mut DbusService, status: &ScanStatus) -> Result<()> {
    service
        .update_paths([
            (AUTO_DETECT.to_string(), serde_json::json!(i32::from(status.scanning))),
            (SCAN_PROGRESS.to_string(), serde_json::json!(status.progress)),
        ])
        .await
}

/// True when a write asks for a new scan
pub fn is_rescan_request(write: &BusWrite) -> bool {
    write.path == AUTO_DETECT && as_number(&write.value).is_some_and(|v| v != 0.0)
}
