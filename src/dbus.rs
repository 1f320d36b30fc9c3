//! D-Bus integration for Venus OS compatibility
//!
//! Every inverter with a running session gets its own
//! `com.victronenergy.pvinverter.pv_{unique_id}` service holding a VeDbus
//! style BusItem tree. A gateway service reports scan progress and accepts
//! rescan requests.

mod exporter;
mod gateway;
mod inverter;
mod items;
mod root;
mod service;
mod shared;
mod util;

pub use exporter::BusExporter;
pub use gateway::{
    AUTO_DETECT, GATEWAY_SERVICE_NAME, SCAN_PROGRESS, gateway_service, publish_status,
};
pub use inverter::{
    INVERTER_PATHS, InverterPath, command_for_write, inverter_service, inverter_service_name,
    publish_snapshot,
};
pub use service::DbusService;
pub use shared::BusWrite;
pub use util::TextFormat;
