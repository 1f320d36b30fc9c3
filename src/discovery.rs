//! Device discovery
//!
//! Candidate hosts come from the priority list, the local subnets and UDP
//! broadcast replies. Every candidate is probed over the Solar API and
//! SunSpec; detected devices are reconciled in the `DeviceRegistry` and get
//! a polling session.

mod addresses;
mod detector;
mod orchestrator;
mod registry;
mod udp;

pub use addresses::{AddressGenerator, Subnet, local_subnets};
pub use detector::{DIRECT_PROBE_UNITS, DeviceDetector, ProbeSettings};
pub use orchestrator::{
    DeviceEvent, Orchestrator, OrchestratorHandle, RtuLink, ScanStatus,
};
pub use registry::{DeviceRegistry, Registration, RegistryEntry};
pub use udp::UdpProbe;
