//! # Helios - PV inverter bridge for Victron Venus OS
//!
//! Discovers photovoltaic inverters on the local network (and optionally on
//! a serial Modbus link), polls them over SunSpec Modbus or the Fronius
//! Solar API and publishes their measurements on D-Bus as standard
//! `pvinverter` services.
//!
//! ## Architecture
//!
//! - `modbus`: Modbus TCP and RTU clients with a shared transport trait
//! - `sunspec`: SunSpec model walker and telemetry decoding
//! - `solar_api`: Fronius Solar API HTTP client
//! - `discovery`: candidate addresses, probes and the device registry
//! - `polling`: per-device state machines, retries and power limiting
//! - `energy`: per-phase energy reconstruction
//! - `settings`: persisted per-device settings
//! - `dbus`: D-Bus export for Venus OS
//! - `config`, `logging`, `error`: ambient plumbing

pub mod config;
pub mod dbus;
pub mod device;
pub mod discovery;
pub mod energy;
pub mod error;
pub mod logging;
pub mod modbus;
pub mod polling;
pub mod settings;
pub mod solar_api;
pub mod sunspec;

// Re-export commonly used types
pub use config::Config;
pub use device::{DeviceInfo, DeviceKey, ProtocolType};
pub use error::{HeliosError, Result};
