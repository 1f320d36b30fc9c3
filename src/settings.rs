//! Persistent settings store
//!
//! Holds the global scan settings and one record per inverter (phase,
//! position, name, activation and energy baseline). The file is JSON and is
//! replaced atomically on every save.

use crate::device::{InverterPhase, InverterPosition, sanitize_id};
use crate::error::{HeliosError, Result};
use crate::logging::{StructuredLogger, get_logger};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Number of load attempts before falling back to defaults
pub const LOAD_ATTEMPTS: u32 = 5;

/// Delay between load attempts
pub const LOAD_RETRY_DELAY: Duration = Duration::from_secs(1);

/// First device instance handed out to an inverter
pub const FIRST_DEVICE_INSTANCE: u32 = 20;

/// Scan settings shared by all devices
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Hosts entered by the user, probed first
    pub ip_addresses: Vec<String>,

    /// Hosts where an inverter was found before
    pub known_ip_addresses: Vec<String>,

    /// Solar API port override
    pub port_number: Option<u16>,

    /// Subnet scan override
    pub auto_scan: Option<bool>,
}

/// Per-inverter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InverterSettings {
    pub phase: InverterPhase,
    pub position: InverterPosition,
    pub custom_name: String,
    pub is_active: bool,

    /// Energy baseline per phase (kWh)
    pub l1_energy: Option<f64>,
    pub l2_energy: Option<f64>,
    pub l3_energy: Option<f64>,

    pub device_instance: u32,
}

impl Default for InverterSettings {
    fn default() -> Self {
        Self {
            phase: InverterPhase::default(),
            position: InverterPosition::default(),
            custom_name: String::new(),
            is_active: true,
            l1_energy: None,
            l2_energy: None,
            l3_energy: None,
            device_instance: FIRST_DEVICE_INSTANCE,
        }
    }
}

impl InverterSettings {
    /// Baseline as an array, NaN where unknown
    pub fn energy_baseline(&self) -> [f64; 3] {
        [self.l1_energy, self.l2_energy, self.l3_energy].map(|e| e.unwrap_or(f64::NAN))
    }
}

/// On-disk layout
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsData {
    pub global: GlobalSettings,
    pub inverters: BTreeMap<String, InverterSettings>,
}

/// Settings key of an inverter: `I` followed by the sanitised unique id
pub fn settings_key(unique_id: &str) -> String {
    format!("I{}", sanitize_id(unique_id))
}

/// Settings manager
pub struct SettingsStore {
    file_path: PathBuf,
    data: SettingsData,
    dirty: bool,
    logger: StructuredLogger,
}

impl SettingsStore {
    /// Create an empty store backed by `file_path`
    pub fn new(file_path: impl AsRef<Path>) -> Self {
        Self {
            file_path: file_path.as_ref().to_path_buf(),
            data: SettingsData::default(),
            dirty: false,
            logger: get_logger("settings"),
        }
    }

    /// Open the store, retrying unreadable files before using defaults
    pub async fn open(file_path: impl AsRef<Path>, attempts: u32, delay: Duration) -> Self {
        let mut store = Self::new(file_path);
        for attempt in 1..=attempts.max(1) {
            match store.load() {
                Ok(()) => return store,
                Err(e) => {
                    store.logger.warn(&format!(
                        "Failed to load settings (attempt {}/{}): {}",
                        attempt, attempts, e
                    ));
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        store
            .logger
            .warn("Settings unavailable, continuing with defaults");
        // Make the next save recreate the file
        store.dirty = true;
        store
    }

    /// Load state from disk. A missing file leaves the defaults in place.
    pub fn load(&mut self) -> Result<()> {
        if !self.file_path.exists() {
            self.logger.info("No settings file found, using defaults");
            return Ok(());
        }
        let contents = std::fs::read_to_string(&self.file_path)?;
        self.data = serde_json::from_str(&contents)?;
        self.dirty = false;
        self.logger.info(&format!(
            "Loaded settings for {} inverter(s)",
            self.data.inverters.len()
        ));
        Ok(())
    }

    /// Write to a temporary file and rename it over the old one
    pub fn save(&mut self) -> Result<()> {
        if let Some(parent) = self.file_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.data)?;
        let tmp = self.file_path.with_extension("json.tmp");
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.file_path)?;
        self.dirty = false;
        self.logger.debug("Saved settings to disk");
        Ok(())
    }

    /// Save when something changed since the last successful save
    pub fn save_if_dirty(&mut self) -> Result<()> {
        if self.dirty { self.save() } else { Ok(()) }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn data(&self) -> &SettingsData {
        &self.data
    }

    pub fn global(&self) -> &GlobalSettings {
        &self.data.global
    }

    pub fn update_global(&mut self, f: impl FnOnce(&mut GlobalSettings)) {
        let before = self.data.global.clone();
        f(&mut self.data.global);
        if self.data.global != before {
            self.dirty = true;
        }
    }

    /// Remember a host an inverter was found on. Returns true if it is new.
    pub fn add_known_ip(&mut self, host: &str) -> bool {
        if self.data.global.known_ip_addresses.iter().any(|h| h == host) {
            return false;
        }
        self.data.global.known_ip_addresses.push(host.to_string());
        self.dirty = true;
        true
    }

    /// Settings of an inverter, created with a fresh device instance if unknown
    pub fn inverter(&mut self, unique_id: &str) -> &InverterSettings {
        let key = settings_key(unique_id);
        if !self.data.inverters.contains_key(&key) {
            let settings = InverterSettings {
                device_instance: self.next_device_instance(),
                ..InverterSettings::default()
            };
            self.logger.info(&format!(
                "New inverter {} gets device instance {}",
                key, settings.device_instance
            ));
            self.data.inverters.insert(key.clone(), settings);
            self.dirty = true;
        }
        &self.data.inverters[&key]
    }

    /// Settings of an inverter without creating them
    pub fn get_inverter(&self, unique_id: &str) -> Option<&InverterSettings> {
        self.data.inverters.get(&settings_key(unique_id))
    }

    /// Modify the settings of an inverter, creating them if needed
    pub fn update_inverter(
        &mut self,
        unique_id: &str,
        f: impl FnOnce(&mut InverterSettings),
    ) -> InverterSettings {
        self.inverter(unique_id);
        let key = settings_key(unique_id);
        let mut updated = self.data.inverters[&key].clone();
        f(&mut updated);
        if updated != self.data.inverters[&key] {
            self.data.inverters.insert(key, updated.clone());
            self.dirty = true;
        }
        updated
    }

    /// Store the per-phase energy baseline; only normal numbers are kept
    pub fn store_energy(&mut self, unique_id: &str, energy: [f64; 3]) {
        self.update_inverter(unique_id, |s| {
            let slots = [&mut s.l1_energy, &mut s.l2_energy, &mut s.l3_energy];
            for (slot, value) in slots.into_iter().zip(energy) {
                if value.is_normal() {
                    *slot = Some(value);
                }
            }
        });
    }

    pub fn set_custom_name(&mut self, unique_id: &str, name: &str) -> Result<()> {
        if name.len() > 64 {
            return Err(HeliosError::validation(
                "custom_name",
                "must be at most 64 characters",
            ));
        }
        self.update_inverter(unique_id, |s| s.custom_name = name.to_string());
        Ok(())
    }

    fn next_device_instance(&self) -> u32 {
        let mut instance = FIRST_DEVICE_INSTANCE;
        while self
            .data
            .inverters
            .values()
            .any(|s| s.device_instance == instance)
        {
            instance += 1;
        }
        instance
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_sanitised() {
        assert_eq!(settings_key("102_28.1-3"), "I102_28_1_3");
    }

    #[test]
    fn device_instances_are_allocated_upward() {
        let mut store = SettingsStore::new("/nonexistent/helios.json");
        assert_eq!(store.inverter("a").device_instance, 20);
        assert_eq!(store.inverter("b").device_instance, 21);
        assert_eq!(store.inverter("a").device_instance, 20);
        assert!(store.is_dirty());
    }

    #[test]
    fn energy_keeps_only_normal_values() {
        let mut store = SettingsStore::new("/nonexistent/helios.json");
        store.store_energy("x", [1.5, f64::NAN, 0.0]);
        let s = store.get_inverter("x").unwrap();
        assert_eq!(s.l1_energy, Some(1.5));
        assert_eq!(s.l2_energy, None);
        assert_eq!(s.l3_energy, None);
        assert!(s.energy_baseline()[1].is_nan());
    }

    #[test]
    fn unchanged_update_is_not_dirty() {
        let mut store = SettingsStore::new("/nonexistent/helios.json");
        store.inverter("x");
        store.dirty = false;
        store.update_inverter("x", |s| s.is_active = true);
        assert!(!store.is_dirty());
        assert!(!store.add_known_ip("10.0.0.1") || store.is_dirty());
    }

    #[test]
    fn long_custom_name_rejected() {
        let mut store = SettingsStore::new("/nonexistent/helios.json");
        assert!(store.set_custom_name("x", &"n".repeat(65)).is_err());
    }
}
