//! Devices the gateway currently manages

use crate::device::{DeviceInfo, DeviceKey};
use crate::polling::SessionHandle;
use std::collections::BTreeMap;

pub struct RegistryEntry {
    pub info: DeviceInfo,
    pub connected: bool,
    /// `None` for inactive devices and while a session is being started
    pub session: Option<SessionHandle>,
}

/// Result of offering a freshly detected device to the registry
pub enum Registration {
    /// Same device at the same address, or a downgrade that was refused
    Unchanged,
    Added,
    /// Known device at a new address; the previous entry must be shut down
    Moved { previous: RegistryEntry },
    /// New device took the address of another; the old one must be shut down
    Replaced { previous: RegistryEntry },
}

#[derive(Default)]
pub struct DeviceRegistry {
    entries: BTreeMap<DeviceKey, RegistryEntry>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&DeviceKey, &RegistryEntry)> {
        self.entries.iter()
    }

    /// A device at `host` / `unit` already has an entry
    pub fn is_managed(&self, host: &str, unit: u8) -> bool {
        self.entries
            .values()
            .any(|e| e.info.host == host && e.info.unit_id == unit)
    }

    pub fn has_host(&self, host: &str) -> bool {
        self.entries.values().any(|e| e.info.host == host)
    }

    /// Apply the mediation rules to a detected device
    pub fn register(&mut self, info: DeviceInfo) -> Registration {
        let key = info.key();
        if let Some(entry) = self.entries.get(&key) {
            if entry.info.same_address(&info) {
                return Registration::Unchanged;
            }
            if entry.info.protocol.is_sunspec() && !info.protocol.is_sunspec() {
                return Registration::Unchanged;
            }
            let previous = self.entries.remove(&key);
            self.insert(info);
            return match previous {
                Some(previous) => Registration::Moved { previous },
                None => Registration::Added,
            };
        }

        let occupant = self
            .entries
            .iter()
            .find(|(_, e)| e.info.same_address(&info))
            .map(|(k, _)| k.clone());
        self.insert(info);
        match occupant.and_then(|k| self.entries.remove(&k)) {
            Some(previous) => Registration::Replaced { previous },
            None => Registration::Added,
        }
    }

    fn insert(&mut self, info: DeviceInfo) {
        self.entries.insert(
            info.key(),
            RegistryEntry {
                info,
                connected: true,
                session: None,
            },
        );
    }

    /// Attach a running session. Returns the session back if the entry is gone.
    pub fn attach_session(
        &mut self,
        key: &DeviceKey,
        session: SessionHandle,
    ) -> Option<SessionHandle> {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.session = Some(session);
                None
            }
            None => Some(session),
        }
    }

    pub fn set_connected(&mut self, key: &DeviceKey, connected: bool) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.connected = connected;
        }
    }

    pub fn remove(&mut self, key: &DeviceKey) -> Option<RegistryEntry> {
        self.entries.remove(key)
    }

    /// Take every entry out, for shutdown
    pub fn drain(&mut self) -> Vec<RegistryEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}
