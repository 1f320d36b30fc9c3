use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use zbus::Connection;
use zbus::zvariant::OwnedObjectPath;

use super::util::TextFormat;

/// A `SetValue` accepted on a writable path
#[derive(Debug, Clone, PartialEq)]
pub struct BusWrite {
    pub path: String,
    pub value: serde_json::Value,
}

pub struct DbusSharedState {
    pub(crate) paths: HashMap<String, serde_json::Value>,
    pub(crate) formats: HashMap<String, TextFormat>,
    pub(crate) writable: HashSet<String>,
    pub(crate) writes_tx: mpsc::UnboundedSender<BusWrite>,
    pub(crate) connection: Option<Connection>,
    pub(crate) root_path: OwnedObjectPath,
}

impl DbusSharedState {
    pub fn new(writes_tx: mpsc::UnboundedSender<BusWrite>, root_path: OwnedObjectPath) -> Self {
        Self {
            paths: HashMap::new(),
            formats: HashMap::new(),
            writable: HashSet::new(),
            writes_tx,
            connection: None,
            root_path,
        }
    }

    pub(crate) fn format_of(&self, path: &str) -> TextFormat {
        self.formats.get(path).copied().unwrap_or_default()
    }
}

/// Lock the shared tree; a poisoned lock still holds consistent path values
pub(crate) fn lock(shared: &Arc<Mutex<DbusSharedState>>) -> MutexGuard<'_, DbusSharedState> {
    shared.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
