use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

use super::shared::{BusWrite, DbusSharedState, lock};
use super::util::{as_number, format_text_value, from_owned_value, text_value, to_owned_value};

/// VeDbus-style BusItem implementing com.victronenergy.BusItem
pub struct BusItem {
    pub(crate) path: String,
    pub(crate) shared: Arc<Mutex<DbusSharedState>>,
}

impl BusItem {
    pub fn new(path: String, shared: Arc<Mutex<DbusSharedState>>) -> Self {
        Self { path, shared }
    }

    /// Coerce a written value to the type currently held by the path.
    /// Returns `None` when the value cannot be represented.
    fn normalize(
        current: Option<&serde_json::Value>,
        value: serde_json::Value,
    ) -> Option<serde_json::Value> {
        match current {
            Some(serde_json::Value::String(_)) => match value {
                serde_json::Value::String(_) => Some(value),
                serde_json::Value::Number(n) => Some(serde_json::json!(n.to_string())),
                _ => None,
            },
            _ => match value {
                serde_json::Value::String(ref s) if s.is_empty() => Some(serde_json::Value::Null),
                serde_json::Value::Null => Some(serde_json::Value::Null),
                other => as_number(&other).map(|f| {
                    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
                        serde_json::json!(f as i64)
                    } else {
                        serde_json::json!(f)
                    }
                }),
            },
        }
    }

    fn change_entry(value: &serde_json::Value, text: &str) -> HashMap<&'static str, OwnedValue> {
        let mut entry = HashMap::new();
        entry.insert("Value", to_owned_value(value));
        entry.insert("Text", text_value(text));
        entry
    }
}

#[zbus::interface(name = "com.victronenergy.BusItem")]
impl BusItem {
    #[zbus(name = "GetValue")]
    async fn get_value(&self) -> OwnedValue {
        let shared = lock(&self.shared);
        to_owned_value(shared.paths.get(&self.path).unwrap_or(&serde_json::Value::Null))
    }

    /// 0 on success, 1 when the path is read-only or the value is unusable
    #[zbus(name = "SetValue")]
    async fn set_value(&self, value: OwnedValue) -> i32 {
        let (conn_opt, root_path, normalized, text) = {
            let mut shared = lock(&self.shared);
            if !shared.writable.contains(&self.path) {
                return 1;
            }
            let Some(normalized) =
                Self::normalize(shared.paths.get(&self.path), from_owned_value(&value))
            else {
                return 1;
            };
            shared.paths.insert(self.path.clone(), normalized.clone());
            let write = BusWrite {
                path: self.path.clone(),
                value: normalized.clone(),
            };
            let _ = shared.writes_tx.send(write);
            let text = format_text_value(&normalized, shared.format_of(&self.path));
            (
                shared.connection.clone(),
                shared.root_path.clone(),
                normalized,
                text,
            )
        };

        if let Some(conn) = conn_opt {
            if let Ok(obj_path) = OwnedObjectPath::try_from(self.path.as_str())
                && let Ok(item_ctx) = SignalEmitter::new(&conn, obj_path)
            {
                let _ = BusItem::properties_changed(
                    &item_ctx,
                    Self::change_entry(&normalized, &text),
                )
                .await;
            }
            if let Ok(root_ctx) = SignalEmitter::new(&conn, root_path) {
                let mut outer: HashMap<&str, HashMap<&str, OwnedValue>> = HashMap::new();
                outer.insert(self.path.as_str(), Self::change_entry(&normalized, &text));
                let _ = super::root::RootBus::items_changed(&root_ctx, outer).await;
            }
        }
        0
    }

    #[zbus(name = "GetText")]
    async fn get_text(&self) -> String {
        let shared = lock(&self.shared);
        let value = shared.paths.get(&self.path).cloned().unwrap_or_default();
        format_text_value(&value, shared.format_of(&self.path))
    }

    #[zbus(signal)]
    pub async fn properties_changed(
        ctxt: &SignalEmitter<'_>,
        changes: HashMap<&str, OwnedValue>,
    ) -> zbus::Result<()>;
}
