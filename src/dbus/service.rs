use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use zbus::object_server::SignalEmitter;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{Connection, Result as ZbusResult, names::WellKnownName};

use crate::error::{HeliosError, Result};
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};

use super::items::BusItem;
use super::root::{RootBus, TreeNode};
use super::shared::{BusWrite, DbusSharedState, lock};
use super::util::{TextFormat, format_text_value, text_value, to_owned_value};

/// One well-known name on the bus with its BusItem tree
pub struct DbusService {
    logger: StructuredLogger,
    service_name: String,
    connection: Option<Connection>,
    pub(crate) shared: Arc<Mutex<DbusSharedState>>,
    registered_paths: HashSet<String>,
    root_path: OwnedObjectPath,
}

impl DbusService {
    /// Create the service. Accepted writes are forwarded to `writes_tx`.
    pub fn new(
        service_name: impl Into<String>,
        writes_tx: mpsc::UnboundedSender<BusWrite>,
    ) -> Result<Self> {
        let service_name = service_name.into();
        let root_path = OwnedObjectPath::try_from("/")
            .map_err(|e| HeliosError::dbus(format!("Invalid object path: {}", e)))?;
        Ok(Self {
            logger: get_logger_with_context(LogContext::new("dbus").with_device(&service_name)),
            service_name,
            connection: None,
            shared: Arc::new(Mutex::new(DbusSharedState::new(writes_tx, root_path.clone()))),
            registered_paths: HashSet::new(),
            root_path,
        })
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Current value of a path
    pub fn value(&self, path: &str) -> Option<serde_json::Value> {
        lock(&self.shared).paths.get(path).cloned()
    }

    /// Connect (system bus, then session bus), export the tree built so far
    /// and claim the service name
    pub async fn start(&mut self) -> Result<()> {
        let connection = match Connection::system().await {
            Ok(c) => c,
            Err(e_sys) => match Connection::session().await {
                Ok(c) => {
                    self.logger.warn(&format!(
                        "System bus unavailable ({}); using session bus",
                        e_sys
                    ));
                    c
                }
                Err(e_sess) => {
                    return Err(HeliosError::dbus(format!(
                        "DBus connect failed: system={} session={}",
                        e_sys, e_sess
                    )));
                }
            },
        };

        let root = RootBus {
            shared: Arc::clone(&self.shared),
        };
        connection
            .object_server()
            .at(&self.root_path, root)
            .await
            .map_err(|e| HeliosError::dbus(format!("Register root BusItem failed: {}", e)))?;

        self.connection = Some(connection.clone());
        lock(&self.shared).connection = Some(connection.clone());

        let known: Vec<String> = std::mem::take(&mut self.registered_paths).into_iter().collect();
        for path in known {
            self.register_objects(&path).await?;
        }

        self.request_name(&connection)
            .await
            .map_err(|e| HeliosError::dbus(format!("RequestName failed: {}", e)))?;
        self.logger
            .info(&format!("D-Bus service started: {}", self.service_name));
        Ok(())
    }

    /// Release the name and drop the connection
    pub async fn stop(&mut self) {
        lock(&self.shared).connection = None;
        if let Some(connection) = self.connection.take() {
            if let Ok(name) = WellKnownName::try_from(self.service_name.as_str()) {
                let _ = connection.release_name(name).await;
            }
            self.logger
                .info(&format!("D-Bus service stopped: {}", self.service_name));
        }
    }

    /// Declare a path with its text format. The initial value is only used
    /// if the path has none yet.
    pub async fn ensure_item(
        &mut self,
        path: &str,
        initial_value: serde_json::Value,
        format: TextFormat,
        writable: bool,
    ) -> Result<()> {
        {
            let mut shared = lock(&self.shared);
            shared.paths.entry(path.to_string()).or_insert(initial_value);
            shared.formats.insert(path.to_string(), format);
            if writable {
                shared.writable.insert(path.to_string());
            }
        }
        self.register_objects(path).await
    }

    /// Export the leaf and every missing intermediate node of `path`
    async fn register_objects(&mut self, path: &str) -> Result<()> {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for i in 1..=segments.len() {
            let subpath = format!("/{}", segments[..i].join("/"));
            if self.registered_paths.contains(&subpath) {
                continue;
            }
            if let Some(conn) = &self.connection {
                let obj_path = OwnedObjectPath::try_from(subpath.as_str()).map_err(|e| {
                    HeliosError::dbus(format!("Invalid object path '{}': {}", subpath, e))
                })?;
                let registered = if i == segments.len() {
                    let item = BusItem::new(subpath.clone(), Arc::clone(&self.shared));
                    conn.object_server().at(&obj_path, item).await
                } else {
                    let node = TreeNode::new(subpath.clone(), Arc::clone(&self.shared));
                    conn.object_server().at(&obj_path, node).await
                };
                registered.map_err(|e| {
                    HeliosError::dbus(format!("Register object failed for {}: {}", subpath, e))
                })?;
            }
            self.registered_paths.insert(subpath);
        }
        Ok(())
    }

    pub async fn update_paths(
        &mut self,
        updates: impl IntoIterator<Item = (String, serde_json::Value)>,
    ) -> Result<()> {
        let mut changed = Vec::new();
        {
            let mut shared = lock(&self.shared);
            for (path, value) in updates {
                if shared.paths.get(&path) == Some(&value) {
                    continue;
                }
                shared.paths.insert(path.clone(), value.clone());
                let text = format_text_value(&value, shared.format_of(&path));
                changed.push((path, value, text));
            }
        }
        for (path, _, _) in &changed {
            self.register_objects(path).await?;
        }
        self.emit_changes(&changed).await
    }

    pub async fn update_path(&mut self, path: &str, value: serde_json::Value) -> Result<()> {
        self.update_paths([(path.to_string(), value)]).await
    }

    /// Per-item `PropertiesChanged` plus one root `ItemsChanged`
    async fn emit_changes(&self, changed: &[(String, serde_json::Value, String)]) -> Result<()> {
        let Some(conn) = &self.connection else {
            return Ok(());
        };
        if changed.is_empty() {
            return Ok(());
        }
        let entry = |value: &serde_json::Value, text: &str| {
            let mut entry: HashMap<&str, OwnedValue> = HashMap::new();
            entry.insert("Value", to_owned_value(value));
            entry.insert("Text", text_value(text));
            entry
        };

        let mut outer: HashMap<&str, HashMap<&str, OwnedValue>> = HashMap::new();
        for (path, value, text) in changed {
            let item_ctx = SignalEmitter::new(
                conn,
                OwnedObjectPath::try_from(path.as_str()).map_err(|e| {
                    HeliosError::dbus(format!("Invalid object path '{}': {}", path, e))
                })?,
            )
            .map_err(|e| HeliosError::dbus(format!("SignalEmitter new failed: {}", e)))?;
            let _ = BusItem::properties_changed(&item_ctx, entry(value, text)).await;
            outer.insert(path.as_str(), entry(value, text));
        }

        let root_ctx = SignalEmitter::new(conn, self.root_path.clone())
            .map_err(|e| HeliosError::dbus(format!("Root SignalEmitter failed: {}", e)))?;
        let _ = RootBus::items_changed(&root_ctx, outer).await;
        Ok(())
    }

    async fn request_name(&self, connection: &Connection) -> ZbusResult<()> {
        use zbus::fdo::{DBusProxy, RequestNameFlags};
        let proxy = DBusProxy::new(connection).await?;
        let name = WellKnownName::try_from(self.service_name.as_str())?;
        let _ = proxy
            .request_name(name, RequestNameFlags::ReplaceExisting.into())
            .await?;
        Ok(())
    }
}
