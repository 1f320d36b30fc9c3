use std::collections::BTreeMap;

/// Who is logging: a component, optionally tied to one device
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component name (e.g. "modbus_tcp", "discovery", "polling")
    pub component: String,
    /// Device unique id
    pub device: Option<String>,
    /// "host:unit" of the device, or the serial device path
    pub location: Option<String>,
    /// Extra key/value pairs, sorted for stable output
    pub extra_fields: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new(component: &str) -> Self {
        Self {
            component: component.to_string(),
            device: None,
            location: None,
            extra_fields: BTreeMap::new(),
        }
    }

    pub fn with_device(mut self, unique_id: &str) -> Self {
        self.device = Some(unique_id.to_string());
        self
    }

    pub fn with_location(mut self, location: String) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_field(mut self, key: &str, value: String) -> Self {
        self.extra_fields.insert(key.to_string(), value);
        self
    }

    /// `key=value` pairs joined by commas, component first
    fn render(&self) -> String {
        let named = [
            Some(("component", self.component.as_str())),
            self.device.as_deref().map(|d| ("device", d)),
            self.location.as_deref().map(|l| ("location", l)),
        ];
        named
            .into_iter()
            .flatten()
            .chain(self.extra_fields.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Logger that tags every event with its context as a `fields` value
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    pub(crate) context: LogContext,
    fields: String,
}

macro_rules! log_method {
    ($name:ident, $macro:ident) => {
        pub fn $name(&self, message: &str) {
            tracing::$macro!(fields = %self.fields, "{}", message);
        }
    };
}

impl StructuredLogger {
    pub fn new(context: LogContext) -> Self {
        let fields = context.render();
        Self { context, fields }
    }

    log_method!(trace, trace);
    log_method!(debug, debug);
    log_method!(info, info);
    log_method!(warn, warn);
    log_method!(error, error);

    /// The rendered context attached to each event
    pub(crate) fn fields(&self) -> &str {
        &self.fields
    }
}

/// Logger for a component without device context
pub fn get_logger(component: &str) -> StructuredLogger {
    StructuredLogger::new(LogContext::new(component))
}

pub fn get_logger_with_context(context: LogContext) -> StructuredLogger {
    StructuredLogger::new(context)
}
