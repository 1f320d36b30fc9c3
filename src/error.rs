//! Error types for Helios
//!
//! Modbus exchanges have their own `ModbusError` (see `modbus`) because the
//! polling state machines branch on the exception kind. Everything else
//! reports a `HeliosError`.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HeliosError>;

#[derive(Debug, Error)]
pub enum HeliosError {
    /// Configuration file or logging setup
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Modbus failure outside a polling exchange (serial port, probe)
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    #[error("D-Bus error: {message}")]
    DBus { message: String },

    /// YAML or JSON encoding
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    /// Connection refused, HTTP transport failure or a reply without a status envelope
    #[error("Network error: {message}")]
    Network { message: String },

    /// Solar API reply with a non-zero status code
    #[error("API error: {message}")]
    Api { message: String },

    /// A rejected configuration value or setting
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Timeout error: {message}")]
    Timeout { message: String },
}

macro_rules! message_constructors {
    ($($name:ident => $variant:ident),* $(,)?) => {
        $(
            pub fn $name<S: Into<String>>(message: S) -> Self {
                HeliosError::$variant {
                    message: message.into(),
                }
            }
        )*
    };
}

impl HeliosError {
    message_constructors! {
        config => Config,
        modbus => Modbus,
        dbus => DBus,
        io => Io,
        network => Network,
        api => Api,
        timeout => Timeout,
    }

    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        HeliosError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// The host did not answer properly, as opposed to the device refusing a request.
    /// Probes move on to the next protocol for these.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            HeliosError::Network { .. } | HeliosError::Timeout { .. } | HeliosError::Io { .. }
        )
    }
}

impl From<std::io::Error> for HeliosError {
    fn from(err: std::io::Error) -> Self {
        HeliosError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for HeliosError {
    fn from(err: serde_yaml::Error) -> Self {
        HeliosError::Serialization {
            message: format!("YAML: {}", err),
        }
    }
}

impl From<serde_json::Error> for HeliosError {
    fn from(err: serde_json::Error) -> Self {
        HeliosError::Serialization {
            message: format!("JSON: {}", err),
        }
    }
}

impl From<reqwest::Error> for HeliosError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            HeliosError::timeout(err.to_string())
        } else {
            HeliosError::network(err.to_string())
        }
    }
}

impl From<zbus::Error> for HeliosError {
    fn from(err: zbus::Error) -> Self {
        HeliosError::dbus(err.to_string())
    }
}

impl From<crate::modbus::ModbusError> for HeliosError {
    fn from(err: crate::modbus::ModbusError) -> Self {
        match err.exception {
            crate::modbus::ModbusException::Timeout => HeliosError::timeout(err.to_string()),
            _ => HeliosError::modbus(err.to_string()),
        }
    }
}
