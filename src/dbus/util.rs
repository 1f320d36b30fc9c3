use zbus::zvariant::{OwnedValue, Value};

/// Unit suffix and decimal places used for `GetText`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TextFormat {
    pub unit: &'static str,
    pub precision: usize,
}

impl TextFormat {
    pub const fn new(unit: &'static str, precision: usize) -> Self {
        Self { unit, precision }
    }
}

/// Text form of a value. Invalid (null) values render as an empty string.
pub(crate) fn format_text_value(val: &serde_json::Value, format: TextFormat) -> String {
    match val {
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(n) => {
            let text = match (n.as_i64(), n.as_f64()) {
                (Some(i), _) if format.precision == 0 => i.to_string(),
                (_, Some(f)) => format!("{:.*}", format.precision, f),
                _ => n.to_string(),
            };
            if format.unit.is_empty() {
                text
            } else {
                format!("{}{}", text, format.unit)
            }
        }
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Bool(b) => u8::from(*b).to_string(),
        _ => val.to_string(),
    }
}

/// Bus representation of a value; null becomes the VeDbus invalid marker
/// (an empty integer array)
pub(crate) fn to_owned_value(v: &serde_json::Value) -> OwnedValue {
    match v {
        serde_json::Value::Null => invalid_value(),
        serde_json::Value::Bool(b) => OwnedValue::from(i32::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                OwnedValue::from(i)
            } else if let Some(u) = n.as_u64() {
                OwnedValue::from(u)
            } else {
                OwnedValue::from(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => text_value(s),
        _ => invalid_value(),
    }
}

pub(crate) fn from_owned_value(v: &OwnedValue) -> serde_json::Value {
    if let Ok(b) = <bool as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(b);
    }
    if let Ok(i) = <i32 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(i);
    }
    if let Ok(i) = <i64 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(i);
    }
    if let Ok(u) = <u32 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(u);
    }
    if let Ok(u) = <u64 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(u);
    }
    if let Ok(f) = <f64 as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(f);
    }
    if let Ok(s) = <&str as TryFrom<&OwnedValue>>::try_from(v) {
        return serde_json::json!(s);
    }
    serde_json::Value::Null
}

pub(crate) fn text_value(s: &str) -> OwnedValue {
    OwnedValue::try_from(Value::from(s)).unwrap_or_else(|_| OwnedValue::from(0i64))
}

fn invalid_value() -> OwnedValue {
    OwnedValue::try_from(Value::from(Vec::<i32>::new())).unwrap_or_else(|_| OwnedValue::from(0i64))
}

/// Number carried by a written value; numeric strings are accepted with
/// either decimal separator
pub(crate) fn as_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::Bool(b) => Some(f64::from(u8::from(*b))),
        serde_json::Value::String(s) => s
            .trim()
            .replace(',', ".")
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite()),
        _ => None,
    }
}
