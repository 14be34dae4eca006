//! Record representation.
//!
//! Source and target records are flat JSON objects. Source rows keep the
//! legacy camelCase column names; target rows use the target column names.

use serde_json::{Map, Value};

/// A record: field name to value.
pub type Row = Map<String, Value>;

/// Typed access to record fields.
///
/// Missing fields and JSON `null` are treated the same everywhere.
pub trait RowExt {
    fn field(&self, key: &str) -> Option<&Value>;

    /// Integer value. Numeric strings are accepted.
    fn get_i64(&self, key: &str) -> Option<i64> {
        match self.field(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.field(key)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "t" | "1" | "yes" => Some(true),
                "false" | "f" | "0" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    fn get_str(&self, key: &str) -> Option<&str> {
        self.field(key)?.as_str()
    }

    /// True unless the field is missing, null, false, zero, or empty.
    fn is_truthy(&self, key: &str) -> bool {
        match self.field(key) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
        }
    }

    /// The value, or `default` when missing or null.
    fn value_or(&self, key: &str, default: Value) -> Value {
        self.field(key).cloned().unwrap_or(default)
    }

    /// The value, or JSON null.
    fn value(&self, key: &str) -> Value {
        self.value_or(key, Value::Null)
    }
}

impl RowExt for Row {
    fn field(&self, key: &str) -> Option<&Value> {
        match self.get(key) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        }
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row<I, K>(pairs: I) -> Row
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

/// Stringified id used as a map key in artifacts.
pub fn id_key(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}
