use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde_json::{json, Value as JsonValue};
use std::collections::BTreeMap;

/// Largest integer magnitude a DOUBLE column represents exactly
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// A single raw field value as produced by a loader
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Str(String),
    Num(f64),
    Bool(bool),
    BigInt(i64),
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
    Blob(Vec<u8>),
    Array(Vec<FieldValue>),
    Object(JsonValue),
}

/// One loader record: field name -> value
pub type RawRecord = BTreeMap<String, FieldValue>;

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Render the value as text, used when a column widens to VARCHAR or JSON
    pub fn to_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Str(s) => Some(s.clone()),
            FieldValue::Num(n) => Some(format_number(*n)),
            FieldValue::Bool(b) => Some(b.to_string()),
            FieldValue::BigInt(i) => Some(i.to_string()),
            FieldValue::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            FieldValue::DateTime(dt) => Some(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
            FieldValue::Blob(bytes) => Some(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
            FieldValue::Array(_) | FieldValue::Object(_) => Some(self.to_json().to_string()),
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::Str(s) => json!(s),
            FieldValue::Num(n) => json!(n),
            FieldValue::Bool(b) => json!(b),
            FieldValue::BigInt(i) => json!(i),
            FieldValue::Date(_) | FieldValue::DateTime(_) | FieldValue::Blob(_) => {
                json!(self.to_text())
            }
            FieldValue::Array(items) => JsonValue::Array(items.iter().map(|v| v.to_json()).collect()),
            FieldValue::Object(value) => value.clone(),
        }
    }

    /// Stable representation used to compare primary key values
    pub fn key_repr(&self) -> String {
        match self {
            FieldValue::Null => "null".to_string(),
            FieldValue::Str(s) => format!("s:{}", s),
            // 1 and 1.0 are the same key
            FieldValue::Num(n) => format!("n:{}", format_number(*n)),
            FieldValue::BigInt(i) => format!("n:{}", i),
            other => format!("v:{}", other.to_text().unwrap_or_default()),
        }
    }

    /// Convert a parsed record into raw fields; non-object values yield None
    pub fn record_from_json(value: JsonValue) -> Option<RawRecord> {
        match value {
            JsonValue::Object(map) => Some(
                map.into_iter()
                    .map(|(key, value)| (key, FieldValue::from(value)))
                    .collect(),
            ),
            _ => None,
        }
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        n.to_string()
    }
}

impl From<JsonValue> for FieldValue {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => FieldValue::Null,
            JsonValue::Bool(b) => FieldValue::Bool(b),
            JsonValue::Number(number) => {
                if let Some(i) = number.as_i64() {
                    if i.unsigned_abs() <= MAX_SAFE_INTEGER as u64 {
                        FieldValue::Num(i as f64)
                    } else {
                        FieldValue::BigInt(i)
                    }
                } else {
                    FieldValue::Num(number.as_f64().unwrap_or(f64::NAN))
                }
            }
            JsonValue::String(s) => FieldValue::Str(s),
            JsonValue::Array(items) => {
                FieldValue::Array(items.into_iter().map(FieldValue::from).collect())
            }
            object @ JsonValue::Object(_) => FieldValue::Object(object),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Str(s)
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Num(n)
    }
}

impl From<i64> for FieldValue {
    fn from(i: i64) -> Self {
        FieldValue::BigInt(i)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(bytes: Vec<u8>) -> Self {
        FieldValue::Blob(bytes)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(FieldValue::Null)
    }
}
