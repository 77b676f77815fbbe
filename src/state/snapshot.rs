use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Names used by the snapshot itself; no device field may take them.
pub const RESERVED_FIELDS: [&str; 3] = ["revision", "timestamp", "online"];

/// Field set and defaults the devices start out with.
const INITIAL_FIELDS: [(&str, FieldValue); 13] = [
    ("pir", FieldValue::Bool(false)),
    ("led1", FieldValue::Bool(false)),
    ("led2", FieldValue::Bool(false)),
    ("temperature", FieldValue::Number(0.0)),
    ("humidity", FieldValue::Number(0.0)),
    ("fan", FieldValue::Bool(false)),
    ("fanAuto", FieldValue::Bool(true)),
    ("door", FieldValue::Bool(false)),
    ("autoOpen", FieldValue::Bool(false)),
    ("rfid", FieldValue::Bool(false)),
    ("distance", FieldValue::Number(0.0)),
    ("securityMode", FieldValue::Bool(false)),
    ("intruder", FieldValue::Bool(false)),
];

/// Last known value of one device field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Number(f64),
}

impl FieldValue {
    /// Booleans and numbers convert, everything else is not a field value.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(FieldValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(FieldValue::Number),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<f64> for FieldValue {
    fn from(value: f64) -> Self {
        FieldValue::Number(value)
    }
}

/// The one authoritative view of system state.
///
/// Snapshots are values: the store swaps whole `Arc<Snapshot>`s and never edits one
/// in place, so anyone holding a snapshot holds a complete merge result.
///
/// Serializes flat, device fields next to `revision`, `timestamp` (ms since epoch)
/// and `online`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
    pub revision: u64,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
    pub online: bool,
}

impl Snapshot {
    /// Startup state: known fields at their defaults, revision 0, offline.
    pub fn initial() -> Self {
        Self {
            fields: INITIAL_FIELDS
                .iter()
                .map(|(name, value)| (name.to_string(), *value))
                .collect(),
            revision: 0,
            timestamp: Utc::now(),
            online: false,
        }
    }

    pub fn get(&self, field: &str) -> Option<FieldValue> {
        self.fields.get(field).copied()
    }

    /// Names of the fields every snapshot starts with.
    pub fn initial_field_names() -> impl Iterator<Item = &'static str> {
        INITIAL_FIELDS.iter().map(|(name, _)| *name)
    }
}
