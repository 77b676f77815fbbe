use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::snapshot::{FieldValue, Snapshot};
use super::store::StateStore;

/// Which payload keys a category may write, and into which snapshot field.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CategoryRule {
    /// payload key -> snapshot field
    pub fields: BTreeMap<String, String>,
}

impl CategoryRule {
    /// Rule whose payload keys are the snapshot field names themselves.
    pub fn identity<'a>(fields: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|f| (f.to_string(), f.to_string()))
                .collect(),
        }
    }

    pub fn with_alias(mut self, key: &str, field: &str) -> Self {
        self.fields.insert(key.to_string(), field.to_string());
        self
    }
}

/// Categories the default route table points at.
pub fn default_categories() -> BTreeMap<String, CategoryRule> {
    let mut categories = BTreeMap::new();
    categories.insert(
        "sensors".to_string(),
        CategoryRule::identity(Snapshot::initial_field_names()),
    );
    categories.insert(
        "temperature".to_string(),
        CategoryRule::identity(["temperature", "humidity"]),
    );
    categories.insert(
        "motion".to_string(),
        CategoryRule::identity(["pir"]).with_alias("motion", "pir"),
    );
    categories.insert(
        "door".to_string(),
        CategoryRule::identity(["door", "autoOpen", "rfid"]),
    );
    categories.insert(
        "distance".to_string(),
        CategoryRule::identity(["distance", "intruder"]),
    );
    categories.insert(
        "status".to_string(),
        CategoryRule::identity(["led1", "led2", "fan", "fanAuto", "securityMode"]),
    );
    categories
}

/// When the snapshot's `online` flag becomes true.
///
/// Going offline is not configurable: a transport disconnect clears the flag at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnlinePolicy {
    /// With the first accepted merge after a (re)connect
    #[default]
    OnFirstMessage,
    /// As soon as the broker acknowledges the connection
    OnConnect,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DropReason {
    #[error("unknown update category {0:?}")]
    UnknownCategory(String),

    #[error("payload is not a JSON object: {0}")]
    Malformed(String),

    #[error("field {field:?} has unsupported value {value}")]
    InvalidValue { field: String, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Accepted(Arc<Snapshot>),
    Dropped(DropReason),
}

impl MergeOutcome {
    pub fn accepted(&self) -> Option<&Arc<Snapshot>> {
        match self {
            MergeOutcome::Accepted(snapshot) => Some(snapshot),
            MergeOutcome::Dropped(_) => None,
        }
    }
}

/// Applies partial updates to the store, last writer wins per field.
///
/// Every accepted update bumps the revision by exactly one and stamps the ingestion
/// time, even when no value changed: the revision counts processed updates, not
/// state changes. Dropped updates leave the store untouched.
///
/// Merging takes `&mut self`; the single owner (the inbound loop) is what keeps
/// revisions ordered.
#[derive(Debug)]
pub struct MergeEngine {
    store: Arc<StateStore>,
    categories: BTreeMap<String, CategoryRule>,
    policy: OnlinePolicy,
}

impl MergeEngine {
    pub fn new(
        store: Arc<StateStore>,
        categories: BTreeMap<String, CategoryRule>,
        policy: OnlinePolicy,
    ) -> Self {
        Self {
            store,
            categories,
            policy,
        }
    }

    pub fn policy(&self) -> OnlinePolicy {
        self.policy
    }

    /// Parses a raw payload and merges it; anything that is not a JSON object drops.
    pub fn apply_payload(&mut self, category: &str, payload: &[u8]) -> MergeOutcome {
        match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(fields)) => self.apply_update(category, &fields),
            Ok(other) => self.drop_update(
                category,
                DropReason::Malformed(format!("expected object, got {}", json_kind(&other))),
            ),
            Err(e) => self.drop_update(category, DropReason::Malformed(e.to_string())),
        }
    }

    pub fn apply_update(&mut self, category: &str, fields: &Map<String, Value>) -> MergeOutcome {
        let Some(rule) = self.categories.get(category) else {
            return self.drop_update(category, DropReason::UnknownCategory(category.to_string()));
        };

        let mut changes: Vec<(&str, FieldValue)> = Vec::with_capacity(fields.len());
        for (key, value) in fields {
            let Some(target) = rule.fields.get(key) else {
                debug!(category, field = %key, "Ignoring unrecognized field");
                continue;
            };
            match FieldValue::from_json(value) {
                Some(field_value) => changes.push((target.as_str(), field_value)),
                None => {
                    let reason = DropReason::InvalidValue {
                        field: key.clone(),
                        value: value.to_string(),
                    };
                    return self.drop_update(category, reason);
                }
            }
        }

        let current = self.store.current();
        let mut next = Snapshot::clone(&current);
        for (field, value) in changes {
            next.fields.insert(field.to_string(), value);
        }
        next.revision = current.revision + 1;
        next.timestamp = Utc::now();
        if self.policy == OnlinePolicy::OnFirstMessage {
            next.online = true;
        }

        let next = Arc::new(next);
        self.store.replace(next.clone());
        debug!(category, revision = next.revision, "Merged update");
        MergeOutcome::Accepted(next)
    }

    fn drop_update(&self, category: &str, reason: DropReason) -> MergeOutcome {
        warn!(category, reason = %reason, "Dropping inbound update");
        MergeOutcome::Dropped(reason)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
