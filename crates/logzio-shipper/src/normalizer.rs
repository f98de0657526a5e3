//! Envelope flattening and field normalization.
//!
//! Event Hub messages either carry one log document or wrap several under a
//! `records` array (Azure diagnostic settings). Each document is then
//! normalized before batching:
//!
//! 1. `time` is copied to `@timestamp` (the original field is kept)
//! 2. `null`, `""` and objects left empty after pruning are removed, at every
//!    depth. Arrays are normalized element-wise and never shrink.
//!
//! Normalization is idempotent and never fails: a value that is not an object
//! passes through unchanged.

use serde_json::{Map, Value};

use crate::constants::{RECORDS_KEY, TIMESTAMP_KEY, TIME_KEY};

/// Applies timestamp normalization and, optionally, empty-field pruning.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    prune_empty_fields: bool,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            prune_empty_fields: true,
        }
    }
}

impl Normalizer {
    #[must_use]
    pub fn new(prune_empty_fields: bool) -> Self {
        Self { prune_empty_fields }
    }

    #[must_use]
    pub fn normalize(&self, event: Value) -> Value {
        let Value::Object(mut map) = event else {
            return event;
        };

        add_timestamp(&mut map);
        if self.prune_empty_fields {
            prune_map(&mut map);
        }
        Value::Object(map)
    }
}

fn add_timestamp(map: &mut Map<String, Value>) {
    if let Some(time) = map.get(TIME_KEY).cloned() {
        map.insert(TIMESTAMP_KEY.to_string(), time);
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn prune_map(map: &mut Map<String, Value>) {
    for value in map.values_mut() {
        prune_value(value);
    }
    map.retain(|_, value| !is_empty(value));
}

fn prune_value(value: &mut Value) {
    match value {
        Value::Object(map) => prune_map(map),
        Value::Array(items) => {
            for item in items {
                prune_value(item);
            }
        }
        _ => {}
    }
}

/// Splits one parsed producer document into the events it carries.
///
/// A top-level `records` array is unwrapped, and records that themselves wrap a
/// `records` array are unwrapped once more. Anything else is a single event.
#[must_use]
pub fn flatten_envelope(message: Value) -> Vec<Value> {
    match take_records(message) {
        Ok(records) => records
            .into_iter()
            .flat_map(|record| match take_records(record) {
                Ok(inner) => inner,
                Err(record) => vec![record],
            })
            .collect(),
        Err(message) => vec![message],
    }
}

fn take_records(value: Value) -> Result<Vec<Value>, Value> {
    match value {
        Value::Object(mut map) if matches!(map.get(RECORDS_KEY), Some(Value::Array(_))) => {
            match map.remove(RECORDS_KEY) {
                Some(Value::Array(records)) => Ok(records),
                _ => Err(Value::Object(map)),
            }
        }
        other => Err(other),
    }
}
