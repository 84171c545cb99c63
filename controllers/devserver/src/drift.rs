//! Drift detection over engine-owned fields.
//!
//! A desired object is in place when every field it sets is present live with
//! the same value. Fields added by the API server or other controllers are
//! ignored. Resource quantities compare by value, since the API server
//! canonicalises them (`1000m` is stored as `1`).

use crds::quantity::parse_quantity;
use serde_json::{Map, Value};

/// Maps whose string values are resource quantities
const QUANTITY_MAPS: &[&str] = &["requests", "limits", "hard", "allocatable", "capacity"];

/// Whether `live` already carries every field of `desired`.
pub fn owned_fields_match(desired: &Value, live: &Value) -> bool {
    matches(desired, live, false)
}

fn matches(desired: &Value, live: &Value, quantities: bool) -> bool {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => want.iter().all(|(key, value)| {
            let nested = QUANTITY_MAPS.contains(&key.as_str());
            match have.get(key) {
                Some(h) => matches(value, h, nested),
                None => value.is_null(),
            }
        }),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| matches(w, h, false))
        }
        (Value::String(want), Value::String(have)) if quantities => {
            want == have
                || matches!((parse_quantity(want), parse_quantity(have)), (Ok(a), Ok(b)) if a == b)
        }
        _ => desired == live,
    }
}

/// Copy the desired fields onto `live`, keeping everything else.
///
/// Objects merge key by key; arrays and scalars from `desired` replace the
/// live value outright. Server-owned metadata such as `resourceVersion`
/// survives, so the write is conditioned on the version that was compared.
pub fn overlay(desired: &Value, live: &Value) -> Value {
    match (desired, live) {
        (Value::Object(want), Value::Object(have)) => {
            let mut merged: Map<String, Value> = have.clone();
            for (key, value) in want {
                let next = match have.get(key) {
                    Some(existing) => overlay(value, existing),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        _ => desired.clone(),
    }
}
