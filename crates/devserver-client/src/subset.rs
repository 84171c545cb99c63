//! JSON subset matching
//!
//! Used for status predicates and for drift detection: a desired object is
//! "in place" when every field it sets has the same value live. Fields the
//! server or other controllers add are ignored.

use serde_json::Value;

/// Whether every field in `expected` is present with an equal value in `actual`.
///
/// Objects compare key by key. Arrays must have the same length and match
/// element-wise. Everything else compares by equality.
pub fn is_subset(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| is_subset(v, h))),
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| is_subset(w, h))
        }
        _ => expected == actual,
    }
}
