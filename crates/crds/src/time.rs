//! Conversions between Kubernetes `meta/v1.Time` and `chrono`.
//!
//! The wire format of `Time` is RFC 3339, so conversions round-trip through
//! JSON rather than depending on the time library k8s-openapi was built with.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

/// Convert an API `Time` into a `chrono` timestamp.
pub fn to_chrono(time: &Time) -> Option<DateTime<Utc>> {
    let value = serde_json::to_value(time).ok()?;
    let raw = value.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Convert a `chrono` timestamp into an API `Time`.
pub fn from_chrono(ts: DateTime<Utc>) -> Option<Time> {
    serde_json::from_value(serde_json::Value::String(
        ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    ))
    .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_round_trip_preserves_seconds() {
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 12, 30, 0).unwrap();
        let time = from_chrono(ts).unwrap();
        assert_eq!(to_chrono(&time), Some(ts));
    }
}
