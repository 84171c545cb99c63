//! DevServerFlavor CRD
//!
//! A named, cluster-scoped resource template. At most one flavor may carry
//! `default: true`; it is used by DevServers that do not name a flavor.

use crate::devserver::VolumeMountSpec;
use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DevServerFlavorSpec defines a resource template
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "devserver.io",
    version = "v1",
    kind = "DevServerFlavor",
    status = "DevServerFlavorStatus",
    shortname = "dsf",
    printcolumn = r#"{"name":"Default","type":"boolean","jsonPath":".spec.default"}"#,
    printcolumn = r#"{"name":"Schedulable","type":"string","jsonPath":".status.schedulable"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevServerFlavorSpec {
    /// Compute requests and limits applied verbatim to the devserver container
    #[serde(default)]
    pub resources: FlavorResources,

    /// Node selector for the workload
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Tolerations for the workload
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<FlavorToleration>,

    /// Image used when the DevServer does not set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,

    /// Volumes mounted into every DevServer of this flavor
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMountSpec>,

    /// Cluster default flavor
    #[serde(default)]
    pub default: bool,
}

/// Resource requests and limits as quantity strings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlavorResources {
    /// Minimum guaranteed resources
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,

    /// Maximum resources
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Pod toleration
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct FlavorToleration {
    /// Taint key (empty with `Exists` matches every taint)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// `Equal` (default) or `Exists`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,

    /// Taint value for `Equal`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Taint effect to match (all effects when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,

    /// Eviction grace for `NoExecute`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

impl FlavorToleration {
    /// Whether this toleration tolerates a taint with the given key, value and effect.
    pub fn tolerates(&self, key: &str, value: Option<&str>, effect: &str) -> bool {
        if let Some(want) = self.effect.as_deref() {
            if !want.is_empty() && want != effect {
                return false;
            }
        }

        let exists = self.operator.as_deref() == Some("Exists");
        match self.key.as_deref() {
            None | Some("") => exists,
            Some(k) if k != key => false,
            Some(_) if exists => true,
            Some(_) => self.value.as_deref().unwrap_or("") == value.unwrap_or(""),
        }
    }
}

/// DevServerFlavorStatus records the last schedulability evaluation
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevServerFlavorStatus {
    /// Current schedulability
    #[serde(default)]
    pub schedulable: Schedulability,

    /// When schedulability was last computed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_evaluated: Option<DateTime<Utc>>,

    /// Why the flavor has its current classification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Whether a flavor can currently be scheduled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum Schedulability {
    /// A ready autoscaler pool can provide matching nodes on demand
    #[serde(rename = "AUTOSCALED")]
    Autoscaled,

    /// A ready node currently has room
    Yes,

    /// Neither a node nor a pool can host the flavor
    No,

    /// Not yet evaluated, or the last inventory query failed
    #[default]
    Unknown,
}

impl std::fmt::Display for Schedulability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Schedulability::Autoscaled => "AUTOSCALED",
            Schedulability::Yes => "Yes",
            Schedulability::No => "No",
            Schedulability::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl DevServerFlavor {
    /// Whether this flavor is marked as the cluster default.
    pub fn is_default(&self) -> bool {
        self.spec.default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toleration(key: Option<&str>, operator: Option<&str>, value: Option<&str>, effect: Option<&str>) -> FlavorToleration {
        FlavorToleration {
            key: key.map(str::to_string),
            operator: operator.map(str::to_string),
            value: value.map(str::to_string),
            effect: effect.map(str::to_string),
            toleration_seconds: None,
        }
    }

    #[test]
    fn test_equal_toleration() {
        let t = toleration(Some("gpu"), None, Some("true"), Some("NoSchedule"));
        assert!(t.tolerates("gpu", Some("true"), "NoSchedule"));
        assert!(!t.tolerates("gpu", Some("false"), "NoSchedule"));
        assert!(!t.tolerates("gpu", Some("true"), "NoExecute"));
        assert!(!t.tolerates("other", Some("true"), "NoSchedule"));
    }

    #[test]
    fn test_exists_toleration() {
        let t = toleration(Some("gpu"), Some("Exists"), None, None);
        assert!(t.tolerates("gpu", Some("anything"), "NoExecute"));

        let wildcard = toleration(None, Some("Exists"), None, None);
        assert!(wildcard.tolerates("whatever", None, "NoSchedule"));
    }

    #[test]
    fn test_schedulability_wire_names() {
        assert_eq!(serde_json::to_value(Schedulability::Autoscaled).unwrap(), "AUTOSCALED");
        assert_eq!(serde_json::to_value(Schedulability::Yes).unwrap(), "Yes");
        let parsed: Schedulability = serde_json::from_value(serde_json::json!("Unknown")).unwrap();
        assert_eq!(parsed, Schedulability::Unknown);
    }
}
