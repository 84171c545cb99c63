//! DevServerUser CRD
//!
//! Access and quota record for a human or service identity. The operator
//! derives a namespace, service account and RBAC bindings from it.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// DevServerUserSpec defines an identity allowed to run DevServers
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[kube(
    group = "devserver.io",
    version = "v1",
    kind = "DevServerUser",
    status = "DevServerUserStatus",
    shortname = "dsu",
    printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".status.namespace"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevServerUserSpec {
    /// Username (RBAC `User` subject)
    pub username: String,

    /// Namespace override; defaults to `dev-<username>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Hard resource quota for the user's namespace
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub quota: BTreeMap<String, String>,
}

/// DevServerUserStatus records the provisioned namespace
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevServerUserStatus {
    /// Namespace where this user's DevServers live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Service account bound to the user's role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,

    /// Error message if provisioning failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DevServerUserSpec {
    /// Namespace the user's DevServers live in.
    pub fn effective_namespace(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) if !ns.is_empty() => ns.to_string(),
            _ => format!("dev-{}", self.username),
        }
    }

    /// Service account name derived from the username.
    pub fn service_account_name(&self) -> String {
        format!("{}-sa", self.username)
    }
}
