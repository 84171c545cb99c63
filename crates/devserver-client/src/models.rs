//! Cluster object models
//!
//! `ManagedObject` is the closed set of child object kinds the operator
//! creates. Node and autoscaler pool inventory are flattened into the
//! fields schedulability classification needs.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, PersistentVolumeClaim, ResourceQuota, Secret, Service,
    ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label naming the DevServer a child object belongs to
pub const LABEL_DEVSERVER: &str = "devserver.io/devserver";

/// Standard management label
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on everything the operator creates
pub const MANAGED_BY: &str = "devserver-operator";

/// Container name of the devserver workload (exec target)
pub const DEVSERVER_CONTAINER: &str = "devserver";

/// Kinds of child objects the operator manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Secret,
    ConfigMap,
    StatefulSet,
    Service,
    Namespace,
    ServiceAccount,
    Role,
    RoleBinding,
    ResourceQuota,
    PersistentVolumeClaim,
}

impl ObjectKind {
    /// Whether objects of this kind live in a namespace.
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, ObjectKind::Namespace)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Identity of a managed object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(kind: ObjectKind, namespace: Option<&str>, name: &str) -> Self {
        Self {
            kind,
            namespace: namespace.map(str::to_string),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A typed child object
#[derive(Debug, Clone, PartialEq)]
pub enum ManagedObject {
    Secret(Secret),
    ConfigMap(ConfigMap),
    StatefulSet(StatefulSet),
    Service(Service),
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    ResourceQuota(ResourceQuota),
    PersistentVolumeClaim(PersistentVolumeClaim),
}

macro_rules! each_object {
    ($value:expr, $obj:ident => $body:expr) => {
        match $value {
            ManagedObject::Secret($obj) => $body,
            ManagedObject::ConfigMap($obj) => $body,
            ManagedObject::StatefulSet($obj) => $body,
            ManagedObject::Service($obj) => $body,
            ManagedObject::Namespace($obj) => $body,
            ManagedObject::ServiceAccount($obj) => $body,
            ManagedObject::Role($obj) => $body,
            ManagedObject::RoleBinding($obj) => $body,
            ManagedObject::ResourceQuota($obj) => $body,
            ManagedObject::PersistentVolumeClaim($obj) => $body,
        }
    };
}

impl ManagedObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            ManagedObject::Secret(_) => ObjectKind::Secret,
            ManagedObject::ConfigMap(_) => ObjectKind::ConfigMap,
            ManagedObject::StatefulSet(_) => ObjectKind::StatefulSet,
            ManagedObject::Service(_) => ObjectKind::Service,
            ManagedObject::Namespace(_) => ObjectKind::Namespace,
            ManagedObject::ServiceAccount(_) => ObjectKind::ServiceAccount,
            ManagedObject::Role(_) => ObjectKind::Role,
            ManagedObject::RoleBinding(_) => ObjectKind::RoleBinding,
            ManagedObject::ResourceQuota(_) => ObjectKind::ResourceQuota,
            ManagedObject::PersistentVolumeClaim(_) => ObjectKind::PersistentVolumeClaim,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        each_object!(self, o => &o.metadata)
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        each_object!(self, o => &mut o.metadata)
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.metadata().namespace.as_deref()
    }

    pub fn object_ref(&self) -> ObjectRef {
        ObjectRef::new(self.kind(), self.namespace(), self.name())
    }

    /// JSON form of the object, used for drift comparison.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        each_object!(self, o => serde_json::to_value(o))
    }

    /// Rebuild an object of `kind` from JSON.
    pub fn from_value(kind: ObjectKind, value: serde_json::Value) -> Result<Self, serde_json::Error> {
        Ok(match kind {
            ObjectKind::Secret => ManagedObject::Secret(serde_json::from_value(value)?),
            ObjectKind::ConfigMap => ManagedObject::ConfigMap(serde_json::from_value(value)?),
            ObjectKind::StatefulSet => ManagedObject::StatefulSet(serde_json::from_value(value)?),
            ObjectKind::Service => ManagedObject::Service(serde_json::from_value(value)?),
            ObjectKind::Namespace => ManagedObject::Namespace(serde_json::from_value(value)?),
            ObjectKind::ServiceAccount => {
                ManagedObject::ServiceAccount(serde_json::from_value(value)?)
            }
            ObjectKind::Role => ManagedObject::Role(serde_json::from_value(value)?),
            ObjectKind::RoleBinding => ManagedObject::RoleBinding(serde_json::from_value(value)?),
            ObjectKind::ResourceQuota => {
                ManagedObject::ResourceQuota(serde_json::from_value(value)?)
            }
            ObjectKind::PersistentVolumeClaim => {
                ManagedObject::PersistentVolumeClaim(serde_json::from_value(value)?)
            }
        })
    }
}

/// A node taint
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeTaint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: String,
}

/// Scheduling-relevant view of a node
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NodeInventory {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<NodeTaint>,
    /// Allocatable resources as quantity strings
    pub allocatable: BTreeMap<String, String>,
    pub ready: bool,
    pub unschedulable: bool,
}

impl NodeInventory {
    pub fn from_node(node: &Node) -> Self {
        let spec = node.spec.as_ref();
        let status = node.status.as_ref();

        let taints = spec
            .and_then(|s| s.taints.as_ref())
            .map(|taints| {
                taints
                    .iter()
                    .map(|t| NodeTaint {
                        key: t.key.clone(),
                        value: t.value.clone(),
                        effect: t.effect.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let allocatable = status
            .and_then(|s| s.allocatable.as_ref())
            .map(|a| a.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
            .unwrap_or_default();

        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
            .unwrap_or(false);

        Self {
            name: node.metadata.name.clone().unwrap_or_default(),
            labels: node.metadata.labels.clone().unwrap_or_default(),
            taints,
            allocatable,
            ready,
            unschedulable: spec.and_then(|s| s.unschedulable).unwrap_or(false),
        }
    }
}

/// An autoscaler-managed node pool (Karpenter `NodePool`)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AutoscalerPool {
    pub name: String,
    /// Labels every node launched from this pool will carry
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<NodeTaint>,
    /// Total resource ceiling; `None` means unbounded
    pub limits: Option<BTreeMap<String, String>>,
    pub ready: bool,
}

impl AutoscalerPool {
    /// Flatten a `karpenter.sh/v1` NodePool.
    ///
    /// Node labels are the template labels plus single-valued `In` requirements.
    /// Pools without conditions are treated as ready.
    pub fn from_dynamic(obj: &DynamicObject) -> Self {
        let spec = obj.data.get("spec");
        let template = spec.and_then(|s| s.get("template"));

        let mut labels: BTreeMap<String, String> = template
            .and_then(|t| t.pointer("/metadata/labels"))
            .and_then(|l| serde_json::from_value(l.clone()).ok())
            .unwrap_or_default();

        if let Some(reqs) = template
            .and_then(|t| t.pointer("/spec/requirements"))
            .and_then(|r| r.as_array())
        {
            for req in reqs {
                let key = req.get("key").and_then(|k| k.as_str());
                let op = req.get("operator").and_then(|o| o.as_str());
                let values = req.get("values").and_then(|v| v.as_array());
                if let (Some(key), Some("In"), Some(values)) = (key, op, values) {
                    if let [single] = values.as_slice() {
                        if let Some(value) = single.as_str() {
                            labels.insert(key.to_string(), value.to_string());
                        }
                    }
                }
            }
        }

        let taints: Vec<NodeTaint> = template
            .and_then(|t| t.pointer("/spec/taints"))
            .and_then(|t| serde_json::from_value(t.clone()).ok())
            .unwrap_or_default();

        let limits = spec
            .and_then(|s| s.get("limits"))
            .and_then(|l| l.as_object())
            .map(|m| {
                m.iter()
                    .map(|(k, v)| {
                        let value = match v {
                            serde_json::Value::String(s) => s.clone(),
                            other => other.to_string(),
                        };
                        (k.clone(), value)
                    })
                    .collect()
            });

        let ready = match obj
            .data
            .pointer("/status/conditions")
            .and_then(|c| c.as_array())
        {
            Some(conditions) if !conditions.is_empty() => conditions.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some("Ready")
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            }),
            _ => true,
        };

        Self {
            name: obj.metadata.name.clone().unwrap_or_default(),
            labels,
            taints,
            limits,
            ready,
        }
    }
}

/// Severity of a published event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// A Kubernetes Event to publish against an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub severity: EventSeverity,
    /// PascalCase reason
    pub reason: String,
    pub action: String,
    pub note: Option<String>,
}

impl EventRecord {
    pub fn normal(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }

    pub fn warning(reason: &str, action: &str, note: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            action: action.to_string(),
            note: Some(note.into()),
        }
    }
}

/// Captured output of a remote command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
