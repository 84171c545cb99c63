//! DevServer CRD
//!
//! One user's development environment. The operator converges a StatefulSet,
//! Services, a host-key Secret and an sshd ConfigMap from this spec and retires
//! the server once its lifecycle policy says it has expired.

use crate::duration::parse_duration;
use crate::error::CrdError;
use crate::quantity::parse_quantity;
use chrono::{DateTime, Duration, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Longest accepted `timeToLive`
pub const MAX_TIME_TO_LIVE_DAYS: i64 = 7;

/// DevServerSpec defines the desired state of a development server
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[kube(
    group = "devserver.io",
    version = "v1",
    kind = "DevServer",
    namespaced,
    status = "DevServerStatus",
    shortname = "ds",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Flavor","type":"string","jsonPath":".spec.flavor"}"#,
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DevServerSpec {
    /// Identity that owns this server (matches a DevServerUser username)
    pub owner: String,

    /// DevServerFlavor name; the cluster default flavor is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flavor: Option<String>,

    /// Container image; falls back to the flavor's default image, then the operator default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Standalone or distributed
    #[serde(default)]
    pub mode: DevServerMode,

    /// Distributed settings, required when `mode` is `distributed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distributed: Option<DistributedSpec>,

    /// Persistent home directory request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_home: Option<PersistentHomeSpec>,

    /// User-managed volume claims to mount
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMountSpec>,

    /// SSH access
    #[serde(default)]
    pub ssh: SshSpec,

    /// Expiry and idle policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lifecycle: Option<LifecycleSpec>,
}

/// Execution mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DevServerMode {
    /// Single process development server
    #[default]
    Standalone,

    /// Member of a distributed training job
    Distributed,
}

/// Distributed launch settings
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DistributedSpec {
    /// Total number of nodes participating
    pub world_size: u32,

    /// Processes launched per node
    #[serde(default = "default_nproc_per_node")]
    pub nproc_per_node: u32,

    /// Communication backend (e.g. `nccl`, `gloo`)
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Backend-specific settings rendered as environment variables
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub settings: BTreeMap<String, String>,
}

fn default_nproc_per_node() -> u32 {
    1
}

fn default_backend() -> String {
    "nccl".to_string()
}

/// Persistent home directory request
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersistentHomeSpec {
    /// Whether the home directory survives pod restarts
    #[serde(default)]
    pub enabled: bool,

    /// Storage size (operator default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// A volume claim mounted into the server
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountSpec {
    /// PersistentVolumeClaim name (must already exist; never owned by the DevServer)
    pub claim_name: String,

    /// Absolute mount path inside the container
    pub mount_path: String,

    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

/// SSH access
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SshSpec {
    /// Authorized public key for the dev user
    #[serde(default)]
    pub public_key: String,
}

/// Lifecycle policy
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleSpec {
    /// Seconds without activity before auto-shutdown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<i64>,

    /// Enable idle-based shutdown
    #[serde(default)]
    pub auto_shutdown: bool,

    /// Absolute expiry timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,

    /// Relative lifetime measured from creation (e.g. `4h`, `1h30m`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_live: Option<String>,
}

/// DevServerStatus describes the observed state
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevServerStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: DevServerPhase,

    /// Conditions recording reconciliation outcomes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<DevServerCondition>,

    /// Generation last acted upon
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Human readable summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// DevServer lifecycle phase
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum DevServerPhase {
    /// Child objects exist but the workload is not ready
    #[default]
    Pending,

    /// Workload ready
    Running,

    /// Deletion in progress
    Deleting,

    /// Retired by lifecycle policy
    Expired,

    /// Terminal error, requires a spec change
    Failed,
}

impl std::fmt::Display for DevServerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DevServerPhase::Pending => "Pending",
            DevServerPhase::Running => "Running",
            DevServerPhase::Deleting => "Deleting",
            DevServerPhase::Expired => "Expired",
            DevServerPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Status of a condition
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    /// Condition holds
    True,
    /// Condition does not hold
    False,
    /// Not yet known
    #[default]
    Unknown,
}

/// A single status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DevServerCondition {
    /// Condition type (e.g. `Reconciled`, `Ready`)
    #[serde(rename = "type")]
    pub type_: String,

    /// Condition status
    pub status: ConditionStatus,

    /// PascalCase machine readable reason
    pub reason: String,

    /// Human readable detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// When the status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl DevServerSpec {
    /// Validate structural rules that the schema cannot express.
    pub fn validate(&self) -> Result<(), CrdError> {
        if self.owner.trim().is_empty() {
            return Err(CrdError::Validation("owner is required".to_string()));
        }

        if self.ssh.public_key.trim().is_empty() {
            return Err(CrdError::Validation("ssh.publicKey is required".to_string()));
        }

        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.validate()?;
        }

        validate_volume_mounts(&self.volumes)?;

        if self.mode == DevServerMode::Distributed {
            let distributed = self.distributed.as_ref().ok_or_else(|| {
                CrdError::Validation("distributed mode requires a distributed block".to_string())
            })?;
            if distributed.world_size == 0 {
                return Err(CrdError::Validation(
                    "distributed.worldSize must be at least 1".to_string(),
                ));
            }
            if distributed.nproc_per_node == 0 {
                return Err(CrdError::Validation(
                    "distributed.nprocPerNode must be at least 1".to_string(),
                ));
            }
        }

        if let Some(size) = self.persistent_home.as_ref().and_then(|h| h.size.as_deref()) {
            parse_quantity(size).map_err(|_| {
                CrdError::Validation(format!("persistentHome.size '{}' is not a valid quantity", size))
            })?;
        }

        Ok(())
    }
}

impl LifecycleSpec {
    /// Validate the TTL: positive and at most seven days.
    pub fn validate(&self) -> Result<(), CrdError> {
        if let Some(ttl) = self.time_to_live.as_deref() {
            let duration = parse_duration(ttl)
                .map_err(|e| CrdError::Validation(format!("invalid timeToLive: {}", e)))?;
            if duration <= Duration::zero() {
                return Err(CrdError::Validation(
                    "timeToLive must be a positive duration".to_string(),
                ));
            }
            if duration > Duration::days(MAX_TIME_TO_LIVE_DAYS) {
                return Err(CrdError::Validation(format!(
                    "timeToLive cannot exceed {} days",
                    MAX_TIME_TO_LIVE_DAYS
                )));
            }
        }

        if let Some(idle) = self.idle_timeout {
            if idle <= 0 {
                return Err(CrdError::Validation(
                    "idleTimeout must be a positive number of seconds".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Effective expiry: the earlier of `created + timeToLive` and `expirationTime`.
    ///
    /// Returns `Ok(None)` when neither bound is set. A TTL without a known
    /// creation time contributes no bound.
    pub fn effective_expiry(
        &self,
        created: Option<DateTime<Utc>>,
    ) -> Result<Option<DateTime<Utc>>, CrdError> {
        let relative = match (self.time_to_live.as_deref(), created) {
            (Some(ttl), Some(created)) => {
                let ttl_duration = parse_duration(ttl)?;
                Some(created.checked_add_signed(ttl_duration).ok_or_else(|| {
                    CrdError::Validation(format!("timeToLive '{}' puts expiry out of range", ttl))
                })?)
            }
            _ => None,
        };

        Ok(match (relative, self.expiration_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        })
    }

    /// Idle deadline: `lastActivity + idleTimeout`, only when auto-shutdown is enabled.
    pub fn idle_deadline(&self, last_activity: Option<DateTime<Utc>>) -> Result<Option<DateTime<Utc>>, CrdError> {
        let (true, Some(idle), Some(last_activity)) = (self.auto_shutdown, self.idle_timeout, last_activity) else {
            return Ok(None);
        };
        Duration::try_seconds(idle)
            .and_then(|timeout| last_activity.checked_add_signed(timeout))
            .map(Some)
            .ok_or_else(|| CrdError::Validation(format!("idleTimeout {}s puts the idle deadline out of range", idle)))
    }
}

/// Mount paths must be absolute, unique, and name a claim.
pub fn validate_volume_mounts(volumes: &[VolumeMountSpec]) -> Result<(), CrdError> {
    let mut seen = HashSet::new();
    for (idx, volume) in volumes.iter().enumerate() {
        if volume.claim_name.trim().is_empty() {
            return Err(CrdError::Validation(format!(
                "volume at index {} is missing claimName",
                idx
            )));
        }
        if volume.mount_path.trim().is_empty() {
            return Err(CrdError::Validation(format!(
                "volume at index {} is missing mountPath",
                idx
            )));
        }
        if !volume.mount_path.starts_with('/') {
            return Err(CrdError::Validation(format!(
                "volume mountPath '{}' must be absolute",
                volume.mount_path
            )));
        }
        if !seen.insert(volume.mount_path.as_str()) {
            return Err(CrdError::Validation(format!(
                "duplicate mount path '{}' is not allowed",
                volume.mount_path
            )));
        }
    }
    Ok(())
}

impl DevServer {
    /// Creation time as reported by the API server.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .creation_timestamp
            .as_ref()
            .and_then(crate::time::to_chrono)
    }

    /// Effective expiry of this server, if any bound is set.
    pub fn effective_expiry(&self) -> Result<Option<DateTime<Utc>>, CrdError> {
        match &self.spec.lifecycle {
            Some(lifecycle) => lifecycle.effective_expiry(self.created_at()),
            None => Ok(None),
        }
    }

    /// Current phase, `Pending` when no status has been written yet.
    pub fn phase(&self) -> DevServerPhase {
        self.status.as_ref().map(|s| s.phase).unwrap_or_default()
    }
}
