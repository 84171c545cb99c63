//! DevServer convergence.
//!
//! One pass resolves the flavor, synthesizes the desired objects, creates
//! what is missing, replaces what drifted, and projects the workload's
//! readiness into the DevServer status.

use crate::backoff::{RetryConfig, retry_with_backoff};
use crate::config::OperatorConfig;
use crate::drift::{overlay, owned_fields_match};
use crate::error::ControllerError;
use crate::events::EventPublisher;
use crate::flavor::FlavorResolver;
use crate::host_keys::build_host_key_secret;
use crate::synthesizer::synthesize;
use chrono::{DateTime, Utc};
use crds::{ConditionStatus, DevServer, DevServerCondition, DevServerPhase, DevServerStatus};
use devserver_client::{ClientError, ClusterClientTrait, EventRecord, ManagedObject, ObjectKind, ObjectRef};
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::ResourceExt;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Condition recording the outcome of the last pass
pub const CONDITION_RECONCILED: &str = "Reconciled";

/// Condition mirroring workload readiness
pub const CONDITION_READY: &str = "Ready";

/// What one convergence pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConvergenceResult {
    pub created: Vec<ObjectRef>,
    pub updated: Vec<ObjectRef>,
    pub phase: DevServerPhase,
    pub status_written: bool,
    /// The DevServer was not eligible for convergence (deleting, expired, failed)
    pub skipped: bool,
}

enum Applied {
    Created(ManagedObject),
    Updated(ManagedObject),
    Unchanged(ManagedObject),
}

impl Applied {
    fn object(&self) -> &ManagedObject {
        match self {
            Applied::Created(o) | Applied::Updated(o) | Applied::Unchanged(o) => o,
        }
    }
}

/// Drives a DevServer's child objects toward the synthesized state
#[derive(Clone)]
pub struct Converger {
    client: Arc<dyn ClusterClientTrait>,
    config: Arc<OperatorConfig>,
    resolver: FlavorResolver,
    events: EventPublisher,
    retry: RetryConfig,
}

impl Converger {
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        config: Arc<OperatorConfig>,
        resolver: FlavorResolver,
        events: EventPublisher,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            config,
            resolver,
            events,
            retry,
        }
    }

    /// Converge `devserver` and record the outcome in its status.
    ///
    /// Terminal errors leave the DevServer `Failed`; retryable errors that
    /// outlived the retry budget leave an `Unknown` Reconciled condition.
    /// Both are returned so the caller can decide whether to requeue.
    pub async fn converge(&self, devserver: &DevServer) -> Result<ConvergenceResult, ControllerError> {
        let namespace = devserver.namespace().unwrap_or_default();
        let name = devserver.name_any();

        if let Some(reason) = skip_reason(devserver) {
            debug!("Skipping DevServer {}/{}: {}", namespace, name, reason);
            let mut result = ConvergenceResult {
                phase: devserver.phase(),
                skipped: true,
                ..Default::default()
            };
            if let Some(status) = deleting_status(devserver) {
                result.phase = status.phase;
                result.status_written = self.write_status(devserver, status).await?;
            }
            return Ok(result);
        }

        match self.apply_all(devserver).await {
            Ok((mut result, ready)) => {
                let status = converged_status(devserver.status.as_ref(), devserver.metadata.generation, ready, Utc::now());
                result.phase = status.phase;
                result.status_written = self.write_status(devserver, status).await?;
                if result.created.iter().any(|r| r.kind == ObjectKind::StatefulSet) {
                    self.events
                        .publish(
                            devserver,
                            EventRecord::normal("Created", "Reconcile", format!("created workload for DevServer {}", name)),
                        )
                        .await;
                }
                Ok(result)
            }
            Err(e) if e.is_terminal() => {
                warn!("DevServer {}/{} failed: {}", namespace, name, e);
                let status = failed_status(devserver.status.as_ref(), devserver.metadata.generation, &e, Utc::now());
                if let Err(patch_err) = self.write_status(devserver, status).await {
                    warn!("Failed to record failure for DevServer {}/{}: {}", namespace, name, patch_err);
                }
                self.events
                    .publish(devserver, EventRecord::warning("ReconcileFailed", "Reconcile", e.to_string()))
                    .await;
                Err(e)
            }
            Err(e) => {
                warn!("DevServer {}/{} not converged, will retry later: {}", namespace, name, e);
                let status = degraded_status(devserver.status.as_ref(), devserver.metadata.generation, &e, Utc::now());
                if let Err(patch_err) = self.write_status(devserver, status).await {
                    warn!("Failed to record retry state for DevServer {}/{}: {}", namespace, name, patch_err);
                }
                Err(e)
            }
        }
    }

    /// Create or repair every child object. Returns the result and whether the
    /// workload reports ready.
    async fn apply_all(&self, devserver: &DevServer) -> Result<(ConvergenceResult, bool), ControllerError> {
        let namespace = devserver.namespace().unwrap_or_default();
        let name = devserver.name_any();
        let owner_uid = devserver.uid().unwrap_or_default();

        let flavor = self.resolver.resolve_effective(devserver).await?;
        let desired = synthesize(devserver, &flavor, &self.config)?;
        debug!(
            "Synthesized DevServer {}/{} with flavor {}",
            namespace,
            name,
            flavor.name_any()
        );

        let client = self.client.clone();
        let mut live: HashMap<ObjectRef, ManagedObject> = retry_with_backoff(&self.retry, "list_owned", || {
            let client = client.clone();
            let namespace = namespace.clone();
            let name = name.clone();
            async move { Ok(client.list_owned(&namespace, &name).await?) }
        })
        .await?
        .into_iter()
        .map(|o| (o.object_ref(), o))
        .collect();

        let mut result = ConvergenceResult::default();

        // Host keys first; once present they are never touched again
        let secret_ref = ObjectRef::new(
            ObjectKind::Secret,
            Some(&namespace),
            desired.host_keys.name.as_deref().unwrap_or_default(),
        );
        if !live.contains_key(&secret_ref) {
            let secret = ManagedObject::Secret(build_host_key_secret(desired.host_keys.clone()));
            let created = retry_with_backoff(&self.retry, "create host keys", || {
                let client = client.clone();
                let secret = &secret;
                async move {
                    match client.create_object(secret).await {
                        Ok(_) => Ok(true),
                        // Someone else created them first; theirs stand
                        Err(ClientError::Conflict(_)) => Ok(false),
                        Err(e) => Err(e.into()),
                    }
                }
            })
            .await?;
            if created {
                info!("Created host keys for DevServer {}/{}", namespace, name);
                result.created.push(secret_ref);
            }
        }

        let mut ready = false;
        for object in desired.ordered() {
            let reference = object.object_ref();
            let prefetched = live.remove(&reference);
            let applied = self.apply(object, prefetched, &owner_uid).await?;
            if let ManagedObject::StatefulSet(sts) = applied.object() {
                ready = workload_ready(sts);
            }
            match applied {
                Applied::Created(_) => {
                    info!("Created {}", reference);
                    result.created.push(reference);
                }
                Applied::Updated(_) => {
                    info!("Repaired drift on {}", reference);
                    result.updated.push(reference);
                }
                Applied::Unchanged(_) => debug!("{} is up to date", reference),
            }
        }
        Ok((result, ready))
    }

    /// Converge one object. The first attempt uses the listed object; retries
    /// after a conflict re-read it.
    async fn apply(
        &self,
        desired: ManagedObject,
        prefetched: Option<ManagedObject>,
        owner_uid: &str,
    ) -> Result<Applied, ControllerError> {
        let reference = desired.object_ref();
        let desired_value = desired.to_value().map_err(serialization_error)?;
        let mut first = Some(prefetched);
        let client = self.client.clone();
        let operation = format!("converge {}", reference);

        retry_with_backoff(&self.retry, &operation, || {
            let client = client.clone();
            let snapshot = first.take();
            let desired = &desired;
            let desired_value = &desired_value;
            let reference = &reference;
            async move {
                let live = match snapshot {
                    Some(live) => live,
                    None => {
                        client
                            .get_object(reference.kind, reference.namespace.as_deref(), &reference.name)
                            .await?
                    }
                };
                let Some(live) = live else {
                    return Ok(Applied::Created(client.create_object(desired).await?));
                };

                check_owner(&live, owner_uid)?;
                let live_value = live.to_value().map_err(serialization_error)?;
                if owned_fields_match(desired_value, &live_value) {
                    return Ok(Applied::Unchanged(live));
                }

                // Replace conditioned on the resourceVersion carried over from live
                let merged =
                    ManagedObject::from_value(reference.kind, overlay(desired_value, &live_value)).map_err(serialization_error)?;
                match client.replace_object(&merged).await {
                    Ok(updated) => Ok(Applied::Updated(updated)),
                    // Deleted since it was read; the next attempt recreates it
                    Err(ClientError::NotFound(msg)) => Err(ControllerError::Conflict(format!(
                        "{} disappeared during update: {}",
                        reference, msg
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
        })
        .await
    }

    /// Patch the status unless it is already current. Returns whether a write happened.
    async fn write_status(&self, devserver: &DevServer, status: DevServerStatus) -> Result<bool, ControllerError> {
        if devserver.status.as_ref() == Some(&status) {
            return Ok(false);
        }
        let namespace = devserver.namespace().unwrap_or_default();
        let name = devserver.name_any();
        let client = self.client.clone();
        let result = retry_with_backoff(&self.retry, "patch_devserver_status", || {
            let client = client.clone();
            let (namespace, name, status) = (&namespace, &name, &status);
            async move { Ok(client.patch_devserver_status(namespace, name, status).await?) }
        })
        .await;

        match result {
            Ok(()) => {
                debug!("DevServer {}/{} is {}", namespace, name, status.phase);
                Ok(true)
            }
            Err(ControllerError::NotFound(_)) => {
                debug!("DevServer {}/{} deleted before its status was written", namespace, name);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

fn skip_reason(devserver: &DevServer) -> Option<&'static str> {
    if devserver.metadata.deletion_timestamp.is_some() {
        return Some("deletion in progress");
    }
    let status = devserver.status.as_ref()?;
    match status.phase {
        DevServerPhase::Expired => Some("expired"),
        DevServerPhase::Failed if status.observed_generation == devserver.metadata.generation => {
            Some("failed at this generation; waiting for a spec change")
        }
        _ => None,
    }
}

/// Status to report once deletion has begun; an expired DevServer keeps its phase.
fn deleting_status(devserver: &DevServer) -> Option<DevServerStatus> {
    devserver.metadata.deletion_timestamp.as_ref()?;
    let mut status = devserver.status.clone().unwrap_or_default();
    match status.phase {
        DevServerPhase::Deleting | DevServerPhase::Expired => None,
        _ => {
            status.phase = DevServerPhase::Deleting;
            Some(status)
        }
    }
}

/// Refuse to adopt an object controlled by something else.
fn check_owner(live: &ManagedObject, owner_uid: &str) -> Result<(), ControllerError> {
    let controller = live
        .metadata()
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)));
    match controller {
        Some(owner) if owner.uid != owner_uid => Err(ControllerError::Transient(format!(
            "{} is controlled by {} {} (uid {}), waiting for it to be released",
            live.object_ref(),
            owner.kind,
            owner.name,
            owner.uid
        ))),
        _ => Ok(()),
    }
}

fn serialization_error(e: serde_json::Error) -> ControllerError {
    ControllerError::Validation(format!("object serialization failed: {}", e))
}

/// All desired replicas report ready
pub fn workload_ready(sts: &StatefulSet) -> bool {
    let want = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1).max(1);
    sts.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0) >= want
}

/// Upsert `condition`, keeping the previous transition time when the status did not change.
pub fn set_condition(conditions: &mut Vec<DevServerCondition>, mut condition: DevServerCondition, now: DateTime<Utc>) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            condition.last_transition_time = if existing.status == condition.status {
                existing.last_transition_time.or(Some(now))
            } else {
                Some(now)
            };
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

fn condition(type_: &str, status: ConditionStatus, reason: &str, message: Option<String>) -> DevServerCondition {
    DevServerCondition {
        type_: type_.to_string(),
        status,
        reason: reason.to_string(),
        message,
        last_transition_time: None,
    }
}

/// Status after a successful pass
pub fn converged_status(
    current: Option<&DevServerStatus>,
    generation: Option<i64>,
    ready: bool,
    now: DateTime<Utc>,
) -> DevServerStatus {
    let mut conditions = current.map(|s| s.conditions.clone()).unwrap_or_default();
    set_condition(
        &mut conditions,
        condition(CONDITION_RECONCILED, ConditionStatus::True, "Converged", None),
        now,
    );
    let (phase, ready_condition, message) = if ready {
        (
            DevServerPhase::Running,
            condition(CONDITION_READY, ConditionStatus::True, "WorkloadReady", None),
            None,
        )
    } else {
        (
            DevServerPhase::Pending,
            condition(CONDITION_READY, ConditionStatus::False, "WorkloadNotReady", None),
            Some("waiting for the workload to become ready".to_string()),
        )
    };
    set_condition(&mut conditions, ready_condition, now);
    DevServerStatus {
        phase,
        conditions,
        observed_generation: generation,
        message,
    }
}

/// Status after a terminal error
pub fn failed_status(
    current: Option<&DevServerStatus>,
    generation: Option<i64>,
    err: &ControllerError,
    now: DateTime<Utc>,
) -> DevServerStatus {
    let mut conditions = current.map(|s| s.conditions.clone()).unwrap_or_default();
    set_condition(
        &mut conditions,
        condition(CONDITION_RECONCILED, ConditionStatus::False, err.reason(), Some(err.to_string())),
        now,
    );
    DevServerStatus {
        phase: DevServerPhase::Failed,
        conditions,
        observed_generation: generation,
        message: Some(err.to_string()),
    }
}

/// Status after the retry budget ran out; the phase is left as it was
pub fn degraded_status(
    current: Option<&DevServerStatus>,
    generation: Option<i64>,
    err: &ControllerError,
    now: DateTime<Utc>,
) -> DevServerStatus {
    let mut status = current.cloned().unwrap_or_default();
    if status.phase == DevServerPhase::Failed {
        status.phase = DevServerPhase::Pending;
    }
    set_condition(
        &mut status.conditions,
        condition(CONDITION_RECONCILED, ConditionStatus::Unknown, err.reason(), Some(err.to_string())),
        now,
    );
    status.observed_generation = generation;
    status.message = Some(err.to_string());
    status
}

#[cfg(test)]
#[path = "converger_test.rs"]
mod converger_test;
