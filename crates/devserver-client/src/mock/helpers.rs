//! Metadata bookkeeping shared by the mock stores

use crate::error::ClientError;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Lock a store, recovering from a poisoned mutex left by a panicking test.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Fill in server-assigned fields on create.
pub(crate) fn stamp_created(meta: &mut ObjectMeta, version: u64) {
    if meta.uid.is_none() {
        meta.uid = Some(Uuid::new_v4().to_string());
    }
    if meta.creation_timestamp.is_none() {
        meta.creation_timestamp = crds::time::from_chrono(Utc::now());
    }
    meta.generation = Some(1);
    meta.resource_version = Some(version.to_string());
}

/// Reject a write carrying a stale resourceVersion.
pub(crate) fn check_version(incoming: &ObjectMeta, stored: &ObjectMeta, what: &str) -> Result<(), ClientError> {
    match (&incoming.resource_version, &stored.resource_version) {
        (Some(theirs), Some(ours)) if theirs != ours => Err(ClientError::Conflict(format!(
            "{} has been modified (resourceVersion {} != {})",
            what, theirs, ours
        ))),
        _ => Ok(()),
    }
}

/// Carry server-owned identity across a replace and bump the version.
pub(crate) fn carry_identity(incoming: &mut ObjectMeta, stored: &ObjectMeta, version: u64, spec_changed: bool) {
    incoming.uid = stored.uid.clone();
    incoming.creation_timestamp = stored.creation_timestamp.clone();
    let generation = stored.generation.unwrap_or(1);
    incoming.generation = Some(if spec_changed { generation + 1 } else { generation });
    incoming.resource_version = Some(version.to_string());
}
