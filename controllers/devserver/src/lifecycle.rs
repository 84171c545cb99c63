//! Lifecycle monitor.
//!
//! Periodically retires DevServers whose time-to-live, absolute expiration
//! time or idle timeout has passed. Retirement is a plain delete; owner
//! references let the API server remove the children.

use crate::backoff::{RetryConfig, retry_with_backoff};
use crate::error::ControllerError;
use crate::events::EventPublisher;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use crds::{DevServer, DevServerPhase};
use devserver_client::{ClusterClientTrait, EventRecord};
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Annotation carrying the last observed user activity (RFC 3339)
pub const LAST_ACTIVITY_ANNOTATION: &str = "devserver.io/last-activity";

/// Source of last-activity timestamps for idle shutdown
#[async_trait]
pub trait ActivitySource: Send + Sync {
    async fn last_activity(&self, devserver: &DevServer) -> Option<DateTime<Utc>>;
}

/// Reads [`LAST_ACTIVITY_ANNOTATION`] from the DevServer itself
#[derive(Debug, Clone, Copy, Default)]
pub struct AnnotationActivitySource;

#[async_trait]
impl ActivitySource for AnnotationActivitySource {
    async fn last_activity(&self, devserver: &DevServer) -> Option<DateTime<Utc>> {
        let raw = devserver.annotations().get(LAST_ACTIVITY_ANNOTATION)?;
        match DateTime::parse_from_rfc3339(raw) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                warn!(
                    "Ignoring malformed {} on DevServer {}: {}",
                    LAST_ACTIVITY_ANNOTATION,
                    devserver.name_any(),
                    e
                );
                None
            }
        }
    }
}

/// Why a DevServer is retired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Expired,
    Idle,
}

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    /// `namespace/name` of every DevServer retired in this sweep
    pub retired: Vec<String>,
}

pub struct LifecycleMonitor {
    client: Arc<dyn ClusterClientTrait>,
    activity: Arc<dyn ActivitySource>,
    events: EventPublisher,
    namespace: Option<String>,
    retry: RetryConfig,
}

impl LifecycleMonitor {
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        activity: Arc<dyn ActivitySource>,
        events: EventPublisher,
        namespace: Option<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            activity,
            events,
            namespace,
            retry,
        }
    }

    /// Sweep every `interval` until `shutdown` is cancelled. A sweep in
    /// progress always runs to completion.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!("Lifecycle monitor started (interval {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.sweep(Utc::now()).await {
                        Ok(report) if !report.retired.is_empty() => {
                            info!("Lifecycle sweep retired {} of {} DevServers", report.retired.len(), report.checked);
                        }
                        Ok(report) => debug!("Lifecycle sweep checked {} DevServers", report.checked),
                        Err(e) => error!("Lifecycle sweep failed: {}", e),
                    }
                }
            }
        }
        info!("Lifecycle monitor stopped");
    }

    /// Retire every DevServer whose deadline is at or before `now`.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, ControllerError> {
        let client = self.client.clone();
        let namespace = self.namespace.clone();
        let devservers = retry_with_backoff(&self.retry, "list_devservers", || {
            let client = client.clone();
            let namespace = namespace.clone();
            async move { Ok(client.list_devservers(namespace.as_deref()).await?) }
        })
        .await?;

        let mut report = SweepReport {
            checked: devservers.len(),
            ..Default::default()
        };
        for devserver in devservers {
            if devserver.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let Some(reason) = self.due(&devserver, now).await else {
                continue;
            };
            let key = format!("{}/{}", devserver.namespace().unwrap_or_default(), devserver.name_any());
            match self.retire(&devserver, reason).await {
                Ok(()) => report.retired.push(key),
                // One failure must not stall the rest of the sweep
                Err(e) => error!("Failed to retire DevServer {}: {}", key, e),
            }
        }
        Ok(report)
    }

    /// Whether `devserver` is due for retirement at `now`, and why.
    async fn due(&self, devserver: &DevServer, now: DateTime<Utc>) -> Option<RetireReason> {
        let lifecycle = devserver.spec.lifecycle.as_ref()?;

        match devserver.effective_expiry() {
            Ok(Some(expiry)) if now >= expiry => return Some(RetireReason::Expired),
            Ok(_) => {}
            Err(e) => warn!("DevServer {} has an unusable lifecycle: {}", devserver.name_any(), e),
        }

        if lifecycle.auto_shutdown {
            // Never used since creation counts as idle since creation
            let last_activity = self.activity.last_activity(devserver).await.or_else(|| devserver.created_at());
            match lifecycle.idle_deadline(last_activity) {
                Ok(Some(deadline)) if now >= deadline => return Some(RetireReason::Idle),
                Ok(_) => {}
                Err(e) => warn!("DevServer {} has an unusable idle timeout: {}", devserver.name_any(), e),
            }
        }
        None
    }

    async fn retire(&self, devserver: &DevServer, reason: RetireReason) -> Result<(), ControllerError> {
        let namespace = devserver.namespace().unwrap_or_default();
        let name = devserver.name_any();
        let note = match reason {
            RetireReason::Expired => "time-to-live or expiration time reached",
            RetireReason::Idle => "idle timeout reached",
        };
        info!("Retiring DevServer {}/{}: {}", namespace, name, note);

        // Best effort: watchers see Expired before the object disappears
        let mut status = devserver.status.clone().unwrap_or_default();
        status.phase = DevServerPhase::Expired;
        status.message = Some(note.to_string());
        if let Err(e) = self.client.patch_devserver_status(&namespace, &name, &status).await {
            debug!("Could not mark DevServer {}/{} expired: {}", namespace, name, e);
        }

        let client = self.client.clone();
        let deleted = retry_with_backoff(&self.retry, "delete_devserver", || {
            let client = client.clone();
            let (namespace, name) = (&namespace, &name);
            async move { Ok(client.delete_devserver(namespace, name).await?) }
        })
        .await;
        match deleted {
            Ok(()) => {}
            Err(ControllerError::NotFound(_)) => {
                debug!("DevServer {}/{} already gone", namespace, name);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let event_reason = match reason {
            RetireReason::Expired => "Expired",
            RetireReason::Idle => "IdleShutdown",
        };
        self.events
            .publish(devserver, EventRecord::normal(event_reason, "Delete", note))
            .await;
        Ok(())
    }
}
