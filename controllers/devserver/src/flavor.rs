//! Flavor resolution and default-flavor uniqueness.
//!
//! At most one `DevServerFlavor` may carry `default: true`. When a flavor is
//! written with `default: true` every other default is demoted, so the most
//! recently marked flavor wins. A DevServer without an explicit flavor uses
//! that default.

use crate::backoff::{RetryConfig, retry_with_backoff};
use crate::error::ControllerError;
use crate::events::EventPublisher;
use crds::{DevServer, DevServerFlavor};
use devserver_client::{ClusterClientTrait, EventRecord};
use kube::ResourceExt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Resolves flavors and keeps the default unique
#[derive(Clone)]
pub struct FlavorResolver {
    client: Arc<dyn ClusterClientTrait>,
    events: EventPublisher,
    retry: RetryConfig,
    /// Serializes enforcement across flavors; clones share it
    enforcing: Arc<Mutex<()>>,
}

impl FlavorResolver {
    pub fn new(client: Arc<dyn ClusterClientTrait>, events: EventPublisher, retry: RetryConfig) -> Self {
        Self {
            client,
            events,
            retry,
            enforcing: Arc::new(Mutex::new(())),
        }
    }

    /// The flavor a DevServer runs with: its own, or the cluster default.
    pub async fn resolve_effective(&self, devserver: &DevServer) -> Result<DevServerFlavor, ControllerError> {
        match devserver.spec.flavor.as_deref() {
            Some(name) => {
                let client = self.client.clone();
                retry_with_backoff(&self.retry, "get_flavor", || {
                    let client = client.clone();
                    async move { client.get_flavor(name).await.map_err(ControllerError::from) }
                })
                .await
                .map_err(|e| match e {
                    ControllerError::NotFound(_) => {
                        ControllerError::NotFound(format!("DevServerFlavor '{}' not found", name))
                    }
                    other => other,
                })
            }
            None => {
                let flavors = self.list_flavors().await?;
                select_default(flavors)
            }
        }
    }

    /// Demote every other default when `incoming` is marked default.
    ///
    /// Returns the names of demoted flavors. Each demotion is a
    /// read-modify-write conditioned on the fresh resourceVersion.
    ///
    /// Only one enforcement runs at a time. Two flavors marked default
    /// together must not demote each other and leave no default behind.
    pub async fn enforce_default_uniqueness(&self, incoming: &DevServerFlavor) -> Result<Vec<String>, ControllerError> {
        let name = incoming.name_any();
        if !incoming.is_default() {
            return Ok(Vec::new());
        }
        let _enforcing = self.enforcing.lock().await;

        // The event may be stale: only act if the flavor is still the default
        let current = match self.client.get_flavor(&name).await {
            Ok(flavor) => flavor,
            Err(e) if e.is_not_found() => {
                debug!("DevServerFlavor {} is gone, nothing to enforce", name);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        if !current.is_default() {
            debug!("DevServerFlavor {} is no longer default, skipping demotion", name);
            return Ok(Vec::new());
        }

        let others: Vec<String> = self
            .list_flavors()
            .await?
            .into_iter()
            .filter(|f| f.is_default() && f.name_any() != name)
            .map(|f| f.name_any())
            .collect();

        let mut demoted = Vec::new();
        for other in others {
            if self.demote(&other, &name).await? {
                info!("Demoted DevServerFlavor {} in favour of new default {}", other, name);
                if let Ok(flavor) = self.client.get_flavor(&other).await {
                    self.events
                        .publish(
                            &flavor,
                            EventRecord::normal(
                                "Demoted",
                                "Reconcile",
                                format!("default moved to DevServerFlavor {}", name),
                            ),
                        )
                        .await;
                }
                demoted.push(other);
            }
        }
        Ok(demoted)
    }

    /// Clear `default` on `name` while `winner` still holds it.
    async fn demote(&self, name: &str, winner: &str) -> Result<bool, ControllerError> {
        let client = self.client.clone();
        let result = retry_with_backoff(&self.retry, "demote_flavor", || {
            let client = client.clone();
            async move {
                match client.get_flavor(winner).await {
                    Ok(flavor) if flavor.spec.default => {}
                    Ok(_) => {
                        debug!("DevServerFlavor {} lost default, keeping {}", winner, name);
                        return Ok(false);
                    }
                    Err(e) if e.is_not_found() => {
                        debug!("DevServerFlavor {} is gone, keeping {}", winner, name);
                        return Ok(false);
                    }
                    Err(e) => return Err(e.into()),
                }
                let mut fresh = client.get_flavor(name).await?;
                if !fresh.spec.default {
                    return Ok(false);
                }
                fresh.spec.default = false;
                client.replace_flavor(&fresh).await?;
                Ok(true)
            }
        })
        .await;

        match result {
            Err(ControllerError::NotFound(_)) => {
                warn!("DevServerFlavor {} disappeared before demotion", name);
                Ok(false)
            }
            other => other,
        }
    }

    async fn list_flavors(&self) -> Result<Vec<DevServerFlavor>, ControllerError> {
        let client = self.client.clone();
        retry_with_backoff(&self.retry, "list_flavors", || {
            let client = client.clone();
            async move { client.list_flavors().await.map_err(ControllerError::from) }
        })
        .await
    }
}

/// Pick the single default among `flavors`.
pub fn select_default(flavors: Vec<DevServerFlavor>) -> Result<DevServerFlavor, ControllerError> {
    let mut defaults: Vec<DevServerFlavor> = flavors.into_iter().filter(DevServerFlavor::is_default).collect();
    match defaults.len() {
        0 => Err(ControllerError::NoDefaultFlavor),
        1 => Ok(defaults.remove(0)),
        _ => {
            let mut names: Vec<String> = defaults.iter().map(|f| f.name_any()).collect();
            names.sort();
            Err(ControllerError::DataInvariantViolation(format!(
                "multiple default DevServerFlavors: {}",
                names.join(", ")
            )))
        }
    }
}

#[cfg(test)]
#[path = "flavor_test.rs"]
mod flavor_test;
