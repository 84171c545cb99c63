//! Flavor schedulability.
//!
//! Classification is a pure function of the flavor spec and the current node
//! and autoscaler pool inventory, recomputed from scratch on every pass.

use crate::backoff::{RetryConfig, retry_with_backoff};
use crate::error::ControllerError;
use chrono::{DateTime, Utc};
use crds::quantity::{ResourceQuantity, parse_quantity};
use crds::{DevServerFlavor, DevServerFlavorSpec, DevServerFlavorStatus, Schedulability};
use devserver_client::{AutoscalerPool, ClusterClientTrait, NodeInventory, NodeTaint};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A classification and the reason for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub schedulable: Schedulability,
    pub message: String,
}

/// Classify `spec` against the given inventory.
pub fn classify(spec: &DevServerFlavorSpec, nodes: &[NodeInventory], pools: &[AutoscalerPool]) -> Classification {
    let requests = match parse_requests(&spec.resources.requests) {
        Ok(requests) => requests,
        Err(message) => {
            return Classification {
                schedulable: Schedulability::No,
                message,
            };
        }
    };

    if let Some(pool) = pools.iter().find(|p| pool_matches(spec, &requests, p)) {
        return Classification {
            schedulable: Schedulability::Autoscaled,
            message: format!("autoscaler pool {} can provision matching nodes", pool.name),
        };
    }
    if let Some(node) = nodes.iter().find(|n| node_matches(spec, &requests, n)) {
        return Classification {
            schedulable: Schedulability::Yes,
            message: format!("node {} can host the flavor", node.name),
        };
    }
    Classification {
        schedulable: Schedulability::No,
        message: "no ready node or autoscaler pool satisfies the flavor's requests, node selector and tolerations"
            .to_string(),
    }
}

fn parse_requests(requests: &BTreeMap<String, String>) -> Result<BTreeMap<String, ResourceQuantity>, String> {
    requests
        .iter()
        .map(|(name, value)| {
            parse_quantity(value)
                .map(|q| (name.clone(), q))
                .map_err(|_| format!("request {}={} is not a valid quantity", name, value))
        })
        .collect()
}

fn selector_matches(selector: &BTreeMap<String, String>, labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

/// Every taint that repels pods is tolerated
fn taints_tolerated(spec: &DevServerFlavorSpec, taints: &[NodeTaint]) -> bool {
    taints
        .iter()
        .filter(|t| t.effect == "NoSchedule" || t.effect == "NoExecute")
        .all(|t| {
            spec.tolerations
                .iter()
                .any(|tol| tol.tolerates(&t.key, t.value.as_deref(), &t.effect))
        })
}

/// `capacity` covers every request. A resource missing from `capacity`
/// counts as `missing` (zero for nodes, unbounded for pool limits).
fn fits(
    requests: &BTreeMap<String, ResourceQuantity>,
    capacity: &BTreeMap<String, String>,
    missing: Option<ResourceQuantity>,
) -> bool {
    requests.iter().all(|(name, want)| {
        let have = match capacity.get(name) {
            Some(raw) => match parse_quantity(raw) {
                Ok(q) => Some(q),
                Err(_) => Some(ResourceQuantity::ZERO),
            },
            None => missing,
        };
        have.is_none_or(|have| &have >= want)
    })
}

fn pool_matches(spec: &DevServerFlavorSpec, requests: &BTreeMap<String, ResourceQuantity>, pool: &AutoscalerPool) -> bool {
    pool.ready
        && selector_matches(&spec.node_selector, &pool.labels)
        && taints_tolerated(spec, &pool.taints)
        && pool.limits.as_ref().is_none_or(|limits| fits(requests, limits, None))
}

fn node_matches(spec: &DevServerFlavorSpec, requests: &BTreeMap<String, ResourceQuantity>, node: &NodeInventory) -> bool {
    node.ready
        && !node.unschedulable
        && selector_matches(&spec.node_selector, &node.labels)
        && taints_tolerated(spec, &node.taints)
        && fits(requests, &node.allocatable, Some(ResourceQuantity::ZERO))
}

/// Outcome of one evaluation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub evaluated: usize,
    /// Flavors whose classification changed
    pub changed: Vec<String>,
}

/// Periodically writes each flavor's schedulability into its status
pub struct SchedulabilityEvaluator {
    client: Arc<dyn ClusterClientTrait>,
    retry: RetryConfig,
}

impl SchedulabilityEvaluator {
    pub fn new(client: Arc<dyn ClusterClientTrait>, retry: RetryConfig) -> Self {
        Self { client, retry }
    }

    /// Evaluate every `interval` until `shutdown` is cancelled.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) {
        info!("Schedulability evaluator started (interval {:?})", interval);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match self.evaluate_all(Utc::now()).await {
                        Ok(report) => debug!(
                            "Evaluated {} flavors, {} changed",
                            report.evaluated,
                            report.changed.len()
                        ),
                        Err(e) => error!("Schedulability evaluation failed: {}", e),
                    }
                }
            }
        }
        info!("Schedulability evaluator stopped");
    }

    /// Classify every flavor against one inventory snapshot.
    pub async fn evaluate_all(&self, now: DateTime<Utc>) -> Result<EvaluationReport, ControllerError> {
        let client = self.client.clone();
        let flavors = retry_with_backoff(&self.retry, "list_flavors", || {
            let client = client.clone();
            async move { Ok(client.list_flavors().await?) }
        })
        .await?;

        let inventory = self.inventory().await;
        let mut report = EvaluationReport {
            evaluated: flavors.len(),
            ..Default::default()
        };
        for flavor in &flavors {
            match self.record(flavor, &inventory, now).await {
                Ok(true) => report.changed.push(flavor.name_any()),
                Ok(false) => {}
                Err(e) => warn!("Failed to record schedulability of DevServerFlavor {}: {}", flavor.name_any(), e),
            }
        }
        Ok(report)
    }

    /// Classify a single flavor, e.g. right after it was created or edited.
    pub async fn evaluate_one(&self, flavor: &DevServerFlavor, now: DateTime<Utc>) -> Result<bool, ControllerError> {
        let inventory = self.inventory().await;
        self.record(flavor, &inventory, now).await
    }

    async fn inventory(&self) -> Result<(Vec<NodeInventory>, Vec<AutoscalerPool>), ControllerError> {
        let client = self.client.clone();
        retry_with_backoff(&self.retry, "list_inventory", || {
            let client = client.clone();
            async move {
                let nodes = client.list_nodes().await?;
                let pools = client.list_autoscaler_pools().await?;
                Ok((nodes, pools))
            }
        })
        .await
    }

    /// Write the classification if it changed. Returns whether it did.
    async fn record(
        &self,
        flavor: &DevServerFlavor,
        inventory: &Result<(Vec<NodeInventory>, Vec<AutoscalerPool>), ControllerError>,
        now: DateTime<Utc>,
    ) -> Result<bool, ControllerError> {
        let name = flavor.name_any();
        let classification = match inventory {
            Ok((nodes, pools)) => classify(&flavor.spec, nodes, pools),
            Err(e) => Classification {
                schedulable: Schedulability::Unknown,
                message: format!("inventory query failed: {}", e),
            },
        };

        let current = flavor.status.as_ref();
        if current.is_some_and(|s| {
            s.schedulable == classification.schedulable && s.message.as_deref() == Some(classification.message.as_str())
        }) {
            debug!("DevServerFlavor {} is still {}", name, classification.schedulable);
            return Ok(false);
        }

        info!(
            "DevServerFlavor {} schedulability: {} ({})",
            name, classification.schedulable, classification.message
        );
        let status = DevServerFlavorStatus {
            schedulable: classification.schedulable,
            last_evaluated: Some(now),
            message: Some(classification.message),
        };
        let client = self.client.clone();
        retry_with_backoff(&self.retry, "patch_flavor_status", || {
            let client = client.clone();
            let (name, status) = (&name, &status);
            async move { Ok(client.patch_flavor_status(name, status).await?) }
        })
        .await?;
        Ok(true)
    }
}
