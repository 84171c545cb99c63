//! Main controller implementation.
//!
//! Wires the components together: watchers feed the dispatcher, whose
//! table routes DevServer deltas to the converger, flavor deltas to default
//! enforcement and schedulability, and user deltas to the user reconciler.
//! The lifecycle monitor and schedulability evaluator run as periodic tasks.
//! Everything stops as a unit when the shutdown token is cancelled.

use crate::backoff::{RequeueTracker, RetryConfig};
use crate::config::OperatorConfig;
use crate::converger::Converger;
use crate::dispatcher::{Delta, DispatchTable, Dispatcher, EventType, ResourceKind, ResourceObject};
use crate::error::ControllerError;
use crate::events::EventPublisher;
use crate::flavor::FlavorResolver;
use crate::lifecycle::{AnnotationActivitySource, LifecycleMonitor};
use crate::schedulability::SchedulabilityEvaluator;
use crate::user::UserReconciler;
use crate::watcher::Watcher;
use chrono::Utc;
use devserver_client::{ClusterClient, ClusterClientTrait};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::ResourceExt;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything the dispatch table's handlers call into
pub struct Handlers {
    client: Arc<dyn ClusterClientTrait>,
    converger: Converger,
    resolver: FlavorResolver,
    evaluator: SchedulabilityEvaluator,
    users: UserReconciler,
}

impl Handlers {
    pub fn new(client: Arc<dyn ClusterClientTrait>, config: Arc<OperatorConfig>, retry: RetryConfig) -> Self {
        let events = EventPublisher::new(client.clone(), config.posting_enabled);
        let resolver = FlavorResolver::new(client.clone(), events.clone(), retry.clone());
        Self {
            converger: Converger::new(client.clone(), config, resolver.clone(), events, retry.clone()),
            resolver,
            evaluator: SchedulabilityEvaluator::new(client.clone(), retry.clone()),
            users: UserReconciler::new(client.clone(), retry),
            client,
        }
    }

    // Deltas may be stale by the time they are handled (coalesced or
    // requeued), so every handler works from a fresh read.

    async fn on_devserver(&self, delta: Delta) -> Result<(), ControllerError> {
        let ResourceObject::DevServer(devserver) = delta.object else {
            return Ok(());
        };
        let namespace = devserver.namespace().unwrap_or_default();
        let name = devserver.name_any();
        let Some(fresh) = not_found_is_none(self.client.get_devserver(&namespace, &name).await)? else {
            debug!("DevServer {}/{} is gone, nothing to converge", namespace, name);
            return Ok(());
        };
        self.converger.converge(&fresh).await.map(|_| ())
    }

    async fn on_flavor(&self, delta: Delta) -> Result<(), ControllerError> {
        let ResourceObject::Flavor(flavor) = delta.object else {
            return Ok(());
        };
        let name = flavor.name_any();
        let Some(fresh) = not_found_is_none(self.client.get_flavor(&name).await)? else {
            debug!("DevServerFlavor {} is gone", name);
            return Ok(());
        };
        self.resolver.enforce_default_uniqueness(&fresh).await?;
        self.evaluator.evaluate_one(&fresh, Utc::now()).await.map(|_| ())
    }

    async fn on_user(&self, delta: Delta) -> Result<(), ControllerError> {
        let ResourceObject::User(user) = delta.object else {
            return Ok(());
        };
        let name = user.name_any();
        let Some(fresh) = not_found_is_none(self.client.get_user(&name).await)? else {
            debug!("DevServerUser {} is gone", name);
            return Ok(());
        };
        self.users.reconcile(&fresh).await.map(|_| ())
    }
}

fn not_found_is_none<T>(result: Result<T, devserver_client::ClientError>) -> Result<Option<T>, ControllerError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(devserver_client::ClientError::NotFound(_)) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Routes built once at startup. Deletions need no handler: owned objects
/// are garbage collected through their owner references.
pub fn dispatch_table(handlers: Arc<Handlers>) -> DispatchTable {
    let upserts = [EventType::Added, EventType::Modified];
    let devservers = handlers.clone();
    let flavors = handlers.clone();
    let users = handlers;
    DispatchTable::new()
        .on(ResourceKind::DevServer, &upserts, move |delta| {
            let handlers = devservers.clone();
            async move { handlers.on_devserver(delta).await }
        })
        .on(ResourceKind::Flavor, &upserts, move |delta| {
            let handlers = flavors.clone();
            async move { handlers.on_flavor(delta).await }
        })
        .on(ResourceKind::User, &upserts, move |delta| {
            let handlers = users.clone();
            async move { handlers.on_user(delta).await }
        })
}

/// Main controller for DevServer resources.
pub struct Controller {
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    devserver_watcher: JoinHandle<Result<(), ControllerError>>,
    statefulset_watcher: JoinHandle<Result<(), ControllerError>>,
    configmap_watcher: JoinHandle<Result<(), ControllerError>>,
    service_watcher: JoinHandle<Result<(), ControllerError>>,
    flavor_watcher: JoinHandle<Result<(), ControllerError>>,
    user_watcher: JoinHandle<Result<(), ControllerError>>,
    lifecycle_monitor: JoinHandle<()>,
    schedulability_evaluator: JoinHandle<()>,
}

impl Controller {
    /// Connect to the cluster and start every watcher and periodic task.
    pub async fn new(config: Arc<OperatorConfig>, shutdown: CancellationToken) -> Result<Self, ControllerError> {
        info!("Initializing DevServer operator");

        let cluster = ClusterClient::try_default().await?;
        let kube_client = cluster.kube_client();
        let client: Arc<dyn ClusterClientTrait> = Arc::new(cluster);
        let retry = RetryConfig::with_max_attempts(config.max_retry_attempts);

        let handlers = Arc::new(Handlers::new(client.clone(), config.clone(), retry.clone()));
        let dispatcher = Dispatcher::new(
            dispatch_table(handlers),
            config.worker_limit,
            RequeueTracker::default(),
            shutdown.clone(),
        );

        let monitor = LifecycleMonitor::new(
            client.clone(),
            Arc::new(AnnotationActivitySource),
            EventPublisher::new(client.clone(), config.posting_enabled),
            config.watch_namespace.clone(),
            retry.clone(),
        );
        let lifecycle_monitor = tokio::spawn(monitor.run(config.expiration_interval(), shutdown.clone()));

        let evaluator = SchedulabilityEvaluator::new(client.clone(), retry);
        let schedulability_evaluator =
            tokio::spawn(evaluator.run(config.flavor_reconciliation_interval(), shutdown.clone()));

        let watcher = Arc::new(Watcher::new(kube_client, dispatcher.clone(), config.watch_namespace.clone()));
        let devserver_watcher = {
            let watcher = watcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.watch_devservers(shutdown).await })
        };
        let statefulset_watcher = {
            let watcher = watcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.watch_owned::<StatefulSet>("StatefulSet", shutdown).await })
        };
        let configmap_watcher = {
            let watcher = watcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.watch_owned::<ConfigMap>("ConfigMap", shutdown).await })
        };
        let service_watcher = {
            let watcher = watcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.watch_owned::<Service>("Service", shutdown).await })
        };
        let flavor_watcher = {
            let watcher = watcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.watch_flavors(shutdown).await })
        };
        let user_watcher = {
            let watcher = watcher.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { watcher.watch_users(shutdown).await })
        };

        Ok(Self {
            dispatcher,
            shutdown,
            devserver_watcher,
            statefulset_watcher,
            configmap_watcher,
            service_watcher,
            flavor_watcher,
            user_watcher,
            lifecycle_monitor,
            schedulability_evaluator,
        })
    }

    /// Run until shutdown is requested or a watcher or periodic task fails for good.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!("DevServer operator running");

        let (result, lifecycle_done, evaluator_done) = tokio::select! {
            _ = self.shutdown.cancelled() => (Ok(()), false, false),
            result = &mut self.devserver_watcher => (watcher_exit("DevServer", result), false, false),
            result = &mut self.statefulset_watcher => (watcher_exit("StatefulSet", result), false, false),
            result = &mut self.configmap_watcher => (watcher_exit("ConfigMap", result), false, false),
            result = &mut self.service_watcher => (watcher_exit("Service", result), false, false),
            result = &mut self.flavor_watcher => (watcher_exit("DevServerFlavor", result), false, false),
            result = &mut self.user_watcher => (watcher_exit("DevServerUser", result), false, false),
            result = &mut self.lifecycle_monitor => {
                (periodic_exit("lifecycle monitor", result, self.shutdown.is_cancelled()), true, false)
            }
            result = &mut self.schedulability_evaluator => {
                (periodic_exit("schedulability evaluator", result, self.shutdown.is_cancelled()), false, true)
            }
        };
        if let Err(e) = &result {
            error!("DevServer operator stopping: {}", e);
        }

        info!("Shutting down DevServer operator");
        self.shutdown.cancel();
        self.dispatcher.drain().await;

        // A handle that already finished in the select must not be polled again
        let mut remaining = Vec::new();
        if !lifecycle_done {
            remaining.push(("lifecycle monitor", self.lifecycle_monitor));
        }
        if !evaluator_done {
            remaining.push(("schedulability evaluator", self.schedulability_evaluator));
        }
        for (name, handle) in remaining {
            periodic_exit(name, handle.await, true)?;
        }
        result
    }
}

/// A periodic task only returns on shutdown; anything else is fatal.
fn periodic_exit(
    what: &str,
    result: Result<(), tokio::task::JoinError>,
    shutting_down: bool,
) -> Result<(), ControllerError> {
    result.map_err(|e| ControllerError::Watch(format!("{} panicked: {}", what, e)))?;
    if shutting_down {
        Ok(())
    } else {
        Err(ControllerError::Watch(format!("{} stopped unexpectedly", what)))
    }
}

fn watcher_exit(
    what: &str,
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result
        .map_err(|e| ControllerError::Watch(format!("{} watcher panicked: {}", what, e)))?
        .map_err(|e| ControllerError::Watch(format!("{} watcher error: {}", what, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use crds::{DevServerPhase, Schedulability};
    use devserver_client::{MockClusterClient, ObjectKind};

    fn dispatcher_for(mock: Arc<MockClusterClient>) -> Dispatcher {
        let handlers = Arc::new(Handlers::new(mock, Arc::new(test_config()), RetryConfig::immediate(3)));
        Dispatcher::new(
            dispatch_table(handlers),
            2,
            RequeueTracker::default(),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_devserver_delta_converges_fresh_object() {
        let mock = mock_with_flavors(vec![create_test_flavor("small", "1", "1Gi", true)]);
        let devserver = mock.add_devserver(create_test_devserver("scratch"));
        let dispatcher = dispatcher_for(mock.clone());

        dispatcher.submit(Delta::devserver(EventType::Added, devserver));
        dispatcher.drain().await;

        assert!(mock.object(ObjectKind::StatefulSet, Some(TEST_NAMESPACE), "scratch").is_some());
        let status = mock.devserver(TEST_NAMESPACE, "scratch").unwrap().status.unwrap();
        assert_eq!(status.phase, DevServerPhase::Pending);
    }

    #[tokio::test]
    async fn test_delta_for_deleted_devserver_is_a_noop() {
        let mock = mock_with_flavors(vec![create_test_flavor("small", "1", "1Gi", true)]);
        let dispatcher = dispatcher_for(mock.clone());

        dispatcher.submit(Delta::devserver(EventType::Modified, create_test_devserver("gone")));
        dispatcher.drain().await;

        assert!(mock.objects().is_empty());
    }

    #[tokio::test]
    async fn test_flavor_delta_enforces_default_and_evaluates() {
        let mock = mock_with_flavors(vec![
            create_test_flavor("small", "1", "1Gi", true),
            create_test_flavor("large", "8", "32Gi", true),
        ]);
        mock.set_nodes(vec![create_test_node("node-a", "4", "16Gi")]);
        let large = mock.flavor("large").unwrap();
        let dispatcher = dispatcher_for(mock.clone());

        dispatcher.submit(Delta::flavor(EventType::Modified, large));
        dispatcher.drain().await;

        assert!(!mock.flavor("small").unwrap().is_default());
        let large = mock.flavor("large").unwrap();
        assert!(large.is_default());
        assert_eq!(large.status.unwrap().schedulable, Schedulability::No);
    }

    #[tokio::test]
    async fn test_user_delta_provisions_namespace() {
        let mock = Arc::new(MockClusterClient::new());
        let user = mock.add_user(create_test_user("alice", "alice"));
        let dispatcher = dispatcher_for(mock.clone());

        dispatcher.submit(Delta::user(EventType::Added, user));
        dispatcher.drain().await;

        assert!(mock.object(ObjectKind::Namespace, None, "dev-alice").is_some());
        let status = mock.user("alice").unwrap().status.unwrap();
        assert_eq!(status.namespace.as_deref(), Some("dev-alice"));
    }

    #[tokio::test]
    async fn test_panicked_periodic_task_is_fatal() {
        let handle = tokio::spawn(async { panic!("sweep blew up") });
        let err = periodic_exit("lifecycle monitor", handle.await, false).unwrap_err();
        assert!(matches!(err, ControllerError::Watch(msg) if msg.contains("lifecycle monitor panicked")));

        let early = periodic_exit("schedulability evaluator", Ok(()), false).unwrap_err();
        assert!(matches!(early, ControllerError::Watch(msg) if msg.contains("stopped unexpectedly")));
        assert!(periodic_exit("schedulability evaluator", Ok(()), true).is_ok());
    }

    #[test]
    fn test_watcher_exit_maps_errors() {
        let err = watcher_exit("DevServer", Ok(Err(ControllerError::Stream("closed".to_string())))).unwrap_err();
        assert!(matches!(err, ControllerError::Watch(msg) if msg.contains("DevServer watcher error")));
        assert!(watcher_exit("DevServer", Ok(Ok(()))).is_ok());
    }
}
