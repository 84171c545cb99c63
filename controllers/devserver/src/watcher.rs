//! Kubernetes resource watchers.
//!
//! Each watcher turns its stream into dispatcher deltas. Streams reconnect
//! with backoff and relist after a gap, so a missed notification is
//! recovered from the next full list.

use crate::dispatcher::{Delta, Dispatcher, EventType};
use crate::error::ControllerError;
use crds::{DevServer, DevServerFlavor, DevServerSpec, DevServerUser};
use devserver_client::{LABEL_DEVSERVER, LABEL_MANAGED_BY, MANAGED_BY};
use futures::StreamExt;
use kube::{Api, Client, Resource, ResourceExt};
use kube_runtime::{WatchStreamExt, watcher};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Watches DevServer resources and the workloads they own.
pub struct Watcher {
    client: Client,
    dispatcher: Dispatcher,
    namespace: Option<String>,
}

impl Watcher {
    /// `namespace` restricts DevServer and child object watches; flavors and users are cluster-scoped.
    pub fn new(client: Client, dispatcher: Dispatcher, namespace: Option<String>) -> Self {
        Self {
            client,
            dispatcher,
            namespace,
        }
    }

    fn scoped<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        match self.namespace.as_deref() {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    pub async fn watch_devservers(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let api: Api<DevServer> = self.scoped();
        self.pump("DevServer", api, watcher::Config::default(), shutdown, |event_type, devserver| {
            Some(Delta::devserver(event_type, devserver))
        })
        .await
    }

    pub async fn watch_flavors(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let api: Api<DevServerFlavor> = Api::all(self.client.clone());
        self.pump("DevServerFlavor", api, watcher::Config::default(), shutdown, |event_type, flavor| {
            Some(Delta::flavor(event_type, flavor))
        })
        .await
    }

    pub async fn watch_users(&self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let api: Api<DevServerUser> = Api::all(self.client.clone());
        self.pump("DevServerUser", api, watcher::Config::default(), shutdown, |event_type, user| {
            Some(Delta::user(event_type, user))
        })
        .await
    }

    /// Changes to an operator-managed child re-trigger the owning DevServer.
    ///
    /// Covers workload readiness as well as external edits and deletions,
    /// which the owner's next pass repairs.
    pub async fn watch_owned<K>(&self, what: &'static str, shutdown: CancellationToken) -> Result<(), ControllerError>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + Debug + Send + 'static,
        K::DynamicType: Default,
    {
        let api: Api<K> = self.scoped();
        let config = watcher::Config::default().labels(&format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY));
        self.pump(what, api, config, shutdown, |event_type, child| {
            // A deleted child is drift too; the owner recreates it
            let event_type = match event_type {
                EventType::Deleted => EventType::Modified,
                other => other,
            };
            owner_delta(event_type, &child)
        })
        .await
    }

    async fn pump<K, F>(
        &self,
        what: &'static str,
        api: Api<K>,
        config: watcher::Config,
        shutdown: CancellationToken,
        to_delta: F,
    ) -> Result<(), ControllerError>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
        F: Fn(EventType, K) -> Option<Delta>,
    {
        info!("Starting {} watcher", what);
        let mut stream = Box::pin(watcher(api, config).default_backoff());

        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("{} watcher stopped", what);
                    return Ok(());
                }
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    warn!("{} watch error, reconnecting: {}", what, e);
                    continue;
                }
                None => return Err(ControllerError::Watch(format!("{} watch stream ended", what))),
            };

            match event {
                watcher::Event::Init => debug!("{} watcher relisting", what),
                watcher::Event::InitDone => info!("{} watcher initialization complete", what),
                other => {
                    if let Some((event_type, object)) = translate(other) {
                        debug!("{} {:?}: {}", what, event_type, display_name(&object));
                        if let Some(delta) = to_delta(event_type, object) {
                            self.dispatcher.submit(delta);
                        }
                    }
                }
            }
        }
    }
}

/// Map a watcher event onto a delta event type.
///
/// The stream does not tell a first sighting from an update outside the
/// initial list, so live applies are reported as `Modified`.
pub fn translate<K>(event: watcher::Event<K>) -> Option<(EventType, K)> {
    match event {
        watcher::Event::InitApply(object) => Some((EventType::Added, object)),
        watcher::Event::Apply(object) => Some((EventType::Modified, object)),
        watcher::Event::Delete(object) => Some((EventType::Deleted, object)),
        watcher::Event::Init | watcher::Event::InitDone => None,
    }
}

/// Delta for the DevServer owning `child`, keyed by its `devserver.io/devserver` label.
pub fn owner_delta<K: Resource>(event_type: EventType, child: &K) -> Option<Delta> {
    let owner = child.labels().get(LABEL_DEVSERVER)?;
    let mut devserver = DevServer::new(owner, DevServerSpec::default());
    devserver.metadata.namespace = child.namespace();
    Some(Delta::devserver(event_type, devserver))
}

fn display_name<K: Resource>(object: &K) -> String {
    match object.namespace() {
        Some(ns) => format!("{}/{}", ns, object.name_any()),
        None => object.name_any(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{ResourceKey, ResourceKind};
    use crate::test_utils::*;
    use k8s_openapi::api::apps::v1::StatefulSet;
    use k8s_openapi::api::core::v1::{ConfigMap, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn statefulset(labels: &[(&str, &str)]) -> StatefulSet {
        StatefulSet {
            metadata: ObjectMeta {
                name: Some("scratch".to_string()),
                namespace: Some(TEST_NAMESPACE.to_string()),
                labels: Some(map(labels)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_translate_watcher_events() {
        let ds = create_test_devserver("a");
        assert_eq!(translate(watcher::Event::InitApply(ds.clone())).map(|(t, _)| t), Some(EventType::Added));
        assert_eq!(translate(watcher::Event::Apply(ds.clone())).map(|(t, _)| t), Some(EventType::Modified));
        assert_eq!(translate(watcher::Event::Delete(ds)).map(|(t, _)| t), Some(EventType::Deleted));
        assert!(translate::<DevServer>(watcher::Event::Init).is_none());
        assert!(translate::<DevServer>(watcher::Event::InitDone).is_none());
    }

    #[test]
    fn test_statefulset_maps_to_owner_key() {
        let sts = statefulset(&[(LABEL_MANAGED_BY, MANAGED_BY), (LABEL_DEVSERVER, "scratch")]);
        let delta = owner_delta(EventType::Modified, &sts).expect("owner label present");
        assert_eq!(
            delta.key(),
            ResourceKey {
                kind: ResourceKind::DevServer,
                namespace: Some(TEST_NAMESPACE.to_string()),
                name: "scratch".to_string(),
            }
        );
        assert_eq!(delta.event_type, EventType::Modified);
    }

    #[test]
    fn test_service_and_config_map_map_to_owner_key() {
        let metadata = ObjectMeta {
            name: Some("scratch-ssh".to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            labels: Some(map(&[(LABEL_MANAGED_BY, MANAGED_BY), (LABEL_DEVSERVER, "scratch")])),
            ..Default::default()
        };
        let service = Service {
            metadata: metadata.clone(),
            ..Default::default()
        };
        let config_map = ConfigMap {
            metadata,
            ..Default::default()
        };

        let from_service = owner_delta(EventType::Modified, &service).expect("owner label present");
        let from_config_map = owner_delta(EventType::Modified, &config_map).expect("owner label present");
        assert_eq!(from_service.key(), from_config_map.key());
        assert_eq!(from_service.key().name, "scratch");
        assert_eq!(from_service.key().kind, ResourceKind::DevServer);
    }

    #[test]
    fn test_unlabelled_statefulset_is_ignored() {
        let sts = statefulset(&[(LABEL_MANAGED_BY, MANAGED_BY)]);
        assert!(owner_delta(EventType::Modified, &sts).is_none());
    }
}
