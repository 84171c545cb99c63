//! Mock ClusterClient for unit testing
//!
//! In-memory implementation of `ClusterClientTrait`. It mimics the API server
//! behaviours the operator relies on:
//! - resource versions with optimistic-concurrency conflicts on stale writes
//! - owner-reference cascade when a DevServer is deleted
//! - injected failures per operation
//! - operation counters for idempotence checks

mod helpers;
mod watch;

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClientError;
use crate::models::*;
use crate::status::WatchEventType;
use crds::{
    DevServer, DevServerFlavor, DevServerFlavorStatus, DevServerStatus, DevServerUser,
    DevServerUserStatus,
};
use helpers::{carry_identity, check_version, lock, stamp_created};
use k8s_openapi::api::apps::v1::StatefulSetStatus;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Operations that accept injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    GetDevServer,
    ListDevServers,
    CreateDevServer,
    DeleteDevServer,
    PatchDevServerStatus,
    GetFlavor,
    ListFlavors,
    ReplaceFlavor,
    PatchFlavorStatus,
    ListUsers,
    PatchUserStatus,
    GetObject,
    CreateObject,
    ReplaceObject,
    ListOwned,
    ListNodes,
    ListAutoscalerPools,
    PublishEvent,
    Exec,
}

/// Write counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockCounters {
    pub object_creates: usize,
    pub object_replaces: usize,
    pub devserver_deletes: usize,
    pub devserver_status_patches: usize,
    pub flavor_replaces: usize,
    pub flavor_status_patches: usize,
}

/// A recorded exec call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCall {
    pub namespace: String,
    pub pod: String,
    pub command: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

/// Mock ClusterClient for testing
#[derive(Clone)]
pub struct MockClusterClient {
    pub(crate) devservers: Arc<Mutex<BTreeMap<(String, String), DevServer>>>,
    pub(crate) flavors: Arc<Mutex<BTreeMap<String, DevServerFlavor>>>,
    pub(crate) users: Arc<Mutex<BTreeMap<String, DevServerUser>>>,
    pub(crate) objects: Arc<Mutex<BTreeMap<ObjectRef, ManagedObject>>>,
    pub(crate) nodes: Arc<Mutex<Vec<NodeInventory>>>,
    pub(crate) pools: Arc<Mutex<Vec<AutoscalerPool>>>,
    pub(crate) events: Arc<Mutex<Vec<(ObjectReference, EventRecord)>>>,
    pub(crate) exec_results: Arc<Mutex<VecDeque<ExecResult>>>,
    pub(crate) exec_calls: Arc<Mutex<Vec<ExecCall>>>,
    pub(crate) failures: Arc<Mutex<HashMap<MockOp, VecDeque<ClientError>>>>,
    pub(crate) counters: Arc<Mutex<MockCounters>>,
    // Counter for resource versions
    pub(crate) next_version: Arc<Mutex<u64>>,
    // DevServer change feed for watches
    pub(crate) changes: broadcast::Sender<(WatchEventType, DevServer)>,
}

impl Default for MockClusterClient {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            devservers: Default::default(),
            flavors: Default::default(),
            users: Default::default(),
            objects: Default::default(),
            nodes: Default::default(),
            pools: Default::default(),
            events: Default::default(),
            exec_results: Default::default(),
            exec_calls: Default::default(),
            failures: Default::default(),
            counters: Default::default(),
            next_version: Default::default(),
            changes,
        }
    }
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, event_type: WatchEventType, devserver: &DevServer) {
        // No receivers is fine
        let _ = self.changes.send((event_type, devserver.clone()));
    }

    /// Generate next resource version
    pub(crate) fn next_version(&self) -> u64 {
        let mut version = lock(&self.next_version);
        *version += 1;
        *version
    }

    fn take_failure(&self, op: MockOp) -> Result<(), ClientError> {
        match lock(&self.failures).get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Make the next call of `op` fail with `err`. Calls queue up.
    pub fn fail_next(&self, op: MockOp, err: ClientError) {
        lock(&self.failures).entry(op).or_default().push_back(err);
    }

    /// Store a DevServer as the API server would on create (for test setup)
    pub fn add_devserver(&self, mut devserver: DevServer) -> DevServer {
        let version = self.next_version();
        stamp_created(&mut devserver.metadata, version);
        let key = (devserver.namespace().unwrap_or_default(), devserver.name_any());
        lock(&self.devservers).insert(key, devserver.clone());
        self.notify(WatchEventType::Added, &devserver);
        devserver
    }

    /// Store a flavor (for test setup)
    pub fn add_flavor(&self, mut flavor: DevServerFlavor) -> DevServerFlavor {
        let version = self.next_version();
        stamp_created(&mut flavor.metadata, version);
        lock(&self.flavors).insert(flavor.name_any(), flavor.clone());
        flavor
    }

    /// Store a user (for test setup)
    pub fn add_user(&self, mut user: DevServerUser) -> DevServerUser {
        let version = self.next_version();
        stamp_created(&mut user.metadata, version);
        lock(&self.users).insert(user.name_any(), user.clone());
        user
    }

    /// Store an arbitrary object, e.g. a user-managed claim (for test setup)
    pub fn add_object(&self, mut object: ManagedObject) -> ManagedObject {
        let version = self.next_version();
        stamp_created(object.metadata_mut(), version);
        lock(&self.objects).insert(object.object_ref(), object.clone());
        object
    }

    /// Replace the node inventory
    pub fn set_nodes(&self, nodes: Vec<NodeInventory>) {
        *lock(&self.nodes) = nodes;
    }

    /// Replace the autoscaler pool inventory
    pub fn set_pools(&self, pools: Vec<AutoscalerPool>) {
        *lock(&self.pools) = pools;
    }

    /// Simulate the StatefulSet controller reporting ready replicas
    pub fn set_statefulset_ready(&self, namespace: &str, name: &str, ready_replicas: i32) {
        let key = ObjectRef::new(ObjectKind::StatefulSet, Some(namespace), name);
        if let Some(ManagedObject::StatefulSet(sts)) = lock(&self.objects).get_mut(&key) {
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            sts.status = Some(StatefulSetStatus {
                replicas,
                ready_replicas: Some(ready_replicas),
                ..Default::default()
            });
        }
    }

    /// Queue the result of the next exec call
    pub fn push_exec_result(&self, result: ExecResult) {
        lock(&self.exec_results).push_back(result);
    }

    pub fn exec_calls(&self) -> Vec<ExecCall> {
        lock(&self.exec_calls).clone()
    }

    pub fn events(&self) -> Vec<(ObjectReference, EventRecord)> {
        lock(&self.events).clone()
    }

    pub fn counters(&self) -> MockCounters {
        lock(&self.counters).clone()
    }

    pub fn reset_counters(&self) {
        *lock(&self.counters) = MockCounters::default();
    }

    /// Stored object, if any
    pub fn object(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Option<ManagedObject> {
        lock(&self.objects).get(&ObjectRef::new(kind, namespace, name)).cloned()
    }

    /// All stored objects
    pub fn objects(&self) -> Vec<ManagedObject> {
        lock(&self.objects).values().cloned().collect()
    }

    /// Overwrite a stored object as an external writer would
    pub fn edit_object(&self, kind: ObjectKind, namespace: Option<&str>, name: &str, edit: impl FnOnce(&mut ManagedObject)) {
        let version = self.next_version();
        if let Some(object) = lock(&self.objects).get_mut(&ObjectRef::new(kind, namespace, name)) {
            edit(object);
            object.metadata_mut().resource_version = Some(version.to_string());
        }
    }

    pub fn devserver(&self, namespace: &str, name: &str) -> Option<DevServer> {
        lock(&self.devservers)
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn flavor(&self, name: &str) -> Option<DevServerFlavor> {
        lock(&self.flavors).get(name).cloned()
    }

    pub fn user(&self, name: &str) -> Option<DevServerUser> {
        lock(&self.users).get(name).cloned()
    }

    /// Edit a stored flavor in place, bumping its version
    pub fn edit_flavor(&self, name: &str, edit: impl FnOnce(&mut DevServerFlavor)) {
        let version = self.next_version();
        if let Some(flavor) = lock(&self.flavors).get_mut(name) {
            edit(flavor);
            flavor.metadata.resource_version = Some(version.to_string());
        }
    }

    fn bump(&self, f: impl FnOnce(&mut MockCounters)) {
        f(&mut lock(&self.counters));
    }
}

fn owned_by(object: &ManagedObject, uid: &str) -> bool {
    object
        .metadata()
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.uid == uid))
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_devserver(&self, namespace: &str, name: &str) -> Result<DevServer, ClientError> {
        self.take_failure(MockOp::GetDevServer)?;
        self.devserver(namespace, name)
            .ok_or_else(|| ClientError::NotFound(format!("DevServer {}/{}", namespace, name)))
    }

    async fn list_devservers(&self, namespace: Option<&str>) -> Result<Vec<DevServer>, ClientError> {
        self.take_failure(MockOp::ListDevServers)?;
        Ok(lock(&self.devservers)
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|want| want == ns))
            .map(|(_, ds)| ds.clone())
            .collect())
    }

    async fn create_devserver(&self, devserver: &DevServer) -> Result<DevServer, ClientError> {
        self.take_failure(MockOp::CreateDevServer)?;
        let namespace = devserver
            .namespace()
            .ok_or_else(|| ClientError::Validation("DevServer has no namespace".to_string()))?;
        let key = (namespace, devserver.name_any());
        if lock(&self.devservers).contains_key(&key) {
            return Err(ClientError::Conflict(format!(
                "DevServer {}/{} already exists",
                key.0, key.1
            )));
        }
        let mut created = devserver.clone();
        created.metadata.creation_timestamp = None;
        Ok(self.add_devserver(created))
    }

    async fn replace_devserver(&self, devserver: &DevServer) -> Result<DevServer, ClientError> {
        let key = (devserver.namespace().unwrap_or_default(), devserver.name_any());
        let version = self.next_version();
        let mut store = lock(&self.devservers);
        let stored = store
            .get(&key)
            .ok_or_else(|| ClientError::NotFound(format!("DevServer {}/{}", key.0, key.1)))?;
        check_version(&devserver.metadata, &stored.metadata, "DevServer")?;

        let mut updated = devserver.clone();
        carry_identity(&mut updated.metadata, &stored.metadata, version, stored.spec != devserver.spec);
        updated.status = stored.status.clone();
        store.insert(key, updated.clone());
        drop(store);
        self.notify(WatchEventType::Modified, &updated);
        Ok(updated)
    }

    async fn delete_devserver(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.take_failure(MockOp::DeleteDevServer)?;
        let removed = lock(&self.devservers).remove(&(namespace.to_string(), name.to_string()));
        let devserver =
            removed.ok_or_else(|| ClientError::NotFound(format!("DevServer {}/{}", namespace, name)))?;
        self.bump(|c| c.devserver_deletes += 1);
        self.notify(WatchEventType::Deleted, &devserver);

        // Garbage collection of dependents
        if let Some(uid) = devserver.metadata.uid.as_deref() {
            lock(&self.objects).retain(|_, object| !owned_by(object, uid));
        }
        Ok(())
    }

    async fn patch_devserver_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DevServerStatus,
    ) -> Result<(), ClientError> {
        self.take_failure(MockOp::PatchDevServerStatus)?;
        let version = self.next_version();
        let mut store = lock(&self.devservers);
        let devserver = store
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClientError::NotFound(format!("DevServer {}/{}", namespace, name)))?;
        devserver.status = Some(status.clone());
        devserver.metadata.resource_version = Some(version.to_string());
        let updated = devserver.clone();
        drop(store);
        self.bump(|c| c.devserver_status_patches += 1);
        self.notify(WatchEventType::Modified, &updated);
        Ok(())
    }

    async fn get_flavor(&self, name: &str) -> Result<DevServerFlavor, ClientError> {
        self.take_failure(MockOp::GetFlavor)?;
        self.flavor(name)
            .ok_or_else(|| ClientError::NotFound(format!("DevServerFlavor {}", name)))
    }

    async fn list_flavors(&self) -> Result<Vec<DevServerFlavor>, ClientError> {
        self.take_failure(MockOp::ListFlavors)?;
        Ok(lock(&self.flavors).values().cloned().collect())
    }

    async fn create_flavor(&self, flavor: &DevServerFlavor) -> Result<DevServerFlavor, ClientError> {
        if lock(&self.flavors).contains_key(&flavor.name_any()) {
            return Err(ClientError::Conflict(format!(
                "DevServerFlavor {} already exists",
                flavor.name_any()
            )));
        }
        Ok(self.add_flavor(flavor.clone()))
    }

    async fn replace_flavor(&self, flavor: &DevServerFlavor) -> Result<DevServerFlavor, ClientError> {
        self.take_failure(MockOp::ReplaceFlavor)?;
        let name = flavor.name_any();
        let version = self.next_version();
        let mut store = lock(&self.flavors);
        let stored = store
            .get(&name)
            .ok_or_else(|| ClientError::NotFound(format!("DevServerFlavor {}", name)))?;
        check_version(&flavor.metadata, &stored.metadata, "DevServerFlavor")?;

        let mut updated = flavor.clone();
        carry_identity(&mut updated.metadata, &stored.metadata, version, stored.spec != flavor.spec);
        updated.status = stored.status.clone();
        store.insert(name, updated.clone());
        drop(store);
        self.bump(|c| c.flavor_replaces += 1);
        Ok(updated)
    }

    async fn delete_flavor(&self, name: &str) -> Result<(), ClientError> {
        lock(&self.flavors)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(format!("DevServerFlavor {}", name)))
    }

    async fn patch_flavor_status(&self, name: &str, status: &DevServerFlavorStatus) -> Result<(), ClientError> {
        self.take_failure(MockOp::PatchFlavorStatus)?;
        let version = self.next_version();
        let mut store = lock(&self.flavors);
        let flavor = store
            .get_mut(name)
            .ok_or_else(|| ClientError::NotFound(format!("DevServerFlavor {}", name)))?;
        flavor.status = Some(status.clone());
        flavor.metadata.resource_version = Some(version.to_string());
        drop(store);
        self.bump(|c| c.flavor_status_patches += 1);
        Ok(())
    }

    async fn get_user(&self, name: &str) -> Result<DevServerUser, ClientError> {
        self.user(name)
            .ok_or_else(|| ClientError::NotFound(format!("DevServerUser {}", name)))
    }

    async fn list_users(&self) -> Result<Vec<DevServerUser>, ClientError> {
        self.take_failure(MockOp::ListUsers)?;
        Ok(lock(&self.users).values().cloned().collect())
    }

    async fn create_user(&self, user: &DevServerUser) -> Result<DevServerUser, ClientError> {
        if lock(&self.users).contains_key(&user.name_any()) {
            return Err(ClientError::Conflict(format!(
                "DevServerUser {} already exists",
                user.name_any()
            )));
        }
        Ok(self.add_user(user.clone()))
    }

    async fn delete_user(&self, name: &str) -> Result<(), ClientError> {
        lock(&self.users)
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ClientError::NotFound(format!("DevServerUser {}", name)))
    }

    async fn patch_user_status(&self, name: &str, status: &DevServerUserStatus) -> Result<(), ClientError> {
        self.take_failure(MockOp::PatchUserStatus)?;
        let mut store = lock(&self.users);
        let user = store
            .get_mut(name)
            .ok_or_else(|| ClientError::NotFound(format!("DevServerUser {}", name)))?;
        user.status = Some(status.clone());
        Ok(())
    }

    async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ManagedObject>, ClientError> {
        self.take_failure(MockOp::GetObject)?;
        Ok(self.object(kind, namespace, name))
    }

    async fn create_object(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
        self.take_failure(MockOp::CreateObject)?;
        let key = object.object_ref();
        if key.kind.is_namespaced() && key.namespace.is_none() {
            return Err(ClientError::Validation(format!("{} requires a namespace", key.kind)));
        }
        if lock(&self.objects).contains_key(&key) {
            return Err(ClientError::Conflict(format!("{} already exists", key)));
        }
        let created = self.add_object(object.clone());
        self.bump(|c| c.object_creates += 1);
        Ok(created)
    }

    async fn replace_object(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
        self.take_failure(MockOp::ReplaceObject)?;
        let key = object.object_ref();
        let version = self.next_version();
        let mut store = lock(&self.objects);
        let stored = store
            .get(&key)
            .ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        check_version(object.metadata(), stored.metadata(), &key.to_string())?;

        let mut updated = object.clone();
        let stored_meta = stored.metadata().clone();
        carry_identity(updated.metadata_mut(), &stored_meta, version, true);
        store.insert(key, updated.clone());
        drop(store);
        self.bump(|c| c.object_replaces += 1);
        Ok(updated)
    }

    async fn list_owned(&self, namespace: &str, devserver: &str) -> Result<Vec<ManagedObject>, ClientError> {
        self.take_failure(MockOp::ListOwned)?;
        Ok(lock(&self.objects)
            .values()
            .filter(|o| o.namespace() == Some(namespace))
            .filter(|o| {
                matches!(
                    o.kind(),
                    ObjectKind::Secret | ObjectKind::ConfigMap | ObjectKind::StatefulSet | ObjectKind::Service
                )
            })
            .filter(|o| {
                o.metadata()
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_DEVSERVER))
                    .is_some_and(|v| v == devserver)
            })
            .cloned()
            .collect())
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInventory>, ClientError> {
        self.take_failure(MockOp::ListNodes)?;
        Ok(lock(&self.nodes).clone())
    }

    async fn list_autoscaler_pools(&self) -> Result<Vec<AutoscalerPool>, ClientError> {
        self.take_failure(MockOp::ListAutoscalerPools)?;
        Ok(lock(&self.pools).clone())
    }

    async fn publish_event(&self, target: &ObjectReference, event: &EventRecord) -> Result<(), ClientError> {
        self.take_failure(MockOp::PublishEvent)?;
        lock(&self.events).push((target.clone(), event.clone()));
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecResult, ClientError> {
        self.take_failure(MockOp::Exec)?;
        lock(&self.exec_calls).push(ExecCall {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            command,
            stdin,
        });
        Ok(lock(&self.exec_results).pop_front().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crds::DevServerSpec;
    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

    fn devserver(name: &str) -> DevServer {
        let mut ds = DevServer::new(name, DevServerSpec::default());
        ds.metadata.namespace = Some("dev".to_string());
        ds
    }

    fn config_map(name: &str, owner_uid: Option<&str>) -> ManagedObject {
        ManagedObject::ConfigMap(ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("dev".to_string()),
                owner_references: owner_uid.map(|uid| {
                    vec![OwnerReference {
                        api_version: "devserver.io/v1".to_string(),
                        kind: "DevServer".to_string(),
                        name: "box".to_string(),
                        uid: uid.to_string(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let client = MockClusterClient::new();
        let created = client.create_object(&config_map("cm", None)).await.unwrap();

        let first = client.replace_object(&created).await.unwrap();
        assert_ne!(first.metadata().resource_version, created.metadata().resource_version);

        let err = client.replace_object(&created).await.unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_dependents_only() {
        let client = MockClusterClient::new();
        let ds = client.create_devserver(&devserver("box")).await.unwrap();
        let uid = ds.metadata.uid.clone().unwrap();

        client.create_object(&config_map("box-sshd-config", Some(&uid))).await.unwrap();
        client.add_object(ManagedObject::PersistentVolumeClaim(PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("datasets".to_string()),
                namespace: Some("dev".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }));

        client.delete_devserver("dev", "box").await.unwrap();

        assert!(client.object(ObjectKind::ConfigMap, Some("dev"), "box-sshd-config").is_none());
        assert!(client.object(ObjectKind::PersistentVolumeClaim, Some("dev"), "datasets").is_some());
        assert!(client.delete_devserver("dev", "box").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let client = MockClusterClient::new();
        client.fail_next(MockOp::ListNodes, ClientError::Transient("boom".to_string()));
        assert!(client.list_nodes().await.is_err());
        assert!(client.list_nodes().await.is_ok());
    }
}
