//! Kubernetes API client
//!
//! Implements `ClusterClientTrait` over `kube`. Typed APIs are used for every
//! kind the operator manages; Karpenter NodePools are read as dynamic objects.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClientError;
use crate::exec::exit_code_from_status;
use crate::models::*;
use crds::{
    DevServer, DevServerFlavor, DevServerFlavorStatus, DevServerStatus, DevServerUser,
    DevServerUserStatus,
};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Namespace, Node, ObjectReference, PersistentVolumeClaim, Pod, ResourceQuota, Secret,
    Service, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, AttachParams, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use kube_runtime::events::{Event, EventType, Recorder, Reporter};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Field manager / event reporter name
pub const FIELD_MANAGER: &str = "devserver-operator";

/// Kubernetes-backed cluster client
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    recorder: Recorder,
}

impl ClusterClient {
    /// Wrap an existing `kube::Client`.
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    /// Connect using in-cluster config or the local kubeconfig.
    pub async fn try_default() -> Result<Self, ClientError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    /// Underlying `kube::Client`
    pub fn kube_client(&self) -> Client {
        self.client.clone()
    }

    fn devservers(&self, namespace: &str) -> Api<DevServer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn flavors(&self) -> Api<DevServerFlavor> {
        Api::all(self.client.clone())
    }

    fn users(&self) -> Api<DevServerUser> {
        Api::all(self.client.clone())
    }

    async fn get_namespaced<K>(&self, namespace: &str, name: &str) -> Result<Option<K>, ClientError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_namespaced<K>(&self, object: &K) -> Result<K, ClientError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let namespace = object
            .namespace()
            .ok_or_else(|| ClientError::Validation(format!("{} has no namespace", object.name_any())))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn replace_namespaced<K>(&self, object: &K) -> Result<K, ClientError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let namespace = object
            .namespace()
            .ok_or_else(|| ClientError::Validation(format!("{} has no namespace", object.name_any())))?;
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace(&object.name_any(), &PostParams::default(), object)
            .await?)
    }

    async fn list_labelled<K>(&self, namespace: &str, selector: &str) -> Result<Vec<K>, ClientError>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default().labels(selector)).await?.items)
    }
}

fn require_namespace<'a>(kind: ObjectKind, namespace: Option<&'a str>) -> Result<&'a str, ClientError> {
    namespace.ok_or_else(|| ClientError::Validation(format!("{} requires a namespace", kind)))
}

/// Karpenter NodePool resource
fn nodepool_resource() -> ApiResource {
    ApiResource {
        group: "karpenter.sh".to_string(),
        version: "v1".to_string(),
        api_version: "karpenter.sh/v1".to_string(),
        kind: "NodePool".to_string(),
        plural: "nodepools".to_string(),
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> Result<String, ClientError> {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        reader.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

#[async_trait::async_trait]
impl ClusterClientTrait for ClusterClient {
    async fn get_devserver(&self, namespace: &str, name: &str) -> Result<DevServer, ClientError> {
        Ok(self.devservers(namespace).get(name).await?)
    }

    async fn list_devservers(&self, namespace: Option<&str>) -> Result<Vec<DevServer>, ClientError> {
        let api: Api<DevServer> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create_devserver(&self, devserver: &DevServer) -> Result<DevServer, ClientError> {
        let namespace = devserver
            .namespace()
            .ok_or_else(|| ClientError::Validation("DevServer has no namespace".to_string()))?;
        Ok(self
            .devservers(&namespace)
            .create(&PostParams::default(), devserver)
            .await?)
    }

    async fn replace_devserver(&self, devserver: &DevServer) -> Result<DevServer, ClientError> {
        let namespace = devserver
            .namespace()
            .ok_or_else(|| ClientError::Validation("DevServer has no namespace".to_string()))?;
        Ok(self
            .devservers(&namespace)
            .replace(&devserver.name_any(), &PostParams::default(), devserver)
            .await?)
    }

    async fn delete_devserver(&self, namespace: &str, name: &str) -> Result<(), ClientError> {
        self.devservers(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn patch_devserver_status(
        &self,
        namespace: &str,
        name: &str,
        status: &DevServerStatus,
    ) -> Result<(), ClientError> {
        let patch = json!({ "status": status });
        self.devservers(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_flavor(&self, name: &str) -> Result<DevServerFlavor, ClientError> {
        Ok(self.flavors().get(name).await?)
    }

    async fn list_flavors(&self) -> Result<Vec<DevServerFlavor>, ClientError> {
        Ok(self.flavors().list(&ListParams::default()).await?.items)
    }

    async fn create_flavor(&self, flavor: &DevServerFlavor) -> Result<DevServerFlavor, ClientError> {
        Ok(self.flavors().create(&PostParams::default(), flavor).await?)
    }

    async fn replace_flavor(&self, flavor: &DevServerFlavor) -> Result<DevServerFlavor, ClientError> {
        Ok(self
            .flavors()
            .replace(&flavor.name_any(), &PostParams::default(), flavor)
            .await?)
    }

    async fn delete_flavor(&self, name: &str) -> Result<(), ClientError> {
        self.flavors().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn patch_flavor_status(
        &self,
        name: &str,
        status: &DevServerFlavorStatus,
    ) -> Result<(), ClientError> {
        let patch = json!({ "status": status });
        self.flavors()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_user(&self, name: &str) -> Result<DevServerUser, ClientError> {
        Ok(self.users().get(name).await?)
    }

    async fn list_users(&self) -> Result<Vec<DevServerUser>, ClientError> {
        Ok(self.users().list(&ListParams::default()).await?.items)
    }

    async fn create_user(&self, user: &DevServerUser) -> Result<DevServerUser, ClientError> {
        Ok(self.users().create(&PostParams::default(), user).await?)
    }

    async fn delete_user(&self, name: &str) -> Result<(), ClientError> {
        self.users().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn patch_user_status(
        &self,
        name: &str,
        status: &DevServerUserStatus,
    ) -> Result<(), ClientError> {
        let patch = json!({ "status": status });
        self.users()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_object(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<ManagedObject>, ClientError> {
        if kind == ObjectKind::Namespace {
            let api: Api<Namespace> = Api::all(self.client.clone());
            return Ok(api.get_opt(name).await?.map(ManagedObject::Namespace));
        }

        let ns = require_namespace(kind, namespace)?;
        let object = match kind {
            ObjectKind::Secret => self.get_namespaced::<Secret>(ns, name).await?.map(ManagedObject::Secret),
            ObjectKind::ConfigMap => self.get_namespaced::<ConfigMap>(ns, name).await?.map(ManagedObject::ConfigMap),
            ObjectKind::StatefulSet => self.get_namespaced::<StatefulSet>(ns, name).await?.map(ManagedObject::StatefulSet),
            ObjectKind::Service => self.get_namespaced::<Service>(ns, name).await?.map(ManagedObject::Service),
            ObjectKind::ServiceAccount => self.get_namespaced::<ServiceAccount>(ns, name).await?.map(ManagedObject::ServiceAccount),
            ObjectKind::Role => self.get_namespaced::<Role>(ns, name).await?.map(ManagedObject::Role),
            ObjectKind::RoleBinding => self.get_namespaced::<RoleBinding>(ns, name).await?.map(ManagedObject::RoleBinding),
            ObjectKind::ResourceQuota => self.get_namespaced::<ResourceQuota>(ns, name).await?.map(ManagedObject::ResourceQuota),
            ObjectKind::PersistentVolumeClaim => self.get_namespaced::<PersistentVolumeClaim>(ns, name).await?.map(ManagedObject::PersistentVolumeClaim),
            ObjectKind::Namespace => None,
        };
        Ok(object)
    }

    async fn create_object(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
        debug!("Creating {}", object.object_ref());
        Ok(match object {
            ManagedObject::Secret(o) => ManagedObject::Secret(self.create_namespaced(o).await?),
            ManagedObject::ConfigMap(o) => ManagedObject::ConfigMap(self.create_namespaced(o).await?),
            ManagedObject::StatefulSet(o) => ManagedObject::StatefulSet(self.create_namespaced(o).await?),
            ManagedObject::Service(o) => ManagedObject::Service(self.create_namespaced(o).await?),
            ManagedObject::ServiceAccount(o) => ManagedObject::ServiceAccount(self.create_namespaced(o).await?),
            ManagedObject::Role(o) => ManagedObject::Role(self.create_namespaced(o).await?),
            ManagedObject::RoleBinding(o) => ManagedObject::RoleBinding(self.create_namespaced(o).await?),
            ManagedObject::ResourceQuota(o) => ManagedObject::ResourceQuota(self.create_namespaced(o).await?),
            ManagedObject::PersistentVolumeClaim(o) => ManagedObject::PersistentVolumeClaim(self.create_namespaced(o).await?),
            ManagedObject::Namespace(o) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                ManagedObject::Namespace(api.create(&PostParams::default(), o).await?)
            }
        })
    }

    async fn replace_object(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError> {
        debug!("Replacing {}", object.object_ref());
        Ok(match object {
            ManagedObject::Secret(o) => ManagedObject::Secret(self.replace_namespaced(o).await?),
            ManagedObject::ConfigMap(o) => ManagedObject::ConfigMap(self.replace_namespaced(o).await?),
            ManagedObject::StatefulSet(o) => ManagedObject::StatefulSet(self.replace_namespaced(o).await?),
            ManagedObject::Service(o) => ManagedObject::Service(self.replace_namespaced(o).await?),
            ManagedObject::ServiceAccount(o) => ManagedObject::ServiceAccount(self.replace_namespaced(o).await?),
            ManagedObject::Role(o) => ManagedObject::Role(self.replace_namespaced(o).await?),
            ManagedObject::RoleBinding(o) => ManagedObject::RoleBinding(self.replace_namespaced(o).await?),
            ManagedObject::ResourceQuota(o) => ManagedObject::ResourceQuota(self.replace_namespaced(o).await?),
            ManagedObject::PersistentVolumeClaim(o) => ManagedObject::PersistentVolumeClaim(self.replace_namespaced(o).await?),
            ManagedObject::Namespace(o) => {
                let api: Api<Namespace> = Api::all(self.client.clone());
                ManagedObject::Namespace(api.replace(&o.name_any(), &PostParams::default(), o).await?)
            }
        })
    }

    async fn list_owned(&self, namespace: &str, devserver: &str) -> Result<Vec<ManagedObject>, ClientError> {
        let selector = format!("{}={}", LABEL_DEVSERVER, devserver);
        let mut objects = Vec::new();
        objects.extend(self.list_labelled::<Secret>(namespace, &selector).await?.into_iter().map(ManagedObject::Secret));
        objects.extend(self.list_labelled::<ConfigMap>(namespace, &selector).await?.into_iter().map(ManagedObject::ConfigMap));
        objects.extend(self.list_labelled::<StatefulSet>(namespace, &selector).await?.into_iter().map(ManagedObject::StatefulSet));
        objects.extend(self.list_labelled::<Service>(namespace, &selector).await?.into_iter().map(ManagedObject::Service));
        Ok(objects)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeInventory>, ClientError> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(NodeInventory::from_node).collect())
    }

    async fn list_autoscaler_pools(&self) -> Result<Vec<AutoscalerPool>, ClientError> {
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &nodepool_resource());
        match api.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items.iter().map(AutoscalerPool::from_dynamic).collect()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!("NodePool CRD not installed, no autoscaler pools");
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn publish_event(&self, target: &ObjectReference, event: &EventRecord) -> Result<(), ClientError> {
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: event.note.clone(),
                    action: event.action.clone(),
                    secondary: None,
                },
                target,
            )
            .await?;
        Ok(())
    }

    async fn exec(
        &self,
        namespace: &str,
        pod: &str,
        command: Vec<String>,
        stdin: Option<Vec<u8>>,
    ) -> Result<ExecResult, ClientError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = AttachParams::default()
            .container(DEVSERVER_CONTAINER)
            .stdin(stdin.is_some())
            .stdout(true)
            .stderr(true);

        let mut attached = pods
            .exec(pod, command, &params)
            .await
            .map_err(|e| ClientError::Exec(format!("exec in {}/{} failed: {}", namespace, pod, e)))?;

        if let Some(data) = stdin {
            if let Some(mut writer) = attached.stdin() {
                writer.write_all(&data).await?;
                writer.shutdown().await?;
            }
        }

        let status = attached.take_status();
        let (stdout, stderr) = tokio::join!(read_all(attached.stdout()), read_all(attached.stderr()));
        let status = match status {
            Some(status) => status.await,
            None => None,
        };
        attached
            .join()
            .await
            .map_err(|e| ClientError::Exec(e.to_string()))?;

        let exit_code = match status {
            Some(status) => exit_code_from_status(&status)?,
            None => 0,
        };

        Ok(ExecResult {
            stdout: stdout?,
            stderr: stderr?,
            exit_code,
        })
    }
}
