//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes API surface the operator and SDK use.
//! The concrete `ClusterClient` implements it over `kube`, and tests use
//! `MockClusterClient`.

use crate::error::ClientError;
use crate::models::*;
use crds::{
    DevServer, DevServerFlavor, DevServerFlavorStatus, DevServerStatus, DevServerUser,
    DevServerUserStatus,
};
use k8s_openapi::api::core::v1::ObjectReference;

/// Trait for cluster API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// `replace_*` operations carry the object's `resourceVersion`; a stale version
/// fails with `ClientError::Conflict`.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // DevServer operations
    async fn get_devserver(&self, namespace: &str, name: &str) -> Result<DevServer, ClientError>;
    async fn list_devservers(&self, namespace: Option<&str>) -> Result<Vec<DevServer>, ClientError>;
    async fn create_devserver(&self, devserver: &DevServer) -> Result<DevServer, ClientError>;
    async fn replace_devserver(&self, devserver: &DevServer) -> Result<DevServer, ClientError>;
    async fn delete_devserver(&self, namespace: &str, name: &str) -> Result<(), ClientError>;
    async fn patch_devserver_status(&self, namespace: &str, name: &str, status: &DevServerStatus) -> Result<(), ClientError>;

    // DevServerFlavor operations
    async fn get_flavor(&self, name: &str) -> Result<DevServerFlavor, ClientError>;
    async fn list_flavors(&self) -> Result<Vec<DevServerFlavor>, ClientError>;
    async fn create_flavor(&self, flavor: &DevServerFlavor) -> Result<DevServerFlavor, ClientError>;
    async fn replace_flavor(&self, flavor: &DevServerFlavor) -> Result<DevServerFlavor, ClientError>;
    async fn delete_flavor(&self, name: &str) -> Result<(), ClientError>;
    async fn patch_flavor_status(&self, name: &str, status: &DevServerFlavorStatus) -> Result<(), ClientError>;

    // DevServerUser operations
    async fn get_user(&self, name: &str) -> Result<DevServerUser, ClientError>;
    async fn list_users(&self) -> Result<Vec<DevServerUser>, ClientError>;
    async fn create_user(&self, user: &DevServerUser) -> Result<DevServerUser, ClientError>;
    async fn delete_user(&self, name: &str) -> Result<(), ClientError>;
    async fn patch_user_status(&self, name: &str, status: &DevServerUserStatus) -> Result<(), ClientError>;

    // Child object operations
    async fn get_object(&self, kind: ObjectKind, namespace: Option<&str>, name: &str) -> Result<Option<ManagedObject>, ClientError>;
    async fn create_object(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError>;
    async fn replace_object(&self, object: &ManagedObject) -> Result<ManagedObject, ClientError>;
    /// Child objects labelled as belonging to the named DevServer
    async fn list_owned(&self, namespace: &str, devserver: &str) -> Result<Vec<ManagedObject>, ClientError>;

    // Inventory
    async fn list_nodes(&self) -> Result<Vec<NodeInventory>, ClientError>;
    /// Autoscaler pools; a cluster without the pool CRD has none
    async fn list_autoscaler_pools(&self) -> Result<Vec<AutoscalerPool>, ClientError>;

    // Events
    async fn publish_event(&self, target: &ObjectReference, event: &EventRecord) -> Result<(), ClientError>;

    // Remote execution
    async fn exec(&self, namespace: &str, pod: &str, command: Vec<String>, stdin: Option<Vec<u8>>) -> Result<ExecResult, ClientError>;
}
