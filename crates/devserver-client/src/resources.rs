//! Typed CRUD over the three DevServer resource kinds
//!
//! Constructors validate required spec fields before anything reaches the
//! API server.

use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClientError;
use crds::{
    DevServer, DevServerFlavor, DevServerFlavorSpec, DevServerMode, DevServerSpec, DevServerUser,
    DevServerUserSpec, DistributedSpec, LifecycleSpec, PersistentHomeSpec, SshSpec,
    VolumeMountSpec, validate_volume_mounts,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

/// Longest Kubernetes DNS label
const MAX_DNS_LABEL: usize = 63;

/// Check an RFC 1123 DNS label (lowercase alphanumerics and '-').
pub fn validate_dns_label(kind: &str, value: &str) -> Result<(), ClientError> {
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = !value.starts_with('-') && !value.ends_with('-');
    if value.is_empty() || value.len() > MAX_DNS_LABEL || !valid_chars || !valid_edges {
        return Err(ClientError::Validation(format!(
            "{} '{}' must be a lowercase DNS label of at most {} characters",
            kind, value, MAX_DNS_LABEL
        )));
    }
    Ok(())
}

/// A DevServer ready to be created
#[derive(Debug, Clone)]
pub struct NewDevServer {
    pub name: String,
    pub namespace: String,
    pub spec: DevServerSpec,
}

impl NewDevServer {
    /// Start a DevServer request with the fields every server needs.
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        owner: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Result<Self, ClientError> {
        let name = name.into();
        let namespace = namespace.into();
        validate_dns_label("name", &name)?;
        validate_dns_label("namespace", &namespace)?;

        let spec = DevServerSpec {
            owner: owner.into(),
            ssh: SshSpec {
                public_key: public_key.into(),
            },
            ..Default::default()
        };
        if spec.owner.trim().is_empty() {
            return Err(ClientError::Validation("owner is required".to_string()));
        }
        if spec.ssh.public_key.trim().is_empty() {
            return Err(ClientError::Validation("an SSH public key is required".to_string()));
        }

        Ok(Self { name, namespace, spec })
    }

    pub fn flavor(mut self, flavor: impl Into<String>) -> Self {
        self.spec.flavor = Some(flavor.into());
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.spec.image = Some(image.into());
        self
    }

    pub fn time_to_live(mut self, ttl: impl Into<String>) -> Self {
        self.spec.lifecycle.get_or_insert_with(LifecycleSpec::default).time_to_live = Some(ttl.into());
        self
    }

    pub fn idle_shutdown(mut self, idle_seconds: i64) -> Self {
        let lifecycle = self.spec.lifecycle.get_or_insert_with(LifecycleSpec::default);
        lifecycle.idle_timeout = Some(idle_seconds);
        lifecycle.auto_shutdown = true;
        self
    }

    pub fn persistent_home(mut self, size: Option<String>) -> Self {
        self.spec.persistent_home = Some(PersistentHomeSpec { enabled: true, size });
        self
    }

    pub fn volume(mut self, claim_name: impl Into<String>, mount_path: impl Into<String>, read_only: bool) -> Self {
        self.spec.volumes.push(VolumeMountSpec {
            claim_name: claim_name.into(),
            mount_path: mount_path.into(),
            read_only,
        });
        self
    }

    pub fn distributed(mut self, distributed: DistributedSpec) -> Self {
        self.spec.mode = DevServerMode::Distributed;
        self.spec.distributed = Some(distributed);
        self
    }

    /// Validate the full spec and build the resource.
    pub fn build(self) -> Result<DevServer, ClientError> {
        self.spec.validate()?;
        let mut devserver = DevServer::new(&self.name, self.spec);
        devserver.metadata.namespace = Some(self.namespace);
        Ok(devserver)
    }
}

/// DevServers in one namespace
pub struct DevServers<C: ClusterClientTrait + ?Sized> {
    client: Arc<C>,
    namespace: String,
}

impl<C: ClusterClientTrait + ?Sized> DevServers<C> {
    pub fn new(client: Arc<C>, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub async fn create(&self, request: NewDevServer) -> Result<DevServer, ClientError> {
        if request.namespace != self.namespace {
            return Err(ClientError::Validation(format!(
                "DevServer targets namespace '{}' but this handle is scoped to '{}'",
                request.namespace, self.namespace
            )));
        }
        let devserver = request.build()?;
        let created = self.client.create_devserver(&devserver).await?;
        info!("Created DevServer {}/{}", self.namespace, devserver.metadata.name.as_deref().unwrap_or_default());
        Ok(created)
    }

    pub async fn get(&self, name: &str) -> Result<DevServer, ClientError> {
        self.client.get_devserver(&self.namespace, name).await
    }

    pub async fn list(&self) -> Result<Vec<DevServer>, ClientError> {
        self.client.list_devservers(Some(&self.namespace)).await
    }

    /// Replace the spec; the object must carry the version it was read at.
    pub async fn update(&self, devserver: &DevServer) -> Result<DevServer, ClientError> {
        devserver.spec.validate()?;
        self.client.replace_devserver(devserver).await
    }

    /// Delete a DevServer. Deleting one that is already gone succeeds.
    pub async fn delete(&self, name: &str) -> Result<(), ClientError> {
        match self.client.delete_devserver(&self.namespace, name).await {
            Err(ClientError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}

/// Cluster-scoped flavors
pub struct Flavors<C: ClusterClientTrait + ?Sized> {
    client: Arc<C>,
}

impl<C: ClusterClientTrait + ?Sized> Flavors<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    pub async fn create(&self, name: &str, spec: DevServerFlavorSpec) -> Result<DevServerFlavor, ClientError> {
        validate_dns_label("flavor name", name)?;
        validate_volume_mounts(&spec.volumes)?;
        for (resource, value) in spec.resources.requests.iter().chain(&spec.resources.limits) {
            crds::quantity::parse_quantity(value).map_err(|e| {
                ClientError::Validation(format!("resource '{}': {}", resource, e))
            })?;
        }
        self.client.create_flavor(&DevServerFlavor::new(name, spec)).await
    }

    pub async fn get(&self, name: &str) -> Result<DevServerFlavor, ClientError> {
        self.client.get_flavor(name).await
    }

    pub async fn list(&self) -> Result<Vec<DevServerFlavor>, ClientError> {
        self.client.list_flavors().await
    }

    pub async fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.client.delete_flavor(name).await
    }
}

/// Cluster-scoped users
pub struct Users<C: ClusterClientTrait + ?Sized> {
    client: Arc<C>,
}

impl<C: ClusterClientTrait + ?Sized> Users<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    pub async fn create(
        &self,
        username: &str,
        quota: BTreeMap<String, String>,
    ) -> Result<DevServerUser, ClientError> {
        validate_dns_label("username", username)?;
        for (resource, value) in &quota {
            crds::quantity::parse_quantity(value).map_err(|e| {
                ClientError::Validation(format!("quota '{}': {}", resource, e))
            })?;
        }
        let spec = DevServerUserSpec {
            username: username.to_string(),
            namespace: None,
            quota,
        };
        self.client.create_user(&DevServerUser::new(username, spec)).await
    }

    pub async fn get(&self, name: &str) -> Result<DevServerUser, ClientError> {
        self.client.get_user(name).await
    }

    pub async fn list(&self) -> Result<Vec<DevServerUser>, ClientError> {
        self.client.list_users().await
    }

    pub async fn delete(&self, name: &str) -> Result<(), ClientError> {
        self.client.delete_user(name).await
    }
}
