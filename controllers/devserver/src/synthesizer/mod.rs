//! Object synthesis.
//!
//! Pure functions from (DevServer, resolved flavor, operator config) to the
//! desired child objects. No I/O and nothing time- or randomness-dependent:
//! the same inputs always produce identical objects. Host keys are the one
//! random payload and are generated by the converger, which only needs the
//! Secret's identity from here.

mod configmap;
mod services;
mod statefulset;
mod volumes;

pub use volumes::{EffectiveVolume, effective_volumes};

use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crds::{DevServer, DevServerFlavor};
use devserver_client::{LABEL_DEVSERVER, LABEL_MANAGED_BY, MANAGED_BY, ManagedObject};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Label selecting a DevServer's pod
pub const LABEL_APP: &str = "app";

/// Mount path of the home directory
pub const HOME_MOUNT_PATH: &str = "/home/dev";

/// Secret holding the sshd host key pair
pub fn host_keys_name(devserver: &str) -> String {
    format!("{}-host-keys", devserver)
}

/// ConfigMap holding sshd_config and motd
pub fn sshd_config_name(devserver: &str) -> String {
    format!("{}-sshd-config", devserver)
}

/// Headless Service giving the pod a stable DNS name
pub fn headless_service_name(devserver: &str) -> String {
    format!("{}-headless", devserver)
}

/// ClusterIP Service for SSH
pub fn ssh_service_name(devserver: &str) -> String {
    format!("{}-ssh", devserver)
}

/// The full desired child object set of one DevServer
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredObjects {
    /// Identity of the host-key Secret; its payload is generated once on create
    pub host_keys: ObjectMeta,
    pub config_map: ConfigMap,
    pub stateful_set: StatefulSet,
    pub services: Vec<Service>,
}

impl DesiredObjects {
    /// Objects other than the host-key Secret, in creation order:
    /// the ConfigMap the StatefulSet mounts comes first.
    pub fn ordered(&self) -> Vec<ManagedObject> {
        let mut objects = vec![
            ManagedObject::ConfigMap(self.config_map.clone()),
            ManagedObject::StatefulSet(self.stateful_set.clone()),
        ];
        objects.extend(self.services.iter().cloned().map(ManagedObject::Service));
        objects
    }
}

/// Synthesize the desired objects for `devserver` using `flavor`.
pub fn synthesize(
    devserver: &DevServer,
    flavor: &DevServerFlavor,
    config: &OperatorConfig,
) -> Result<DesiredObjects, ControllerError> {
    devserver.spec.validate()?;

    let name = devserver.name_any();
    let namespace = devserver.namespace().ok_or_else(|| {
        ControllerError::Validation(format!("DevServer {} has no namespace", name))
    })?;
    let owner = owner_reference(devserver)?;
    let meta = ChildMeta {
        name: &name,
        namespace: &namespace,
        owner,
    };

    let image = effective_image(devserver, flavor, config)?;
    let volumes = effective_volumes(&flavor.spec.volumes, &devserver.spec.volumes);

    Ok(DesiredObjects {
        host_keys: meta.object_meta(host_keys_name(&name)),
        config_map: configmap::build_sshd_config_map(&meta, devserver),
        stateful_set: statefulset::build_statefulset(&meta, devserver, flavor, config, &image, &volumes)?,
        services: vec![
            services::build_headless_service(&meta),
            services::build_ssh_service(&meta),
        ],
    })
}

/// DevServer image, else the flavor's default image, else the operator default.
pub fn effective_image(
    devserver: &DevServer,
    flavor: &DevServerFlavor,
    config: &OperatorConfig,
) -> Result<String, ControllerError> {
    [
        devserver.spec.image.as_deref(),
        flavor.spec.default_image.as_deref(),
        Some(config.default_devserver_image.as_str()),
    ]
    .into_iter()
    .flatten()
    .map(str::trim)
    .find(|image| !image.is_empty())
    .map(str::to_string)
    .ok_or_else(|| ControllerError::Validation("no container image could be resolved".to_string()))
}

/// Labels carried by every child object
pub fn managed_labels(devserver: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
        (LABEL_DEVSERVER.to_string(), devserver.to_string()),
    ])
}

fn owner_reference(devserver: &DevServer) -> Result<OwnerReference, ControllerError> {
    devserver.controller_owner_ref(&()).ok_or_else(|| {
        ControllerError::Validation(format!(
            "DevServer {} has no uid; cannot own child objects",
            devserver.name_any()
        ))
    })
}

/// Identity shared by the child objects of one DevServer
pub(crate) struct ChildMeta<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub owner: OwnerReference,
}

impl ChildMeta<'_> {
    pub fn object_meta(&self, name: String) -> ObjectMeta {
        self.object_meta_with(name, BTreeMap::new())
    }

    pub fn object_meta_with(&self, name: String, extra_labels: BTreeMap<String, String>) -> ObjectMeta {
        let mut labels = managed_labels(self.name);
        labels.extend(extra_labels);
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.to_string()),
            labels: Some(labels),
            owner_references: Some(vec![self.owner.clone()]),
            ..Default::default()
        }
    }

    /// Pod selector labels
    pub fn selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LABEL_APP.to_string(), self.name.to_string())])
    }
}
