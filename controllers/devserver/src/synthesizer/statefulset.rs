//! StatefulSet builder
//!
//! One replica with a stable network identity (`<name>-0`). An init container
//! copies portable sshd binaries and the startup script into a shared volume
//! so any user image can run sshd.

use super::volumes::{self, EffectiveVolume, HOME_VOLUME};
use super::{ChildMeta, headless_service_name, host_keys_name, sshd_config_name};
use crate::config::OperatorConfig;
use crate::error::ControllerError;
use crds::{DevServer, DevServerFlavor, DevServerMode, FlavorResources, FlavorToleration};
use devserver_client::DEVSERVER_CONTAINER;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecretVolumeSource, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

/// Rendezvous port for distributed workloads
pub const MASTER_PORT: u16 = 29500;

const BIN_VOLUME: &str = "bin";
const BIN_PATH: &str = "/opt/bin";
const SSHD_CONFIG_VOLUME: &str = "sshd-config";
const HOST_KEYS_VOLUME: &str = "host-keys";
const HOST_KEYS_PATH: &str = "/opt/ssh/hostkeys";
const HOST_KEYS_MODE: i32 = 0o600;

const INSTALL_SSHD_SCRIPT: &str = "set -ex
for bin in sshd scp sftp-server ssh-keygen doas startup.sh; do
  cp /usr/local/bin/$bin /opt/bin/
done
chmod +x /opt/bin/sshd /opt/bin/startup.sh
chmod u+s,+x /opt/bin/doas
";

pub(super) fn build_statefulset(
    meta: &ChildMeta<'_>,
    devserver: &DevServer,
    flavor: &DevServerFlavor,
    config: &OperatorConfig,
    image: &str,
    user_volumes: &[EffectiveVolume],
) -> Result<StatefulSet, ControllerError> {
    let spec = &devserver.spec;

    let persistent_home = spec
        .persistent_home
        .as_ref()
        .filter(|home| home.enabled)
        .map(|home| {
            home.size
                .clone()
                .unwrap_or_else(|| config.default_persistent_home_size.clone())
        });

    let mut pod_volumes = vec![
        volumes::empty_dir(BIN_VOLUME),
        Volume {
            name: SSHD_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: sshd_config_name(meta.name),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: HOST_KEYS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(host_keys_name(meta.name)),
                default_mode: Some(HOST_KEYS_MODE),
                ..Default::default()
            }),
            ..Default::default()
        },
    ];
    if persistent_home.is_none() {
        pod_volumes.push(volumes::empty_dir(HOME_VOLUME));
    }
    pod_volumes.extend(user_volumes.iter().map(EffectiveVolume::volume));

    let mut mounts = vec![
        volumes::home_mount(),
        mount(BIN_VOLUME, BIN_PATH, None, false),
        mount(SSHD_CONFIG_VOLUME, "/opt/ssh/sshd_config", Some("sshd_config"), true),
        mount(SSHD_CONFIG_VOLUME, "/etc/motd", Some("motd"), true),
        mount(HOST_KEYS_VOLUME, HOST_KEYS_PATH, None, true),
    ];
    mounts.extend(user_volumes.iter().map(EffectiveVolume::mount));

    let mut env = vec![env_var("SSH_PUBLIC_KEY", &spec.ssh.public_key)];
    if spec.mode == DevServerMode::Distributed {
        env.extend(distributed_env(devserver, meta)?);
    }

    let init = Container {
        name: "install-sshd".to_string(),
        image: Some(config.static_dependencies_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![INSTALL_SSHD_SCRIPT.to_string()]),
        volume_mounts: Some(vec![mount(BIN_VOLUME, BIN_PATH, None, false)]),
        ..Default::default()
    };

    let main = Container {
        name: DEVSERVER_CONTAINER.to_string(),
        image: Some(image.to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
        args: Some(vec![format!("{}/startup.sh", BIN_PATH)]),
        ports: Some(vec![ContainerPort {
            name: Some("ssh".to_string()),
            container_port: 22,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        env: Some(env),
        resources: resource_requirements(&flavor.spec.resources),
        volume_mounts: Some(mounts),
        ..Default::default()
    };

    let selector = meta.selector();
    let pod_spec = PodSpec {
        init_containers: Some(vec![init]),
        containers: vec![main],
        volumes: Some(pod_volumes),
        node_selector: Some(flavor.spec.node_selector.clone()).filter(|s| !s.is_empty()),
        tolerations: Some(flavor.spec.tolerations.iter().map(toleration).collect::<Vec<_>>())
            .filter(|t| !t.is_empty()),
        ..Default::default()
    };

    Ok(StatefulSet {
        metadata: meta.object_meta_with(meta.name.to_string(), selector.clone()),
        spec: Some(StatefulSetSpec {
            replicas: Some(1),
            service_name: Some(headless_service_name(meta.name)),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(pod_labels(meta, selector)),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            volume_claim_templates: persistent_home
                .as_deref()
                .map(|size| vec![volumes::home_claim_template(size)]),
            ..Default::default()
        }),
        status: None,
    })
}

fn pod_labels(meta: &ChildMeta<'_>, selector: BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut labels = super::managed_labels(meta.name);
    labels.extend(selector);
    labels
}

fn distributed_env(devserver: &DevServer, meta: &ChildMeta<'_>) -> Result<Vec<EnvVar>, ControllerError> {
    let distributed = devserver.spec.distributed.as_ref().ok_or_else(|| {
        ControllerError::Validation("distributed mode requires a distributed block".to_string())
    })?;

    let master = format!(
        "{}-0.{}.{}.svc.cluster.local",
        meta.name,
        headless_service_name(meta.name),
        meta.namespace
    );
    let mut env = vec![
        env_var("WORLD_SIZE", &distributed.world_size.to_string()),
        env_var("NPROC_PER_NODE", &distributed.nproc_per_node.to_string()),
        env_var("DIST_BACKEND", &distributed.backend),
        env_var("MASTER_ADDR", &master),
        env_var("MASTER_PORT", &MASTER_PORT.to_string()),
    ];
    env.extend(
        distributed
            .settings
            .iter()
            .map(|(key, value)| env_var(&setting_env_name(key), value)),
    );
    Ok(env)
}

/// `nccl.socket-ifname` -> `NCCL_SOCKET_IFNAME`
fn setting_env_name(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn resource_requirements(resources: &FlavorResources) -> Option<ResourceRequirements> {
    fn quantities(map: &BTreeMap<String, String>) -> Option<BTreeMap<String, Quantity>> {
        Some(map.iter().map(|(k, v)| (k.clone(), Quantity(v.clone()))).collect::<BTreeMap<_, _>>())
            .filter(|m| !m.is_empty())
    }

    if resources.requests.is_empty() && resources.limits.is_empty() {
        return None;
    }
    Some(ResourceRequirements {
        requests: quantities(&resources.requests),
        limits: quantities(&resources.limits),
        ..Default::default()
    })
}

fn toleration(t: &FlavorToleration) -> Toleration {
    Toleration {
        key: t.key.clone(),
        operator: t.operator.clone(),
        value: t.value.clone(),
        effect: t.effect.clone(),
        toleration_seconds: t.toleration_seconds,
    }
}

fn mount(name: &str, path: &str, sub_path: Option<&str>, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        sub_path: sub_path.map(str::to_string),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}
