//! Test utilities for unit testing reconcilers
//!
//! Builders for test resources and a mock cluster preloaded with them.

use crate::config::OperatorConfig;
use chrono::{DateTime, Utc};
use crds::{
    DevServer, DevServerFlavor, DevServerFlavorSpec, DevServerSpec, DevServerUser,
    DevServerUserSpec, FlavorResources, LifecycleSpec, SshSpec, VolumeMountSpec,
};
use devserver_client::{AutoscalerPool, MockClusterClient, NodeInventory, NodeTaint};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const TEST_NAMESPACE: &str = "dev-alice";

pub fn test_config() -> OperatorConfig {
    OperatorConfig {
        default_devserver_image: "devserver-base:test".to_string(),
        static_dependencies_image: "devserver-static:test".to_string(),
        ..Default::default()
    }
}

pub fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// DevServer with an owner, key and uid; no flavor, image or lifecycle
pub fn create_test_devserver(name: &str) -> DevServer {
    DevServer {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(TEST_NAMESPACE.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: DevServerSpec {
            owner: "alice".to_string(),
            ssh: SshSpec {
                public_key: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAITEST alice@laptop".to_string(),
            },
            ..Default::default()
        },
        status: None,
    }
}

/// DevServer created at `created` with the given TTL and absolute expiry
pub fn create_test_devserver_with_lifecycle(
    name: &str,
    created: DateTime<Utc>,
    time_to_live: Option<&str>,
    expiration_time: Option<DateTime<Utc>>,
) -> DevServer {
    let mut devserver = create_test_devserver(name);
    devserver.metadata.creation_timestamp = crds::time::from_chrono(created);
    devserver.spec.lifecycle = Some(LifecycleSpec {
        time_to_live: time_to_live.map(str::to_string),
        expiration_time,
        ..Default::default()
    });
    devserver
}

/// Flavor requesting `cpu` and `memory`
pub fn create_test_flavor(name: &str, cpu: &str, memory: &str, default: bool) -> DevServerFlavor {
    let mut flavor = DevServerFlavor::new(
        name,
        DevServerFlavorSpec {
            resources: FlavorResources {
                requests: map(&[("cpu", cpu), ("memory", memory)]),
                limits: map(&[("cpu", cpu), ("memory", memory)]),
            },
            default,
            ..Default::default()
        },
    );
    flavor.metadata.uid = Some(format!("uid-flavor-{}", name));
    flavor
}

pub fn create_test_user(name: &str, username: &str) -> DevServerUser {
    DevServerUser::new(
        name,
        DevServerUserSpec {
            username: username.to_string(),
            ..Default::default()
        },
    )
}

pub fn volume(claim: &str, path: &str) -> VolumeMountSpec {
    VolumeMountSpec {
        claim_name: claim.to_string(),
        mount_path: path.to_string(),
        read_only: false,
    }
}

/// Ready, schedulable node with the given allocatable cpu and memory
pub fn create_test_node(name: &str, cpu: &str, memory: &str) -> NodeInventory {
    NodeInventory {
        name: name.to_string(),
        labels: map(&[("kubernetes.io/hostname", name)]),
        taints: Vec::new(),
        allocatable: map(&[("cpu", cpu), ("memory", memory), ("pods", "110")]),
        ready: true,
        unschedulable: false,
    }
}

pub fn taint(key: &str, value: Option<&str>, effect: &str) -> NodeTaint {
    NodeTaint {
        key: key.to_string(),
        value: value.map(str::to_string),
        effect: effect.to_string(),
    }
}

/// Ready pool without limits
pub fn create_test_pool(name: &str, labels: &[(&str, &str)]) -> AutoscalerPool {
    AutoscalerPool {
        name: name.to_string(),
        labels: map(labels),
        taints: Vec::new(),
        limits: None,
        ready: true,
    }
}

/// Mock cluster holding `flavors`
pub fn mock_with_flavors(flavors: Vec<DevServerFlavor>) -> Arc<MockClusterClient> {
    let mock = Arc::new(MockClusterClient::new());
    for flavor in flavors {
        mock.add_flavor(flavor);
    }
    mock
}
