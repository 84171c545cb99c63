//! Service builders

use super::{ChildMeta, headless_service_name, ssh_service_name};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

fn ssh_port() -> ServicePort {
    ServicePort {
        name: Some("ssh".to_string()),
        port: 22,
        target_port: Some(IntOrString::Int(22)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Stable per-pod DNS for the StatefulSet; resolvable before readiness so
/// distributed peers can rendezvous.
pub(super) fn build_headless_service(meta: &ChildMeta<'_>) -> Service {
    Service {
        metadata: meta.object_meta(headless_service_name(meta.name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(meta.selector()),
            ports: Some(vec![ssh_port()]),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    }
}

pub(super) fn build_ssh_service(meta: &ChildMeta<'_>) -> Service {
    Service {
        metadata: meta.object_meta(ssh_service_name(meta.name)),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(meta.selector()),
            ports: Some(vec![ssh_port()]),
            ..Default::default()
        }),
        status: None,
    }
}
