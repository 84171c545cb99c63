//! sshd configuration and message of the day

use super::{ChildMeta, sshd_config_name};
use crds::{DevServer, DevServerMode};
use k8s_openapi::api::core::v1::ConfigMap;
use std::collections::BTreeMap;

const SSHD_CONFIG: &str = include_str!("sshd_config");

pub(super) fn build_sshd_config_map(meta: &ChildMeta<'_>, devserver: &DevServer) -> ConfigMap {
    ConfigMap {
        metadata: meta.object_meta(sshd_config_name(meta.name)),
        data: Some(BTreeMap::from([
            ("sshd_config".to_string(), SSHD_CONFIG.to_string()),
            ("motd".to_string(), render_motd(meta.name, devserver)),
        ])),
        ..Default::default()
    }
}

fn render_motd(name: &str, devserver: &DevServer) -> String {
    let mode = match devserver.spec.mode {
        DevServerMode::Standalone => "standalone".to_string(),
        DevServerMode::Distributed => {
            let world = devserver.spec.distributed.as_ref().map_or(1, |d| d.world_size);
            format!("distributed (world size {})", world)
        }
    };
    let home = if devserver.spec.persistent_home.as_ref().is_some_and(|h| h.enabled) {
        "persistent"
    } else {
        "ephemeral, lost when the server is deleted"
    };

    format!(
        "Welcome to DevServer {name}\n\
         \n  Owner: {owner}\
         \n  Mode:  {mode}\
         \n  Home:  {home}\n\n",
        name = name,
        owner = devserver.spec.owner,
        mode = mode,
        home = home,
    )
}
