//! Volume merging and rendering

use super::HOME_MOUNT_PATH;
use crds::VolumeMountSpec;
use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Name of the home volume (or claim template)
pub const HOME_VOLUME: &str = "home";

/// A user volume after flavor and DevServer declarations are merged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveVolume {
    /// Pod-level volume name
    pub name: String,
    pub claim_name: String,
    pub mount_path: String,
    pub read_only: bool,
}

/// Merge flavor volumes with DevServer volumes keyed by mount path.
///
/// A DevServer volume replaces a flavor volume at the same path. The result
/// is ordered by mount path so names are stable across passes.
pub fn effective_volumes(flavor: &[VolumeMountSpec], devserver: &[VolumeMountSpec]) -> Vec<EffectiveVolume> {
    let mut by_path: BTreeMap<&str, &VolumeMountSpec> = BTreeMap::new();
    for volume in flavor.iter().chain(devserver) {
        by_path.insert(volume.mount_path.as_str(), volume);
    }

    by_path
        .into_values()
        .enumerate()
        .map(|(idx, volume)| EffectiveVolume {
            name: format!("vol-{}", idx),
            claim_name: volume.claim_name.clone(),
            mount_path: volume.mount_path.clone(),
            read_only: volume.read_only,
        })
        .collect()
}

impl EffectiveVolume {
    pub fn volume(&self) -> Volume {
        Volume {
            name: self.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: self.claim_name.clone(),
                read_only: self.read_only.then_some(true),
            }),
            ..Default::default()
        }
    }

    pub fn mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.name.clone(),
            mount_path: self.mount_path.clone(),
            read_only: self.read_only.then_some(true),
            ..Default::default()
        }
    }
}

/// Scratch volume backed by node storage
pub fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// Claim template for a persistent home of `size`
pub fn home_claim_template(size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(HOME_VOLUME.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn home_mount() -> VolumeMount {
    VolumeMount {
        name: HOME_VOLUME.to_string(),
        mount_path: HOME_MOUNT_PATH.to_string(),
        ..Default::default()
    }
}
