use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One shard of a synthesis attempt's output. Created by the executor,
/// referenced from the attempt, consumed by the downstream reconciler which
/// writes per-resource status back.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "ResourceSlice",
    namespaced,
    status = "ResourceSliceStatus",
    shortname = "slice"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceSpec {
    /// UUID of the attempt that produced this slice.
    pub synthesis_uuid: String,

    /// Composition generation observed by that attempt.
    #[serde(default)]
    pub composition_generation: i64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Manifest>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Opaque resource manifest, serialized JSON.
    pub manifest: String,

    /// The synthesizer no longer emits this resource; downstream deletes it.
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceStatus {
    /// Written by the downstream reconciler, index-aligned with
    /// `spec.resources`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<ResourceState>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceState {
    #[serde(default)]
    pub reconciled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Time>,

    #[serde(default)]
    pub deleted: bool,
}

impl ResourceSlice {
    /// True once the downstream reconciler has written one state entry per
    /// manifest. Until then the slice's composition cannot be considered
    /// reconciled.
    pub fn status_populated(&self) -> bool {
        let manifests = self.spec.resources.len();
        manifests == 0
            || self
                .status
                .as_ref()
                .is_some_and(|s| s.resources.len() == manifests)
    }

    pub fn resource_states(&self) -> &[ResourceState] {
        self.status
            .as_ref()
            .map(|s| s.resources.as_slice())
            .unwrap_or_default()
    }

    /// Every resource acknowledged deleted by the downstream reconciler.
    pub fn all_deleted(&self) -> bool {
        self.status_populated() && self.resource_states().iter().all(|r| r.deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_populated_requires_full_coverage() {
        let mut slice = ResourceSlice::new(
            "s",
            ResourceSliceSpec {
                synthesis_uuid: "u".into(),
                composition_generation: 1,
                resources: vec![
                    Manifest {
                        manifest: "{}".into(),
                        deleted: false,
                    },
                    Manifest {
                        manifest: "{}".into(),
                        deleted: false,
                    },
                ],
            },
        );
        assert!(!slice.status_populated());

        slice.status = Some(ResourceSliceStatus {
            resources: vec![ResourceState::default()],
        });
        assert!(!slice.status_populated());

        slice.status = Some(ResourceSliceStatus {
            resources: vec![ResourceState::default(), ResourceState::default()],
        });
        assert!(slice.status_populated());
    }

    #[test]
    fn empty_slice_is_trivially_populated() {
        let slice = ResourceSlice::new(
            "s",
            ResourceSliceSpec {
                synthesis_uuid: "u".into(),
                composition_generation: 1,
                resources: vec![],
            },
        );
        assert!(slice.status_populated());
        assert!(slice.all_deleted());
    }
}
