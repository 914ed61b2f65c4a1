use std::collections::BTreeMap;
use std::collections::BTreeSet;

use kube::api::GroupVersionKind;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A Synthesizer is the executable specification that produces resources: a
/// container image plus command that, given named inputs on stdin, emits a
/// KRM ResourceList on stdout.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Synthesizer",
    status = "SynthesizerStatus",
    shortname = "syn"
)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerSpec {
    /// Executor container image.
    pub image: String,

    /// Command executed inside the container. The executor harness pipes the
    /// input ResourceList to its stdin and captures its stdout.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Maximum wall time for one invocation of the command, e.g. "30s".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_timeout: Option<String>,

    /// Declared inputs. Compositions bind each ref's key to a concrete
    /// object unless the ref names one itself.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<Ref>,

    /// Metadata merged onto executor pods running this synthesizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_overrides: Option<PodOverrides>,
}

/// One declared input of a Synthesizer.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Ref {
    /// Binding key. Compositions bind objects to keys; the executor stamps
    /// the key onto each input object it hands to the synthesizer.
    pub key: String,

    pub resource: ResourceRef,

    /// Changes to deferred inputs do not force immediate resynthesis; they
    /// are batched until a non-deferred input changes or the rollout
    /// cooldown expires.
    #[serde(default)]
    pub defer: bool,
}

/// Group/version/kind of a ref, optionally pinned to a single object.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API group. Empty for the core group.
    #[serde(default)]
    pub group: String,

    pub version: String,
    pub kind: String,

    /// When set the ref is implicit: every Composition using this
    /// synthesizer reads the same object and no binding is needed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodOverrides {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerStatus {
    /// Last generation seen by the controller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_generation: Option<i64>,
}

impl ResourceRef {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.group, &self.version, &self.kind)
    }
}

impl Synthesizer {
    /// Distinct group/version/kinds mentioned by this synthesizer's refs.
    /// The input watch fabric keeps exactly one watcher per member.
    pub fn watched_gvks(&self) -> BTreeSet<(String, String, String)> {
        self.spec
            .refs
            .iter()
            .map(|r| {
                (
                    r.resource.group.clone(),
                    r.resource.version.clone(),
                    r.resource.kind.clone(),
                )
            })
            .collect()
    }

    /// Refs that require a Composition binding, i.e. those not pinned to a
    /// single object by the synthesizer itself.
    pub fn bound_refs(&self) -> impl Iterator<Item = &Ref> {
        self.spec.refs.iter().filter(|r| r.resource.name.is_none())
    }

    pub fn ref_for_key(&self, key: &str) -> Option<&Ref> {
        self.spec.refs.iter().find(|r| r.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synth_with_refs(refs: Vec<Ref>) -> Synthesizer {
        Synthesizer::new(
            "test",
            SynthesizerSpec {
                image: "img:1".into(),
                refs,
                ..Default::default()
            },
        )
    }

    #[test]
    fn watched_gvks_deduplicates() {
        let syn = synth_with_refs(vec![
            Ref {
                key: "a".into(),
                resource: ResourceRef {
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                    ..Default::default()
                },
                defer: false,
            },
            Ref {
                key: "b".into(),
                resource: ResourceRef {
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                    ..Default::default()
                },
                defer: true,
            },
            Ref {
                key: "c".into(),
                resource: ResourceRef {
                    group: "apps".into(),
                    version: "v1".into(),
                    kind: "Deployment".into(),
                    ..Default::default()
                },
                defer: false,
            },
        ]);
        assert_eq!(syn.watched_gvks().len(), 2);
    }

    #[test]
    fn bound_refs_skips_pinned() {
        let syn = synth_with_refs(vec![
            Ref {
                key: "bound".into(),
                resource: ResourceRef {
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                    ..Default::default()
                },
                defer: false,
            },
            Ref {
                key: "pinned".into(),
                resource: ResourceRef {
                    version: "v1".into(),
                    kind: "ConfigMap".into(),
                    name: Some("global".into()),
                    namespace: Some("default".into()),
                    ..Default::default()
                },
                defer: false,
            },
        ]);
        let keys: Vec<_> = syn.bound_refs().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, vec!["bound"]);
    }
}
