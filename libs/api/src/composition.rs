use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::synthesizer::Synthesizer;
use crate::{DELETION_STRATEGY_ANNOTATION, DELETION_STRATEGY_ORPHAN, IGNORE_SIDE_EFFECTS_ANNOTATION};

/// A Composition binds one Synthesizer to concrete inputs. Its status tracks
/// the lifecycle of synthesis attempts and the observed revisions of every
/// bound input.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Composition",
    namespaced,
    status = "CompositionStatus",
    shortname = "comp"
)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSpec {
    pub synthesizer: SynthesizerRef,

    /// One entry per non-implicit synthesizer ref key.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,

    /// Extra environment passed to the executor pod. Names prefixed with
    /// `ENO_` are reserved and dropped by the pod builder.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synthesis_env: Vec<EnvVar>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerRef {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    /// Key of the synthesizer ref this binding satisfies.
    pub key: String,
    pub resource: BoundResource,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoundResource {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompositionStatus {
    /// Latest completed or terminally failed attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_synthesis: Option<Synthesis>,

    /// Last successful attempt, retained until the next one is reconciled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_synthesis: Option<Synthesis>,

    /// Attempt dispatched by the scheduler, cleared on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_flight_synthesis: Option<Synthesis>,

    /// Last observed revision per binding key, written by the watch fabric.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_revisions: Vec<InputRevisions>,

    /// Set when a deferred input changed; a new attempt starts once the
    /// rollout cooldown has elapsed since this time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_resynthesis: Option<Time>,

    /// Set by recovery paths (e.g. missing slice) to force a new attempt.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force_resynthesis: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simplified: Option<SimplifiedStatus>,
}

/// One synthesis attempt, identified by UUID. Attempt state
/// (pending/running/succeeded/failed) is derived from these fields and the
/// executor pod; it is never persisted as an enum.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Synthesis {
    pub uuid: String,

    /// Stamped by the scheduler at dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initialized: Option<Time>,

    /// Stamped by the pod lifecycle controller when the executor pod is
    /// created, and reset when the pod is recreated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_creation: Option<Time>,

    /// Stamped by the executor once all slices are written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesized: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Time>,

    #[serde(default)]
    pub observed_composition_generation: i64,

    #[serde(default)]
    pub observed_synthesizer_generation: i64,

    /// Snapshot of the composition's input revisions at dispatch time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub input_revisions: Vec<InputRevisions>,

    /// Names of the slices holding this attempt's output. Append-only
    /// within one attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_slices: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ResultEntry>,

    /// Executor pod creations for this attempt, drives recreate backoff.
    #[serde(default)]
    pub attempts: i64,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

/// The `(resourceVersion, synthesizerGeneration)` pair recorded per binding
/// key when the watch fabric observes a change.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InputRevisions {
    pub key: String,
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesizer_generation: Option<i64>,
}

/// A diagnostic emitted by the synthesizer. `severity == Error` is terminal
/// for the attempt.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResultEntry {
    pub message: String,
    #[serde(default)]
    pub severity: ResultSeverity,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResultSeverity {
    #[default]
    Info,
    Warning,
    Error,
}

/// Human-oriented rollup of the composition state.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SimplifiedStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Synthesis {
    pub fn failed(&self) -> bool {
        self.failed
            || self
                .results
                .iter()
                .any(|r| r.severity == ResultSeverity::Error)
    }

    pub fn first_error(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| r.severity == ResultSeverity::Error)
            .map(|r| r.message.as_str())
    }
}

impl Composition {
    pub fn synthesizer_name(&self) -> &str {
        &self.spec.synthesizer.name
    }

    pub fn current_synthesis(&self) -> Option<&Synthesis> {
        self.status.as_ref().and_then(|s| s.current_synthesis.as_ref())
    }

    pub fn previous_synthesis(&self) -> Option<&Synthesis> {
        self.status.as_ref().and_then(|s| s.previous_synthesis.as_ref())
    }

    pub fn in_flight_synthesis(&self) -> Option<&Synthesis> {
        self.status
            .as_ref()
            .and_then(|s| s.in_flight_synthesis.as_ref())
    }

    pub fn input_revisions(&self) -> &[InputRevisions] {
        self.status
            .as_ref()
            .map(|s| s.input_revisions.as_slice())
            .unwrap_or_default()
    }

    pub fn force_resynthesis(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.force_resynthesis)
    }

    pub fn pending_resynthesis(&self) -> Option<&Time> {
        self.status
            .as_ref()
            .and_then(|s| s.pending_resynthesis.as_ref())
    }

    pub fn binding_for_key(&self, key: &str) -> Option<&Binding> {
        self.spec.bindings.iter().find(|b| b.key == key)
    }

    /// True when the UUID belongs to the in-flight, current or previous
    /// attempt. Slices from any other attempt are orphans.
    pub fn references_synthesis(&self, uuid: &str) -> bool {
        [
            self.in_flight_synthesis(),
            self.current_synthesis(),
            self.previous_synthesis(),
        ]
        .into_iter()
        .flatten()
        .any(|s| s.uuid == uuid)
    }

    pub fn deletion_strategy_is_orphan(&self) -> bool {
        self.annotations()
            .get(DELETION_STRATEGY_ANNOTATION)
            .is_some_and(|v| v == DELETION_STRATEGY_ORPHAN)
    }

    pub fn ignore_side_effects(&self) -> bool {
        self.annotations()
            .get(IGNORE_SIDE_EFFECTS_ANNOTATION)
            .is_some_and(|v| v == "true")
    }

    /// Every non-implicit synthesizer ref must have a binding and an
    /// observed input revision before synthesis can be dispatched.
    pub fn inputs_exist(&self, synth: &Synthesizer) -> bool {
        synth.bound_refs().all(|r| {
            self.binding_for_key(&r.key).is_some()
                && self.input_revisions().iter().any(|ir| ir.key == r.key)
        }) && synth
            .spec
            .refs
            .iter()
            .filter(|r| r.resource.name.is_some())
            .all(|r| self.input_revisions().iter().any(|ir| ir.key == r.key))
    }

    /// Inputs are in lockstep when all recorded revisions were observed
    /// under the same synthesizer generation. Entries without a recorded
    /// generation are tolerated.
    pub fn inputs_in_lockstep(&self) -> bool {
        let mut seen: Option<i64> = None;
        for rev in self.input_revisions() {
            if let Some(gen) = rev.synthesizer_generation {
                match seen {
                    Some(prev) if prev != gen => return false,
                    _ => seen = Some(gen),
                }
            }
        }
        true
    }

    /// Input revision entries whose `(resourceVersion, synthesizerGeneration)`
    /// differs from the snapshot recorded on the given attempt.
    pub fn changed_input_keys<'a>(&'a self, since: &'a Synthesis) -> Vec<&'a str> {
        self.input_revisions()
            .iter()
            .filter(|cur| {
                since
                    .input_revisions
                    .iter()
                    .find(|snap| snap.key == cur.key)
                    .map_or(true, |snap| {
                        snap.resource_version != cur.resource_version
                            || snap.synthesizer_generation != cur.synthesizer_generation
                    })
            })
            .map(|cur| cur.key.as_str())
            .collect()
    }

    /// Compute the human rollup from the attempt fields.
    pub fn simplified(&self) -> SimplifiedStatus {
        if let Some(current) = self.current_synthesis() {
            if current.failed() {
                return SimplifiedStatus {
                    status: "Failed".into(),
                    error: current.first_error().map(str::to_owned),
                };
            }
            if current.ready.is_some() {
                return SimplifiedStatus {
                    status: "Ready".into(),
                    error: None,
                };
            }
            if current.synthesized.is_some() {
                return SimplifiedStatus {
                    status: "Reconciling".into(),
                    error: None,
                };
            }
        }
        SimplifiedStatus {
            status: "Synthesizing".into(),
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::synthesizer::{Ref, ResourceRef, SynthesizerSpec};

    fn rev(key: &str, rv: &str, gen: Option<i64>) -> InputRevisions {
        InputRevisions {
            key: key.into(),
            resource_version: rv.into(),
            synthesizer_generation: gen,
        }
    }

    fn composition_with_revisions(revs: Vec<InputRevisions>) -> Composition {
        let mut comp = Composition::new(
            "test",
            CompositionSpec {
                synthesizer: SynthesizerRef { name: "syn".into() },
                bindings: vec![Binding {
                    key: "cfg".into(),
                    resource: BoundResource {
                        name: "cm-input".into(),
                        namespace: Some("default".into()),
                    },
                }],
                synthesis_env: vec![],
            },
        );
        comp.status = Some(CompositionStatus {
            input_revisions: revs,
            ..Default::default()
        });
        comp
    }

    fn synth_with_ref(key: &str, defer: bool) -> Synthesizer {
        Synthesizer::new(
            "syn",
            SynthesizerSpec {
                image: "img:1".into(),
                refs: vec![Ref {
                    key: key.into(),
                    resource: ResourceRef {
                        version: "v1".into(),
                        kind: "ConfigMap".into(),
                        ..Default::default()
                    },
                    defer,
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    fn lockstep_holds_for_matching_generations() {
        let comp = composition_with_revisions(vec![
            rev("a", "1", Some(3)),
            rev("b", "9", Some(3)),
            rev("c", "4", None),
        ]);
        assert!(comp.inputs_in_lockstep());
    }

    #[test]
    fn lockstep_broken_by_mixed_generations() {
        let comp =
            composition_with_revisions(vec![rev("a", "1", Some(3)), rev("b", "9", Some(4))]);
        assert!(!comp.inputs_in_lockstep());
    }

    #[test]
    fn inputs_exist_requires_binding_and_revision() {
        let synth = synth_with_ref("cfg", false);

        let comp = composition_with_revisions(vec![rev("cfg", "1", Some(1))]);
        assert!(comp.inputs_exist(&synth));

        let comp = composition_with_revisions(vec![]);
        assert!(!comp.inputs_exist(&synth));

        let synth = synth_with_ref("other", false);
        let comp = composition_with_revisions(vec![rev("cfg", "1", Some(1))]);
        assert!(!comp.inputs_exist(&synth));
    }

    #[test]
    fn changed_input_keys_compares_against_snapshot() {
        let comp = composition_with_revisions(vec![
            rev("a", "2", Some(1)),
            rev("b", "5", Some(1)),
            rev("c", "7", Some(1)),
        ]);
        let attempt = Synthesis {
            uuid: "u".into(),
            input_revisions: vec![rev("a", "2", Some(1)), rev("b", "4", Some(1))],
            ..Default::default()
        };
        let changed = comp.changed_input_keys(&attempt);
        assert_eq!(changed, vec!["b", "c"]);
    }

    #[test]
    fn references_synthesis_covers_all_three_slots() {
        let mut comp = composition_with_revisions(vec![]);
        comp.status = Some(CompositionStatus {
            current_synthesis: Some(Synthesis {
                uuid: "cur".into(),
                ..Default::default()
            }),
            previous_synthesis: Some(Synthesis {
                uuid: "prev".into(),
                ..Default::default()
            }),
            in_flight_synthesis: Some(Synthesis {
                uuid: "next".into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert!(comp.references_synthesis("cur"));
        assert!(comp.references_synthesis("prev"));
        assert!(comp.references_synthesis("next"));
        assert!(!comp.references_synthesis("other"));
    }

    #[test]
    fn simplified_prefers_failure() {
        let mut comp = composition_with_revisions(vec![]);
        comp.status = Some(CompositionStatus {
            current_synthesis: Some(Synthesis {
                uuid: "cur".into(),
                results: vec![ResultEntry {
                    message: "boom".into(),
                    severity: ResultSeverity::Error,
                }],
                ..Default::default()
            }),
            ..Default::default()
        });
        let simplified = comp.simplified();
        assert_eq!(simplified.status, "Failed");
        assert_eq!(simplified.error.as_deref(), Some("boom"));
    }

    #[test]
    fn simplified_tracks_attempt_progress() {
        let mut comp = composition_with_revisions(vec![]);
        assert_eq!(comp.simplified().status, "Synthesizing");

        let now = Time(chrono::Utc::now());
        comp.status = Some(CompositionStatus {
            current_synthesis: Some(Synthesis {
                uuid: "cur".into(),
                synthesized: Some(now.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        assert_eq!(comp.simplified().status, "Reconciling");

        comp.status.as_mut().unwrap().current_synthesis.as_mut().unwrap().ready =
            Some(now);
        assert_eq!(comp.simplified().status, "Ready");
    }
}
