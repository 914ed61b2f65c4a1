//! Executor pod construction.
//!
//! The pod runs the synthesizer's image; the Eno executor binary is copied
//! in from the configured executor image by an init container and wraps the
//! user command, reading inputs from the API and writing ResourceSlices
//! back.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, NodeAffinity, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm, Pod, PodSpec, Toleration, Volume, VolumeMount,
};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use eno_api::{Composition, Synthesis, Synthesizer};

use crate::controller::{KeyValuePair, OperatorConfig};

const EXECUTOR_VOLUME: &str = "eno-bin";
const EXECUTOR_MOUNT_PATH: &str = "/eno/bin";
const EXECUTOR_BINARY: &str = "eno-executor";

pub fn pod_name(attempt: &Synthesis) -> String {
    format!("synth-{}", attempt.uuid)
}

fn tolerations(pairs: &[KeyValuePair]) -> Option<Vec<Toleration>> {
    if pairs.is_empty() {
        return None;
    }
    Some(
        pairs
            .iter()
            .map(|kv| Toleration {
                key: Some(kv.key.clone()),
                operator: Some(match kv.value {
                    Some(_) => "Equal".to_string(),
                    None => "Exists".to_string(),
                }),
                value: kv.value.clone(),
                ..Toleration::default()
            })
            .collect(),
    )
}

fn node_affinity(pairs: &[KeyValuePair]) -> Option<NodeAffinity> {
    if pairs.is_empty() {
        return None;
    }
    let match_expressions = pairs
        .iter()
        .map(|kv| NodeSelectorRequirement {
            key: kv.key.clone(),
            operator: match kv.value {
                Some(_) => "In".to_string(),
                None => "Exists".to_string(),
            },
            values: kv.value.clone().map(|v| vec![v]),
        })
        .collect();
    Some(NodeAffinity {
        required_during_scheduling_ignored_during_execution: Some(NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: Some(match_expressions),
                ..NodeSelectorTerm::default()
            }],
        }),
        ..NodeAffinity::default()
    })
}

fn environment(comp: &Composition, attempt: &Synthesis) -> Vec<EnvVar> {
    let mut env = vec![
        EnvVar {
            name: eno_api::ENV_COMPOSITION_NAME.to_string(),
            value: Some(comp.name_any()),
            ..EnvVar::default()
        },
        EnvVar {
            name: eno_api::ENV_COMPOSITION_NAMESPACE.to_string(),
            value: comp.namespace(),
            ..EnvVar::default()
        },
        EnvVar {
            name: eno_api::ENV_COMPOSITION_UID.to_string(),
            value: comp.uid(),
            ..EnvVar::default()
        },
        EnvVar {
            name: eno_api::ENV_SYNTHESIS_UUID.to_string(),
            value: Some(attempt.uuid.clone()),
            ..EnvVar::default()
        },
    ];
    // user environment, with the reserved prefix protected
    env.extend(
        comp.spec
            .synthesis_env
            .iter()
            .filter(|e| !e.name.starts_with("ENO_"))
            .map(|e| EnvVar {
                name: e.name.clone(),
                value: Some(e.value.clone()),
                ..EnvVar::default()
            }),
    );
    env
}

/// Build the executor pod for one attempt.
pub fn build(
    comp: &Composition,
    synth: &Synthesizer,
    attempt: &Synthesis,
    config: &OperatorConfig,
) -> Pod {
    let mut labels: BTreeMap<String, String> = BTreeMap::new();
    labels.insert(eno_api::MANAGER_LABEL.to_string(), eno_api::MANAGER.to_string());
    labels.insert(
        eno_api::COMPOSITION_NAME_LABEL.to_string(),
        comp.name_any(),
    );
    labels.insert(
        eno_api::COMPOSITION_NAMESPACE_LABEL.to_string(),
        comp.namespace().unwrap_or_default(),
    );
    labels.insert(eno_api::SYNTHESIS_UUID_LABEL.to_string(), attempt.uuid.clone());

    let overrides = synth.spec.pod_overrides.clone().unwrap_or_default();
    labels.extend(overrides.labels);
    let annotations = if overrides.annotations.is_empty() {
        None
    } else {
        Some(overrides.annotations)
    };

    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name(attempt)),
            namespace: Some(config.pod_namespace.clone()),
            labels: Some(labels),
            annotations,
            ..ObjectMeta::default()
        },
        spec: Some(PodSpec {
            restart_policy: Some("Never".to_string()),
            service_account_name: overrides.service_account_name,
            tolerations: tolerations(&config.taint_tolerations),
            affinity: node_affinity(&config.node_affinity).map(|na| {
                k8s_openapi::api::core::v1::Affinity {
                    node_affinity: Some(na),
                    ..Default::default()
                }
            }),
            init_containers: Some(vec![Container {
                name: "executor-loader".to_string(),
                image: Some(config.executor_image.clone()),
                command: Some(vec![
                    "cp".to_string(),
                    format!("/usr/local/bin/{EXECUTOR_BINARY}"),
                    format!("{EXECUTOR_MOUNT_PATH}/{EXECUTOR_BINARY}"),
                ]),
                volume_mounts: Some(vec![VolumeMount {
                    name: EXECUTOR_VOLUME.to_string(),
                    mount_path: EXECUTOR_MOUNT_PATH.to_string(),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }]),
            containers: vec![Container {
                name: "synthesizer".to_string(),
                image: Some(synth.spec.image.clone()),
                command: Some(vec![format!("{EXECUTOR_MOUNT_PATH}/{EXECUTOR_BINARY}")]),
                env: Some(environment(comp, attempt)),
                volume_mounts: Some(vec![VolumeMount {
                    name: EXECUTOR_VOLUME.to_string(),
                    mount_path: EXECUTOR_MOUNT_PATH.to_string(),
                    ..VolumeMount::default()
                }]),
                ..Container::default()
            }],
            volumes: Some(vec![Volume {
                name: EXECUTOR_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            }]),
            ..PodSpec::default()
        }),
        ..Pod::default()
    }
}
