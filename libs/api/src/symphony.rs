use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::composition::{Binding, EnvVar};

/// A Symphony fans out to one Composition per variation and aggregates their
/// status. Variations share the symphony-level bindings unless they override
/// them.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Symphony",
    namespaced,
    status = "SymphonyStatus",
    shortname = "sym"
)]
#[serde(rename_all = "camelCase")]
pub struct SymphonySpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variations: Vec<Variation>,

    /// Bindings inherited by every variation that does not set its own.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub synthesizer: VariationSynthesizer,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Annotations for the generated Composition. A key with value `""` is
    /// pruned before writing, so an annotation can be moved between
    /// variations without ever appearing on two at once.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Overrides the symphony-level bindings when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings: Option<Vec<Binding>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synthesis_env: Vec<EnvVar>,

    /// Optional variations do not hold back the aggregated status.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VariationSynthesizer {
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SymphonyStatus {
    #[serde(default)]
    pub observed_generation: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synthesized: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<Time>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<Time>,

    /// Synthesizer names currently expanded into Compositions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synthesizers: Vec<String>,
}

impl Symphony {
    pub fn variation_for_synthesizer(&self, name: &str) -> Option<&Variation> {
        self.spec
            .variations
            .iter()
            .find(|v| v.synthesizer.name == name)
    }

    /// Effective bindings for a variation: its own when set, else the
    /// symphony-level ones.
    pub fn bindings_for<'a>(&'a self, variation: &'a Variation) -> &'a [Binding] {
        variation
            .bindings
            .as_deref()
            .unwrap_or(self.spec.bindings.as_slice())
    }
}

/// Drop annotation keys whose value is empty. Applied to variation
/// annotations before they are written to the generated Composition.
pub fn prune_empty_annotations(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    annotations
        .iter()
        .filter(|(_, v)| !v.is_empty())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
