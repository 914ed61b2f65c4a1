//! KRM ResourceList wire format: the executor's contract with the user
//! synthesizer. Inputs go to stdin as a ResourceList whose items carry the
//! binding key annotation; stdout must be a ResourceList of desired
//! resources plus optional results.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use eno_api::{Manifest, ResultEntry, ResultSeverity};

pub const API_VERSION: &str = "config.kubernetes.io/v1";
pub const KIND: &str = "ResourceList";

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ResourceList {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub items: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<KrmResult>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct KrmResult {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
}

impl ResourceList {
    pub fn new(items: Vec<Value>) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            items,
            results: vec![],
        }
    }

    /// Results translated to the attempt's result entries. Unknown
    /// severities map to info rather than failing the attempt.
    pub fn result_entries(&self) -> Vec<ResultEntry> {
        self.results
            .iter()
            .map(|r| ResultEntry {
                message: r.message.clone(),
                severity: match r.severity.as_deref() {
                    Some("error") => ResultSeverity::Error,
                    Some("warning") => ResultSeverity::Warning,
                    _ => ResultSeverity::Info,
                },
            })
            .collect()
    }

    pub fn has_error(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.severity.as_deref() == Some("error"))
    }
}

/// Stamp the binding key onto an input object before handing it to the
/// synthesizer.
pub fn annotate_input(mut obj: Value, key: &str) -> Value {
    if let Some(map) = obj.as_object_mut() {
        let metadata = map
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(metadata) = metadata.as_object_mut() {
            let annotations = metadata
                .entry("annotations")
                .or_insert_with(|| Value::Object(Default::default()));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(
                    eno_api::INPUT_KEY_ANNOTATION.to_string(),
                    Value::String(key.to_string()),
                );
            }
        }
    }
    obj
}

/// Shard output objects into slices so no single API write exceeds the
/// request size budget. Order is preserved; a single oversized manifest
/// still gets its own slice.
pub fn partition(items: &[Value], max_slice_bytes: usize) -> Vec<Vec<Manifest>> {
    let mut slices: Vec<Vec<Manifest>> = Vec::new();
    let mut current: Vec<Manifest> = Vec::new();
    let mut current_bytes = 0usize;

    for item in items {
        let manifest = item.to_string();
        let size = manifest.len();
        if !current.is_empty() && current_bytes + size > max_slice_bytes {
            slices.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current_bytes += size;
        current.push(Manifest {
            manifest,
            deleted: false,
        });
    }
    if !current.is_empty() {
        slices.push(current);
    }
    slices
}
