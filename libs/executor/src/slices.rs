//! ResourceSlice creation and the final status writes back onto the
//! Composition. Everything here is idempotent: a restarted pod finds its
//! slices by deterministic name and re-applies only what is missing.

use crate::error::{Error, Result};

use std::num::NonZeroU32;

use chrono::Utc;
use governor::{Quota, RateLimiter};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt};
use kube::Client;
use serde_json::json;
use tracing::{debug, info, warn};

use eno_api::{
    Composition, Manifest, ResourceSlice, ResourceSliceSpec, ResultEntry, Synthesis,
    CLEANUP_FINALIZER, SYNTHESIS_UUID_LABEL,
};

/// Keep slice writes comfortably under the API server request ceiling.
pub const MAX_SLICE_BYTES: usize = 1 << 20;

const STATUS_RETRIES: usize = 3;

/// Deterministic, attempt-scoped slice name. Pod restarts regenerate the
/// same names, which is what makes creation idempotent.
pub fn slice_name(composition: &str, uuid: &str, index: usize) -> String {
    let uuid_prefix: String = uuid.chars().take(8).collect();
    let budget = 253 - uuid_prefix.len() - 2 - index.to_string().len();
    let composition: String = composition.chars().take(budget).collect();
    format!("{composition}-{uuid_prefix}-{index}")
}

fn owner_reference(comp: &Composition) -> OwnerReference {
    OwnerReference {
        api_version: format!("{}/{}", eno_api::GROUP, eno_api::VERSION),
        kind: "Composition".to_string(),
        name: comp.name_any(),
        uid: comp.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

fn build_slice(
    comp: &Composition,
    attempt: &Synthesis,
    manifests: Vec<Manifest>,
    index: usize,
) -> ResourceSlice {
    ResourceSlice {
        metadata: ObjectMeta {
            name: Some(slice_name(&comp.name_any(), &attempt.uuid, index)),
            namespace: comp.namespace(),
            labels: Some(
                [
                    (
                        eno_api::MANAGER_LABEL.to_string(),
                        eno_api::MANAGER.to_string(),
                    ),
                    (SYNTHESIS_UUID_LABEL.to_string(), attempt.uuid.clone()),
                ]
                .into(),
            ),
            finalizers: Some(vec![CLEANUP_FINALIZER.to_string()]),
            owner_references: Some(vec![owner_reference(comp)]),
            ..ObjectMeta::default()
        },
        spec: ResourceSliceSpec {
            synthesis_uuid: attempt.uuid.clone(),
            composition_generation: attempt.observed_composition_generation,
            resources: manifests,
        },
        status: None,
    }
}

/// Create one slice per partition, skipping any that already exist from a
/// previous run of this attempt. Writes are paced by `qps`.
pub async fn write_all(
    client: &Client,
    comp: &Composition,
    attempt: &Synthesis,
    partitions: Vec<Vec<Manifest>>,
    qps: u32,
) -> Result<Vec<String>> {
    let namespace = comp.namespace().ok_or(Error::InvalidComposition(
        "composition has no namespace".into(),
    ))?;
    let api: Api<ResourceSlice> = Api::namespaced(client.clone(), &namespace);

    let selector = format!("{SYNTHESIS_UUID_LABEL}={}", attempt.uuid);
    let existing: Vec<String> = api
        .list(&ListParams::default().labels(&selector))
        .await?
        .items
        .iter()
        .map(|s| s.name_any())
        .collect();

    let limiter = RateLimiter::direct(Quota::per_second(
        NonZeroU32::new(qps).unwrap_or(NonZeroU32::MIN),
    ));

    let mut names = Vec::with_capacity(partitions.len());
    for (index, manifests) in partitions.into_iter().enumerate() {
        let slice = build_slice(comp, attempt, manifests, index);
        let name = slice.name_any();
        if existing.contains(&name) {
            debug!(msg = "slice already exists, skipping", name);
            names.push(name);
            continue;
        }
        limiter.until_ready().await;
        match api.create(&PostParams::default(), &slice).await {
            Ok(_) => {
                debug!(msg = "created resource slice", name);
                names.push(name);
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                names.push(name);
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(names)
}

enum AttemptSlot {
    InFlight(Composition),
    AlreadyPromoted,
    Reclaimed,
}

fn locate_attempt(comp: Composition, uuid: &str) -> AttemptSlot {
    if comp.current_synthesis().is_some_and(|s| s.uuid == uuid) {
        return AttemptSlot::AlreadyPromoted;
    }
    if comp.in_flight_synthesis().is_some_and(|s| s.uuid == uuid) {
        return AttemptSlot::InFlight(comp);
    }
    AttemptSlot::Reclaimed
}

/// Append the slice refs and stamp `synthesized`, retrying through write
/// conflicts with the controllers. The slice list only ever grows within an
/// attempt, and `synthesized` is written once.
pub async fn record_synthesized(
    api: &Api<Composition>,
    name: &str,
    uuid: &str,
    slice_names: Vec<String>,
    results: Vec<ResultEntry>,
) -> Result<()> {
    for _ in 0..STATUS_RETRIES {
        let comp = match locate_attempt(api.get(name).await?, uuid) {
            AttemptSlot::InFlight(comp) => comp,
            AttemptSlot::AlreadyPromoted => return Ok(()),
            AttemptSlot::Reclaimed => {
                warn!(
                    msg = "attempt no longer in flight, skipping status write",
                    uuid
                );
                return Ok(());
            }
        };
        let attempt = comp
            .in_flight_synthesis()
            .expect("locate_attempt returned in-flight");

        let mut merged = attempt.resource_slices.clone();
        for slice in &slice_names {
            if !merged.contains(slice) {
                merged.push(slice.clone());
            }
        }
        let synthesized = attempt
            .synthesized
            .clone()
            .unwrap_or_else(|| Time(Utc::now()));

        let body = json!({
            "metadata": { "resourceVersion": comp.resource_version() },
            "status": {
                "inFlightSynthesis": {
                    "resourceSlices": merged,
                    "synthesized": synthesized,
                    "results": results,
                },
            },
        });
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
        {
            Ok(_) => {
                info!(msg = "recorded synthesis", uuid, slices = slice_names.len());
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::StatusConflict)
}

/// Record terminal results on the attempt before exiting non-zero. Best
/// effort retried like the success path; losing the attempt slot means the
/// failure no longer matters.
pub async fn record_results(
    api: &Api<Composition>,
    name: &str,
    uuid: &str,
    results: Vec<ResultEntry>,
) -> Result<()> {
    for _ in 0..STATUS_RETRIES {
        let comp = match locate_attempt(api.get(name).await?, uuid) {
            AttemptSlot::InFlight(comp) => comp,
            AttemptSlot::AlreadyPromoted | AttemptSlot::Reclaimed => return Ok(()),
        };
        let body = json!({
            "metadata": { "resourceVersion": comp.resource_version() },
            "status": {
                "inFlightSynthesis": { "results": results },
            },
        });
        match api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&body))
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::StatusConflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_api::{CompositionSpec, CompositionStatus, SynthesizerRef};

    fn composition_with(uuid_current: Option<&str>, uuid_in_flight: Option<&str>) -> Composition {
        let mut comp = Composition::new(
            "comp",
            CompositionSpec {
                synthesizer: SynthesizerRef { name: "syn".into() },
                ..Default::default()
            },
        );
        comp.metadata.namespace = Some("default".into());
        comp.status = Some(CompositionStatus {
            current_synthesis: uuid_current.map(|u| Synthesis {
                uuid: u.into(),
                ..Default::default()
            }),
            in_flight_synthesis: uuid_in_flight.map(|u| Synthesis {
                uuid: u.into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        comp
    }

    #[test]
    fn slice_names_are_deterministic_and_bounded() {
        let a = slice_name("my-comp", "0f47ac10-58cc-4372-a567-0e02b2c3d479", 0);
        let b = slice_name("my-comp", "0f47ac10-58cc-4372-a567-0e02b2c3d479", 0);
        assert_eq!(a, b);
        assert_eq!(a, "my-comp-0f47ac10-0");

        let long = "x".repeat(500);
        let name = slice_name(&long, "0f47ac10-58cc-4372-a567-0e02b2c3d479", 12);
        assert!(name.len() <= 253);
        assert!(name.ends_with("-0f47ac10-12"));
    }

    #[test]
    fn locate_attempt_distinguishes_slots() {
        assert!(matches!(
            locate_attempt(composition_with(Some("u"), None), "u"),
            AttemptSlot::AlreadyPromoted
        ));
        assert!(matches!(
            locate_attempt(composition_with(None, Some("u")), "u"),
            AttemptSlot::InFlight(_)
        ));
        assert!(matches!(
            locate_attempt(composition_with(None, Some("other")), "u"),
            AttemptSlot::Reclaimed
        ));
        assert!(matches!(
            locate_attempt(composition_with(None, None), "u"),
            AttemptSlot::Reclaimed
        ));
    }

    #[test]
    fn built_slices_carry_owner_finalizer_and_labels() {
        let comp = {
            let mut c = composition_with(None, Some("u-1"));
            c.metadata.uid = Some("uid-1".into());
            c
        };
        let attempt = Synthesis {
            uuid: "u-1".into(),
            observed_composition_generation: 7,
            ..Default::default()
        };
        let slice = build_slice(
            &comp,
            &attempt,
            vec![Manifest {
                manifest: "{}".into(),
                deleted: false,
            }],
            0,
        );
        assert_eq!(slice.spec.synthesis_uuid, "u-1");
        assert_eq!(slice.spec.composition_generation, 7);
        assert_eq!(
            slice.metadata.finalizers.as_ref().unwrap()[0],
            CLEANUP_FINALIZER
        );
        let owner = &slice.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "Composition");
        assert_eq!(owner.uid, "uid-1");
    }
}
