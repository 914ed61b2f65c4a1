//! Symphony controller: expands variations into Compositions, self-heals
//! duplicates, aggregates child status, and orders deletion so children are
//! gone before the Symphony itself is released.

use crate::controller::{error_policy, Context, ControllerId};
use crate::error::{Error, Result};
use crate::index::NamespacedName;
use crate::telemetry;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ReflectHandle, Store};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

use eno_api::{
    prune_empty_annotations, Composition, CompositionSpec, Symphony, SymphonyStatus,
    SynthesizerRef, Variation, OWNER_SYMPHONY_LABEL, SYMPHONY_DELETING_LABEL, SYMPHONY_FINALIZER,
};

pub const CONTROLLER_ID: ControllerId = "symphony";

fn owner_reference(symphony: &Symphony) -> OwnerReference {
    OwnerReference {
        api_version: format!("{}/{}", eno_api::GROUP, eno_api::VERSION),
        kind: "Symphony".to_string(),
        name: symphony.name_any(),
        uid: symphony.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Desired Composition for one variation.
pub fn desired_composition(symphony: &Symphony, variation: &Variation) -> Composition {
    let mut labels = variation.labels.clone();
    labels.insert(
        OWNER_SYMPHONY_LABEL.to_string(),
        symphony.name_any(),
    );
    let annotations = prune_empty_annotations(&variation.annotations);

    Composition {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", variation.synthesizer.name)),
            namespace: symphony.namespace(),
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            owner_references: Some(vec![owner_reference(symphony)]),
            ..ObjectMeta::default()
        },
        spec: CompositionSpec {
            synthesizer: SynthesizerRef {
                name: variation.synthesizer.name.clone(),
            },
            bindings: symphony.bindings_for(variation).to_vec(),
            synthesis_env: variation.synthesis_env.clone(),
        },
        status: None,
    }
}

/// Metadata drift check: every desired label/annotation must be present with
/// the desired value. Extraneous keys set by others are left alone.
fn metadata_outdated(existing: &Composition, desired: &Composition) -> bool {
    let has_all = |want: &Option<BTreeMap<String, String>>,
                   have: &Option<BTreeMap<String, String>>| {
        want.iter()
            .flatten()
            .all(|(k, v)| have.as_ref().and_then(|m| m.get(k)) == Some(v))
    };
    !has_all(&desired.metadata.labels, &existing.metadata.labels)
        || !has_all(&desired.metadata.annotations, &existing.metadata.annotations)
}

fn spec_outdated(existing: &Composition, desired: &Composition) -> bool {
    existing.spec.bindings != desired.spec.bindings
        || existing.spec.synthesis_env != desired.spec.synthesis_env
}

/// Aggregate child status across the non-optional variations: the latest
/// time per milestone, or nil when any child has not reached it under its
/// current generation.
pub fn aggregate_status(children: &[&Composition]) -> (Option<Time>, Option<Time>, Option<Time>) {
    let mut synthesized: Option<Time> = None;
    let mut reconciled: Option<Time> = None;
    let mut ready: Option<Time> = None;
    let mut all_synthesized = true;
    let mut all_reconciled = true;
    let mut all_ready = true;

    for child in children {
        let current = child.current_synthesis().filter(|s| {
            s.observed_composition_generation == child.metadata.generation.unwrap_or_default()
        });
        let take_max = |slot: &mut Option<Time>, t: &Option<Time>| {
            if let Some(t) = t {
                if slot.as_ref().map_or(true, |cur| t.0 > cur.0) {
                    *slot = Some(t.clone());
                }
            }
        };
        match current {
            Some(current) => {
                take_max(&mut synthesized, &current.synthesized);
                take_max(&mut reconciled, &current.reconciled);
                take_max(&mut ready, &current.ready);
                all_synthesized &= current.synthesized.is_some();
                all_reconciled &= current.reconciled.is_some();
                all_ready &= current.ready.is_some();
            }
            None => {
                all_synthesized = false;
                all_reconciled = false;
                all_ready = false;
            }
        }
    }

    (
        all_synthesized.then_some(synthesized).flatten(),
        all_reconciled.then_some(reconciled).flatten(),
        all_ready.then_some(ready).flatten(),
    )
}

fn children_of(ctx: &Context, symphony: &Symphony) -> Vec<Arc<Composition>> {
    let id = NamespacedName::new(
        symphony.namespace().unwrap_or_default(),
        symphony.name_any(),
    );
    ctx.indexes
        .compositions_for_symphony(&id)
        .into_iter()
        .filter_map(|child| {
            ctx.stores.compositions.get(
                &kube::runtime::reflector::ObjectRef::new(&child.name).within(&child.namespace),
            )
        })
        .collect()
}

async fn ensure_finalizer(symphony: &Symphony, api: &Api<Symphony>) -> Result<()> {
    if symphony.finalizers().iter().any(|f| f == SYMPHONY_FINALIZER) {
        return Ok(());
    }
    let mut finalizers = symphony.finalizers().to_vec();
    finalizers.push(SYMPHONY_FINALIZER.to_string());
    let body = json!({
        "metadata": {
            "resourceVersion": symphony.resource_version(),
            "finalizers": finalizers,
        },
    });
    api.patch(&symphony.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    Ok(())
}

async fn release_finalizer(symphony: &Symphony, api: &Api<Symphony>) -> Result<()> {
    let finalizers: Vec<String> = symphony
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != SYMPHONY_FINALIZER)
        .cloned()
        .collect();
    let body = json!({
        "metadata": {
            "resourceVersion": symphony.resource_version(),
            "finalizers": finalizers,
        },
    });
    api.patch(&symphony.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    Ok(())
}

/// Stamp the diagnostic label, then delete.
async fn delete_child(child: &Composition, api: &Api<Composition>) -> Result<()> {
    let body = json!({
        "metadata": { "labels": { SYMPHONY_DELETING_LABEL: "true" } },
    });
    api.patch(&child.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    api.delete(&child.name_any(), &Default::default()).await?;
    info!(msg = "deleted symphony child composition", name = child.name_any());
    Ok(())
}

/// Delete children whose variation is gone or whose symphony is deleting,
/// and newer duplicates. Runs before the forward pass so deletions settle
/// before anything new is created.
async fn reverse_reconcile(
    symphony: &Symphony,
    children: &[Arc<Composition>],
    api: &Api<Composition>,
) -> Result<bool> {
    let deleting = symphony.metadata.deletion_timestamp.is_some();
    let mut acted = false;

    // oldest child per synthesizer wins; the rest are duplicates
    let mut oldest: BTreeMap<&str, &Composition> = BTreeMap::new();
    for child in children {
        let synth = child.synthesizer_name();
        let slot = oldest.entry(synth).or_insert(child.as_ref());
        if child.creation_timestamp() < slot.creation_timestamp() {
            *slot = child.as_ref();
        }
    }

    for child in children {
        if child.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let synth = child.synthesizer_name();
        let obsolete = deleting || symphony.variation_for_synthesizer(synth).is_none();
        let duplicate = oldest.get(synth).map(|c| c.name_any()) != Some(child.name_any());
        if obsolete {
            delete_child(child, api).await?;
            acted = true;
        } else if duplicate {
            debug!(
                msg = "deleting duplicate composition",
                synthesizer = synth,
                name = child.name_any()
            );
            delete_child(child, api).await?;
            acted = true;
        }
    }
    Ok(acted)
}

async fn forward_reconcile(
    symphony: &Symphony,
    children: &[Arc<Composition>],
    api: &Api<Composition>,
) -> Result<()> {
    for variation in &symphony.spec.variations {
        let desired = desired_composition(symphony, variation);
        let existing = children
            .iter()
            .filter(|c| c.synthesizer_name() == variation.synthesizer.name)
            .min_by_key(|c| c.creation_timestamp());

        let Some(existing) = existing else {
            // The cache might lag a creation from a previous pass; only a
            // live read proves the child is really absent.
            let selector = format!("{}={}", OWNER_SYMPHONY_LABEL, symphony.name_any());
            let live = api
                .list(&ListParams::default().labels(&selector))
                .await?
                .items
                .into_iter()
                .any(|c| c.synthesizer_name() == variation.synthesizer.name);
            if live {
                debug!(
                    msg = "composition exists on server but not in cache, skipping create",
                    synthesizer = variation.synthesizer.name
                );
                continue;
            }
            api.create(&PostParams::default(), &desired).await?;
            info!(
                msg = "created symphony child composition",
                symphony = symphony.name_any(),
                synthesizer = variation.synthesizer.name
            );
            continue;
        };

        if spec_outdated(existing, &desired) {
            let body = json!({
                "metadata": { "resourceVersion": existing.resource_version() },
                "spec": {
                    "bindings": desired.spec.bindings,
                    "synthesisEnv": desired.spec.synthesis_env,
                },
            });
            api.patch(&existing.name_any(), &PatchParams::default(), &Patch::Merge(&body))
                .await?;
        } else if metadata_outdated(existing, &desired) {
            let body = json!({
                "metadata": {
                    "resourceVersion": existing.resource_version(),
                    "labels": desired.metadata.labels,
                    "annotations": desired.metadata.annotations,
                },
            });
            api.patch(&existing.name_any(), &PatchParams::default(), &Patch::Merge(&body))
                .await?;
        }
    }
    Ok(())
}

async fn update_status(
    symphony: &Symphony,
    children: &[Arc<Composition>],
    ctx: &Context,
) -> Result<()> {
    let namespace = symphony
        .namespace()
        .ok_or(Error::InvalidResource("symphony has no namespace".into()))?;

    let tracked: Vec<&Composition> = symphony
        .spec
        .variations
        .iter()
        .filter(|v| !v.optional)
        .filter_map(|v| {
            children
                .iter()
                .find(|c| c.synthesizer_name() == v.synthesizer.name)
                .map(Arc::as_ref)
        })
        .collect();
    let non_optional = symphony.spec.variations.iter().filter(|v| !v.optional).count();
    let (synthesized, reconciled, ready) = if tracked.len() == non_optional {
        aggregate_status(&tracked)
    } else {
        (None, None, None)
    };

    let status = SymphonyStatus {
        observed_generation: symphony.metadata.generation.unwrap_or_default(),
        synthesized,
        reconciled,
        ready,
        synthesizers: children
            .iter()
            .map(|c| c.synthesizer_name().to_string())
            .collect(),
    };
    // already converged: repeated reconciles must not keep writing
    if serde_json::to_value(&status)? == serde_json::to_value(&symphony.status)? {
        return Ok(());
    }
    let body = json!({
        "metadata": { "resourceVersion": symphony.resource_version() },
        "status": status,
    });
    let api: Api<Symphony> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&symphony.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    Ok(())
}

#[instrument(skip(ctx, symphony), fields(trace_id))]
async fn reconcile(symphony: Arc<Symphony>, ctx: Arc<Context>) -> Result<Action, Error> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(CONTROLLER_ID, &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !ctx.caches_synced() {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let namespace = symphony
        .namespace()
        .ok_or(Error::InvalidResource("symphony has no namespace".into()))?;
    let symphony_api: Api<Symphony> = Api::namespaced(ctx.client.clone(), &namespace);
    let composition_api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);

    let children = children_of(&ctx, &symphony);
    let deleting = symphony.metadata.deletion_timestamp.is_some();

    if !deleting {
        ensure_finalizer(&symphony, &symphony_api).await?;
    }

    let deleted_any = reverse_reconcile(&symphony, &children, &composition_api).await?;

    if deleting {
        if children.is_empty() {
            release_finalizer(&symphony, &symphony_api).await?;
            return Ok(Action::await_change());
        }
        return Ok(Action::requeue(Duration::from_secs(5)));
    }
    if deleted_any {
        // let the deletions settle before creating replacements
        return Ok(Action::requeue(Duration::from_secs(2)));
    }

    forward_reconcile(&symphony, &children, &composition_api).await?;
    update_status(&symphony, &children, &ctx).await?;
    Ok(Action::requeue(Duration::from_secs(60)))
}

/// Initialize the symphony controller off the shared symphony stream,
/// triggered by child composition events through the owner reference.
pub async fn run(
    ctx: Arc<Context>,
    trigger: ReflectHandle<Symphony>,
    reader: Store<Symphony>,
    composition_trigger: ReflectHandle<Composition>,
    reload_rx: mpsc::Receiver<()>,
) {
    info!(msg = "starting symphony controller");
    let controller = Controller::for_shared_stream(trigger, reader)
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .owns_shared_stream(composition_trigger)
        .reconcile_all_on(reload_rx.map(|_| ()))
        .shutdown_on_signal()
        .run(reconcile, error_policy(CONTROLLER_ID), ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.metrics.reconcile.ready_set(CONTROLLER_ID, 1);
    controller.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_api::{CompositionStatus, Synthesis, SymphonySpec, VariationSynthesizer};

    fn symphony(variations: Vec<&str>) -> Symphony {
        let mut sym = Symphony::new(
            "sym",
            SymphonySpec {
                variations: variations
                    .into_iter()
                    .map(|name| Variation {
                        synthesizer: VariationSynthesizer { name: name.into() },
                        ..Default::default()
                    })
                    .collect(),
                bindings: vec![],
            },
        );
        sym.metadata.namespace = Some("default".into());
        sym.metadata.uid = Some("sym-uid".into());
        sym
    }

    fn child(synthesizer: &str, generation: i64, milestones: (bool, bool, bool)) -> Composition {
        let now = Time(Utc::now());
        let mut comp = Composition::new(
            synthesizer,
            CompositionSpec {
                synthesizer: SynthesizerRef {
                    name: synthesizer.into(),
                },
                ..Default::default()
            },
        );
        comp.metadata.generation = Some(generation);
        comp.status = Some(CompositionStatus {
            current_synthesis: Some(Synthesis {
                uuid: "u".into(),
                observed_composition_generation: generation,
                synthesized: milestones.0.then(|| now.clone()),
                reconciled: milestones.1.then(|| now.clone()),
                ready: milestones.2.then(|| now.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        comp
    }

    #[test]
    fn desired_composition_prunes_empty_annotations() {
        let mut sym = symphony(vec!["a"]);
        let variation = &mut sym.spec.variations[0];
        variation
            .annotations
            .insert("keep".into(), "yes".into());
        variation.annotations.insert("drop".into(), "".into());

        let desired = desired_composition(&sym, &sym.spec.variations[0]);
        let annotations = desired.metadata.annotations.unwrap();
        assert_eq!(annotations.get("keep").map(String::as_str), Some("yes"));
        assert!(!annotations.contains_key("drop"));
        assert_eq!(
            desired.metadata.generate_name.as_deref(),
            Some("a-")
        );
        assert_eq!(
            desired.metadata.labels.unwrap().get(OWNER_SYMPHONY_LABEL),
            Some(&"sym".to_string())
        );
    }

    #[test]
    fn aggregate_requires_every_child() {
        let a = child("a", 1, (true, true, true));
        let b = child("b", 1, (true, false, false));
        let (synthesized, reconciled, ready) = aggregate_status(&[&a, &b]);
        assert!(synthesized.is_some());
        assert!(reconciled.is_none());
        assert!(ready.is_none());
    }

    #[test]
    fn aggregate_ignores_stale_generation() {
        let mut a = child("a", 1, (true, true, true));
        // spec moved on; the old attempt no longer counts
        a.metadata.generation = Some(2);
        let (synthesized, _, _) = aggregate_status(&[&a]);
        assert!(synthesized.is_none());
    }

    #[test]
    fn aggregate_takes_latest_time() {
        let early = Time(Utc::now() - chrono::Duration::seconds(120));
        let mut a = child("a", 1, (true, true, true));
        a.status
            .as_mut()
            .unwrap()
            .current_synthesis
            .as_mut()
            .unwrap()
            .ready = Some(early.clone());
        let b = child("b", 1, (true, true, true));
        let late = b
            .current_synthesis()
            .unwrap()
            .ready
            .clone()
            .unwrap();

        let (_, _, ready) = aggregate_status(&[&a, &b]);
        assert_eq!(ready.unwrap().0, late.0);
    }

    #[test]
    fn metadata_drift_is_detected() {
        let sym = symphony(vec!["a"]);
        let desired = desired_composition(&sym, &sym.spec.variations[0]);
        let mut existing = desired.clone();
        assert!(!metadata_outdated(&existing, &desired));

        existing.metadata.labels = Some(BTreeMap::new());
        assert!(metadata_outdated(&existing, &desired));
    }
}
