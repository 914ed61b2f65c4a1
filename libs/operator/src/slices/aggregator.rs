//! Folds per-resource status from all slices of the current attempt back
//! onto the Composition, and recovers from slices that went missing by
//! forcing a new synthesis.

use crate::controller::{error_policy, Context, ControllerId};
use crate::error::{Error, Result};
use crate::telemetry;

use std::sync::Arc;

use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, ReflectHandle, Store};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, warn, Span};

use eno_api::{Composition, ResourceSlice};
use eno_k8s_util::api::get_opt;

pub const CONTROLLER_ID: ControllerId = "slice-aggregator";

/// Informer lag grace before a missing slice is treated as lost.
const MISSING_SLICE_GRACE: Duration = Duration::from_secs(5);

/// Result of folding per-resource state across all referenced slices.
#[derive(Debug, PartialEq)]
pub struct Folded {
    pub reconciled: bool,
    pub ready: Option<Time>,
}

/// Fold the downstream-reported state of every resource in every slice.
/// Returns `None` while any slice's status has not caught up with its spec.
pub fn fold_status(
    slices: &[Arc<ResourceSlice>],
    deleting: bool,
    orphan: bool,
) -> Option<Folded> {
    if slices.is_empty() {
        // An empty synthesis has nothing to reconcile; it is trivially done.
        return Some(Folded {
            reconciled: true,
            ready: Some(Time(Utc::now())),
        });
    }
    if !slices.iter().all(|s| s.status_populated()) {
        return None;
    }

    let mut reconciled = true;
    let mut ready = true;
    let mut ready_time: Option<Time> = None;
    for slice in slices {
        for state in slice.resource_states() {
            // A resource pending deletion counts as reconciled when the
            // composition is going away or downstream orphans it.
            let resource_reconciled =
                state.reconciled || (state.deleted && (deleting || orphan));
            reconciled = reconciled && resource_reconciled;
            match &state.ready {
                Some(t) => {
                    if ready_time.as_ref().map_or(true, |cur| t.0 > cur.0) {
                        ready_time = Some(t.clone());
                    }
                }
                None => ready = false,
            }
        }
    }
    Some(Folded {
        reconciled,
        ready: (reconciled && ready).then(|| ready_time.unwrap_or(Time(Utc::now()))),
    })
}

enum SliceLookup {
    Found(Vec<Arc<ResourceSlice>>),
    /// At least one slice is not in cache; holds its name.
    Missing(String),
}

fn lookup_slices(ctx: &Context, comp: &Composition, names: &[String]) -> SliceLookup {
    let namespace = comp.namespace().unwrap_or_default();
    let mut found = Vec::with_capacity(names.len());
    for name in names {
        match ctx
            .stores
            .slices
            .get(&ObjectRef::new(name).within(&namespace))
        {
            Some(slice) => found.push(slice),
            None => return SliceLookup::Missing(name.clone()),
        }
    }
    SliceLookup::Found(found)
}

/// A referenced slice is gone: force a new synthesis unless the composition
/// is deleting, side effects are suppressed, or recovery is already pending.
async fn recover_missing_slice(comp: &Composition, slice_name: &str, ctx: &Context) -> Result<()> {
    if comp.metadata.deletion_timestamp.is_some()
        || comp.ignore_side_effects()
        || comp.force_resynthesis()
    {
        return Ok(());
    }

    let namespace = comp
        .namespace()
        .ok_or(Error::InvalidResource("composition has no namespace".into()))?;

    // The cache may simply be behind; only a direct read proves the slice
    // is really gone.
    let slice_api: Api<ResourceSlice> = Api::namespaced(ctx.client.clone(), &namespace);
    if get_opt(&slice_api, slice_name).await?.is_some() {
        return Ok(());
    }

    warn!(
        msg = "resource slice missing, forcing resynthesis",
        namespace,
        name = comp.name_any(),
        slice = slice_name
    );
    let body = json!({
        "metadata": { "resourceVersion": comp.resource_version() },
        "status": { "forceResynthesis": true },
    });
    let api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&comp.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    Ok(())
}

#[instrument(skip(ctx, comp), fields(trace_id))]
async fn reconcile(comp: Arc<Composition>, ctx: Arc<Context>) -> Result<Action, Error> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(CONTROLLER_ID, &trace_id);

    if !ctx.caches_synced() {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let Some(current) = comp.current_synthesis() else {
        return Ok(Action::await_change());
    };
    // Failed attempts produced no output to aggregate.
    if current.failed() {
        return Ok(Action::await_change());
    }
    if current.reconciled.is_some() && current.ready.is_some() {
        return Ok(Action::await_change());
    }

    let slices = match lookup_slices(&ctx, &comp, &current.resource_slices) {
        SliceLookup::Found(slices) => slices,
        SliceLookup::Missing(name) => {
            let age = current
                .synthesized
                .as_ref()
                .map(|t| (Utc::now() - t.0).to_std().unwrap_or_default())
                .unwrap_or_default();
            if age < MISSING_SLICE_GRACE {
                return Ok(Action::requeue(MISSING_SLICE_GRACE));
            }
            recover_missing_slice(&comp, &name, &ctx).await?;
            return Ok(Action::requeue(Duration::from_secs(10)));
        }
    };

    let Some(folded) = fold_status(
        &slices,
        comp.metadata.deletion_timestamp.is_some(),
        comp.deletion_strategy_is_orphan(),
    ) else {
        // downstream has not caught up yet
        debug!(msg = "slice status not yet populated", name = comp.name_any());
        return Ok(Action::requeue(Duration::from_secs(5)));
    };

    let mut changes = serde_json::Map::new();
    let mut previous_released = false;
    if current.reconciled.is_none() && folded.reconciled {
        let now = Time(Utc::now());
        if let Some(synthesized) = &current.synthesized {
            info!(
                msg = "composition reconciled",
                name = comp.name_any(),
                latency_seconds = (now.0 - synthesized.0).num_seconds()
            );
        }
        changes.insert("reconciled".into(), serde_json::to_value(&now)?);
        // the previous attempt was only retained until this one reconciled;
        // releasing it lets the cleaner collect its slices
        previous_released = comp.previous_synthesis().is_some();
    }
    if current.ready.is_none() {
        if let Some(ready) = &folded.ready {
            if let Some(synthesized) = &current.synthesized {
                info!(
                    msg = "composition ready",
                    name = comp.name_any(),
                    latency_seconds = (ready.0 - synthesized.0).num_seconds()
                );
            }
            changes.insert("ready".into(), serde_json::to_value(ready)?);
        }
    }
    if changes.is_empty() {
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let ready_now = changes.contains_key("ready") || current.ready.is_some();
    let namespace = comp
        .namespace()
        .ok_or(Error::InvalidResource("composition has no namespace".into()))?;
    let mut status = json!({
        "currentSynthesis": changes,
        "simplified": { "status": if ready_now { "Ready" } else { "Reconciling" } },
    });
    if previous_released {
        status["previousSynthesis"] = serde_json::Value::Null;
    }
    let body = json!({
        "metadata": { "resourceVersion": comp.resource_version() },
        "status": status,
    });
    let api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&comp.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    Ok(Action::requeue(Duration::from_secs(30)))
}

/// Initialize the aggregator off the shared composition stream; slice
/// events re-trigger the owning composition through the owner reference.
pub async fn run(
    ctx: Arc<Context>,
    trigger: ReflectHandle<Composition>,
    reader: Store<Composition>,
    slice_trigger: ReflectHandle<ResourceSlice>,
    reload_rx: mpsc::Receiver<()>,
) {
    info!(msg = "starting slice aggregator controller");
    let controller = Controller::for_shared_stream(trigger, reader)
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .owns_shared_stream(slice_trigger)
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
    use eno_api::{Manifest, ResourceSliceSpec, ResourceSliceStatus, ResourceState};

    fn slice(states: Vec<ResourceState>) -> Arc<ResourceSlice> {
        let manifests = states
            .iter()
            .map(|_| Manifest {
                manifest: "{}".into(),
                deleted: false,
            })
            .collect();
        let mut s = ResourceSlice::new(
            "s",
            ResourceSliceSpec {
                synthesis_uuid: "u".into(),
                composition_generation: 1,
                resources: manifests,
            },
        );
        s.status = Some(ResourceSliceStatus { resources: states });
        Arc::new(s)
    }

    fn state(reconciled: bool, ready: Option<Time>, deleted: bool) -> ResourceState {
        ResourceState {
            reconciled,
            ready,
            deleted,
        }
    }

    #[test]
    fn empty_attempt_is_trivially_ready() {
        let folded = fold_status(&[], false, false).unwrap();
        assert!(folded.reconciled);
        assert!(folded.ready.is_some());
    }

    #[test]
    fn unpopulated_status_blocks_aggregation() {
        let mut s = ResourceSlice::new(
            "s",
            ResourceSliceSpec {
                synthesis_uuid: "u".into(),
                composition_generation: 1,
                resources: vec![Manifest {
                    manifest: "{}".into(),
                    deleted: false,
                }],
            },
        );
        s.status = None;
        assert_eq!(fold_status(&[Arc::new(s)], false, false), None);
    }

    #[test]
    fn reconciled_requires_every_resource() {
        let now = Time(Utc::now());
        let slices = vec![
            slice(vec![state(true, Some(now.clone()), false)]),
            slice(vec![state(false, None, false)]),
        ];
        let folded = fold_status(&slices, false, false).unwrap();
        assert!(!folded.reconciled);
        assert!(folded.ready.is_none());
    }

    #[test]
    fn deleted_resources_count_when_orphaning() {
        let slices = vec![slice(vec![state(false, None, true)])];

        let folded = fold_status(&slices, false, false).unwrap();
        assert!(!folded.reconciled);

        let folded = fold_status(&slices, true, false).unwrap();
        assert!(folded.reconciled);

        let folded = fold_status(&slices, false, true).unwrap();
        assert!(folded.reconciled);
    }

    #[test]
    fn ready_takes_latest_time() {
        let early = Time(Utc::now() - chrono::Duration::seconds(60));
        let late = Time(Utc::now());
        let slices = vec![
            slice(vec![state(true, Some(early), false)]),
            slice(vec![state(true, Some(late.clone()), false)]),
        ];
        let folded = fold_status(&slices, false, false).unwrap();
        assert!(folded.reconciled);
        assert_eq!(folded.ready.unwrap().0, late.0);
    }
}
