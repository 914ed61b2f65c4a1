//! Deletes slices that no attempt references anymore, once downstream has
//! deleted (or orphaned) their resources. Destructive decisions are made
//! twice: from cache, then from a direct read, so informer lag can never
//! delete a slice that is still live.

use crate::controller::{error_policy, Context, ControllerId};
use crate::error::{Error, Result};
use crate::telemetry;

use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, ReflectHandle, Store};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};

use eno_api::{Composition, ResourceSlice, CLEANUP_FINALIZER};
use eno_k8s_util::api::{delete_with_uid, get_opt};

pub const CONTROLLER_ID: ControllerId = "slice-cleaner";

fn owner_composition(slice: &ResourceSlice) -> Option<String> {
    slice
        .owner_references()
        .iter()
        .find(|o| o.kind == "Composition")
        .map(|o| o.name.clone())
}

/// A slice can be deleted iff its owner exists, no attempt references its
/// UUID, and downstream is done with every resource (deleted, or orphaned
/// by the composition's deletion strategy).
pub fn deletable(slice: &ResourceSlice, comp: Option<&Composition>) -> bool {
    let Some(comp) = comp else {
        // owner gone entirely: the control-plane GC owns this deletion
        return false;
    };
    if comp.references_synthesis(&slice.spec.synthesis_uuid) {
        return false;
    }
    comp.deletion_strategy_is_orphan() || slice.all_deleted()
}

/// The cleanup finalizer only serializes deletion with downstream
/// reconciliation; it is released once the slice left `currentSynthesis`
/// or the owner is not deleting.
pub fn finalizer_releasable(slice: &ResourceSlice, comp: Option<&Composition>) -> bool {
    let Some(comp) = comp else {
        return true;
    };
    let referenced_by_current = comp
        .current_synthesis()
        .is_some_and(|s| s.uuid == slice.spec.synthesis_uuid);
    !referenced_by_current || comp.metadata.deletion_timestamp.is_none()
}

async fn release_finalizer(slice: &ResourceSlice, ctx: &Context) -> Result<()> {
    if !slice.finalizers().iter().any(|f| f == CLEANUP_FINALIZER) {
        return Ok(());
    }
    let namespace = slice
        .namespace()
        .ok_or(Error::InvalidResource("slice has no namespace".into()))?;
    let finalizers: Vec<String> = slice
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != CLEANUP_FINALIZER)
        .cloned()
        .collect();
    let body = json!({
        "metadata": {
            "resourceVersion": slice.resource_version(),
            "finalizers": finalizers,
        },
    });
    let api: Api<ResourceSlice> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch(&slice.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    debug!(
        msg = "released cleanup finalizer",
        namespace,
        name = slice.name_any()
    );
    Ok(())
}

fn cached_owner(ctx: &Context, slice: &ResourceSlice) -> Option<Arc<Composition>> {
    let namespace = slice.namespace()?;
    let owner = owner_composition(slice)?;
    ctx.stores
        .compositions
        .get(&ObjectRef::new(&owner).within(&namespace))
}

#[instrument(skip(ctx, slice), fields(trace_id))]
async fn reconcile(slice: Arc<ResourceSlice>, ctx: Arc<Context>) -> Result<Action, Error> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(CONTROLLER_ID, &trace_id);

    if !ctx.caches_synced() {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let comp = cached_owner(&ctx, &slice);

    if slice.metadata.deletion_timestamp.is_some() {
        if finalizer_releasable(&slice, comp.as_deref()) {
            release_finalizer(&slice, &ctx).await?;
            return Ok(Action::await_change());
        }
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    if !deletable(&slice, comp.as_deref()) {
        return Ok(Action::requeue(Duration::from_secs(60)));
    }

    // Confirm against live state before acting on the cached view.
    let namespace = slice
        .namespace()
        .ok_or(Error::InvalidResource("slice has no namespace".into()))?;
    let owner = owner_composition(&slice)
        .ok_or(Error::InvalidResource("slice has no owning composition".into()))?;
    let slice_api: Api<ResourceSlice> = Api::namespaced(ctx.client.clone(), &namespace);
    let comp_api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);

    let Some(fresh_slice) = get_opt(&slice_api, &slice.name_any()).await? else {
        return Ok(Action::await_change());
    };
    let fresh_comp = get_opt(&comp_api, &owner).await?;
    if !deletable(&fresh_slice, fresh_comp.as_ref()) {
        debug!(
            msg = "cache said deletable but live state disagrees",
            namespace,
            name = slice.name_any()
        );
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    if let Some(uid) = fresh_slice.uid() {
        delete_with_uid(&slice_api, &fresh_slice.name_any(), &uid).await?;
        info!(
            msg = "deleted released resource slice",
            namespace,
            name = fresh_slice.name_any(),
            synthesis_uuid = fresh_slice.spec.synthesis_uuid
        );
    }
    Ok(Action::await_change())
}

/// Initialize the cleaner off the shared slice stream; composition events
/// arrive via the reload channel since deletability depends on them.
pub async fn run(
    ctx: Arc<Context>,
    trigger: ReflectHandle<ResourceSlice>,
    reader: Store<ResourceSlice>,
    reload_rx: mpsc::Receiver<()>,
) {
    info!(msg = "starting slice cleaner controller");
    let controller = Controller::for_shared_stream(trigger, reader)
        // debounce to filter out reconcile calls that happen quick succession (only taking the latest)
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
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
    use chrono::Utc;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use eno_api::{
        CompositionSpec, CompositionStatus, Manifest, ResourceSliceSpec, ResourceSliceStatus,
        ResourceState, Synthesis, SynthesizerRef,
    };

    fn slice(uuid: &str, deleted: bool) -> ResourceSlice {
        let mut s = ResourceSlice::new(
            "slice-1",
            ResourceSliceSpec {
                synthesis_uuid: uuid.into(),
                composition_generation: 1,
                resources: vec![Manifest {
                    manifest: "{}".into(),
                    deleted: false,
                }],
            },
        );
        s.metadata.namespace = Some("default".into());
        s.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "eno.azure.io/v1".into(),
            kind: "Composition".into(),
            name: "comp".into(),
            uid: "uid".into(),
            ..Default::default()
        }]);
        s.status = Some(ResourceSliceStatus {
            resources: vec![ResourceState {
                reconciled: true,
                ready: None,
                deleted,
            }],
        });
        s
    }

    fn composition(current_uuid: Option<&str>) -> Composition {
        let mut comp = Composition::new(
            "comp",
            CompositionSpec {
                synthesizer: SynthesizerRef { name: "syn".into() },
                ..Default::default()
            },
        );
        comp.metadata.namespace = Some("default".into());
        comp.status = Some(CompositionStatus {
            current_synthesis: current_uuid.map(|uuid| Synthesis {
                uuid: uuid.into(),
                ..Default::default()
            }),
            ..Default::default()
        });
        comp
    }

    #[test]
    fn referenced_slices_are_kept() {
        let slice = slice("u-1", true);
        let comp = composition(Some("u-1"));
        assert!(!deletable(&slice, Some(&comp)));
    }

    #[test]
    fn released_slice_requires_deleted_resources() {
        let comp = composition(Some("u-2"));

        let undeleted = slice("u-1", false);
        assert!(!deletable(&undeleted, Some(&comp)));

        let deleted = slice("u-1", true);
        assert!(deletable(&deleted, Some(&comp)));
    }

    #[test]
    fn orphan_strategy_skips_deletion_wait() {
        let mut comp = composition(Some("u-2"));
        comp.metadata.annotations = Some(
            [(
                eno_api::DELETION_STRATEGY_ANNOTATION.to_string(),
                "orphan".to_string(),
            )]
            .into(),
        );
        let undeleted = slice("u-1", false);
        assert!(deletable(&undeleted, Some(&comp)));
    }

    #[test]
    fn missing_owner_defers_to_gc() {
        let s = slice("u-1", true);
        assert!(!deletable(&s, None));
        assert!(finalizer_releasable(&s, None));
    }

    #[test]
    fn finalizer_held_while_current_and_deleting() {
        let s = slice("u-1", true);
        let mut comp = composition(Some("u-1"));
        assert!(finalizer_releasable(&s, Some(&comp)));

        comp.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(!finalizer_releasable(&s, Some(&comp)));

        let other = composition(Some("u-2"));
        let mut deleting_other = other.clone();
        deleting_other.metadata.deletion_timestamp = Some(Time(Utc::now()));
        assert!(finalizer_releasable(&s, Some(&deleting_other)));
    }
}
