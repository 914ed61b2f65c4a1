//! One dynamic watcher per referenced kind, plus the revision bookkeeping
//! it drives.

use super::WatcherState;
use crate::controller::Context;
use crate::error::Result;
use crate::index::{BindingTarget, GvkKey, NamespacedName};

use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams, ResourceExt};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::{watcher, WatchStreamExt};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, error, trace};

use eno_api::{Composition, InputRevisions, Ref, Synthesizer};

const DISCOVERY_RETRY: Duration = Duration::from_secs(30);

/// Replace, insert or remove the entry for `key`. Returns `None` when the
/// list is already up to date, so callers can skip the write entirely.
pub fn merge_revisions(
    existing: &[InputRevisions],
    key: &str,
    revision: Option<(&str, Option<i64>)>,
) -> Option<Vec<InputRevisions>> {
    let current = existing.iter().find(|r| r.key == key);
    match revision {
        None => {
            current?;
            Some(existing.iter().filter(|r| r.key != key).cloned().collect())
        }
        Some((resource_version, generation)) => {
            if current.is_some_and(|c| {
                c.resource_version == resource_version && c.synthesizer_generation == generation
            }) {
                return None;
            }
            let mut merged: Vec<InputRevisions> =
                existing.iter().filter(|r| r.key != key).cloned().collect();
            merged.push(InputRevisions {
                key: key.to_string(),
                resource_version: resource_version.to_string(),
                synthesizer_generation: generation,
            });
            merged.sort_by(|a, b| a.key.cmp(&b.key));
            Some(merged)
        }
    }
}

fn ref_matches_gvk(r: &Ref, gvk: &GvkKey) -> bool {
    r.resource.group == gvk.group && r.resource.version == gvk.version && r.resource.kind == gvk.kind
}

/// Does this object satisfy the ref for this composition's binding?
pub fn binding_matches(comp: &Composition, r: &Ref, obj_namespace: &str, obj_name: &str) -> bool {
    match comp.binding_for_key(&r.key) {
        Some(binding) => {
            let bound_namespace = binding
                .resource
                .namespace
                .clone()
                .or_else(|| comp.namespace())
                .unwrap_or_default();
            binding.resource.name == obj_name
                && (obj_namespace.is_empty() || bound_namespace == obj_namespace)
        }
        None => false,
    }
}

/// Compositions affected by a change to `obj` through `r` of `synth`.
fn affected_compositions(
    ctx: &Context,
    synth: &Synthesizer,
    r: &Ref,
    obj_namespace: &str,
    obj_name: &str,
) -> Vec<NamespacedName> {
    let synthesizer = synth.name_any();
    match &r.resource.name {
        // implicit ref: the synthesizer pins the object, every composition
        // using it is affected
        Some(pinned) => {
            if pinned != obj_name {
                return vec![];
            }
            if let Some(ns) = &r.resource.namespace {
                if !obj_namespace.is_empty() && ns != obj_namespace {
                    return vec![];
                }
            }
            ctx.indexes.compositions_for_synthesizer(&synthesizer)
        }
        None if obj_namespace.is_empty() => {
            // cluster-scoped object: the binding index is namespace-keyed,
            // fall back to scanning the synthesizer's compositions
            ctx.indexes.compositions_for_synthesizer(&synthesizer)
        }
        None => ctx.indexes.compositions_for_binding(&BindingTarget {
            synthesizer,
            namespace: obj_namespace.to_string(),
            name: obj_name.to_string(),
        }),
    }
}

/// Write the new revision entry, guarded by resourceVersion. One retry
/// against a live read covers the common conflict with another watcher.
async fn update_revision(
    comp: &Composition,
    r: &Ref,
    revision: Option<(&str, Option<i64>)>,
    ctx: &Context,
) -> Result<()> {
    let Some(namespace) = comp.namespace() else {
        return Ok(());
    };
    let name = comp.name_any();
    let api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut target = comp.clone();
    for attempt in 0..2 {
        let Some(merged) = merge_revisions(target.input_revisions(), &r.key, revision) else {
            return Ok(());
        };

        // all watcher writes share one token bucket
        ctx.write_limiter.until_ready().await;

        let mut status = json!({ "inputRevisions": merged });
        if r.defer && target.pending_resynthesis().is_none() && revision.is_some() {
            status["pendingResynthesis"] = serde_json::to_value(Time(Utc::now()))?;
        }
        let body = json!({
            "metadata": { "resourceVersion": target.resource_version() },
            "status": status,
        });
        match api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
            .await
        {
            Ok(_) => {
                ctx.metrics.inputs.revision_updates.inc();
                debug!(
                    msg = "updated input revision",
                    namespace,
                    name,
                    key = r.key,
                    deferred = r.defer
                );
                return Ok(());
            }
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempt == 0 => {
                match api.get(&name).await {
                    Ok(fresh) => target = fresh,
                    Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Fan one observed object change out to every affected composition.
async fn handle_object(gvk: &GvkKey, obj: &DynamicObject, deleted: bool, ctx: &Context) {
    ctx.metrics.inputs.events.inc();
    let obj_name = obj.name_any();
    let obj_namespace = obj.namespace().unwrap_or_default();
    let resource_version = obj.resource_version().unwrap_or_default();

    for synthesizer in ctx.indexes.synthesizers_for_gvk(gvk) {
        let Some(synth) = ctx
            .stores
            .synthesizers
            .get(&ObjectRef::new(&synthesizer))
        else {
            continue;
        };
        let generation = synth.metadata.generation;

        for r in synth.spec.refs.iter().filter(|r| ref_matches_gvk(r, gvk)) {
            for comp_id in affected_compositions(ctx, &synth, r, &obj_namespace, &obj_name) {
                let Some(comp) = ctx
                    .stores
                    .compositions
                    .get(&ObjectRef::new(&comp_id.name).within(&comp_id.namespace))
                else {
                    continue;
                };
                if r.resource.name.is_none()
                    && !binding_matches(&comp, r, &obj_namespace, &obj_name)
                {
                    continue;
                }
                // a deleted input loses its revision entry, which also
                // makes the composition ineligible until it returns
                let revision = (!deleted).then_some((resource_version.as_str(), generation));
                if let Err(error) = update_revision(&comp, r, revision, ctx).await {
                    error!(
                        msg = "failed to update input revision",
                        composition = %comp_id,
                        key = r.key,
                        %error
                    );
                }
            }
        }
    }
}

/// Watch one kind until aborted. Discovery failures retry forever without
/// affecting the coordinator or the other watchers.
pub(super) async fn watch_gvk(gvk: GvkKey, ctx: Arc<Context>, state: Arc<Mutex<WatcherState>>) {
    loop {
        let kube_gvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        let api_resource = match kube::discovery::pinned_kind(&ctx.client, &kube_gvk).await {
            Ok((ar, _caps)) => ar,
            Err(error) => {
                error!(msg = "input kind discovery failed", gvk = %gvk, %error);
                tokio::time::sleep(DISCOVERY_RETRY).await;
                continue;
            }
        };
        let api: Api<DynamicObject> = Api::all_with(ctx.client.clone(), &api_resource);

        let stream = watcher(api, watcher::Config::default().any_semantic()).default_backoff();
        futures::pin_mut!(stream);
        while let Some(res) = stream.next().await {
            match res {
                Ok(watcher::Event::InitDone) => {
                    *state.lock().unwrap() = WatcherState::Running;
                }
                Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                    trace!(msg = "input applied", gvk = %gvk, name = obj.name_any());
                    handle_object(&gvk, &obj, false, &ctx).await;
                }
                // tombstones carry the final object and take the same path
                Ok(watcher::Event::Delete(obj)) => {
                    trace!(msg = "input deleted", gvk = %gvk, name = obj.name_any());
                    handle_object(&gvk, &obj, true, &ctx).await;
                }
                Ok(watcher::Event::Init) => {}
                Err(error) => {
                    error!(msg = "input watch error", gvk = %gvk, %error);
                    ctx.metrics.reconcile.watch_operations_failed_inc();
                }
            }
        }
        // stream ended; rediscover in case the kind was reinstalled
        *state.lock().unwrap() = WatcherState::Starting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_api::{Binding, BoundResource, CompositionSpec, ResourceRef, SynthesizerRef};

    fn rev(key: &str, rv: &str, gen: Option<i64>) -> InputRevisions {
        InputRevisions {
            key: key.into(),
            resource_version: rv.into(),
            synthesizer_generation: gen,
        }
    }

    #[test]
    fn merge_is_idempotent() {
        let existing = vec![rev("cfg", "5", Some(2))];
        assert_eq!(merge_revisions(&existing, "cfg", Some(("5", Some(2)))), None);
    }

    #[test]
    fn merge_updates_changed_revision() {
        let existing = vec![rev("cfg", "5", Some(2)), rev("other", "1", Some(2))];
        let merged = merge_revisions(&existing, "cfg", Some(("6", Some(2)))).unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(
            merged.iter().find(|r| r.key == "cfg").unwrap().resource_version,
            "6"
        );
    }

    #[test]
    fn merge_updates_generation_alone() {
        let existing = vec![rev("cfg", "5", Some(2))];
        let merged = merge_revisions(&existing, "cfg", Some(("5", Some(3)))).unwrap();
        assert_eq!(
            merged[0].synthesizer_generation,
            Some(3)
        );
    }

    #[test]
    fn merge_inserts_new_key() {
        let merged = merge_revisions(&[], "cfg", Some(("1", None))).unwrap();
        assert_eq!(merged.len(), 1);
    }

    #[test]
    fn merge_removes_deleted_key() {
        let existing = vec![rev("cfg", "5", Some(2))];
        let merged = merge_revisions(&existing, "cfg", None).unwrap();
        assert!(merged.is_empty());

        // removing a missing key is a no-op
        assert_eq!(merge_revisions(&[], "cfg", None), None);
    }

    #[test]
    fn binding_match_defaults_namespace() {
        let mut comp = Composition::new(
            "comp",
            CompositionSpec {
                synthesizer: SynthesizerRef { name: "syn".into() },
                bindings: vec![Binding {
                    key: "cfg".into(),
                    resource: BoundResource {
                        name: "cm-input".into(),
                        namespace: None,
                    },
                }],
                synthesis_env: vec![],
            },
        );
        comp.metadata.namespace = Some("default".into());
        let r = Ref {
            key: "cfg".into(),
            resource: ResourceRef {
                version: "v1".into(),
                kind: "ConfigMap".into(),
                ..Default::default()
            },
            defer: false,
        };

        assert!(binding_matches(&comp, &r, "default", "cm-input"));
        assert!(!binding_matches(&comp, &r, "other", "cm-input"));
        assert!(!binding_matches(&comp, &r, "default", "different"));
    }
}
