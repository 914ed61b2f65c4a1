//! Pod lifecycle controller.
//!
//! Keeps exactly one executor pod per in-flight synthesis attempt. Attempt
//! state is derived from the Composition and the pod on every reconcile,
//! never persisted. The executor itself writes slices and `synthesized`;
//! this controller only performs attempt transitions, so the two writers
//! touch disjoint fields.

pub mod pod;

use crate::controller::{error_policy, Context, ControllerId};
use crate::error::{Error, Result};
use crate::telemetry;

use std::sync::Arc;

use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, PostParams, ResourceExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ReflectHandle, Store};
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, warn, Span};

use eno_api::{Composition, Synthesis};

pub const CONTROLLER_ID: ControllerId = "pod-lifecycle";

/// Derived state of the in-flight attempt. Computed on read, per the rule
/// that attempt state is never persisted as an enum.
#[derive(Debug, PartialEq, Eq)]
pub enum AttemptState {
    /// No pod exists for the attempt.
    Pending,
    /// Pod created but the kubelet has not acknowledged it yet.
    Creating,
    Running,
    /// Pod exited zero and the executor recorded `synthesized`.
    Succeeded,
    /// Pod exited zero without recording a result; treated as transient.
    ExitedWithoutResult,
    /// Pod failed and the attempt carries an error result.
    FailedTerminal,
    /// Pod failed without a terminal result (missing input, transient API
    /// error); the pod is recreated with backoff.
    FailedTransient,
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("")
}

fn kubelet_acknowledged(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|cs| !cs.is_empty())
}

pub fn pod_finished(pod: &Pod) -> bool {
    matches!(pod_phase(pod), "Succeeded" | "Failed")
}

pub fn attempt_state(attempt: &Synthesis, pod: Option<&Pod>) -> AttemptState {
    let Some(pod) = pod else {
        return AttemptState::Pending;
    };
    match pod_phase(pod) {
        "Succeeded" => {
            if attempt.synthesized.is_some() {
                AttemptState::Succeeded
            } else {
                AttemptState::ExitedWithoutResult
            }
        }
        "Failed" => {
            if attempt.failed() {
                AttemptState::FailedTerminal
            } else {
                AttemptState::FailedTransient
            }
        }
        "Running" => AttemptState::Running,
        _ => {
            if kubelet_acknowledged(pod) {
                AttemptState::Running
            } else {
                AttemptState::Creating
            }
        }
    }
}

/// Recreate backoff, capped at one minute.
fn recreate_backoff(attempts: i64) -> Duration {
    let exp = attempts.clamp(0, 6) as u32;
    Duration::from_secs(1u64 << exp).min(Duration::from_secs(60))
}

fn executor_pods(ctx: &Context, comp: &Composition) -> Vec<Arc<Pod>> {
    let name = comp.name_any();
    let namespace = comp.namespace().unwrap_or_default();
    ctx.stores
        .pods
        .state()
        .into_iter()
        .filter(|p| {
            let labels = p.labels();
            labels.get(eno_api::COMPOSITION_NAME_LABEL) == Some(&name)
                && labels.get(eno_api::COMPOSITION_NAMESPACE_LABEL) == Some(&namespace)
        })
        .collect()
}

fn synthesis_uuid(pod: &Pod) -> Option<&str> {
    pod.labels()
        .get(eno_api::SYNTHESIS_UUID_LABEL)
        .map(String::as_str)
}

async fn delete_pod(api: &Api<Pod>, pod: &Pod) -> Result<()> {
    if let Some(uid) = pod.uid() {
        eno_k8s_util::api::delete_with_uid(api, &pod.name_any(), &uid).await?;
    }
    Ok(())
}

/// Promote the in-flight attempt to current, pushing the prior current to
/// previous. Guarded by resourceVersion so the executor's final writes are
/// never clobbered.
async fn promote(comp: &Composition, attempt: &Synthesis, ctx: &Context) -> Result<()> {
    let namespace = comp
        .namespace()
        .ok_or(Error::InvalidResource("composition has no namespace".into()))?;
    let body = json!({
        "metadata": { "resourceVersion": comp.resource_version() },
        "status": {
            "previousSynthesis": comp.current_synthesis(),
            "currentSynthesis": attempt,
            "inFlightSynthesis": null,
            "simplified": { "status": "Reconciling" },
        },
    });
    let api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&comp.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    info!(
        msg = "synthesis succeeded",
        namespace,
        name = comp.name_any(),
        uuid = attempt.uuid
    );
    Ok(())
}

/// Terminal failure: the attempt becomes current with `failed=true` and no
/// `synthesized` time. No automatic retry; a generation bump or forced
/// resynthesis is required.
async fn record_terminal_failure(
    comp: &Composition,
    attempt: &Synthesis,
    ctx: &Context,
) -> Result<()> {
    let namespace = comp
        .namespace()
        .ok_or(Error::InvalidResource("composition has no namespace".into()))?;
    let mut failed_attempt = attempt.clone();
    failed_attempt.failed = true;
    let body = json!({
        "metadata": { "resourceVersion": comp.resource_version() },
        "status": {
            "previousSynthesis": comp.current_synthesis(),
            "currentSynthesis": failed_attempt,
            "inFlightSynthesis": null,
            "simplified": {
                "status": "Failed",
                "error": attempt.first_error(),
            },
        },
    });
    let api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&comp.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    warn!(
        msg = "synthesis failed terminally",
        namespace,
        name = comp.name_any(),
        uuid = attempt.uuid,
        error = attempt.first_error().unwrap_or("process exited non-zero")
    );
    Ok(())
}

async fn create_executor_pod(
    comp: &Composition,
    attempt: &Synthesis,
    ctx: &Context,
    pod_api: &Api<Pod>,
) -> Result<()> {
    let Some(synth) = ctx
        .stores
        .synthesizers
        .get(&kube::runtime::reflector::ObjectRef::new(
            comp.synthesizer_name(),
        ))
    else {
        return Err(Error::MissingObject {
            kind: "Synthesizer",
            name: comp.synthesizer_name().to_string(),
        });
    };

    let pod = pod::build(comp, &synth, attempt, &ctx.config);
    match pod_api.create(&PostParams::default(), &pod).await {
        Ok(_) => {}
        // lost a race with ourselves; the pod is there
        Err(kube::Error::Api(ae)) if ae.code == 409 => {}
        Err(e) => return Err(e.into()),
    }

    // Bookkeeping on the attempt. resourceVersion-guarded so a concurrent
    // stuck reclaim (new uuid) is never stamped with this pod's metadata.
    let namespace = comp
        .namespace()
        .ok_or(Error::InvalidResource("composition has no namespace".into()))?;
    let body = json!({
        "metadata": { "resourceVersion": comp.resource_version() },
        "status": {
            "inFlightSynthesis": {
                "podCreation": Time(Utc::now()),
                "attempts": attempt.attempts + 1,
            },
        },
    });
    let api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&comp.name_any(), &PatchParams::default(), &Patch::Merge(&body))
        .await?;
    info!(
        msg = "created executor pod",
        namespace,
        name = comp.name_any(),
        pod = pod.name_any(),
        attempt = attempt.attempts + 1
    );
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

    let pod_api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ctx.config.pod_namespace);
    let pods = executor_pods(&ctx, &comp);

    // A deleting composition is never synthesized; its pods go away now.
    if comp.metadata.deletion_timestamp.is_some() {
        for p in &pods {
            delete_pod(&pod_api, p).await?;
        }
        return Ok(Action::await_change());
    }

    let in_flight_uuid = comp.in_flight_synthesis().map(|s| s.uuid.clone());

    // Orphan sweep: pods whose attempt is no longer referenced, plus
    // finished pods of completed attempts.
    for p in &pods {
        let Some(uuid) = synthesis_uuid(p) else {
            continue;
        };
        let orphaned = !comp.references_synthesis(uuid);
        let completed = in_flight_uuid.as_deref() != Some(uuid) && pod_finished(p);
        if orphaned || completed {
            debug!(
                msg = "deleting pod",
                pod = p.name_any(),
                orphaned,
                completed
            );
            delete_pod(&pod_api, p).await?;
        }
    }

    let Some(in_flight) = comp.in_flight_synthesis() else {
        return Ok(Action::requeue(Duration::from_secs(5 * 60)));
    };

    let pod = pods
        .iter()
        .find(|p| synthesis_uuid(p) == Some(in_flight.uuid.as_str()))
        .map(Arc::as_ref);
    // A pod already being deleted counts as absent; wait for it to go.
    let pod = pod.filter(|p| p.metadata.deletion_timestamp.is_none());

    match attempt_state(in_flight, pod) {
        AttemptState::Pending => {
            // The executor finished but the pod is already gone: promote on
            // the recorded result rather than recreating.
            if in_flight.synthesized.is_some() {
                promote(&comp, in_flight, &ctx).await?;
                return Ok(Action::await_change());
            }
            if let Some(created) = &in_flight.pod_creation {
                let since = (Utc::now() - created.0).to_std().unwrap_or_default();
                let backoff = recreate_backoff(in_flight.attempts);
                if since < backoff {
                    return Ok(Action::requeue(backoff - since));
                }
            }
            create_executor_pod(&comp, in_flight, &ctx, &pod_api).await?;
            Ok(Action::requeue(ctx.config.container_creation_ttl))
        }
        AttemptState::Creating => {
            let pod = pod.expect("creating state implies a pod");
            let age = pod
                .creation_timestamp()
                .map(|t| (Utc::now() - t.0).to_std().unwrap_or_default())
                .unwrap_or_default();
            if age >= ctx.config.container_creation_ttl {
                warn!(
                    msg = "kubelet never acknowledged pod, recreating",
                    pod = pod.name_any()
                );
                delete_pod(&pod_api, pod).await?;
                return Ok(Action::requeue(Duration::from_secs(1)));
            }
            Ok(Action::requeue(ctx.config.container_creation_ttl - age))
        }
        AttemptState::Running => Ok(Action::requeue(Duration::from_secs(10))),
        AttemptState::Succeeded => {
            promote(&comp, in_flight, &ctx).await?;
            let pod = pod.expect("succeeded state implies a pod");
            delete_pod(&pod_api, pod).await?;
            Ok(Action::await_change())
        }
        AttemptState::FailedTerminal => {
            record_terminal_failure(&comp, in_flight, &ctx).await?;
            let pod = pod.expect("failed state implies a pod");
            delete_pod(&pod_api, pod).await?;
            Ok(Action::await_change())
        }
        AttemptState::ExitedWithoutResult | AttemptState::FailedTransient => {
            let pod = pod.expect("failed state implies a pod");
            warn!(
                msg = "executor pod failed transiently, recreating",
                pod = pod.name_any(),
                attempts = in_flight.attempts
            );
            delete_pod(&pod_api, pod).await?;
            Ok(Action::requeue(recreate_backoff(in_flight.attempts)))
        }
    }
}

/// Initialize the pod lifecycle controller off the shared composition
/// stream. Pod events arrive via the reload channel.
pub async fn run(
    ctx: Arc<Context>,
    trigger: ReflectHandle<Composition>,
    reader: Store<Composition>,
    reload_rx: mpsc::Receiver<()>,
) {
    info!(msg = "starting pod lifecycle controller");
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
    use k8s_openapi::api::core::v1::{ContainerStatus, PodStatus};
    use eno_api::{ResultEntry, ResultSeverity};

    fn pod_with_phase(phase: &str, acked: bool) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                container_statuses: acked.then(|| {
                    vec![ContainerStatus {
                        name: "synthesizer".into(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn no_pod_is_pending() {
        let attempt = Synthesis::default();
        assert_eq!(attempt_state(&attempt, None), AttemptState::Pending);
    }

    #[test]
    fn unacknowledged_pod_is_creating() {
        let attempt = Synthesis::default();
        let pod = pod_with_phase("Pending", false);
        assert_eq!(attempt_state(&attempt, Some(&pod)), AttemptState::Creating);

        let pod = pod_with_phase("Pending", true);
        assert_eq!(attempt_state(&attempt, Some(&pod)), AttemptState::Running);
    }

    #[test]
    fn success_requires_synthesized() {
        let pod = pod_with_phase("Succeeded", true);

        let attempt = Synthesis::default();
        assert_eq!(
            attempt_state(&attempt, Some(&pod)),
            AttemptState::ExitedWithoutResult
        );

        let attempt = Synthesis {
            synthesized: Some(Time(Utc::now())),
            ..Default::default()
        };
        assert_eq!(attempt_state(&attempt, Some(&pod)), AttemptState::Succeeded);
    }

    #[test]
    fn failure_severity_decides_terminality() {
        let pod = pod_with_phase("Failed", true);

        let attempt = Synthesis::default();
        assert_eq!(
            attempt_state(&attempt, Some(&pod)),
            AttemptState::FailedTransient
        );

        let attempt = Synthesis {
            results: vec![ResultEntry {
                message: "bad input".into(),
                severity: ResultSeverity::Error,
            }],
            ..Default::default()
        };
        assert_eq!(
            attempt_state(&attempt, Some(&pod)),
            AttemptState::FailedTerminal
        );
    }

    #[test]
    fn recreate_backoff_grows_and_caps() {
        assert_eq!(recreate_backoff(0), Duration::from_secs(1));
        assert_eq!(recreate_backoff(3), Duration::from_secs(8));
        assert_eq!(recreate_backoff(100), Duration::from_secs(60));
    }
}
