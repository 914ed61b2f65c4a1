//! Synthesis scheduler.
//!
//! Decides, per Composition, whether a new synthesis attempt is due and
//! admits it under the global concurrency cap and the per-synthesizer
//! rollout cooldown. Dispatch writes `inFlightSynthesis` with a fresh UUID
//! under a resourceVersion guard so concurrent dispatchers cannot double
//! book an attempt.

use crate::controller::{error_policy, Context, ControllerId};
use crate::error::{Error, Result};
use crate::telemetry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, ResourceExt};
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::reflector::{ObjectRef, ReflectHandle, Store};
use rand::Rng;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, field, info, instrument, Span};
use uuid::Uuid;

use eno_api::{Composition, Synthesis, Synthesizer};

pub const CONTROLLER_ID: ControllerId = "scheduler";

/// Why a Composition is due for (re)synthesis. Ordering mirrors the
/// precedence of the checks: an in-flight attempt masks everything except
/// the stuck branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueReason {
    NeverSynthesized,
    CompositionModified,
    SynthesizerModified,
    InputModified,
    DeferredInput,
    Forced,
    StuckAttempt,
}

impl DueReason {
    /// Initial synthesis, forced recovery, stuck reclaim and non-deferred
    /// input changes skip the rollout cooldown; it throttles
    /// synthesizer-driven rollouts, not user-driven input updates.
    pub fn bypasses_cooldown(&self) -> bool {
        matches!(
            self,
            DueReason::NeverSynthesized
                | DueReason::Forced
                | DueReason::StuckAttempt
                | DueReason::InputModified
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DueReason::NeverSynthesized => "never-synthesized",
            DueReason::CompositionModified => "composition-modified",
            DueReason::SynthesizerModified => "synthesizer-modified",
            DueReason::InputModified => "input-modified",
            DueReason::DeferredInput => "deferred-input",
            DueReason::Forced => "forced",
            DueReason::StuckAttempt => "stuck-attempt",
        }
    }
}

fn age_exceeds(since: Option<&Time>, now: DateTime<Utc>, threshold: Duration) -> bool {
    since.is_some_and(|t| {
        (now - t.0)
            .to_std()
            .map(|elapsed| elapsed >= threshold)
            .unwrap_or_default()
    })
}

/// Decide whether the composition needs a new attempt and why.
pub fn due_reason(
    comp: &Composition,
    synth: &Synthesizer,
    now: DateTime<Utc>,
    cooldown: Duration,
    watchdog_threshold: Duration,
) -> Option<DueReason> {
    if let Some(in_flight) = comp.in_flight_synthesis() {
        // At most one attempt at a time. A lost pod surfaces here once the
        // attempt is older than the watchdog threshold.
        if age_exceeds(in_flight.initialized.as_ref(), now, watchdog_threshold) {
            return Some(DueReason::StuckAttempt);
        }
        return None;
    }

    let Some(current) = comp.current_synthesis() else {
        return Some(DueReason::NeverSynthesized);
    };

    if comp.force_resynthesis() {
        return Some(DueReason::Forced);
    }

    if current.observed_composition_generation != comp.metadata.generation.unwrap_or_default() {
        return Some(DueReason::CompositionModified);
    }

    if current.observed_synthesizer_generation != synth.metadata.generation.unwrap_or_default() {
        return Some(DueReason::SynthesizerModified);
    }

    let changed = comp.changed_input_keys(current);
    if changed.is_empty() {
        return None;
    }
    let any_non_deferred = changed
        .iter()
        .any(|key| !synth.ref_for_key(key).map(|r| r.defer).unwrap_or_default());
    if any_non_deferred {
        return Some(DueReason::InputModified);
    }
    if age_exceeds(comp.pending_resynthesis(), now, cooldown) {
        return Some(DueReason::DeferredInput);
    }
    None
}

/// Due is necessary but not sufficient: deleting compositions are never
/// dispatched and inputs must exist and be in lockstep.
pub fn eligible(comp: &Composition, synth: &Synthesizer) -> bool {
    comp.metadata.deletion_timestamp.is_none()
        && comp.inputs_exist(synth)
        && comp.inputs_in_lockstep()
}

fn in_flight_count(ctx: &Context) -> usize {
    ctx.stores
        .compositions
        .state()
        .iter()
        .filter(|c| c.in_flight_synthesis().is_some())
        .count()
}

/// Jitter requeues so compositions blocked on the same condition do not
/// wake in lockstep.
fn requeue_with_jitter(base: Duration) -> Action {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    Action::requeue(base + jitter)
}

async fn dispatch(
    comp: &Composition,
    synth: &Synthesizer,
    reason: DueReason,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<()> {
    let name = comp.name_any();
    let namespace = comp
        .namespace()
        .ok_or(Error::InvalidResource("composition has no namespace".into()))?;

    let attempt = Synthesis {
        uuid: Uuid::new_v4().to_string(),
        initialized: Some(Time(now)),
        observed_composition_generation: comp.metadata.generation.unwrap_or_default(),
        observed_synthesizer_generation: synth.metadata.generation.unwrap_or_default(),
        input_revisions: comp.input_revisions().to_vec(),
        ..Default::default()
    };

    // Guarded by the resourceVersion observed when inFlightSynthesis was
    // seen empty (or stuck). A concurrent writer invalidates the guard and
    // the reconcile is retried against fresh state.
    let body = json!({
        "metadata": { "resourceVersion": comp.resource_version() },
        "status": {
            "inFlightSynthesis": &attempt,
            "pendingResynthesis": null,
            "forceResynthesis": false,
            "simplified": { "status": "Synthesizing" },
        },
    });
    let api: Api<Composition> = Api::namespaced(ctx.client.clone(), &namespace);
    api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&body))
        .await?;

    ctx.schedule.record_dispatch(&synth.name_any());
    ctx.metrics.scheduler.dispatch_inc(&synth.name_any());
    if reason == DueReason::StuckAttempt {
        ctx.metrics.scheduler.stuck_reclaim_inc(&synth.name_any());
    }
    info!(
        msg = "dispatched synthesis",
        namespace,
        name,
        synthesizer = synth.name_any(),
        uuid = attempt.uuid,
        reason = reason.as_str()
    );
    Ok(())
}

#[instrument(skip(ctx, comp), fields(trace_id))]
async fn reconcile(comp: Arc<Composition>, ctx: Arc<Context>) -> Result<Action, Error> {
    let trace_id = telemetry::get_trace_id();
    Span::current().record("trace_id", field::display(&trace_id));
    let _timer = ctx.metrics.reconcile.count_and_measure(CONTROLLER_ID, &trace_id);
    ctx.diagnostics.write().await.last_event = Utc::now();

    if !ctx.caches_synced() {
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    ctx.metrics
        .scheduler
        .in_flight
        .set(in_flight_count(&ctx) as i64);

    let Some(synth) = ctx
        .stores
        .synthesizers
        .get(&ObjectRef::new(comp.synthesizer_name()))
    else {
        // Not an error: the watchdog exposes the condition and the
        // synthesizer watch re-triggers us when it appears.
        debug!(
            msg = "synthesizer not found",
            name = comp.name_any(),
            synthesizer = comp.synthesizer_name()
        );
        return Ok(Action::requeue(Duration::from_secs(60)));
    };

    let now = Utc::now();
    let cooldown = ctx.config.rollout_cooldown;
    let threshold = ctx.config.watchdog_threshold;

    let Some(reason) = due_reason(&comp, &synth, now, cooldown, threshold) else {
        // Wake up in time for the deferred-input or stuck branches.
        if comp.in_flight_synthesis().is_some() {
            return Ok(requeue_with_jitter(threshold));
        }
        if comp.pending_resynthesis().is_some() {
            return Ok(requeue_with_jitter(cooldown));
        }
        return Ok(Action::requeue(Duration::from_secs(5 * 60)));
    };

    if !eligible(&comp, &synth) {
        debug!(
            msg = "due but not eligible",
            name = comp.name_any(),
            reason = reason.as_str()
        );
        ctx.metrics.scheduler.blocked_inc("not-eligible");
        return Ok(Action::requeue(Duration::from_secs(60)));
    }

    // Admission: global concurrency cap. A stuck reclaim replaces an
    // attempt that is already counted, so it is exempt.
    if reason != DueReason::StuckAttempt && in_flight_count(&ctx) >= ctx.config.concurrency_limit {
        ctx.metrics.scheduler.blocked_inc("concurrency-limit");
        return Ok(requeue_with_jitter(Duration::from_secs(5)));
    }

    // Admission: per-synthesizer rollout cooldown.
    if !reason.bypasses_cooldown() {
        if let Some(since) = ctx.schedule.since_last_dispatch(&synth.name_any()) {
            if since < cooldown {
                ctx.metrics.scheduler.blocked_inc("rollout-cooldown");
                return Ok(requeue_with_jitter(cooldown - since));
            }
        }
    }

    dispatch(&comp, &synth, reason, &ctx, now).await?;
    Ok(Action::requeue(Duration::from_secs(60)))
}

/// Initialize the scheduler controller off the shared composition stream.
pub async fn run(
    ctx: Arc<Context>,
    trigger: ReflectHandle<Composition>,
    reader: Store<Composition>,
    reload_rx: mpsc::Receiver<()>,
) {
    info!(msg = "starting scheduler controller");
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
