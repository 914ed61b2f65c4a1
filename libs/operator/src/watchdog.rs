//! Watchdog: periodic sweep exporting gauges for compositions stuck in
//! each lifecycle stage, labeled by synthesizer. Never mutates state.

use crate::controller::Context;
use crate::metrics::SynthesizerLabel;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::api::ResourceExt;
use kube::runtime::reflector::ObjectRef;
use tokio::time::Duration;
use tracing::info;

use eno_api::{Composition, Synthesizer};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub waiting_on_inputs: bool,
    pub pending_initial_reconciliation: bool,
    pub stuck_reconciling: bool,
    pub pending_readiness: bool,
    pub terminal_error: bool,
}

fn older_than(t: Option<&k8s_openapi::apimachinery::pkg::apis::meta::v1::Time>, now: DateTime<Utc>, threshold: Duration) -> bool {
    t.is_some_and(|t| {
        (now - t.0)
            .to_std()
            .map(|elapsed| elapsed > threshold)
            .unwrap_or_default()
    })
}

/// Classify one composition against the threshold. Pure so the sweep is
/// trivial to test.
pub fn classify(
    comp: &Composition,
    synth: Option<&Synthesizer>,
    now: DateTime<Utc>,
    threshold: Duration,
) -> Classification {
    let mut c = Classification::default();
    let aged = older_than(comp.creation_timestamp().as_ref(), now, threshold);
    let current = comp.current_synthesis();
    let previous = comp.previous_synthesis();

    if let Some(synth) = synth {
        if aged && (!comp.inputs_exist(synth) || !comp.inputs_in_lockstep()) {
            c.waiting_on_inputs = true;
        }
    }

    let reconciled_somewhere = current.is_some_and(|s| s.reconciled.is_some())
        || previous.is_some_and(|s| s.reconciled.is_some());
    if aged && !reconciled_somewhere {
        c.pending_initial_reconciliation = true;
    }

    if let Some(current) = current {
        if current.reconciled.is_none()
            && older_than(current.initialized.as_ref(), now, threshold)
        {
            c.stuck_reconciling = true;
        }

        let ready_somewhere = current.ready.is_some() || previous.is_some_and(|s| s.ready.is_some());
        if !ready_somewhere && older_than(current.reconciled.as_ref(), now, threshold) {
            c.pending_readiness = true;
        }

        if current.synthesized.is_none() && current.failed() {
            c.terminal_error = true;
        }
    }

    c
}

fn sweep(ctx: &Context) {
    let now = Utc::now();
    let threshold = ctx.config.watchdog_threshold;
    let mut counts: HashMap<String, [i64; 5]> = HashMap::new();

    for comp in ctx.stores.compositions.state() {
        let synth = ctx
            .stores
            .synthesizers
            .get(&ObjectRef::new(comp.synthesizer_name()));
        let c = classify(&comp, synth.as_deref(), now, threshold);
        let entry = counts
            .entry(comp.synthesizer_name().to_string())
            .or_default();
        entry[0] += c.waiting_on_inputs as i64;
        entry[1] += c.pending_initial_reconciliation as i64;
        entry[2] += c.stuck_reconciling as i64;
        entry[3] += c.pending_readiness as i64;
        entry[4] += c.terminal_error as i64;
    }

    let m = &ctx.metrics.watchdog;
    m.waiting_on_inputs.clear();
    m.pending_initial_reconciliation.clear();
    m.stuck_reconciling.clear();
    m.pending_readiness.clear();
    m.terminal_errors.clear();
    for (synthesizer, [waiting, initial, stuck, readiness, terminal]) in counts {
        let label = SynthesizerLabel { synthesizer };
        m.waiting_on_inputs.get_or_create(&label).set(waiting);
        m.pending_initial_reconciliation
            .get_or_create(&label)
            .set(initial);
        m.stuck_reconciling.get_or_create(&label).set(stuck);
        m.pending_readiness.get_or_create(&label).set(readiness);
        m.terminal_errors.get_or_create(&label).set(terminal);
    }
}

pub async fn run(ctx: Arc<Context>) {
    info!(msg = "starting watchdog");
    let mut tick = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        tick.tick().await;
        sweep(&ctx);
    }
}
