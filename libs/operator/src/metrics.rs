use crate::controller::ControllerId;
use crate::error::Error;

use opentelemetry::trace::TraceId;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::{
    counter::Counter, exemplar::HistogramWithExemplars, family::Family,
};
use prometheus_client::registry::{Registry, Unit};
use std::sync::Arc;
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconcile: ReconcileMetrics,
    pub scheduler: SchedulerMetrics,
    pub inputs: InputMetrics,
    pub watchdog: WatchdogMetrics,
    pub registry: Arc<Registry>,
}

impl Metrics {
    pub fn new(mut registry: Registry, controllers: &[ControllerId]) -> Self {
        let reconcile = ReconcileMetrics::default().register(&mut registry, controllers);
        let scheduler = SchedulerMetrics::default().register(&mut registry);
        let inputs = InputMetrics::default().register(&mut registry);
        let watchdog = WatchdogMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            reconcile,
            scheduler,
            inputs,
            watchdog,
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct TraceLabel {
    pub id: String,
}

impl TryFrom<&TraceId> for TraceLabel {
    type Error = Error;

    fn try_from(id: &TraceId) -> Result<TraceLabel, Self::Error> {
        if std::matches!(id, &TraceId::INVALID) {
            Err(Error::InvalidTraceId)
        } else {
            let trace_id = id.to_string();
            Ok(Self { id: trace_id })
        }
    }
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ControllerLabel {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TriggerLabels {
    pub action: Action,
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Action {
    Apply,
    Delete,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct SynthesizerLabel {
    pub synthesizer: String,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug, Default)]
pub struct ReasonLabel {
    pub reason: String,
}

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub runs: Family<ControllerLabel, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: HistogramWithExemplars<TraceLabel>,
    pub triggered: Family<TriggerLabels, Counter>,
    pub watch_operations_failed: Counter,
    pub ready: Family<ControllerLabel, Gauge>,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self {
            runs: Family::<ControllerLabel, Counter>::default(),
            failures: Family::<ErrorLabels, Counter>::default(),
            duration: HistogramWithExemplars::new([0.1, 0.5, 1., 5., 10.].into_iter()),
            triggered: Family::<TriggerLabels, Counter>::default(),
            watch_operations_failed: Counter::default(),
            ready: Family::<ControllerLabel, Gauge>::default(),
        }
    }
}

impl ReconcileMetrics {
    pub fn register(self, r: &mut Registry, controllers: &[ControllerId]) -> Self {
        r.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        r.register(
            "reconcile_failures",
            "reconciliation errors",
            self.failures.clone(),
        );
        r.register("reconcile_runs", "reconciliations", self.runs.clone());
        r.register(
            "reconcile_triggered",
            "reconciliations triggered by watched resources",
            self.triggered.clone(),
        );
        r.register(
            "watch_operations_failed",
            "failed watch operations",
            self.watch_operations_failed.clone(),
        );
        r.register(
            "controller_ready",
            "controller readiness",
            self.ready.clone(),
        );
        // pre-create series so dashboards see zeroes before the first event
        for controller in controllers {
            let label = ControllerLabel {
                controller: controller.to_string(),
            };
            self.runs.get_or_create(&label);
            self.ready.get_or_create(&label);
        }
        self
    }

    pub fn failure_inc(&self, controller: ControllerId, e: &Error) {
        self.failures
            .get_or_create(&ErrorLabels {
                controller: controller.to_string(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn triggered_inc(&self, action: Action, resource: &str) {
        self.triggered
            .get_or_create(&TriggerLabels {
                action,
                resource: resource.to_string(),
            })
            .inc();
    }

    pub fn watch_operations_failed_inc(&self) {
        self.watch_operations_failed.inc();
    }

    pub fn ready_set(&self, controller: ControllerId, value: i64) {
        self.ready
            .get_or_create(&ControllerLabel {
                controller: controller.to_string(),
            })
            .set(value);
    }

    pub fn count_and_measure(
        &self,
        controller: ControllerId,
        trace_id: &TraceId,
    ) -> ReconcileMeasurer {
        self.runs
            .get_or_create(&ControllerLabel {
                controller: controller.to_string(),
            })
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            labels: trace_id.try_into().ok(),
            metric: self.duration.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SchedulerMetrics {
    pub dispatches: Family<SynthesizerLabel, Counter>,
    pub blocked: Family<ReasonLabel, Counter>,
    pub in_flight: Gauge,
    pub stuck_reclaims: Family<SynthesizerLabel, Counter>,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self {
            dispatches: Family::default(),
            blocked: Family::default(),
            in_flight: Gauge::default(),
            stuck_reclaims: Family::default(),
        }
    }
}

impl SchedulerMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "synthesis_dispatches",
            "synthesis attempts dispatched",
            self.dispatches.clone(),
        );
        r.register(
            "synthesis_dispatch_blocked",
            "dispatches blocked by admission",
            self.blocked.clone(),
        );
        r.register(
            "synthesis_in_flight",
            "compositions with an in-flight synthesis",
            self.in_flight.clone(),
        );
        r.register(
            "synthesis_stuck_reclaims",
            "in-flight attempts reclaimed by the watchdog branch",
            self.stuck_reclaims.clone(),
        );
        self
    }

    pub fn dispatch_inc(&self, synthesizer: &str) {
        self.dispatches
            .get_or_create(&SynthesizerLabel {
                synthesizer: synthesizer.to_string(),
            })
            .inc();
    }

    pub fn blocked_inc(&self, reason: &str) {
        self.blocked
            .get_or_create(&ReasonLabel {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn stuck_reclaim_inc(&self, synthesizer: &str) {
        self.stuck_reclaims
            .get_or_create(&SynthesizerLabel {
                synthesizer: synthesizer.to_string(),
            })
            .inc();
    }
}

#[derive(Clone, Default)]
pub struct InputMetrics {
    pub active_watchers: Gauge,
    pub revision_updates: Counter,
    pub events: Counter,
}

impl InputMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "input_watchers",
            "running dynamic input watchers",
            self.active_watchers.clone(),
        );
        r.register(
            "input_revision_updates",
            "input revision entries written to compositions",
            self.revision_updates.clone(),
        );
        r.register(
            "input_events",
            "events observed by input watchers",
            self.events.clone(),
        );
        self
    }
}

/// Gauges exported by the watchdog sweep, labeled by synthesizer.
#[derive(Clone, Default)]
pub struct WatchdogMetrics {
    pub waiting_on_inputs: Family<SynthesizerLabel, Gauge>,
    pub pending_initial_reconciliation: Family<SynthesizerLabel, Gauge>,
    pub stuck_reconciling: Family<SynthesizerLabel, Gauge>,
    pub pending_readiness: Family<SynthesizerLabel, Gauge>,
    pub terminal_errors: Family<SynthesizerLabel, Gauge>,
}

impl WatchdogMetrics {
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "compositions_waiting_on_inputs",
            "compositions whose inputs are missing or out of lockstep beyond the threshold",
            self.waiting_on_inputs.clone(),
        );
        r.register(
            "compositions_pending_initial_reconciliation",
            "compositions with no reconciled attempt beyond the threshold",
            self.pending_initial_reconciliation.clone(),
        );
        r.register(
            "compositions_stuck_reconciling",
            "compositions not reconciled long after synthesis was initialized",
            self.stuck_reconciling.clone(),
        );
        r.register(
            "compositions_pending_readiness",
            "compositions reconciled but not ready beyond the threshold",
            self.pending_readiness.clone(),
        );
        r.register(
            "compositions_terminal_errors",
            "compositions whose current synthesis failed terminally",
            self.terminal_errors.clone(),
        );
        self
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    labels: Option<TraceLabel>,
    metric: HistogramWithExemplars<TraceLabel>,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = self.labels.take();
        self.metric.observe(duration, labels);
    }
}
