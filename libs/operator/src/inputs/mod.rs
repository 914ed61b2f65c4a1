//! Input watch fabric.
//!
//! Keeps exactly one dynamic watcher per group/version/kind referenced by
//! any synthesizer. Watchers translate observed object changes into
//! `inputRevisions` updates on the affected Compositions; deferred refs
//! additionally stamp `pendingResynthesis`. The registry is the only
//! process-wide mutable state: a mutex-guarded map with an explicit
//! start/stop lifecycle, owned by this component.

mod watch;

use crate::controller::Context;
use crate::index::GvkKey;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use kube::runtime::reflector::ReflectHandle;
use rand::seq::SliceRandom;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};

use eno_api::Synthesizer;

/// Resync cadence of the coordinator; watcher start/stop normally happens
/// on synthesizer events, the tick only catches missed ones.
const COORDINATOR_RESYNC: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatcherState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub(crate) struct WatcherHandle {
    state: Arc<Mutex<WatcherState>>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    fn spawn(gvk: GvkKey, ctx: Arc<Context>) -> Self {
        let state = Arc::new(Mutex::new(WatcherState::Starting));
        let task = tokio::spawn(watch::watch_gvk(gvk, ctx, state.clone()));
        Self { state, task }
    }

    fn stop(self) {
        *self.state.lock().unwrap() = WatcherState::Stopping;
        self.task.abort();
        *self.state.lock().unwrap() = WatcherState::Stopped;
    }

    pub fn state(&self) -> WatcherState {
        *self.state.lock().unwrap()
    }
}

type Registry = Arc<Mutex<HashMap<GvkKey, WatcherHandle>>>;

/// Converge the registry onto the set of GVKs referenced by live
/// synthesizers. The desired set is shuffled so one kind that repeatedly
/// fails to start cannot starve the others.
fn reconcile_watchers(ctx: &Arc<Context>, registry: &Registry) {
    // starting watchers against a half-built synthesizer index would tear
    // them down again on the next pass
    if !ctx.caches_synced() {
        return;
    }
    let mut desired = ctx.indexes.referenced_gvks();
    desired.shuffle(&mut rand::thread_rng());

    let mut registry = registry.lock().unwrap();

    let stale: Vec<GvkKey> = registry
        .keys()
        .filter(|gvk| !desired.contains(gvk))
        .cloned()
        .collect();
    for gvk in stale {
        if let Some(handle) = registry.remove(&gvk) {
            info!(msg = "stopping input watcher", gvk = %gvk);
            handle.stop();
        }
    }

    for gvk in desired {
        // restart watchers whose task died
        if registry.get(&gvk).is_some_and(|h| h.task.is_finished()) {
            registry.remove(&gvk);
        }
        if !registry.contains_key(&gvk) {
            info!(msg = "starting input watcher", gvk = %gvk);
            registry.insert(gvk.clone(), WatcherHandle::spawn(gvk, ctx.clone()));
        }
    }

    // gauge counts watchers past their initial sync
    let running = registry
        .values()
        .filter(|h| h.state() == WatcherState::Running)
        .count();
    ctx.metrics.inputs.active_watchers.set(running as i64);
}

/// Run the fabric: converge on synthesizer events and on a slow tick.
pub async fn run(ctx: Arc<Context>, mut synthesizer_events: ReflectHandle<Synthesizer>) {
    info!(msg = "starting input watch fabric");
    let registry: Registry = Arc::new(Mutex::new(HashMap::new()));
    let mut tick = tokio::time::interval(COORDINATOR_RESYNC);

    loop {
        tokio::select! {
            _ = tick.tick() => {}
            event = synthesizer_events.next() => {
                if event.is_none() {
                    // shared stream closed; fall back to the resync tick
                    debug!(msg = "synthesizer stream closed");
                    tick.tick().await;
                }
            }
        }
        reconcile_watchers(&ctx, &registry);
    }
}
