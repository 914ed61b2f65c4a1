use crate::error::Error;
use crate::index::Indexes;
use crate::metrics::{self, Metrics};
use crate::{inputs, scheduler, slices, symphony, synthesis, watchdog};

use std::collections::HashMap;
use std::fmt::Debug;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, ResourceExt};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::events::Reporter;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup, ReflectHandle, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

use eno_api::{Composition, ResourceSlice, Symphony, Synthesizer};
use eno_k8s_util::api::short_type_name;

pub type ControllerId = &'static str;

pub const CONTROLLERS: &[ControllerId] = &[
    scheduler::CONTROLLER_ID,
    synthesis::CONTROLLER_ID,
    slices::AGGREGATOR_CONTROLLER_ID,
    slices::CLEANER_CONTROLLER_ID,
    symphony::CONTROLLER_ID,
];

const SUBSCRIBE_BUFFER_SIZE: usize = 256;
const RELOAD_BUFFER_SIZE: usize = 16;

/// Key, optionally with a value: `key[=value]`. Used for taint tolerations
/// and node affinity; a bare key matches on presence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValuePair {
    pub key: String,
    pub value: Option<String>,
}

impl FromStr for KeyValuePair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err("empty key".to_string());
        }
        match s.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok(Self {
                key: key.to_string(),
                value: Some(value.to_string()),
            }),
            Some(_) => Err(format!("invalid key=value pair: {s:?}")),
            None => Ok(Self {
                key: s.to_string(),
                value: None,
            }),
        }
    }
}

/// Static configuration shared by every controller, parsed from the CLI.
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Namespace executor pods run in.
    pub pod_namespace: String,
    /// Image of the executor container wrapping user synthesizers.
    pub executor_image: String,
    /// Global cap on compositions with an in-flight synthesis.
    pub concurrency_limit: usize,
    /// Minimum interval between dispatches sharing a synthesizer.
    pub rollout_cooldown: Duration,
    /// Age beyond which an in-flight attempt is reclaimed as stuck.
    pub watchdog_threshold: Duration,
    /// Grace period for the kubelet to acknowledge a created pod.
    pub container_creation_ttl: Duration,
    pub taint_tolerations: Vec<KeyValuePair>,
    pub node_affinity: Vec<KeyValuePair>,
    /// Narrow the composition watch to one namespace.
    pub composition_namespace: Option<String>,
    /// Narrow the composition watch by label selector.
    pub composition_label_selector: Option<String>,
    /// Aggregate status-write budget of the input watch fabric, per second.
    pub input_write_qps: u32,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            pod_namespace: "eno".to_string(),
            executor_image: String::new(),
            concurrency_limit: 10,
            rollout_cooldown: Duration::from_secs(60),
            watchdog_threshold: Duration::from_secs(180),
            container_creation_ttl: Duration::from_secs(3),
            taint_tolerations: vec![],
            node_affinity: vec![],
            composition_namespace: None,
            composition_label_selector: None,
            input_write_qps: 5,
        }
    }
}

/// Most recent dispatch per synthesizer, backing the rollout cooldown.
/// Process-local: after a restart the cooldown restarts too, which only
/// delays the next dispatch, never loses one.
#[derive(Default)]
pub struct ScheduleState {
    last_dispatch: Mutex<HashMap<String, Instant>>,
}

impl ScheduleState {
    pub fn since_last_dispatch(&self, synthesizer: &str) -> Option<Duration> {
        self.last_dispatch
            .lock()
            .unwrap()
            .get(synthesizer)
            .map(|t| t.elapsed())
    }

    pub fn record_dispatch(&self, synthesizer: &str) {
        self.last_dispatch
            .lock()
            .unwrap()
            .insert(synthesizer.to_string(), Instant::now());
    }
}

/// Cache-backed reads shared by all reconcilers. Writes never go through
/// these; they hit the API server directly.
#[derive(Clone)]
pub struct Stores {
    pub compositions: Store<Composition>,
    pub synthesizers: Store<Synthesizer>,
    pub slices: Store<ResourceSlice>,
    pub symphonies: Store<Symphony>,
    pub pods: Store<Pod>,
}

impl Stores {
    /// Block until every cache has synced. Controllers start only after
    /// this returns so the indices are fully populated.
    pub async fn wait_until_ready(&self) {
        self.compositions.wait_until_ready().await.ok();
        self.synthesizers.wait_until_ready().await.ok();
        self.slices.wait_until_ready().await.ok();
        self.symphonies.wait_until_ready().await.ok();
        self.pods.wait_until_ready().await.ok();
    }
}

// Context for the reconcilers
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    pub stores: Arc<Stores>,
    pub indexes: Arc<Indexes>,
    pub config: Arc<OperatorConfig>,
    pub schedule: Arc<ScheduleState>,
    /// Shared token bucket capping input-fabric status writes.
    pub write_limiter: Arc<DefaultDirectRateLimiter>,
    caches_synced: Arc<AtomicBool>,
}

impl Context {
    /// True once every store has synced and the indices are fully
    /// populated. Reconcilers requeue until then; they must never act on a
    /// half-built index.
    pub fn caches_synced(&self) -> bool {
        self.caches_synced.load(Ordering::Relaxed)
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "eno-controller".into(),
        }
    }
}

/// State shared between the controllers and the web server
#[derive(Clone)]
pub struct State {
    diagnostics: Arc<RwLock<Diagnostics>>,
    metrics: Arc<Metrics>,
    config: Arc<OperatorConfig>,
}

impl State {
    pub fn new(registry: prometheus_client::registry::Registry, config: OperatorConfig) -> Self {
        Self {
            diagnostics: Arc::new(RwLock::new(Diagnostics::default())),
            metrics: Arc::new(Metrics::new(registry, CONTROLLERS)),
            config: Arc::new(config),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry)?;
        Ok(buffer)
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(
        &self,
        client: Client,
        stores: Arc<Stores>,
        indexes: Arc<Indexes>,
    ) -> Arc<Context> {
        let qps = NonZeroU32::new(self.config.input_write_qps).unwrap_or(NonZeroU32::MIN);
        Arc::new(Context {
            client,
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            stores,
            indexes,
            config: self.config.clone(),
            schedule: Arc::new(ScheduleState::default()),
            write_limiter: Arc::new(RateLimiter::direct(Quota::per_second(qps))),
            caches_synced: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Shared error policy: log, count, back off. Conflicts requeue quickly
/// since they are the normal outcome of compare-and-set races.
pub fn error_policy<K: ResourceExt>(
    controller: ControllerId,
) -> impl Fn(Arc<K>, &Error, Arc<Context>) -> Action {
    move |obj, error, ctx| {
        if error.is_conflict() {
            debug!(msg = "write conflict, requeueing", controller, name = %obj.name_any());
            return Action::requeue(Duration::from_secs(1));
        }
        error!(msg = "failed reconciliation", controller, namespace = obj.namespace().unwrap_or_default(), name = %obj.name_any(), %error);
        ctx.metrics.reconcile.failure_inc(controller, error);
        Action::requeue(Duration::from_secs(5 * 60))
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions and installed CRDs",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub struct ResourceReflector<K>
where
    K: Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub store: Store<K>,
    pub writer: Writer<K>,
    pub subscriber: ReflectHandle<K>,
}

fn create_subscriber<K>(buffer_size: usize) -> ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, writer) = reflector::store_shared(buffer_size);
    let subscriber = writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    ResourceReflector {
        store,
        writer,
        subscriber,
    }
}

/// When a reload channel fires: always on deletes (workaround for
/// kube-rs#1590), optionally on applies for controllers whose trigger is
/// only loosely coupled to the watched resource.
pub struct Reload {
    tx: mpsc::Sender<()>,
    on_apply: bool,
}

impl Reload {
    pub fn on_delete(tx: mpsc::Sender<()>) -> Self {
        Self {
            tx,
            on_apply: false,
        }
    }

    pub fn on_any(tx: mpsc::Sender<()>) -> Self {
        Self { tx, on_apply: true }
    }
}

type IndexHook<K> = Arc<dyn Fn(&Indexes, &K) + Send + Sync>;

/// Index maintenance hooks invoked as watch events flow through.
pub struct IndexHooks<K> {
    pub apply: Option<IndexHook<K>>,
    pub delete: Option<IndexHook<K>>,
}

impl<K> IndexHooks<K> {
    pub fn none() -> Self {
        Self {
            apply: None,
            delete: None,
        }
    }
}

fn create_watch<K>(
    api: Api<K>,
    config: watcher::Config,
    writer: Writer<K>,
    reloads: Vec<Reload>,
    ctx: Arc<Context>,
    hooks: IndexHooks<K>,
) -> BoxFuture<'static, ()>
where
    K: Resource + Lookup + Clone + DeserializeOwned + Send + Sync + Debug + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
    <K as Resource>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let resource_name = short_type_name::<K>().unwrap_or("Unknown");

    watcher(api, config)
        .default_backoff()
        .reflect_shared(writer)
        .for_each(move |res| {
            let reloads: Vec<(mpsc::Sender<()>, bool)> = reloads
                .iter()
                .map(|r| (r.tx.clone(), r.on_apply))
                .collect();
            let ctx = ctx.clone();
            let apply_hook = hooks.apply.clone();
            let delete_hook = hooks.delete.clone();
            async move {
                match res {
                    Ok(event) => {
                        trace!(msg = "watched event", resource = resource_name);
                        match event {
                            watcher::Event::Delete(d) => {
                                debug!(
                                    msg = format!("delete event for {resource_name}"),
                                    namespace = ResourceExt::namespace(&d).unwrap_or_default(),
                                    name = d.name_any()
                                );
                                if let Some(hook) = delete_hook {
                                    hook(&ctx.indexes, &d);
                                }
                                // TODO: remove trigger on delete logic when
                                // (dispatch delete events issue)[https://github.com/kube-rs/kube/issues/1590]
                                // is solved
                                for (mut tx, _) in reloads {
                                    let _ignore_errors = tx.try_send(()).map_err(
                                        |e| error!(msg = "failed to trigger reconcile on delete", %e),
                                    );
                                }
                                ctx.metrics
                                    .reconcile
                                    .triggered_inc(metrics::Action::Delete, resource_name);
                            }
                            watcher::Event::Apply(d) | watcher::Event::InitApply(d) => {
                                if let Some(hook) = apply_hook {
                                    hook(&ctx.indexes, &d);
                                }
                                for (mut tx, on_apply) in reloads {
                                    if on_apply {
                                        let _ignore_errors = tx.try_send(());
                                    }
                                }
                                ctx.metrics
                                    .reconcile
                                    .triggered_inc(metrics::Action::Apply, resource_name);
                            }
                            _ => {}
                        }
                    }
                    Err(e) => {
                        error!(msg = format!("unexpected error when watching {resource_name}"), %e);
                        ctx.metrics.reconcile.watch_operations_failed_inc();
                    }
                }
            }
        })
        .boxed()
}

fn composition_watch_config(config: &OperatorConfig) -> watcher::Config {
    let mut wc = watcher::Config::default().any_semantic();
    if let Some(selector) = &config.composition_label_selector {
        wc = wc.labels(selector);
    }
    wc
}

/// Initialize every controller and shared state (given the crds are installed)
pub async fn run(state: State, client: Client) {
    let _ = check_api_queryable::<Composition>(client.clone()).await;
    let synthesizer_api = check_api_queryable::<Synthesizer>(client.clone()).await;
    let _ = check_api_queryable::<ResourceSlice>(client.clone()).await;
    let _ = check_api_queryable::<Symphony>(client.clone()).await;

    let composition_api: Api<Composition> = match &state.config.composition_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let slice_api: Api<ResourceSlice> = match &state.config.composition_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let symphony_api: Api<Symphony> = match &state.config.composition_namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };
    let pod_api: Api<Pod> = Api::namespaced(client.clone(), &state.config.pod_namespace);

    let composition_r = create_subscriber::<Composition>(SUBSCRIBE_BUFFER_SIZE);
    let synthesizer_r = create_subscriber::<Synthesizer>(SUBSCRIBE_BUFFER_SIZE);
    let slice_r = create_subscriber::<ResourceSlice>(SUBSCRIBE_BUFFER_SIZE);
    let symphony_r = create_subscriber::<Symphony>(SUBSCRIBE_BUFFER_SIZE);
    let pod_r = create_subscriber::<Pod>(SUBSCRIBE_BUFFER_SIZE);

    // additional trigger streams off the same watches
    let composition_sub_pod = composition_r
        .writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");
    let composition_sub_aggregator = composition_r
        .writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");
    let composition_sub_symphony = composition_r
        .writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");
    let synthesizer_sub_fabric = synthesizer_r
        .writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");
    let slice_sub_cleaner = slice_r
        .writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    let (scheduler_reload_tx, scheduler_reload_rx) = mpsc::channel(RELOAD_BUFFER_SIZE);
    let (pod_reload_tx, pod_reload_rx) = mpsc::channel(RELOAD_BUFFER_SIZE);
    let (aggregator_reload_tx, aggregator_reload_rx) = mpsc::channel(RELOAD_BUFFER_SIZE);
    let (cleaner_reload_tx, cleaner_reload_rx) = mpsc::channel(RELOAD_BUFFER_SIZE);
    let (symphony_reload_tx, symphony_reload_rx) = mpsc::channel(RELOAD_BUFFER_SIZE);

    let stores = Arc::new(Stores {
        compositions: composition_r.store,
        synthesizers: synthesizer_r.store,
        slices: slice_r.store,
        symphonies: symphony_r.store,
        pods: pod_r.store,
    });
    let indexes = Arc::new(Indexes::default());
    let ctx = state.to_context(client.clone(), stores.clone(), indexes.clone());

    let composition_watch = create_watch(
        composition_api,
        composition_watch_config(&state.config),
        composition_r.writer,
        vec![
            Reload::on_delete(symphony_reload_tx),
            Reload::on_any(cleaner_reload_tx),
        ],
        ctx.clone(),
        IndexHooks {
            apply: Some(Arc::new(|ix, c| ix.apply_composition(c))),
            delete: Some(Arc::new(|ix, c| ix.delete_composition(c))),
        },
    );
    let synthesizer_watch = create_watch(
        synthesizer_api,
        watcher::Config::default().any_semantic(),
        synthesizer_r.writer,
        vec![Reload::on_any(scheduler_reload_tx)],
        ctx.clone(),
        IndexHooks {
            apply: Some(Arc::new(|ix, s| ix.apply_synthesizer(s))),
            delete: Some(Arc::new(|ix, s| ix.delete_synthesizer(s))),
        },
    );
    let slice_watch = create_watch(
        slice_api,
        watcher::Config::default().any_semantic(),
        slice_r.writer,
        vec![Reload::on_delete(aggregator_reload_tx)],
        ctx.clone(),
        IndexHooks {
            apply: Some(Arc::new(|ix, s| ix.apply_slice(s))),
            delete: Some(Arc::new(|ix, s| ix.delete_slice(s))),
        },
    );
    let symphony_watch = create_watch(
        symphony_api,
        watcher::Config::default().any_semantic(),
        symphony_r.writer,
        vec![],
        ctx.clone(),
        IndexHooks::none(),
    );
    let pod_watch = create_watch(
        pod_api,
        watcher::Config::default()
            .labels(&format!("{}={}", eno_api::MANAGER_LABEL, eno_api::MANAGER))
            .any_semantic(),
        pod_r.writer,
        vec![Reload::on_any(pod_reload_tx)],
        ctx.clone(),
        IndexHooks::none(),
    );

    let controllers = {
        let ctx = ctx.clone();
        let stores = stores.clone();
        async move {
            // The controllers start polling immediately so the shared
            // streams never back up; their reconcilers requeue until this
            // flag flips.
            let warmup = {
                let ctx = ctx.clone();
                let stores = stores.clone();
                async move {
                    stores.wait_until_ready().await;
                    ctx.caches_synced.store(true, Ordering::Relaxed);
                    info!(msg = "caches synced, indices populated");
                }
            };

            let scheduler = scheduler::run(
                ctx.clone(),
                composition_r.subscriber,
                stores.compositions.clone(),
                scheduler_reload_rx,
            );
            let pod_lifecycle = synthesis::run(
                ctx.clone(),
                composition_sub_pod,
                stores.compositions.clone(),
                pod_reload_rx,
            );
            let aggregator = slices::aggregator::run(
                ctx.clone(),
                composition_sub_aggregator,
                stores.compositions.clone(),
                slice_r.subscriber,
                aggregator_reload_rx,
            );
            let cleaner = slices::cleaner::run(
                ctx.clone(),
                slice_sub_cleaner,
                stores.slices.clone(),
                cleaner_reload_rx,
            );
            let symphony_controller = symphony::run(
                ctx.clone(),
                symphony_r.subscriber,
                stores.symphonies.clone(),
                composition_sub_symphony,
                symphony_reload_rx,
            );
            let fabric = inputs::run(ctx.clone(), synthesizer_sub_fabric);
            let watchdog_sweep = watchdog::run(ctx.clone());

            // the reconcilers stop on signal; the fabric and watchdog run
            // until then
            let reconcilers = async {
                tokio::join!(
                    warmup,
                    scheduler,
                    pod_lifecycle,
                    aggregator,
                    cleaner,
                    symphony_controller,
                );
            };
            tokio::select! {
                _ = reconcilers => {},
                _ = fabric => {},
                _ = watchdog_sweep => {},
            }
        }
    };

    tokio::select! {
        _ = controllers => {},
        _ = composition_watch => {},
        _ = synthesizer_watch => {},
        _ = slice_watch => {},
        _ = symphony_watch => {},
        _ = pod_watch => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pair_parses_bare_key() {
        let kv: KeyValuePair = "dedicated".parse().unwrap();
        assert_eq!(kv.key, "dedicated");
        assert_eq!(kv.value, None);
    }

    #[test]
    fn key_value_pair_parses_key_value() {
        let kv: KeyValuePair = "dedicated=eno".parse().unwrap();
        assert_eq!(kv.key, "dedicated");
        assert_eq!(kv.value.as_deref(), Some("eno"));
    }

    #[test]
    fn key_value_pair_rejects_empty_key() {
        assert!("".parse::<KeyValuePair>().is_err());
        assert!("=value".parse::<KeyValuePair>().is_err());
    }

    #[test]
    fn schedule_state_tracks_dispatches() {
        let schedule = ScheduleState::default();
        assert!(schedule.since_last_dispatch("syn").is_none());
        schedule.record_dispatch("syn");
        assert!(schedule.since_last_dispatch("syn").unwrap() < Duration::from_secs(1));
    }
}
