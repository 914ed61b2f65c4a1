use actix_web::{
    get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer, Responder,
};
use eno_operator::controller::{self, KeyValuePair, OperatorConfig, State};
use eno_operator::telemetry;
use eno_k8s_util::client::new_client_with_metrics;

use std::time::Duration;

use clap::{crate_authors, crate_description, crate_version, CommandFactory, Parser, Subcommand};
use kube::{Config, CustomResourceExt};
use prometheus_client::registry::Registry;

#[get("/metrics")]
async fn metrics(c: Data<State>, _req: HttpRequest) -> impl Responder {
    match c.metrics() {
        Ok(metrics) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(metrics),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[get("/health")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/ready")]
async fn ready(c: Data<State>, _req: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json(c.diagnostics().await.last_event)
}

#[derive(Parser, Debug)]
#[command(
    name = "eno-controller",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Namespace executor pods are created in.
    #[arg(long, env = "POD_NAMESPACE")]
    synthesizer_pod_namespace: Option<String>,

    /// Image providing the eno-executor binary injected into synthesizer pods.
    #[arg(long, env = "EXECUTOR_IMAGE")]
    executor_image: Option<String>,

    /// Maximum number of compositions with an in-flight synthesis.
    #[arg(long, default_value_t = 10, env)]
    concurrency_limit: usize,

    /// Minimum interval between synthesis dispatches sharing a synthesizer.
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration, env)]
    rollout_cooldown: Duration,

    /// Age beyond which an in-flight synthesis is considered stuck.
    #[arg(long, default_value = "3m", value_parser = humantime::parse_duration, env)]
    watchdog_threshold: Duration,

    /// Grace period for the kubelet to acknowledge a new executor pod.
    #[arg(long, default_value = "3s", value_parser = humantime::parse_duration, env)]
    container_creation_ttl: Duration,

    /// Toleration for executor pods as key[=value]; key alone matches on presence. Repeatable.
    #[arg(long = "taint-toleration", value_parser = clap::value_parser!(KeyValuePair))]
    taint_tolerations: Vec<KeyValuePair>,

    /// Required node affinity for executor pods as key[=value]. Repeatable.
    #[arg(long = "node-affinity", value_parser = clap::value_parser!(KeyValuePair))]
    node_affinity: Vec<KeyValuePair>,

    /// Narrow the composition watch by label selector.
    #[arg(long, env)]
    composition_label_selector: Option<String>,

    /// Narrow the composition watch to one namespace.
    #[arg(long, env)]
    composition_namespace: Option<String>,

    /// Aggregate write budget of the input watch fabric, per second.
    #[arg(long, default_value_t = 5, env)]
    input_write_qps: u32,

    /// Address serving /metrics.
    #[arg(long, default_value = "0.0.0.0:8080", env)]
    metrics_addr: String,

    /// Address serving /health and /ready.
    #[arg(long, default_value = "0.0.0.0:8081", env)]
    health_probe_addr: String,

    /// Enable verbose logs.
    #[arg(long, default_value_t = false, env)]
    debug: bool,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,eno=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the CRD manifests for all Eno kinds.
    Crdgen,
}

fn crdgen() -> anyhow::Result<()> {
    let crds = [
        eno_api::Synthesizer::crd(),
        eno_api::Composition::crd(),
        eno_api::ResourceSlice::crd(),
        eno_api::Symphony::crd(),
    ];
    for crd in crds {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    if let Some(Command::Crdgen) = args.command {
        return crdgen();
    }

    telemetry::init(&telemetry::Settings {
        filter: args.log_filter.clone(),
        format: args.log_format.clone(),
        otlp_endpoint: args.tracing_url.clone(),
        sample_ratio: args.sample_ratio,
        debug: args.debug,
    })?;

    let Some(pod_namespace) = args.synthesizer_pod_namespace else {
        Args::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "--synthesizer-pod-namespace (or POD_NAMESPACE) is required",
            )
            .exit();
    };
    let Some(executor_image) = args.executor_image else {
        Args::command()
            .error(
                clap::error::ErrorKind::MissingRequiredArgument,
                "--executor-image (or EXECUTOR_IMAGE) is required",
            )
            .exit();
    };

    let config = OperatorConfig {
        pod_namespace,
        executor_image,
        concurrency_limit: args.concurrency_limit,
        rollout_cooldown: args.rollout_cooldown,
        watchdog_threshold: args.watchdog_threshold,
        container_creation_ttl: args.container_creation_ttl,
        taint_tolerations: args.taint_tolerations,
        node_affinity: args.node_affinity,
        composition_namespace: args.composition_namespace,
        composition_label_selector: args.composition_label_selector,
        input_write_qps: args.input_write_qps,
    };

    let mut registry = Registry::with_prefix("eno");
    let kube_config = Config::infer().await?;
    let client = new_client_with_metrics(kube_config, &mut registry).await?;
    let state = State::new(registry, config);

    let controllers = controller::run(state.clone(), client);

    let metrics_server = {
        let state = state.clone();
        HttpServer::new(move || {
            App::new()
                .app_data(Data::new(state.clone()))
                .wrap(middleware::Logger::default())
                .service(metrics)
        })
        .bind(&args.metrics_addr)?
        .shutdown_timeout(5)
    };
    let health_server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .service(health)
            .service(ready)
    })
    .bind(&args.health_probe_addr)?
    .shutdown_timeout(5);

    // All three implement graceful shutdown, so poll until everything is done
    let (_, metrics_result, health_result) =
        tokio::join!(controllers, metrics_server.run(), health_server.run());
    metrics_result?;
    health_result?;
    Ok(())
}
