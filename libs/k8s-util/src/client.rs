use crate::metrics::MetricsLayer;

use hyper_util::rt::TokioExecutor;
use kube::Result;
use kube::{client::ConfigExt, Client, Config};
use prometheus_client::registry::Registry;
use tower::ServiceBuilder;

/// Build a client whose HTTP layer reports request durations and status
/// codes to the given registry. Every Eno binary goes through this so API
/// server traffic is observable per process.
pub async fn new_client_with_metrics(config: Config, registry: &mut Registry) -> Result<Client> {
    let base_path = config.cluster_url.path().trim_end_matches('/').to_owned();
    let metrics_layer = MetricsLayer::new(registry, Some(base_path));
    let https = config.rustls_https_connector()?;
    let service = ServiceBuilder::new()
        .layer(metrics_layer)
        .layer(config.base_uri_layer())
        .option_layer(config.auth_layer()?)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(Client::new(service, config.default_namespace))
}
