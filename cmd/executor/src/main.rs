use clap::{crate_description, crate_version, Parser};
use eno_executor::ExecutorEnv;
use kube::Client;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// In-pod entrypoint: wraps the user synthesizer for one synthesis
/// attempt. All coordinates come from the environment set by the pod
/// lifecycle controller; flags only tune logging.
#[derive(Parser, Debug)]
#[command(
    name = "eno-executor",
    about = crate_description!(),
    version = crate_version!(),
)]
struct Args {
    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`.
    #[arg(long, default_value = "info", env)]
    log_filter: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    // executor logs are scraped from the pod, always structured
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(EnvFilter::new(&args.log_filter))
        .init();

    let env = ExecutorEnv::from_env()?;
    let client = Client::try_default().await?;

    if let Err(err) = eno_executor::run(client, env).await {
        error!(msg = "synthesis attempt failed", %err, terminal = err.is_terminal());
        std::process::exit(1);
    }
    Ok(())
}
