//! Service binding operator - projects service credentials into workloads

mod controller_runner;
mod crds;

use std::time::Duration;

use clap::{Parser, Subcommand};
use kube::Client;

use bindings_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use bindings_common::REQUEUE_SUCCESS_SECS;

/// Service binding operator
#[derive(Parser, Debug)]
#[command(name = "bindings-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log line format (json or text)
    #[arg(long, env = "BINDINGS_LOG_FORMAT", default_value = "json", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controllers (default mode)
    Controller(ControllerArgs),
}

#[derive(clap::Args, Debug, Clone)]
struct ControllerArgs {
    /// Only watch resources in this namespace; all namespaces when unset
    #[arg(long, env = "BINDINGS_WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Install or update the CRDs on startup
    #[arg(
        long,
        env = "BINDINGS_INSTALL_CRDS",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    install_crds: bool,

    /// Seconds between resyncs of a healthy resource
    #[arg(long, env = "BINDINGS_REQUEUE_SECS", default_value_t = REQUEUE_SUCCESS_SECS)]
    requeue_secs: u64,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        Self {
            namespace: None,
            install_crds: true,
            requeue_secs: REQUEUE_SUCCESS_SECS,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        println!("{}", crds::render_crds()?);
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        service_name: "bindings-operator".to_string(),
        format: cli.log_format,
    })?;

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!(
        namespace = args.namespace.as_deref().unwrap_or("*"),
        requeue_secs = args.requeue_secs,
        "bindings controller starting"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    if args.install_crds {
        crds::ensure_crds_installed(&client).await?;
    }

    let resync = Duration::from_secs(args.requeue_secs);
    let controllers =
        controller_runner::build_controllers(client, args.namespace.as_deref(), resync);

    tracing::info!(count = controllers.len(), "controllers started");
    futures::future::join_all(controllers).await;
    tracing::info!("controllers stopped");
    Ok(())
}
