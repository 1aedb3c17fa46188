//! Tessera control service binary.
//!
//! Runs the background worker and job queue, or a single job on demand.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tessera_control::service::shutdown_signal;
use tessera_control::{ControlConfig, ControlService};

#[derive(Parser)]
#[command(name = "tessera-control")]
#[command(about = "Provision and maintain Tessera runtime deployments")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "tessera.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the worker until SIGINT or SIGTERM (default)
    Run,

    /// Run one registered job and exit
    RunJob {
        /// Job name, e.g. reset_all_deployments
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("tessera_control=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Tessera control service starting");

    let config = ControlConfig::from_file(&cli.config)?;
    info!(
        config = %cli.config.display(),
        provisioners = config.provisioners.len(),
        queue = ?config.queue.backend,
        "configuration loaded"
    );

    if let Some(listen) = config.metrics.listen {
        PrometheusBuilder::new().with_http_listener(listen).install()?;
        info!(%listen, "metrics exporter listening");
    }

    let shutdown = CancellationToken::new();
    let service = ControlService::build(&config, shutdown.clone()).await?;

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let on_signal = shutdown.clone();
            tokio::spawn(async move {
                shutdown_signal(on_signal.clone()).await;
                on_signal.cancel();
            });
            service.run().await
        }
        Command::RunJob { name } => service.run_job(&name).await,
    };

    shutdown.cancel();
    if let Err(e) = result {
        error!(error = %e, "control service failed");
        return Err(e.into());
    }

    info!("control service shutdown complete");
    Ok(())
}
