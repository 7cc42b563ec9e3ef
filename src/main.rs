use std::path::PathBuf;

use clap::Parser;
use kairos::app::App;
use kairos::config::load_config;
use kairos::shutdown::Shutdown;
use kairos::utils::spawn_or_abort;
use kairos::{logging, server};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "kairos", version, about = "Knowledge-protocol server")]
struct Cli {
    /// Path to an optional TOML config file; environment variables override
    /// its values.
    #[arg(long, env = "KAIROS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    logging::init(&config.service)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.service.service_name,
        "Starting kairos"
    );

    let shutdown = Shutdown::new();
    shutdown.watch_signals();

    let app = App::new(config.clone()).await?;
    if let Err(error) = app.init().await {
        warn!(%error, "Startup initialization failed, continuing degraded");
    }

    let metrics = spawn_or_abort(server::run_metrics(
        config.server.metrics_address,
        shutdown.clone(),
    ));

    server::run(app, config.server.clone(), shutdown.clone()).await?;

    // Redundant when a signal triggered the stop; required when the server
    // returned by itself.
    shutdown.shutdown();

    info!("Stopping metrics server");
    metrics.await?;

    info!("Program terminating normally");
    Ok(())
}
