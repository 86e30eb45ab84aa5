use anyhow::Result;
use clap::Parser;
use cos_core::CosEngine;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Chief-of-Staff supervisor daemon.
#[derive(Debug, Parser)]
#[command(name = "cos-core", version, about)]
struct Args {
    /// Directory holding the cos/ state tree.
    #[arg(long, env = "COS_DATA_ROOT", default_value = ".")]
    data_root: PathBuf,

    /// Do not start the scheduler even if config autoStart is set.
    #[arg(long)]
    no_autostart: bool,

    /// Log filter, e.g. "info" or "cos_core=debug".
    #[arg(long, env = "COS_LOG", default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; absence is not an error.
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting Chief-of-Staff supervisor");
    let engine = CosEngine::new(&args.data_root).await?;

    let auto_start = engine.get_config().await.auto_start;
    if auto_start && !args.no_autostart {
        engine.start().await?;
    } else {
        info!("scheduler idle; start it through the control surface");
    }

    wait_for_shutdown_signal().await;

    info!("shutdown signal received, draining");
    engine.shutdown().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
