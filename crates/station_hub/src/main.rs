use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use shared::protocol::OrchestratorCommand;
use station_hub::{
    build_router,
    config::{load_settings, load_settings_from},
    demo::run_demo,
    OrchestratorHub,
};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "station-hub", about = "Serves station state to test consoles")]
struct Args {
    /// Settings file; defaults to ./station_hub.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides the bind address from settings.
    #[arg(long)]
    bind: Option<String>,
    /// Runs a scripted unit through the station after startup.
    #[arg(long)]
    demo: bool,
    /// Delay between scripted steps, in milliseconds.
    #[arg(long, default_value_t = 800)]
    demo_step_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(bind) = args.bind {
        settings.bind_addr = bind;
    }

    let addr: SocketAddr = settings
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address '{}'", settings.bind_addr))?;
    let hub = Arc::new(OrchestratorHub::new(settings));

    tokio::spawn(log_commands(hub.subscribe_commands()));
    if args.demo {
        tokio::spawn(run_demo(
            Arc::clone(&hub),
            Duration::from_millis(args.demo_step_ms),
        ));
    }

    let app = build_router(Arc::clone(&hub));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "station hub listening");
    let shutdown_hub = Arc::clone(&hub);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_hub.drop_connections();
        })
        .await?;
    info!("station hub stopped");
    Ok(())
}

async fn log_commands(mut commands: broadcast::Receiver<OrchestratorCommand>) {
    loop {
        match commands.recv().await {
            Ok(command) => info!(topic = %command.topic(), ?command, "console command"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "command log fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(%error, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
