use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::AppConfig;
use crate::handlers;
use crate::state::AppState;

#[derive(Parser)]
#[command(name = "vpnshop-server")]
#[command(about = "VPN storefront commerce server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Webhook HTTP server plus job worker and cleanup scheduler
    Serve,
    /// Job worker and cleanup scheduler only
    Worker,
    /// Apply pending database migrations and exit
    Migrate,
    /// Run the expired-subscription cleanup once
    Cleanup,
}

pub async fn run(cli: Cli, config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Serve => serve(config, shutdown).await,
        Commands::Worker => worker(config, shutdown).await,
        Commands::Migrate => migrate(&config).await,
        Commands::Cleanup => cleanup(config, shutdown).await,
    }
}

async fn serve(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen_addr {}", config.listen_addr))?;
    let state = AppState::connect(config, shutdown.clone()).await?;
    let background = state.spawn_background();

    let app = handlers::router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    futures::future::join_all(background).await;
    info!("Server stopped");
    Ok(())
}

async fn worker(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let state = AppState::connect(config, shutdown).await?;
    futures::future::join_all(state.spawn_background()).await;
    info!("Worker stopped");
    Ok(())
}

async fn migrate(config: &AppConfig) -> Result<()> {
    let pool = vpnshop_db::db::init_db(&config.database_url, 1).await?;
    vpnshop_db::db::migrate(&pool).await?;
    info!("Migrations applied");
    Ok(())
}

async fn cleanup(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let state = AppState::connect(config, shutdown.clone()).await?;
    let report = state
        .cleanup_scheduler()
        .run(&shutdown)
        .await
        .context("Cleanup run failed")?;
    info!(
        "Cleanup: {} deleted, {} failed{}",
        report.deleted,
        report.failed,
        if report.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}
