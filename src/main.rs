mod api;
mod bootstrap;
mod config;
mod error;
mod execution;
mod ledger;
mod middleware;
mod server;
mod settlement;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,fee_settlement_broker=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = config::Config::from_env().context("loading configuration")?;

    init_tracing();
    info!("🚀 Starting fee settlement broker");

    let app = bootstrap::initialize_app(&config)
        .await
        .context("initializing application")?;

    // Create HTTP server
    let router = server::create_app(app.state);

    let shutdown = app.shutdown;
    let serve = server::run_server(router, &config.bind_address, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("❌ Failed to listen for shutdown signal: {}", e);
        }
        info!("🛑 Shutdown signal received");
    });
    serve.await.context("running HTTP server")?;

    // Let the scheduler finish its current round
    shutdown.send_replace(true);
    if let Err(e) = app.scheduler.await {
        error!("❌ Settlement scheduler ended abnormally: {}", e);
    }

    info!("👋 Broker stopped");
    Ok(())
}
