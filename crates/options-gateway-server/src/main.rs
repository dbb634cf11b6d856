//! options-gateway: session-based option market data gateway.
//!
//! Serves the tool-call protocol over HTTP and WebSocket, keeps one upstream
//! connection per client session and expires sessions left idle.

mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use cli::Cli;
use options_gateway_session::{SessionFacade, SimulatedMarket};
use options_gateway_transport::{Dispatcher, create_router};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)))
        .init();

    let session_config = cli.session_config().context("invalid session configuration")?;
    let gateway_config = cli.gateway_config();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        ibkr_host = %gateway_config.host,
        ibkr_port = gateway_config.port,
        client_id = gateway_config.client_id,
        market_data = %gateway_config.market_data_mode,
        session_timeout_secs = session_config.session_timeout.as_secs(),
        max_sessions = session_config.max_active_sessions,
        "Starting options gateway"
    );
    tracing::warn!("Serving quotes from the simulated market; no broker gateway is contacted");

    let facade = SessionFacade::with_source(
        session_config,
        gateway_config,
        Arc::new(SimulatedMarket::new()),
    );
    let reaper = facade.reaper().spawn();
    let dispatcher =
        Dispatcher::new(facade.clone()).with_default_strike_count(cli.default_strike_count);
    let app = create_router(Arc::new(dispatcher));

    let addr = cli.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!("Server listening on http://{addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    reaper.shutdown().await;
    let drained = facade.shutdown().await;
    tracing::info!(drained, "Options gateway stopped");

    served.context("server error")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
