//! Multi-chain faucet - native-currency payouts on several EVM networks
//!
//! Each chain gets its own nonce sequencer, fee strategy and confirmation
//! loop; payout requests arrive over a small JSON API.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

mod api;
mod chain;
mod config;
mod error;
mod metrics;
mod tx;

#[cfg(test)]
mod test_utils;

use api::AppState;
use chain::ChainManager;
use config::Settings;
use metrics::MetricsServer;
use tx::{TxSigner, WalletSigner};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting multichain faucet v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration for {} chains",
        settings.enabled_chains().len()
    );

    let signer: Arc<dyn TxSigner> =
        Arc::new(WalletSigner::from_env(&settings.faucet.private_key_env)?);
    info!("Faucet wallet {:?}", signer.address());

    // Initialize metrics server
    let metrics_server = if settings.metrics.enabled {
        Some(MetricsServer::new(settings.metrics.port))
    } else {
        None
    };

    // Connect chains and rebuild nonces from the nodes
    let chain_manager = Arc::new(ChainManager::new(&settings, signer).await?);
    info!(
        "Chain connections initialized: {:?}",
        chain_manager.connected_chains()
    );

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState::new(chain_manager.clone(), &settings.faucet);
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = metrics_server.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        })
    });

    // Background confirmed-nonce and balance resync
    let sync_handle = tokio::spawn({
        let chain_manager = chain_manager.clone();
        async move { chain_manager.run_sync().await }
    });

    info!("Multichain faucet is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown
    chain_manager.stop().await;

    // Abort background tasks
    api_handle.abort();
    sync_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("Multichain faucet stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,multichain_faucet=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
