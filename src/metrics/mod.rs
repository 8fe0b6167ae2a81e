//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transfer outcomes and latency
//! - Nonce positions and fee mode per chain
//! - Wallet balances and RPC errors

use crate::error::{FaucetError, FaucetResult};

use axum::{http::StatusCode, routing::get, Router};
use ethers::types::U256;
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Transfer metrics
    pub static ref TRANSFERS_REQUESTED: CounterVec = register_counter_vec!(
        "faucet_transfers_requested_total",
        "Total payouts requested",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFERS_CONFIRMED: CounterVec = register_counter_vec!(
        "faucet_transfers_confirmed_total",
        "Total payouts confirmed on chain",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFERS_FAILED: CounterVec = register_counter_vec!(
        "faucet_transfers_failed_total",
        "Total payouts that failed",
        &["chain_id"]
    ).unwrap();

    pub static ref BROADCASTS: CounterVec = register_counter_vec!(
        "faucet_broadcasts_total",
        "Signed variants accepted by the node",
        &["chain_id"]
    ).unwrap();

    pub static ref TRANSFER_LATENCY: HistogramVec = register_histogram_vec!(
        "faucet_transfer_latency_seconds",
        "Time from request to confirmation",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();

    // Chain metrics
    pub static ref PENDING_NONCE: GaugeVec = register_gauge_vec!(
        "faucet_pending_nonce",
        "Next nonce handed out to a transfer",
        &["chain_id"]
    ).unwrap();

    pub static ref CONFIRMED_NONCE: GaugeVec = register_gauge_vec!(
        "faucet_confirmed_nonce",
        "Next nonce expected on chain",
        &["chain_id"]
    ).unwrap();

    pub static ref FEE_MARKET: GaugeVec = register_gauge_vec!(
        "faucet_fee_market_enabled",
        "Fee mode (1=EIP-1559, 0=legacy)",
        &["chain_id"]
    ).unwrap();

    pub static ref RPC_ERRORS: CounterVec = register_counter_vec!(
        "faucet_rpc_errors_total",
        "RPC calls that failed after retries",
        &["chain_id", "operation"]
    ).unwrap();

    // Wallet metrics
    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "faucet_wallet_balance_eth",
        "Faucet wallet balance in native units",
        &["chain_id"]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> FaucetResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| FaucetError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| FaucetError::Internal(e.to_string()))
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// Encode every registered metric in the Prometheus text format
pub fn render() -> Result<String, String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

// Helper functions to record metrics

pub fn record_transfer_requested(chain_id: u64) {
    TRANSFERS_REQUESTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_confirmed(chain_id: u64) {
    TRANSFERS_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_transfer_failed(chain_id: u64) {
    TRANSFERS_FAILED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_broadcast(chain_id: u64) {
    BROADCASTS.with_label_values(&[&chain_id.to_string()]).inc();
}

pub fn record_transfer_latency(chain_id: u64, latency_secs: f64) {
    TRANSFER_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

pub fn record_nonces(chain_id: u64, pending: u64, confirmed: u64) {
    let label = chain_id.to_string();
    PENDING_NONCE.with_label_values(&[&label]).set(pending as f64);
    CONFIRMED_NONCE
        .with_label_values(&[&label])
        .set(confirmed as f64);
}

pub fn record_fee_mode(chain_id: u64, fee_market: bool) {
    FEE_MARKET
        .with_label_values(&[&chain_id.to_string()])
        .set(if fee_market { 1.0 } else { 0.0 });
}

pub fn record_rpc_error(chain_id: u64, operation: &str) {
    RPC_ERRORS
        .with_label_values(&[&chain_id.to_string(), operation])
        .inc();
}

pub fn record_wallet_balance(chain_id: u64, balance_wei: U256) {
    let balance = ethers::utils::format_ether(balance_wei)
        .parse::<f64>()
        .unwrap_or(f64::MAX);
    WALLET_BALANCE
        .with_label_values(&[&chain_id.to_string()])
        .set(balance);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_series() {
        record_transfer_requested(99_001);
        record_wallet_balance(99_001, U256::exp10(18) * 3);
        record_fee_mode(99_001, false);

        let text = render().unwrap();
        assert!(text.contains("faucet_transfers_requested_total{chain_id=\"99001\"}"));
        assert!(text.contains("faucet_wallet_balance_eth{chain_id=\"99001\"} 3"));
        assert!(text.contains("faucet_fee_market_enabled{chain_id=\"99001\"} 0"));
    }
}
