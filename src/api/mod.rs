//! HTTP API for payout requests, health checks and chain status

use crate::chain::{ChainManager, ChainSummary};
use crate::config::{ApiConfig, FaucetConfig};
use crate::error::{FaucetError, FaucetResult};
use crate::tx::TransferOutcome;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub chain_manager: Arc<ChainManager>,
    pub cooldown: chrono::Duration,
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(chain_manager: Arc<ChainManager>, faucet: &FaucetConfig) -> Self {
        Self {
            chain_manager,
            cooldown: chrono::Duration::seconds(faucet.cooldown_secs as i64),
            request_timeout: Duration::from_secs(faucet.request_timeout_secs),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/chains", get(get_chains))
        .route("/request", post(request_funds))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> FaucetResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| FaucetError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| FaucetError::Internal(e.to_string()))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Status of every configured chain
async fn get_chains(State(state): State<AppState>) -> impl IntoResponse {
    Json(ChainsResponse {
        chains: state.chain_manager.statuses().await,
    })
}

/// Pay out to `address` on `chain`, subject to the per-requester cooldown
async fn request_funds(
    State(state): State<AppState>,
    Json(request): Json<FundsRequest>,
) -> Result<Response, FaucetError> {
    let chain = state.chain_manager.get(&request.chain)?;
    let address: Address = request
        .address
        .trim()
        .parse()
        .map_err(|_| FaucetError::InvalidAddress(request.address.clone()))?;

    chain
        .state
        .try_claim_requester(address, Utc::now(), state.cooldown)
        .map_err(|remaining_secs| FaucetError::Cooldown {
            address: format!("{:?}", address),
            remaining_secs,
        })?;

    let request_id = Uuid::new_v4();
    info!(
        "Request {} for {:?} on {} accepted",
        request_id, address, chain.key
    );

    // The transfer owns its nonce; it must run to the end even if the caller goes away
    let task = tokio::spawn({
        let chain = chain.clone();
        async move {
            let outcome = chain.sender.send(address).await;
            if let TransferOutcome::Failed(_) = outcome {
                chain.state.release_requester(&address);
            }
            outcome
        }
        .instrument(tracing::info_span!("transfer", %request_id))
    });

    let outcome = match tokio::time::timeout(state.request_timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(e)) => {
            chain.state.release_requester(&address);
            return Err(FaucetError::Internal(format!("Transfer task failed: {}", e)));
        }
        Err(_) => {
            warn!("Request {} still pending after {:?}", request_id, state.request_timeout);
            let body = FundsResponse {
                request_id,
                status: "pending",
                tx_hash: None,
                explorer_urls: vec![],
                error: None,
            };
            return Ok((StatusCode::ACCEPTED, Json(body)).into_response());
        }
    };

    match outcome {
        TransferOutcome::Confirmed(hash) => {
            let explorer_urls = chain
                .config
                .explorer_urls
                .iter()
                .map(|base| format!("{}{:?}", base, hash))
                .collect();
            let body = FundsResponse {
                request_id,
                status: "confirmed",
                tx_hash: Some(format!("{:?}", hash)),
                explorer_urls,
                error: None,
            };
            Ok((StatusCode::OK, Json(body)).into_response())
        }
        TransferOutcome::Failed(reason) => {
            let dry = FaucetError::FaucetDry {
                chain_id: chain.config.chain_id,
            };
            let status = if reason == dry.to_string() {
                StatusCode::SERVICE_UNAVAILABLE
            } else {
                StatusCode::BAD_GATEWAY
            };
            let body = FundsResponse {
                request_id,
                status: "failed",
                tx_hash: None,
                explorer_urls: vec![],
                error: Some(reason),
            };
            Ok((status, Json(body)).into_response())
        }
    }
}

impl IntoResponse for FaucetError {
    fn into_response(self) -> Response {
        let status = match &self {
            FaucetError::ChainNotFound(_) => StatusCode::NOT_FOUND,
            FaucetError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
            FaucetError::Cooldown { .. } => StatusCode::TOO_MANY_REQUESTS,
            FaucetError::FaucetDry { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FaucetError::Rpc { .. } if self.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            FaucetError::Rpc { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.should_alert() {
            error!("{}", self);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

// Request and response types

#[derive(Debug, Deserialize)]
struct FundsRequest {
    chain: String,
    address: String,
}

#[derive(Debug, Serialize)]
struct FundsResponse {
    request_id: Uuid,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    tx_hash: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    explorer_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ChainsResponse {
    chains: Vec<ChainSummary>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ChainConfig, SenderConfig};
    use crate::test_utils::{ether, FakeNode, FakeRpc, Mining, RecordingSigner};

    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    const REQUESTER: &str = "0x70997970C51812dc3A010C7d01b50e0d17dc79C8";

    async fn app_with(node: FakeNode, request_timeout: Duration) -> (Router, Arc<ChainManager>) {
        let manager = Arc::new(ChainManager::empty(&SenderConfig::default()));
        manager
            .add_chain(
                "sepolia",
                ChainConfig {
                    chain_id: 11155111,
                    name: "Sepolia".to_string(),
                    rpc_url: "http://localhost:8545".to_string(),
                    symbol: "ETH".to_string(),
                    explorer_urls: vec!["https://sepolia.etherscan.io/tx/".to_string()],
                    enabled: true,
                },
                FakeRpc::new(node),
                RecordingSigner::new(),
                SenderConfig::default(),
                ether(1),
            )
            .await
            .unwrap();

        let state = AppState {
            chain_manager: manager.clone(),
            cooldown: chrono::Duration::hours(24),
            request_timeout,
        };
        (router(state), manager)
    }

    fn post_request(chain: &str, address: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/request")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "chain": chain, "address": address }).to_string(),
            ))
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app_with(FakeNode::default(), Duration::from_secs(120)).await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_chains_lists_status() {
        let (app, _) = app_with(FakeNode::default(), Duration::from_secs(120)).await;
        let response = app
            .oneshot(Request::get("/chains").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = body_json(response).await;
        let chain = &body["chains"][0];
        assert_eq!(chain["key"], "sepolia");
        assert_eq!(chain["chain_id"], 11155111);
        assert_eq!(chain["fee_market"], true);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_pays_out_then_enforces_cooldown() {
        let (app, manager) = app_with(FakeNode::default(), Duration::from_secs(120)).await;

        let response = app
            .clone()
            .oneshot(post_request("sepolia", REQUESTER))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "confirmed");
        let hash = body["tx_hash"].as_str().unwrap().to_string();
        assert_eq!(
            body["explorer_urls"][0],
            format!("https://sepolia.etherscan.io/tx/{hash}")
        );

        let response = app.oneshot(post_request("sepolia", REQUESTER)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(manager.get("sepolia").unwrap().state.confirmed_nonce(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_payout_releases_cooldown() {
        let node = FakeNode {
            balance: ether(1),
            ..FakeNode::default()
        };
        let (app, manager) = app_with(node, Duration::from_secs(120)).await;

        let response = app
            .clone()
            .oneshot(post_request("sepolia", REQUESTER))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["error"], "Faucet is dry");
        assert_eq!(
            manager.get("sepolia").unwrap().state.requester_count(),
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_payout_reports_pending() {
        let node = FakeNode {
            mining: Mining::Never,
            ..FakeNode::default()
        };
        let (app, manager) = app_with(node, Duration::from_secs(5)).await;

        let response = app.oneshot(post_request("sepolia", REQUESTER)).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(body_json(response).await["status"], "pending");
        // Claim is kept while the transfer is still running
        assert_eq!(
            manager.get("sepolia").unwrap().state.requester_count(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejects_unknown_chain_and_bad_address() {
        let (app, _) = app_with(FakeNode::default(), Duration::from_secs(120)).await;

        let response = app
            .clone()
            .oneshot(post_request("mainnet", REQUESTER))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app.oneshot(post_request("sepolia", "0x1234")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("Invalid address"));
    }
}
