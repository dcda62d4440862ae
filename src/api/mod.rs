//! HTTP API for submitting intents, querying transactions, and monitoring

use crate::config::ApiConfig;
use crate::error::{TxmError, TxmResult};
use crate::txm::{NewTransaction, StateCounts, Transaction, Txm};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use uuid::Uuid;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub txm: Arc<Txm>,
}

pub fn router(txm: Arc<Txm>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/transactions", post(create_transaction))
        .route("/transactions/:id", get(get_transaction))
        .route("/metrics", get(crate::metrics::metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(AppState { txm })
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, txm: Arc<Txm>) -> TxmResult<()> {
    let app = router(txm);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| TxmError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| TxmError::Internal(e.to_string()))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store and chain reachable
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let result = state.txm.ready().await;
    let status = if result.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: result.is_ok(),
            chain_id: state.txm.chain_id(),
            keys: state.txm.keys().len(),
            error: result.err().map(|e| e.to_string()),
        }),
    )
}

/// Transaction counts per state
async fn get_stats(State(state): State<AppState>) -> Result<Json<StateCounts>, ApiError> {
    Ok(Json(state.txm.state_counts().await?))
}

async fn create_transaction(
    State(state): State<AppState>,
    Json(request): Json<NewTransaction>,
) -> Result<Response, ApiError> {
    let (tx, created) = state.txm.create_transaction(request).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(tx)).into_response())
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Transaction>, ApiError> {
    state
        .txm
        .transaction(id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(TxmError::TransactionNotFound { tx_id: id }))
}

/// Maps manager errors onto HTTP statuses
pub struct ApiError(TxmError);

impl From<TxmError> for ApiError {
    fn from(e: TxmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TxmError::IdempotencyConflict { .. } => StatusCode::CONFLICT,
            TxmError::InvalidRequest(_) | TxmError::UnknownKey(_) => StatusCode::BAD_REQUEST,
            TxmError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
            e if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("API request failed: {}", self.0);
        }

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

// Response types

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    chain_id: u64,
    keys: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txm::testing::{test_config, Harness};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn post_json(body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/transactions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_submit_replay_and_conflict() {
        let h = Harness::new();
        let app = router(Arc::new(Txm::new(h.collaborators(), &test_config())));
        let intent = serde_json::json!({
            "from": format!("{:?}", h.from),
            "to": "0x4242424242424242424242424242424242424242",
            "data": "0x01",
            "gas_limit": 21000,
            "idempotency_key": "job-7",
        });

        let created = app.clone().oneshot(post_json(intent.clone())).await.unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let body = json_body(created).await;
        assert_eq!(body["state"], "unstarted");
        let id = body["id"].as_str().unwrap().to_string();

        let replay = app.clone().oneshot(post_json(intent.clone())).await.unwrap();
        assert_eq!(replay.status(), StatusCode::OK);
        assert_eq!(json_body(replay).await["id"], id.as_str());

        let mut changed = intent;
        changed["data"] = serde_json::json!("0x02");
        let conflict = app.clone().oneshot(post_json(changed)).await.unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);

        let fetched = app
            .oneshot(
                Request::builder()
                    .uri(format!("/transactions/{}", id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(fetched.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_transaction_and_sender() {
        let h = Harness::new();
        let app = router(Arc::new(Txm::new(h.collaborators(), &test_config())));

        let missing = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/transactions/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let stranger = app
            .oneshot(post_json(serde_json::json!({
                "from": "0x0909090909090909090909090909090909090909",
                "to": "0x4242424242424242424242424242424242424242",
                "gas_limit": 21000,
            })))
            .await
            .unwrap();
        assert_eq!(stranger.status(), StatusCode::BAD_REQUEST);
    }
}
