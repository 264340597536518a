//! Admin API for credential and task management
//!
//! Runs on its own listener (default 127.0.0.1:9090). Token values are never
//! returned; listings show masked ids. Path ids are raw keys, since the
//! operator holds them.
//!
//! Endpoints:
//! - GET  /health                             pool and queue health
//! - GET  /metrics                            Prometheus exposition
//! - GET  /admin/credentials                  list credentials with usage
//! - POST /admin/credentials                  add a credential
//! - POST /admin/credentials/{id}/reset       restore quota
//! - POST /admin/credentials/{id}/deactivate  take a key out of rotation
//! - POST /admin/credentials/reset-all        daily quota reset
//! - GET  /admin/pool                         pool status summary
//! - GET  /admin/tasks                        queue stats and live tasks
//! - POST /admin/tasks                        enqueue keywords
//! - POST /admin/flush                        flush buffered ledger operations

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use credential_pool::Pool;
use dispatcher::Dispatcher;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    pool: Arc<Pool>,
    dispatcher: Arc<Dispatcher>,
    prometheus: PrometheusHandle,
    default_quota: u64,
    started_at: Instant,
}

impl AdminState {
    pub fn new(
        pool: Arc<Pool>,
        dispatcher: Arc<Dispatcher>,
        prometheus: PrometheusHandle,
        default_quota: u64,
    ) -> Self {
        Self {
            pool,
            dispatcher,
            prometheus,
            default_quota,
            started_at: Instant::now(),
        }
    }
}

/// Build the admin router.
///
/// Applies a concurrency limit so a misbehaving client cannot pile up
/// requests against the pool lock.
pub fn build_admin_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route(
            "/admin/credentials",
            get(list_credentials).post(add_credential),
        )
        .route("/admin/credentials/reset-all", post(reset_all))
        .route("/admin/credentials/{id}/reset", post(reset_credential))
        .route(
            "/admin/credentials/{id}/deactivate",
            post(deactivate_credential),
        )
        .route("/admin/pool", get(pool_status))
        .route("/admin/tasks", get(list_tasks).post(enqueue_tasks))
        .route("/admin/flush", post(flush))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_response(status, serde_json::json!({ "error": message.into() }))
}

/// Map pool errors onto HTTP status codes.
fn pool_error_response(error: credential_pool::Error) -> Response {
    let status = match &error {
        credential_pool::Error::NotFound(_) => StatusCode::NOT_FOUND,
        credential_pool::Error::Duplicate(_) => StatusCode::CONFLICT,
        credential_pool::Error::PoolExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
        credential_pool::Error::Ledger(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(status, error.to_string())
}

/// Parse an optional JSON body. An empty body yields the default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, Response> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))
}

/// GET /health: 200 while any credential is active, 503 otherwise.
async fn health(State(state): State<AdminState>) -> Response {
    let mut body = state.pool.health().await;
    let stats = state.dispatcher.stats().await;
    let unhealthy = body["status"] == "unhealthy";

    body["uptime_seconds"] = state.started_at.elapsed().as_secs().into();
    body["paused_workers"] = state.dispatcher.paused_workers().into();
    body["tasks"] = serde_json::to_value(stats).unwrap_or_default();

    let status = if unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    json_response(status, body)
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_text(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// GET /admin/credentials: every credential with usage, ids masked.
async fn list_credentials(State(state): State<AdminState>) -> Response {
    let credentials: Vec<serde_json::Value> = state
        .pool
        .snapshot_with_usage()
        .await
        .into_iter()
        .map(|(credential, usage)| {
            serde_json::json!({
                "id": credential.masked_id(),
                "owner": credential.owner,
                "status": credential.status.label(),
                "remaining_quota": credential.remaining_quota,
                "last_updated_ms": credential.last_updated_ms,
                "deactivation_reason": credential.deactivation_reason,
                "total_charged": usage.total_charged,
                "charge_count": usage.charge_count,
            })
        })
        .collect();
    json_response(
        StatusCode::OK,
        serde_json::json!({ "credentials": credentials }),
    )
}

#[derive(Deserialize, Default)]
struct AddCredentialRequest {
    #[serde(default)]
    key: String,
    #[serde(default)]
    owner: Option<String>,
    #[serde(default)]
    quota: Option<u64>,
}

/// POST /admin/credentials: add a key, persisted before it enters rotation.
async fn add_credential(State(state): State<AdminState>, body: Bytes) -> Response {
    let request: AddCredentialRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let key = request.key.trim();
    if key.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "key must not be empty");
    }
    let quota = request.quota.unwrap_or(state.default_quota);

    match state.pool.add_credential(key, request.owner, quota).await {
        Ok(()) => {
            let id = common::mask(key);
            info!(credential = %id, quota, "credential added via admin API");
            json_response(
                StatusCode::CREATED,
                serde_json::json!({ "id": id, "status": "added", "remaining_quota": quota }),
            )
        }
        Err(e) => {
            warn!(error = %e, "failed to add credential");
            pool_error_response(e)
        }
    }
}

#[derive(Deserialize, Default)]
struct ResetRequest {
    #[serde(default)]
    quota: Option<u64>,
}

/// POST /admin/credentials/{id}/reset: restore quota (default quota if omitted).
async fn reset_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request: ResetRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let quota = request.quota.unwrap_or(state.default_quota);

    match state.pool.reset(&id, quota).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": common::mask(&id), "status": "reset", "remaining_quota": quota }),
        ),
        Err(e) => pool_error_response(e),
    }
}

#[derive(Deserialize, Default)]
struct DeactivateRequest {
    #[serde(default)]
    reason: Option<String>,
}

/// POST /admin/credentials/{id}/deactivate: remove a key from rotation.
async fn deactivate_credential(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Response {
    let request: DeactivateRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let reason = request
        .reason
        .unwrap_or_else(|| "deactivated by operator".to_string());

    match state.pool.deactivate(&id, &reason).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "id": common::mask(&id), "status": "deactivated" }),
        ),
        Err(e) => pool_error_response(e),
    }
}

/// POST /admin/credentials/reset-all: reset every non-deactivated credential.
async fn reset_all(State(state): State<AdminState>, body: Bytes) -> Response {
    let request: ResetRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let quota = request.quota.unwrap_or(state.default_quota);
    let reset = state.pool.reset_all(quota).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({ "reset": reset, "remaining_quota": quota }),
    )
}

/// GET /admin/pool: pool status summary (same shape as the health body).
async fn pool_status(State(state): State<AdminState>) -> Response {
    json_response(StatusCode::OK, state.pool.health().await)
}

/// GET /admin/tasks: queue counters plus pending and in-progress tasks.
async fn list_tasks(State(state): State<AdminState>) -> Response {
    let stats = state.dispatcher.stats().await;
    let tasks = state.dispatcher.queue().snapshot().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({ "stats": stats, "tasks": tasks }),
    )
}

#[derive(Deserialize, Default)]
struct EnqueueRequest {
    #[serde(default)]
    keywords: Vec<String>,
}

/// POST /admin/tasks: enqueue keywords. Duplicates of live tasks are rejected.
async fn enqueue_tasks(State(state): State<AdminState>, body: Bytes) -> Response {
    let request: EnqueueRequest = match parse_body(&body) {
        Ok(r) => r,
        Err(response) => return response,
    };

    let mut accepted = Vec::new();
    let mut rejected = Vec::new();
    for keyword in request.keywords {
        let keyword = keyword.trim().to_string();
        if keyword.is_empty() {
            continue;
        }
        if state.dispatcher.enqueue(keyword.clone()).await {
            accepted.push(keyword);
        } else {
            rejected.push(keyword);
        }
    }
    info!(
        accepted = accepted.len(),
        rejected = rejected.len(),
        "tasks enqueued via admin API"
    );
    json_response(
        StatusCode::ACCEPTED,
        serde_json::json!({ "accepted": accepted, "rejected": rejected }),
    )
}

/// POST /admin/flush: push buffered operations to the ledger now.
async fn flush(State(state): State<AdminState>) -> Response {
    match state.pool.flush().await {
        Ok(persisted) => json_response(
            StatusCode::OK,
            serde_json::json!({
                "persisted": persisted,
                "pending_ledger_ops": state.pool.pending_ops().await,
            }),
        ),
        Err(e) => {
            let pending = state.pool.pending_ops().await;
            json_response(
                StatusCode::SERVICE_UNAVAILABLE,
                serde_json::json!({ "error": e.to_string(), "pending_ledger_ops": pending }),
            )
        }
    }
}
