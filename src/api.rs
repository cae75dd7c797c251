//! HTTP interface for task submission, status polling and operations. Thin
//! handlers over the stores and the signer session; every response is a JSON
//! body with camelCase keys so callers see one envelope regardless of route.

use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use anyhow::Context;

use crate::error::{RelayError, StoreError};
use crate::enclave::{SessionState, SignerSession};
use crate::settlement::{previous_utc_day, SettlementProcessor};
use crate::storage::{now_ms, RecordsDb, TaskRecord, TaskStatus};
use crate::submission::{SubmissionService, TaskRequest};

/// History responses cap out at the most recent entries per user.
pub const HISTORY_LIMIT: usize = 50;

const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct ApiState {
    pub records: RecordsDb,
    pub submission: SubmissionService,
    pub session: SignerSession,
    pub settlement: SettlementProcessor,
    pub api_key: String,
    pub restart_attempts: u32,
    pub restart_delay: Duration,
    pub started_at_ms: u64,
    /// CONFIRMED and FAILED records never change again, so status polls for
    /// them are served from here instead of hitting SQLite every time.
    pub terminal_tasks: Arc<DashMap<String, TaskRecord>>,
}

pub fn build_router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/execute", post(submit_task))
        .route("/execute/:task_id", get(task_status))
        .route("/users/:address/history", get(user_history))
        .route("/admin/session/restart", post(restart_session))
        .route("/settlement/run", post(run_settlement))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(
            CorsLayer::new()
                .allow_methods([Method::GET, Method::POST])
                .allow_origin(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve(
    state: ApiState,
    bind_addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding HTTP listener on {bind_addr}"))?;
    tracing::info!("[API] Listening on {}", bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            tracing::info!("[API] Shutting down HTTP listener");
        })
        .await
        .context("HTTP server terminated abnormally")?;
    Ok(())
}

// --- auth ----------------------------------------------------------------

async fn require_api_key(
    State(state): State<ApiState>,
    request: Request,
    next: Next,
) -> Response {
    if api_key_matches(request.headers(), &state.api_key) {
        next.run(request).await
    } else {
        json_error(StatusCode::UNAUTHORIZED, "invalid or missing API key").into_response()
    }
}

/// Accepts the key either as `x-api-key` or as a bearer token.
fn api_key_matches(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    if let Some(value) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        if value.trim() == expected {
            return true;
        }
    }
    if let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if token.trim() == expected {
                return true;
            }
        }
    }
    false
}

// --- handlers ------------------------------------------------------------

async fn submit_task(
    State(state): State<ApiState>,
    body: Option<Json<TaskRequest>>,
) -> (StatusCode, Json<Value>) {
    let Some(Json(request)) = body else {
        return json_error(StatusCode::BAD_REQUEST, "invalid JSON body");
    };
    match state.submission.submit(&request) {
        Ok(ack) => (StatusCode::ACCEPTED, Json(json!(ack))),
        Err(err) => relay_error_response(&err),
    }
}

async fn task_status(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> (StatusCode, Json<Value>) {
    if let Some(cached) = state.terminal_tasks.get(&task_id) {
        return (StatusCode::OK, Json(task_view(cached.value(), now_ms())));
    }

    match state.records.task_by_id(&task_id) {
        Ok(Some(task)) => {
            if task.status.is_terminal() {
                state.terminal_tasks.insert(task_id, task.clone());
            }
            (StatusCode::OK, Json(task_view(&task, now_ms())))
        }
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Task not found", "taskId": task_id })),
        ),
        Err(err) => {
            tracing::error!("[API] Status lookup for {} failed: {:#}", task_id, err);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to retrieve task status")
        }
    }
}

async fn user_history(
    State(state): State<ApiState>,
    Path(address): Path<String>,
) -> (StatusCode, Json<Value>) {
    let address = address.trim().to_ascii_lowercase();
    match state.records.user_task_history(&address, HISTORY_LIMIT) {
        Ok(tasks) => {
            let executions: Vec<Value> = tasks.iter().map(history_view).collect();
            (
                StatusCode::OK,
                Json(json!({
                    "userAddress": address,
                    "totalExecutions": executions.len(),
                    "executions": executions,
                })),
            )
        }
        Err(err) => {
            tracing::error!("[API] History lookup for {} failed: {:#}", address, err);
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "failed to retrieve execution history")
        }
    }
}

/// Unauthenticated probe endpoint. Reports "degraded" whenever the signer
/// session is anything but ready so load balancers can route around us
/// without being able to read task data.
async fn health(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    let session_state = state.session.state();
    let counts = match state.records.task_status_counts() {
        Ok(counts) => counts,
        Err(err) => {
            tracing::error!("[API] Health check could not read task counts: {:#}", err);
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "records store unavailable");
        }
    };

    let mut body = json!({
        "success": true,
        "status": if session_state.is_ready() { "ok" } else { "degraded" },
        "session": session_state.as_str(),
        "uptimeSeconds": now_ms().saturating_sub(state.started_at_ms) / 1000,
        "tasks": {
            "pending": counts.pending,
            "executing": counts.executing,
            "confirmed": counts.confirmed,
            "failed": counts.failed,
            "total": counts.total(),
        },
    });
    if let SessionState::Ready { signer_address } = &session_state {
        body["signerAddress"] = json!(signer_address);
    }
    (StatusCode::OK, Json(body))
}

async fn restart_session(State(state): State<ApiState>) -> (StatusCode, Json<Value>) {
    tracing::info!("[API] Session restart requested");
    let session_state = state
        .session
        .restart(state.restart_attempts, state.restart_delay)
        .await;
    let mut body = json!({
        "success": session_state.is_ready(),
        "session": session_state.as_str(),
    });
    if let SessionState::Ready { signer_address } = &session_state {
        body["signerAddress"] = json!(signer_address);
    }
    (StatusCode::OK, Json(body))
}

async fn run_settlement(
    State(state): State<ApiState>,
    body: Option<Json<Value>>,
) -> (StatusCode, Json<Value>) {
    let period = body
        .as_ref()
        .and_then(|Json(value)| value.get("period"))
        .and_then(|value| value.as_str())
        .map(str::trim)
        .filter(|period| !period.is_empty())
        .map(str::to_string)
        .unwrap_or_else(previous_utc_day);

    tracing::info!("[API] Manual settlement run for period {}", period);
    match state.settlement.run(&period) {
        Ok(summary) => {
            let mut body = json!(summary);
            body["success"] = json!(true);
            (StatusCode::OK, Json(body))
        }
        Err(err) => relay_error_response(&err),
    }
}

// --- views ---------------------------------------------------------------

fn task_view(task: &TaskRecord, now: u64) -> Value {
    let mut view = json!({
        "taskId": task.task_id,
        "status": task.status.as_str(),
        "userAddress": task.user_address,
        "action": task.action.as_str(),
        "asset": task.asset.as_str(),
        "amount": task.amount,
        "createdAt": iso_timestamp(task.created_at_ms),
        "elapsedSeconds": now.saturating_sub(task.created_at_ms) / 1000,
        "retryCount": task.retry_count,
    });
    match task.status {
        TaskStatus::Confirmed => {
            if let Some(hash) = &task.tx_hash {
                view["transactionHash"] = json!(hash);
            }
            if let Some(gas) = task.gas_used {
                view["gasUsed"] = json!(gas);
            }
            if let Some(block) = task.block_number {
                view["blockNumber"] = json!(block);
            }
        }
        TaskStatus::Failed => {
            if let Some(error) = &task.last_error {
                view["error"] = json!(error);
            }
        }
        _ => {}
    }
    view
}

fn history_view(task: &TaskRecord) -> Value {
    let mut view = json!({
        "taskId": task.task_id,
        "status": task.status.as_str(),
        "action": task.action.as_str(),
        "asset": task.asset.as_str(),
        "amount": task.amount,
        "createdAt": iso_timestamp(task.created_at_ms),
        "retryCount": task.retry_count,
    });
    match task.status {
        TaskStatus::Confirmed => {
            if let Some(hash) = &task.tx_hash {
                view["transactionHash"] = json!(hash);
            }
            if let Some(gas) = task.gas_used {
                view["gasUsed"] = json!(gas);
            }
        }
        TaskStatus::Failed => {
            if let Some(error) = &task.last_error {
                view["error"] = json!(error);
            }
        }
        _ => {}
    }
    view
}

fn iso_timestamp(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(i64::try_from(ms).unwrap_or(i64::MAX))
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}

fn json_error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "success": false, "error": message })))
}

fn relay_error_response(err: &RelayError) -> (StatusCode, Json<Value>) {
    let status = match err {
        RelayError::Validation(_) => StatusCode::BAD_REQUEST,
        RelayError::Store(StoreError::Contention { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("[API] Request failed: {:#}", err);
    }
    json_error(status, &err.to_string())
}
