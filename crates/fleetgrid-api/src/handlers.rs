//! REST API handlers for rollout management.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use fleetgrid_rollout::{AgentReport, CreateRollout, RolloutError};
use serde::Deserialize;
use tracing::{error, info};

use crate::ApiState;

/// Seconds a client should wait before retrying a busy rollout.
const BUSY_RETRY_AFTER_SECS: &str = "1";

/// Standard API response wrapper.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn status_for(err: &RolloutError) -> StatusCode {
    match err {
        RolloutError::ReleaseNotFound(_)
        | RolloutError::ReleaseNotEligible { .. }
        | RolloutError::InvalidStrategy(_)
        | RolloutError::InvalidAction(_)
        | RolloutError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
        RolloutError::NotFound(_) | RolloutError::AgentNotFound { .. } => StatusCode::NOT_FOUND,
        RolloutError::Conflict { .. } => StatusCode::CONFLICT,
        RolloutError::Busy(_) => StatusCode::SERVICE_UNAVAILABLE,
        RolloutError::Registry(_) => StatusCode::BAD_GATEWAY,
        RolloutError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Map a controller error onto its HTTP status and envelope.
fn rollout_error(err: RolloutError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() && !matches!(err, RolloutError::Busy(_)) {
        error!(error = %err, "request failed");
    }

    let mut resp = error_response(&err.to_string(), status);
    if matches!(err, RolloutError::Busy(_)) {
        resp.headers_mut().insert(
            header::RETRY_AFTER,
            HeaderValue::from_static(BUSY_RETRY_AFTER_SECS),
        );
    }
    resp
}

fn bad_body(rejection: JsonRejection) -> Response {
    error_response(&rejection.body_text(), StatusCode::BAD_REQUEST)
}

/// Request body to roll back a rollout.
#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub reason: String,
}

// ── Rollouts ───────────────────────────────────────────────────────

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> impl IntoResponse {
    match state.controller.list() {
        Ok(rollouts) => ApiResponse::ok(rollouts).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts
pub async fn create_rollout(
    State(state): State<ApiState>,
    payload: Result<Json<CreateRollout>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.controller.create(req).await {
        Ok(rollout) => {
            info!(rollout = %rollout.id, "rollout created via API");
            (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response()
        }
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/rollouts/{id}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.get(&id) {
        Ok(detail) => ApiResponse::ok(detail).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/rollouts/{id}/agents
pub async fn list_agents(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.get(&id) {
        Ok(detail) => ApiResponse::ok(detail.agents).into_response(),
        Err(e) => rollout_error(e),
    }
}

// ── Operator actions ───────────────────────────────────────────────

/// POST /api/v1/rollouts/{id}/pause
pub async fn pause_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.pause(&id).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts/{id}/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.resume(&id).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts/{id}/advance
pub async fn advance_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.controller.advance(&id).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts/{id}/rollback
pub async fn rollback_rollout(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: Result<Json<RollbackRequest>, JsonRejection>,
) -> impl IntoResponse {
    let Json(req) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.controller.rollback(&id, &req.reason).await {
        Ok(rollout) => ApiResponse::ok(rollout).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// POST /api/v1/rollouts/{id}/agents/{agent_id}/report
pub async fn report_agent(
    State(state): State<ApiState>,
    Path((id, agent_id)): Path<(String, String)>,
    payload: Result<Json<AgentReport>, JsonRejection>,
) -> impl IntoResponse {
    let Json(report) = match payload {
        Ok(body) => body,
        Err(rejection) => return bad_body(rejection),
    };
    match state.controller.report(&id, &agent_id, report).await {
        Ok(row) => ApiResponse::ok(row).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    ApiResponse::ok("ok")
}
