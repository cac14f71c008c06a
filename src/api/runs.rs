use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use pcc_common::{Run, RunCommand};

use super::{ApiError, SharedState};
use crate::orchestrator::EnqueueOutcome;

const DEFAULT_LOG_LINES: usize = 200;
const MAX_LOG_LINES: usize = 5_000;

#[derive(Deserialize)]
pub struct LogQuery {
    pub lines: Option<usize>,
}

#[derive(Deserialize)]
pub struct InputRequest {
    pub text: String,
}

#[derive(Serialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub commands: Vec<RunCommand>,
}

#[derive(Serialize)]
pub struct LogTail {
    pub run_id: String,
    pub lines: Vec<String>,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/work-orders/{id}/runs", post(enqueue_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/log", get(get_log))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/runs/{id}/input", post(provide_input))
}

/// 202 when the run started or queued, 409 when the budget denied it. The
/// body is the enqueue outcome either way so callers see the rescue offer.
async fn enqueue_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.orchestrator.enqueue(&id).await?;
    let status = match outcome {
        EnqueueOutcome::Denied { .. } => StatusCode::CONFLICT,
        EnqueueOutcome::Started { .. } | EnqueueOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.orchestrator.get(&id).await?;
    let commands = state.orchestrator.commands(&id).await?;
    Ok(Json(RunDetail { run, commands }))
}

async fn get_log(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);
    let lines = state.orchestrator.log_tail(&id, lines).await?;
    Ok(Json(LogTail { run_id: id, lines }))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.orchestrator.cancel(&id).await?))
}

async fn provide_input(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<InputRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.text.trim().is_empty() {
        return Err(ApiError::BadRequest("text is required".into()));
    }
    state.orchestrator.provide_input(&id, &req.text).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"run_id": id, "accepted": true})),
    ))
}
