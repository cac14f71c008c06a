//! HTTP control plane.
//!
//! One axum router over the shared services, plus `/ws` forwarding the event
//! bus. Every error leaves as `{"error": "..."}` with a 400, 404, 409 or 500.

mod infra;
mod projects;
mod runs;
mod shifts;
mod work_items;
pub mod ws;

use std::sync::Arc;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::error;

use crate::budget::BudgetGovernor;
use crate::errors::{
    BudgetError, PortfolioError, RunError, ShiftError, VmError, WorkItemError,
};
use crate::events::EventBus;
use crate::orchestrator::RunOrchestrator;
use crate::portfolio::Portfolio;
use crate::shift::{SessionCoordinator, ShiftScheduler};
use crate::store::DbHandle;
use crate::vm::VmManager;
use crate::work_items::WorkItemStore;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: EventBus,
    pub work_items: WorkItemStore,
    pub orchestrator: RunOrchestrator,
    pub vm: VmManager,
    pub budget: BudgetGovernor,
    pub shifts: ShiftScheduler,
    pub sessions: SessionCoordinator,
    pub portfolio: Portfolio,
}

pub type SharedState = Arc<AppState>;

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self::Internal(format!("{e:#}"))
    }
}

impl From<WorkItemError> for ApiError {
    fn from(e: WorkItemError) -> Self {
        let msg = e.to_string();
        match e {
            WorkItemError::NotFound { .. } | WorkItemError::ProjectNotFound { .. } => {
                Self::NotFound(msg)
            }
            WorkItemError::InvalidTransition { .. }
            | WorkItemError::DependenciesNotDone { .. }
            | WorkItemError::DuplicateId { .. }
            | WorkItemError::Conflict { .. } => Self::Conflict(msg),
            WorkItemError::DependencyCycle { .. }
            | WorkItemError::UnknownDependency { .. }
            | WorkItemError::InvalidSpec(_) => Self::BadRequest(msg),
            WorkItemError::Other(e) => e.into(),
        }
    }
}

impl From<BudgetError> for ApiError {
    fn from(e: BudgetError) -> Self {
        let msg = e.to_string();
        match e {
            BudgetError::ProjectNotFound { .. } => Self::NotFound(msg),
            BudgetError::InvalidAmount { .. } => Self::BadRequest(msg),
            BudgetError::Other(e) => e.into(),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        let msg = e.to_string();
        match e {
            RunError::NotFound { .. } => Self::NotFound(msg),
            RunError::NotReady { .. }
            | RunError::AlreadyActive { .. }
            | RunError::AlreadyFinished { .. }
            | RunError::NotWaitingForInput { .. } => Self::Conflict(msg),
            RunError::WorkItem(e) => e.into(),
            RunError::Budget(e) => e.into(),
            RunError::Other(e) => e.into(),
        }
    }
}

impl From<VmError> for ApiError {
    fn from(e: VmError) -> Self {
        let msg = e.to_string();
        match e {
            VmError::ProjectNotFound { .. } => Self::NotFound(msg),
            VmError::InvalidState { .. } => Self::Conflict(msg),
            VmError::OperationFailed { .. } => Self::Internal(msg),
            VmError::Other(e) => e.into(),
        }
    }
}

impl From<ShiftError> for ApiError {
    fn from(e: ShiftError) -> Self {
        let msg = e.to_string();
        match e {
            ShiftError::ProjectNotFound { .. } | ShiftError::NoSession => Self::NotFound(msg),
            ShiftError::AlreadyActive { .. } | ShiftError::InvalidSessionState { .. } => {
                Self::Conflict(msg)
            }
            ShiftError::Run(e) => e.into(),
            ShiftError::Other(e) => e.into(),
        }
    }
}

impl From<PortfolioError> for ApiError {
    fn from(e: PortfolioError) -> Self {
        let msg = e.to_string();
        match e {
            PortfolioError::Invalid(_) => Self::BadRequest(msg),
            PortfolioError::ProjectNotFound { .. }
            | PortfolioError::CommunicationNotFound { .. }
            | PortfolioError::EscalationNotFound { .. } => Self::NotFound(msg),
            PortfolioError::WorkItem(e) => e.into(),
            PortfolioError::Shift(e) => e.into(),
            PortfolioError::Budget(e) => e.into(),
            PortfolioError::Other(e) => e.into(),
        }
    }
}

/// Parse a snake_case enum from a query or body string, as a 400 on failure.
fn parse_enum<T>(raw: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse().map_err(ApiError::BadRequest)
}

/// Follow project aliases to the live id, or 404.
async fn canonical_project(state: &AppState, project_id: &str) -> Result<String, ApiError> {
    let key = project_id.to_string();
    state
        .db
        .call(move |db| db.resolve_canonical(&key))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {project_id} not found")))
}

// ── Router ────────────────────────────────────────────────────────────

/// Every route of the control plane, including `/ws`.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws::ws_handler))
        .merge(projects::routes())
        .merge(work_items::routes())
        .merge(runs::routes())
        .merge(infra::routes())
        .merge(shifts::routes())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}
