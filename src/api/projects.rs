use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
};
use serde::Deserialize;
use tracing::{info, warn};

use pcc_common::ProjectStatus;

use super::{ApiError, SharedState, canonical_project};
use crate::store::NewProject;

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: ProjectStatus,
}

#[derive(Deserialize)]
pub struct CollapseRequest {
    /// The project that survives; the path id is folded into it.
    pub canonical: String,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project))
        .route("/api/projects/{id}/status", patch(update_status))
        .route("/api/projects/{id}/collapse", post(collapse_project))
}

async fn list_projects(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let projects = state.db.call(|db| db.list_projects()).await?;
    Ok(Json(projects))
}

async fn create_project(
    State(state): State<SharedState>,
    Json(req): Json<NewProject>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() || req.path.trim().is_empty() {
        return Err(ApiError::BadRequest("name and path are required".into()));
    }
    if !(1..=5).contains(&req.priority) {
        return Err(ApiError::BadRequest(format!(
            "priority must be between 1 and 5, got {}",
            req.priority
        )));
    }
    let project = state
        .db
        .call(move |db| {
            if let Some(id) = &req.id
                && db.resolve_canonical(id)?.is_some()
            {
                return Ok(Err(ApiError::Conflict(format!("Project {id} already exists"))));
            }
            Ok(Ok(db.create_project(&req)?))
        })
        .await??;
    info!(project_id = %project.id, name = %project.name, "Project created");
    Ok((StatusCode::CREATED, Json(project)))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let pid = canonical_project(&state, &id).await?;
    let project = state
        .db
        .call(move |db| db.get_project(&pid))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {id} not found")))?;
    Ok(Json(project))
}

async fn update_status(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pid = canonical_project(&state, &id).await?;
    let project = state
        .db
        .call(move |db| db.update_project_status(&pid, req.status))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Project {id} not found")))?;
    info!(project_id = %project.id, status = %project.status, "Project status changed");
    Ok(Json(project))
}

async fn collapse_project(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CollapseRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let duplicate = canonical_project(&state, &id).await?;
    let canonical = canonical_project(&state, &req.canonical).await?;
    if duplicate == canonical {
        return Err(ApiError::BadRequest(format!(
            "{id} and {} are already the same project",
            req.canonical
        )));
    }
    let (dup, canon) = (duplicate.clone(), canonical.clone());
    let summary = state
        .db
        .call(move |db| db.collapse_projects(&dup, &canon))
        .await?;
    warn!(
        duplicate = %duplicate,
        canonical = %canonical,
        work_items_moved = summary.work_items_moved,
        runs_moved = summary.runs_moved,
        "Project identity collapsed"
    );
    Ok(Json(summary))
}
