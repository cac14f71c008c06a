//! Shifts, the global session, and the portfolio queues.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use pcc_common::{ActionItem, NewCommunication, Shift};

use super::{ApiError, SharedState};
use crate::errors::ShiftError;
use crate::shift::ShiftContext;

const DEFAULT_HANDOFF_LIMIT: u32 = 10;

#[derive(Serialize)]
pub struct ShiftView {
    pub active: Option<Shift>,
    pub context: ShiftContext,
}

#[derive(Deserialize, Default)]
pub struct StartShiftRequest {
    #[serde(default)]
    pub goals: Option<Vec<String>>,
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct EscalationQuery {
    pub project_id: Option<String>,
    /// Defaults to open escalations only.
    pub open: Option<bool>,
}

#[derive(Deserialize)]
pub struct CommunicationQuery {
    pub project_id: Option<String>,
    #[serde(default)]
    pub unacknowledged: bool,
    pub limit: Option<u32>,
}

#[derive(Deserialize)]
pub struct BriefingRequest {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/projects/{id}/shift", get(get_shift).post(start_shift))
        .route("/api/projects/{id}/handoffs", get(list_handoffs))
        .route("/api/escalations", get(list_escalations))
        .route("/api/escalations/{id}/resolve", post(resolve_escalation))
        .route("/api/communications", get(list_communications))
        .route(
            "/api/communications/{id}/acknowledge",
            post(acknowledge_communication),
        )
        .route(
            "/api/projects/{id}/communications",
            post(post_communication),
        )
        .route("/api/action-items", post(apply_action))
        .route("/api/session", get(get_session))
        .route("/api/session/briefing", post(session_briefing))
        .route("/api/session/confirm", post(session_confirm))
        .route("/api/session/resume", post(session_resume))
        .route("/api/session/stop", post(session_stop))
        .route("/api/global/context", get(global_context))
}

/// Goals of the current session, used when a caller gives none.
async fn session_goals(state: &SharedState) -> Result<Vec<String>, ApiError> {
    Ok(state
        .sessions
        .current()
        .await?
        .map(|s| s.goals)
        .unwrap_or_default())
}

async fn get_shift(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let goals = session_goals(&state).await?;
    let context = state.shifts.context(&id, &goals).await?;
    let active = state.shifts.active(&context.project.id).await?;
    Ok(Json(ShiftView { active, context }))
}

async fn start_shift(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Option<Json<StartShiftRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    let goals = match req.goals {
        Some(goals) => goals,
        None => session_goals(&state).await?,
    };
    let shift = state.shifts.spawn(&id, goals).await?;
    Ok((StatusCode::ACCEPTED, Json(shift)))
}

async fn list_handoffs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_HANDOFF_LIMIT);
    Ok(Json(state.shifts.handoffs(&id, limit).await?))
}

async fn list_escalations(
    State(state): State<SharedState>,
    Query(query): Query<EscalationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let open_only = query.open.unwrap_or(true);
    Ok(Json(
        state
            .portfolio
            .escalations(query.project_id.as_deref(), open_only)
            .await?,
    ))
}

async fn resolve_escalation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.portfolio.resolve_escalation(&id).await?))
}

async fn list_communications(
    State(state): State<SharedState>,
    Query(query): Query<CommunicationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state
            .portfolio
            .communications(query.project_id.as_deref(), query.unacknowledged, query.limit)
            .await?,
    ))
}

async fn acknowledge_communication(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.portfolio.acknowledge(&id).await?))
}

async fn post_communication(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(communication): Json<NewCommunication>,
) -> Result<impl IntoResponse, ApiError> {
    let posted = state
        .portfolio
        .post_communication(Some(&id), communication)
        .await?;
    Ok((StatusCode::CREATED, Json(posted)))
}

async fn apply_action(
    State(state): State<SharedState>,
    Json(action): Json<ActionItem>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.portfolio.apply_action(action).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

async fn get_session(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let session = state.sessions.current().await?.ok_or(ShiftError::NoSession)?;
    Ok(Json(session))
}

async fn session_briefing(
    State(state): State<SharedState>,
    Json(req): Json<BriefingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.sessions.briefing(req.goals, req.constraints).await?,
    ))
}

async fn session_confirm(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.confirm().await?))
}

async fn session_resume(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.resume().await?))
}

async fn session_stop(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.stop().await?))
}

async fn global_context(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.portfolio.global_context().await?))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::testing::TestApp;

    #[tokio::test]
    async fn test_shift_view_and_start() {
        let app = TestApp::new().await;
        app.harness.ready_item("WO-1").await;

        let (status, view) = app.get("/api/projects/p/shift").await;
        assert_eq!(status, StatusCode::OK);
        assert!(view["active"].is_null());
        assert_eq!(view["context"]["project"]["id"], "p");

        let (status, shift) = app.post("/api/projects/p/shift", json!({})).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(shift["project_id"], "p");

        // The shift runs in the background; its handoff shows up once it ends.
        let mut handoffs = serde_json::Value::Null;
        for _ in 0..200 {
            let (_, body) = app.get("/api/projects/p/handoffs").await;
            if !body.as_array().unwrap().is_empty() {
                handoffs = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let handoff = &handoffs[0]["handoff"];
        let completed = handoff["work_completed"].as_array().unwrap();
        assert!(completed.iter().any(|c| c.as_str().unwrap().contains("WO-1")));
    }

    #[tokio::test]
    async fn test_shift_for_unknown_project() {
        let app = TestApp::new().await;
        let (status, _) = app.get("/api/projects/ghost/shift").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = app.post("/api/projects/ghost/shift", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_session_lifecycle() {
        let app = TestApp::new().await;
        let (status, _) = app.get("/api/session").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, session) = app
            .post("/api/session/briefing", json!({"goals": ["billing"]}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["state"], "briefing");

        let (status, _) = app.post("/api/session/resume", json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, session) = app.post("/api/session/stop", json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(session["state"], "stopped");
    }

    #[tokio::test]
    async fn test_communications_and_action_items() {
        let app = TestApp::new().await;
        let (status, posted) = app
            .post(
                "/api/projects/p/communications",
                json!({"intent": "message", "type": "blocked", "summary": "waiting on API keys"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        let id = posted["communication"]["id"].as_str().unwrap().to_string();

        let (_, listed) = app.get("/api/communications?unacknowledged=true").await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let (status, _) = app
            .post(&format!("/api/communications/{id}/acknowledge"), json!({}))
            .await;
        assert_eq!(status, StatusCode::OK);
        let (_, listed) = app.get("/api/communications?unacknowledged=true").await;
        assert!(listed.as_array().unwrap().is_empty());

        let (status, outcome) = app
            .post(
                "/api/action-items",
                json!({"kind": "work_order", "project_id": "p", "spec": {"title": "Add search"}}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(outcome["kind"], "work_order");
        assert_eq!(outcome["work_item"]["title"], "Add search");

        let (status, _) = app
            .post("/api/action-items", json!({"kind": "launch_rocket"}))
            .await;
        assert!(status.is_client_error());
    }

    #[tokio::test]
    async fn test_escalations_and_global_context() {
        let app = TestApp::new().await;
        let (status, list) = app.get("/api/escalations").await;
        assert_eq!(status, StatusCode::OK);
        assert!(list.as_array().unwrap().is_empty());

        let (status, _) = app.post("/api/escalations/e404/resolve", json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        app.harness.item("WO-1", pcc_common::WorkItemStatus::Ready).await;
        let (status, ctx) = app.get("/api/global/context").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ctx["projects"]["total"], 1);
        assert_eq!(ctx["work_items"]["ready"], 1);
        assert!(ctx["session"].is_null());
    }
}
