//! Per-project compute and budget endpoints.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;

use pcc_common::SizeClass;

use super::{ApiError, SharedState, parse_enum};

#[derive(Deserialize)]
pub struct ProvisionQuery {
    pub size: Option<String>,
}

#[derive(Deserialize)]
pub struct ResizeRequest {
    pub size: SizeClass,
}

#[derive(Deserialize)]
pub struct SetBudgetRequest {
    pub monthly_usd: f64,
    #[serde(default)]
    pub daily_drip_usd: Option<f64>,
}

#[derive(Deserialize)]
pub struct TopUpRequest {
    pub amount_usd: f64,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/api/projects/{id}/vm", get(get_vm))
        .route("/api/projects/{id}/vm/resize", post(resize_vm))
        .route("/api/projects/{id}/vm/{action}", post(vm_action))
        .route(
            "/api/projects/{id}/budget",
            get(get_budget).put(set_budget),
        )
        .route("/api/projects/{id}/budget/top-up", post(top_up))
}

async fn get_vm(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.vm.status(&id).await?))
}

async fn vm_action(
    State(state): State<SharedState>,
    Path((id, action)): Path<(String, String)>,
    Query(query): Query<ProvisionQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let record = match action.as_str() {
        "provision" => {
            let size = query
                .size
                .as_deref()
                .map(parse_enum::<SizeClass>)
                .transpose()?;
            state.vm.provision(&id, size).await?
        }
        "start" => state.vm.start(&id).await?,
        "stop" => state.vm.stop(&id).await?,
        "delete" => state.vm.delete(&id).await?,
        other => {
            return Err(ApiError::BadRequest(format!(
                "Unknown VM action {other}; expected provision, start, stop, resize or delete"
            )));
        }
    };
    Ok(Json(record))
}

async fn resize_vm(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.vm.resize(&id, req.size).await?))
}

async fn get_budget(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.budget.snapshot(&id).await?))
}

async fn set_budget(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<SetBudgetRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .budget
        .set_allocation(&id, req.monthly_usd, req.daily_drip_usd)
        .await?;
    Ok(Json(state.budget.snapshot(&id).await?))
}

async fn top_up(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<TopUpRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state.budget.top_up(&id, req.amount_usd).await?;
    Ok(Json(state.budget.snapshot(&id).await?))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::testing::TestApp;

    #[tokio::test]
    async fn test_budget_snapshot_and_top_up() {
        let app = TestApp::new().await;
        let (status, snap) = app.get("/api/projects/p/budget").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snap["monthly_allocation_usd"], 50.0);
        assert_eq!(snap["status"], "healthy");

        let (status, snap) = app
            .post("/api/projects/p/budget/top-up", json!({"amount_usd": 25.0}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snap["monthly_allocation_usd"], 75.0);
        assert_eq!(snap["remaining_usd"], 75.0);
        assert_eq!(snap["drip_available_usd"], 1.0);

        let (status, _) = app
            .post("/api/projects/p/budget/top-up", json!({"amount_usd": -1.0}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_set_allocation() {
        let app = TestApp::new().await;
        let (status, snap) = app
            .send(
                "PUT",
                "/api/projects/p/budget",
                Some(json!({"monthly_usd": 10.0, "daily_drip_usd": 0.5})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(snap["monthly_allocation_usd"], 10.0);
        assert_eq!(snap["daily_drip_usd"], 0.5);
        assert_eq!(snap["drip_available_usd"], 0.5);

        let (status, _) = app.get("/api/projects/ghost/budget").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_vm_routes() {
        let app = TestApp::new().await;
        let (status, vm) = app.get("/api/projects/p/vm").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(vm["status"], "not_provisioned");

        let (status, body) = app.post("/api/projects/p/vm/explode", json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Unknown VM action"));

        let (status, _) = app.post("/api/projects/p/vm/stop", json!({})).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
