use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};

use pcc_common::{Run, WorkItem, WorkItemEvent, WorkItemPatch, WorkItemSpec, WorkItemStatus};

use super::{ApiError, SharedState, canonical_project, parse_enum};
use crate::work_items::spec_file::parse_spec_document;

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

/// A work order arrives either as structured JSON or as a markdown document
/// with YAML frontmatter.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum CreateWorkOrderRequest {
    Document { document: String },
    Spec(WorkItemSpec),
}

#[derive(Deserialize)]
pub struct TransitionRequest {
    pub status: WorkItemStatus,
}

#[derive(Deserialize)]
pub struct DependenciesRequest {
    pub depends_on: Vec<String>,
}

#[derive(Serialize)]
pub struct WorkOrderDetail {
    #[serde(flatten)]
    pub work_item: WorkItem,
    pub events: Vec<WorkItemEvent>,
    pub runs: Vec<Run>,
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route(
            "/api/projects/{id}/work-orders",
            get(list_work_orders).post(create_work_order),
        )
        .route(
            "/api/work-orders/{id}",
            get(get_work_order).patch(patch_work_order),
        )
        .route("/api/work-orders/{id}/transition", post(transition_work_order))
        .route("/api/work-orders/{id}/dependencies", put(set_dependencies))
}

async fn list_work_orders(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(parse_enum::<WorkItemStatus>)
        .transpose()?;
    let pid = canonical_project(&state, &id).await?;
    let items = state.work_items.list(Some(&pid), status).await?;
    Ok(Json(items))
}

async fn create_work_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CreateWorkOrderRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let spec = match req {
        CreateWorkOrderRequest::Document { document } => parse_spec_document(&document)?,
        CreateWorkOrderRequest::Spec(spec) => spec,
    };
    let pid = canonical_project(&state, &id).await?;
    let item = state.work_items.create(&pid, spec).await?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn get_work_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let work_item = state.work_items.get(&id).await?;
    let events = state.work_items.events(&id).await?;
    let runs = state.orchestrator.list_for_work_item(&id).await?;
    Ok(Json(WorkOrderDetail {
        work_item,
        events,
        runs,
    }))
}

async fn patch_work_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(patch): Json<WorkItemPatch>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.work_items.patch(&id, patch).await?))
}

async fn transition_work_order(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.work_items.transition(&id, req.status).await?))
}

async fn set_dependencies(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<DependenciesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(
        state.work_items.set_dependencies(&id, req.depends_on).await?,
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::api::testing::TestApp;
    use pcc_common::WorkItemStatus;

    #[tokio::test]
    async fn test_create_from_json_and_document() {
        let app = TestApp::new().await;
        let (status, item) = app
            .post(
                "/api/projects/p/work-orders",
                json!({"title": "Add login", "goal": "users can sign in"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(item["status"], "backlog");
        assert_eq!(item["priority"], 3);

        let document = "---\nid: WO-77\ntitle: Billing page\npriority: 2\n---\nShow invoices.\n";
        let (status, item) = app
            .post("/api/projects/p/work-orders", json!({"document": document}))
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(item["id"], "WO-77");
        assert_eq!(item["priority"], 2);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_spec() {
        let app = TestApp::new().await;
        let (status, body) = app
            .post("/api/projects/p/work-orders", json!({"title": "x", "priority": 9}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("priority"));

        let (status, _) = app
            .post("/api/projects/nope/work-orders", json!({"title": "x"}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let app = TestApp::new().await;
        app.harness.item("WO-1", WorkItemStatus::Ready).await;
        app.harness.item("WO-2", WorkItemStatus::Backlog).await;

        let (status, items) = app.get("/api/projects/p/work-orders?status=ready").await;
        assert_eq!(status, StatusCode::OK);
        let items = items.as_array().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["id"], "WO-1");

        let (status, _) = app.get("/api/projects/p/work-orders?status=sideways").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_transition_rules_surface_as_conflict() {
        let app = TestApp::new().await;
        app.harness.item("WO-1", WorkItemStatus::Backlog).await;

        let (status, body) = app
            .post("/api/work-orders/WO-1/transition", json!({"status": "done"}))
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().unwrap().contains("backlog -> done"));

        let (status, item) = app
            .post("/api/work-orders/WO-1/transition", json!({"status": "ready"}))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["status"], "ready");

        let (status, detail) = app.get("/api/work-orders/WO-1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(detail["events"].as_array().unwrap().len(), 1);
        assert!(detail["runs"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dependency_cycle_is_bad_request() {
        let app = TestApp::new().await;
        app.harness.item("WO-1", WorkItemStatus::Backlog).await;
        app.harness.item("WO-2", WorkItemStatus::Backlog).await;

        let (status, _) = app
            .send(
                "PUT",
                "/api/work-orders/WO-2/dependencies",
                Some(json!({"depends_on": ["WO-1"]})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = app
            .send(
                "PUT",
                "/api/work-orders/WO-1/dependencies",
                Some(json!({"depends_on": ["WO-2"]})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("cycle"));
    }

    #[tokio::test]
    async fn test_patch_leaves_status() {
        let app = TestApp::new().await;
        app.harness.item("WO-1", WorkItemStatus::Ready).await;
        let (status, item) = app
            .send(
                "PATCH",
                "/api/work-orders/WO-1",
                Some(json!({"title": "Renamed", "priority": 1})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(item["title"], "Renamed");
        assert_eq!(item["status"], "ready");

        let (status, _) = app.get("/api/work-orders/WO-404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
