//! Browsing, grabbing and "my task" endpoints.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use uuid::Uuid;

use super::error::market_error;
use super::proofs;
use super::routes::AppState;
use super::types::*;
use crate::marketplace::{Caller, Page};

/// Routes for regular users. Mounted under `/api`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/categories", get(list_categories))
        .route("/categories/:id/tasks", get(category_tasks))
        .route("/tasks/available", get(available_tasks))
        .route("/tasks/take", post(take_task))
        .route("/my-tasks/current", get(current_task))
        .route("/my-tasks/:task_id", get(my_task))
        .route("/my-tasks/:task_id/proof", post(proofs::upload_proof))
}

/// GET /api/categories
pub async fn list_categories(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CategoryEntry>>, (StatusCode, String)> {
    let listings = state.market.browse_categories().await.map_err(market_error)?;
    Ok(Json(listings.iter().map(CategoryEntry::from).collect()))
}

/// GET /api/categories/:id/tasks?page=
pub async fn category_tasks(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<PageQuery>,
) -> Result<Json<CategoryTasksResponse>, (StatusCode, String)> {
    let page = Page::new(q.page);
    let (category, tasks, total) = state
        .market
        .category_tasks(id, page)
        .await
        .map_err(market_error)?;
    Ok(Json(CategoryTasksResponse {
        category,
        tasks: TaskPage {
            page: page.number,
            per_page: page.per_page,
            total: Some(total),
            tasks: tasks.iter().map(TaskSummary::from).collect(),
        },
    }))
}

/// GET /api/tasks/available?category_id=&page=
pub async fn available_tasks(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AvailableQuery>,
) -> Result<Json<TaskPage>, (StatusCode, String)> {
    let page = Page::new(q.page);
    let tasks = state
        .market
        .list_available(q.category_id, page)
        .await
        .map_err(market_error)?;
    Ok(Json(TaskPage {
        page: page.number,
        per_page: page.per_page,
        total: None,
        tasks: tasks.iter().map(TaskSummary::from).collect(),
    }))
}

/// POST /api/tasks/take
pub async fn take_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<TakeTaskRequest>,
) -> Result<(StatusCode, Json<ClaimResponse>), (StatusCode, String)> {
    let claim = state
        .market
        .claim(&caller, req.task_id)
        .await
        .map_err(market_error)?;
    Ok((StatusCode::CREATED, Json(ClaimResponse::from(&claim))))
}

/// GET /api/my-tasks/current
pub async fn current_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<Option<MyTaskResponse>>, (StatusCode, String)> {
    let view = state.market.current_claim(&caller).await.map_err(market_error)?;
    Ok(Json(view.as_ref().map(MyTaskResponse::from)))
}

/// GET /api/my-tasks/:task_id
pub async fn my_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<MyTaskResponse>, (StatusCode, String)> {
    let view = state
        .market
        .claim_for_task(&caller, task_id)
        .await
        .map_err(market_error)?;
    Ok(Json(MyTaskResponse::from(&view)))
}
