//! Admin endpoints: publishing, verification, sweep and earnings audit.
//!
//! Every route here sits behind `require_admin`; finer capability and
//! ownership checks happen in the marketplace.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, patch, post},
    Router,
};
use uuid::Uuid;

use super::auth;
use super::error::{internal_error, market_error};
use super::proofs;
use super::routes::AppState;
use super::types::*;
use crate::marketplace::{Caller, Category, EarningsAudit, MarketError, NewCategory, NewTask, Task, Verdict};

/// Create the admin API routes. Mounted under `/api/admin`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/categories", post(create_category))
        .route("/tasks", post(create_task))
        .route("/tasks/:id", patch(update_task))
        .route("/claims/:id/request-proof2", post(request_proof2))
        .route("/claims/:id/finalize", post(finalize))
        .route("/claims/sweep", post(sweep))
        .route("/proofs/:name", get(proofs::get_proof))
        .route("/users", post(register_user))
        .route("/users/:id/audit", get(audit_user))
        .route("/users/:id/reconcile", post(reconcile_user))
}

/// POST /api/admin/categories
async fn create_category(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<NewCategory>,
) -> Result<(StatusCode, Json<Category>), (StatusCode, String)> {
    let category = state
        .market
        .create_category(&caller, req)
        .await
        .map_err(market_error)?;
    Ok((StatusCode::CREATED, Json(category)))
}

/// POST /api/admin/tasks
async fn create_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), (StatusCode, String)> {
    let task = state
        .market
        .publish_task(&caller, req)
        .await
        .map_err(market_error)?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// PATCH /api/admin/tasks/:id
/// Only `is_active` and `expires_at` can change after publishing.
async fn update_task(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<Json<Task>, (StatusCode, String)> {
    let current = state
        .market
        .store()
        .get_task(id)
        .await
        .map_err(market_error)?
        .ok_or_else(|| market_error(MarketError::NotFound("task")))?;
    let task = state
        .market
        .set_task_availability(
            &caller,
            id,
            req.is_active.unwrap_or(current.is_active),
            req.expires_at.unwrap_or(current.expires_at),
        )
        .await
        .map_err(market_error)?;
    Ok(Json(task))
}

/// POST /api/admin/claims/:id/request-proof2
async fn request_proof2(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<ClaimResponse>, (StatusCode, String)> {
    let claim = state
        .market
        .request_second_proof(&caller, id)
        .await
        .map_err(market_error)?;
    Ok(Json(ClaimResponse::from(&claim)))
}

/// POST /api/admin/claims/:id/finalize
async fn finalize(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
    Json(req): Json<FinalizeRequest>,
) -> Result<Json<FinalizeResponse>, (StatusCode, String)> {
    let notes = req.notes.filter(|n| !n.trim().is_empty());
    let verdict = match req.outcome.trim() {
        "completed" => Verdict::Completed { notes },
        "failed" => Verdict::Failed { notes },
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("Unknown outcome: {} (expected completed or failed)", other),
            ));
        }
    };
    let (claim, user) = state
        .market
        .finalize(&caller, id, verdict)
        .await
        .map_err(market_error)?;
    Ok(Json(FinalizeResponse {
        claim: ClaimResponse::from(&claim),
        user,
    }))
}

/// POST /api/admin/claims/sweep
async fn sweep(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
) -> Result<Json<SweepResponse>, (StatusCode, String)> {
    if !caller.role.can_verify() {
        return Err(market_error(MarketError::Forbidden("verify")));
    }
    let claim_ids = state.market.sweep_expired().await.map_err(market_error)?;
    Ok(Json(SweepResponse {
        failed: claim_ids.len(),
        claim_ids,
    }))
}

/// GET /api/admin/users/:id/audit
async fn audit_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<EarningsAudit>, (StatusCode, String)> {
    let audit = state
        .market
        .audit_earnings(&caller, id, false)
        .await
        .map_err(market_error)?;
    Ok(Json(audit))
}

/// POST /api/admin/users/:id/reconcile
async fn reconcile_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<Uuid>,
) -> Result<Json<EarningsAudit>, (StatusCode, String)> {
    let audit = state
        .market
        .audit_earnings(&caller, id, true)
        .await
        .map_err(market_error)?;
    Ok(Json(audit))
}

/// POST /api/admin/users
/// Superadmin only. Returns a token for the new user when JWTs are configured.
async fn register_user(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<(StatusCode, Json<RegisterUserResponse>), (StatusCode, String)> {
    let user = state
        .market
        .register_user(&caller, &req.name, req.role)
        .await
        .map_err(market_error)?;

    let (token, exp) = match state.config.auth.jwt_secret.as_deref() {
        Some(secret) => {
            let (token, exp) = auth::issue_jwt(secret, state.config.auth.jwt_ttl_days, user.id)
                .map_err(internal_error)?;
            (Some(token), Some(exp))
        }
        None => (None, None),
    };

    Ok((StatusCode::CREATED, Json(RegisterUserResponse { user, token, exp })))
}
