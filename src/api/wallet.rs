//! Wallet endpoint.

use std::sync::Arc;

use axum::{
    extract::{Extension, Query, State},
    http::StatusCode,
    response::Json,
};
use serde::Serialize;

use super::error::market_error;
use super::routes::AppState;
use super::types::PageQuery;
use crate::marketplace::{format_cents, Caller, Page, PaidClaim};

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub total_tasks: u64,
    pub total_earnings_cents: u64,
    pub total_earnings: String,
    pub today_earnings_cents: u64,
    pub today_earnings: String,
    pub badge: &'static str,
    pub page: usize,
    pub history: Vec<PaidClaim>,
}

/// GET /api/wallet?page=
pub async fn wallet(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Query(q): Query<PageQuery>,
) -> Result<Json<WalletResponse>, (StatusCode, String)> {
    let page = Page::new(q.page);
    let view = state.market.wallet(&caller, page).await.map_err(market_error)?;
    Ok(Json(WalletResponse {
        total_tasks: view.total_tasks,
        total_earnings_cents: view.total_earnings_cents,
        total_earnings: format_cents(view.total_earnings_cents),
        today_earnings_cents: view.today_earnings_cents,
        today_earnings: format_cents(view.today_earnings_cents),
        badge: view.badge.as_str(),
        page: page.number,
        history: view.history,
    }))
}
