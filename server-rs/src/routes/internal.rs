use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde_json::{json, Value};

use crate::error::AppResult;
use crate::models::RefundRequest;
use crate::routes::billing::LimitQuery;
use crate::services::wallet;
use crate::AppState;

/// Wallets whose balance disagrees with their transaction log. Empty when healthy.
pub async fn ledger_drift(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let drift = wallet::verify_ledger(state.store.as_ref()).await?;
    Ok(Json(json!({ "healthy": drift.is_empty(), "drift": drift })))
}

pub async fn failed_webhooks(
    State(state): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> AppResult<Json<Value>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let events = state.store.failed_webhook_events(limit).await?;
    Ok(Json(json!({ "events": events })))
}

pub async fn refund(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(body): Json<RefundRequest>,
) -> AppResult<Json<Value>> {
    let posting = wallet::refund(
        state.store.as_ref(),
        &tenant_id,
        body.amount,
        &body.reference_id,
        body.description.as_deref().unwrap_or("Usage refund"),
    )
    .await?;
    Ok(Json(json!({
        "transaction": posting.transaction,
        "balance": posting.balance,
        "duplicate": posting.duplicate,
    })))
}
