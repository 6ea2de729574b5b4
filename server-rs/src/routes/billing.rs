use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::middleware::tenant::TenantId;
use crate::models::*;
use crate::services::{addons, limits, usage_meters, wallet};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

fn limit_resource(resource: &str) -> AppResult<LimitResource> {
    LimitResource::parse(resource)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown limit resource '{}'", resource)))
}

pub async fn plans() -> Json<Value> {
    Json(json!({
        "plans": PLANS,
        "addOns": ADDONS,
        "overageRates": OVERAGE_RATE,
    }))
}

pub async fn get_wallet(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
) -> AppResult<Json<Value>> {
    let tenant_id = &tenant.0 .0;
    let balance = wallet::balance(state.store.as_ref(), tenant_id).await?;
    Ok(Json(json!({ "tenantId": tenant_id, "balance": balance })))
}

pub async fn list_transactions(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
    Query(q): Query<LimitQuery>,
) -> AppResult<Json<Value>> {
    let rows = wallet::transactions(state.store.as_ref(), &tenant.0 .0, q.limit).await?;
    Ok(Json(json!({ "transactions": rows })))
}

pub async fn record_usage(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
    Json(body): Json<RecordUsageRequest>,
) -> AppResult<Json<UsageOutcome>> {
    let outcome =
        usage_meters::record_usage(state.store.as_ref(), &tenant.0 .0, body.resource, body.quantity)
            .await?;
    Ok(Json(outcome))
}

pub async fn usage_summary(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
) -> AppResult<Json<UsageSummary>> {
    let summary = usage_meters::usage_summary(state.store.as_ref(), &tenant.0 .0).await?;
    Ok(Json(summary))
}

pub async fn check_limit(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
    Path(resource): Path<String>,
) -> AppResult<Json<LimitCheck>> {
    let resource = limit_resource(&resource)?;
    let check = limits::check_limit(state.store.as_ref(), &tenant.0 .0, resource).await?;
    Ok(Json(check))
}

/// Call site for provisioning flows: 403 with current/limit when the tenant is full.
pub async fn reserve_check(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
    Path(resource): Path<String>,
) -> AppResult<Json<LimitCheck>> {
    let resource = limit_resource(&resource)?;
    let check = limits::require_capacity(state.store.as_ref(), &tenant.0 .0, resource).await?;
    Ok(Json(check))
}

pub async fn list_addons(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
) -> AppResult<Json<Value>> {
    let rows = addons::list(state.store.as_ref(), &tenant.0 .0).await?;
    Ok(Json(json!({ "addOns": rows })))
}

pub async fn purchase_addon(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
    Json(body): Json<PurchaseAddOnRequest>,
) -> AppResult<Json<AddOnSubscription>> {
    let row = addons::purchase(
        state.store.as_ref(),
        &tenant.0 .0,
        &body.add_on_id,
        body.quantity.unwrap_or(1),
    )
    .await?;
    Ok(Json(row))
}

pub async fn cancel_addon(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
    Path(addon_id): Path<String>,
) -> AppResult<Json<Value>> {
    addons::cancel(state.store.as_ref(), &tenant.0 .0, &addon_id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn notifications(
    State(state): State<AppState>,
    tenant: axum::Extension<TenantId>,
    Query(q): Query<LimitQuery>,
) -> AppResult<Json<Value>> {
    let limit = q.limit.unwrap_or(20).clamp(1, 100);
    let rows = state.store.notifications(&tenant.0 .0, limit).await?;
    Ok(Json(json!({ "notifications": rows })))
}
