use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::error::{AppError, AppResult};
use crate::services::reconciler::{self, ProviderEvent, WebhookOutcome};
use crate::services::{flutterwave, stripe_service};
use crate::AppState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

async fn reconcile(state: &AppState, event: ProviderEvent) -> AppResult<Json<Value>> {
    // details stay on the event row, the provider gets a plain 500
    let outcome = reconciler::process(state.store.as_ref(), &state.config, event)
        .await
        .map_err(|e| match e {
            AppError::Database(_) | AppError::Internal(_) => e,
            other => AppError::Internal(other.to_string()),
        })?;

    Ok(Json(json!({
        "received": true,
        "duplicate": outcome == WebhookOutcome::Duplicate,
    })))
}

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let stripe = &state.config.stripe;
    stripe_service::verify_signature(
        &body,
        header(&headers, "stripe-signature").unwrap_or(""),
        &stripe.webhook_secret,
        stripe.signature_tolerance_secs,
        chrono::Utc::now().timestamp(),
    )?;

    let event = stripe_service::parse_event(&body)?;
    reconcile(&state, event).await
}

pub async fn flutterwave_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    flutterwave::verify_signature(
        &body,
        header(&headers, "verif-hash"),
        header(&headers, "flutterwave-signature"),
        &state.config.flutterwave.secret_hash,
    )?;

    let event = flutterwave::parse_event(&body)?;
    reconcile(&state, event).await
}
