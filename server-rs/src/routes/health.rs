use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = state.store.health_check().await;

    let (status, label) = if db_ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };
    (
        status,
        Json(json!({
            "status": label,
            "postgres": db_ok,
            "timestamp": chrono::Utc::now(),
        })),
    )
}
