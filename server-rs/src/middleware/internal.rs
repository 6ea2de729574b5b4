use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;

use crate::error::AppError;
use crate::AppState;

/// Middleware: operator endpoints require the shared internal key. An unset key
/// disables them entirely.
pub async fn require_internal_key(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let expected = state.config.internal.api_key.as_bytes();
    let provided = req
        .headers()
        .get(&state.config.internal.header)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if expected.is_empty() || !bool::from(provided.ct_eq(expected)) {
        return Err(AppError::Unauthorized("Internal key required".into()));
    }
    Ok(next.run(req).await)
}
