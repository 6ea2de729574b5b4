use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: i64, available: i64 },

    #[error("No active subscription")]
    NoActiveSubscription,

    #[error("No open usage period")]
    NoUsagePeriod,

    #[error("Limit reached for {resource}: {current}/{limit}")]
    LimitReached {
        resource: String,
        current: i64,
        limit: i64,
    },

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({ "error": "Too many requests" }),
            ),
            AppError::InsufficientFunds {
                required,
                available,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                json!({
                    "error": "Insufficient wallet balance",
                    "code": "insufficient_funds",
                    "required": required,
                    "available": available,
                }),
            ),
            AppError::NoActiveSubscription => (
                StatusCode::FORBIDDEN,
                json!({ "error": "No active subscription", "code": "no_active_subscription" }),
            ),
            AppError::NoUsagePeriod => (
                StatusCode::FORBIDDEN,
                json!({ "error": "No open billing period", "code": "no_usage_period" }),
            ),
            AppError::LimitReached {
                resource,
                current,
                limit,
            } => (
                StatusCode::FORBIDDEN,
                json!({
                    "error": format!("Limit reached for {}", resource),
                    "code": "limit_reached",
                    "resource": resource,
                    "current": current,
                    "limit": limit,
                }),
            ),
            AppError::InvalidSignature(reason) => {
                tracing::warn!(reason = %reason, "Rejected webhook signature");
                (
                    StatusCode::BAD_REQUEST,
                    json!({ "error": "Invalid signature" }),
                )
            }
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            AppError::Migration(e) => {
                tracing::error!("Migration error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_errors_map_to_client_statuses() {
        let cases = [
            (
                AppError::InsufficientFunds {
                    required: 10,
                    available: 0,
                },
                StatusCode::PAYMENT_REQUIRED,
            ),
            (AppError::NoActiveSubscription, StatusCode::FORBIDDEN),
            (AppError::NoUsagePeriod, StatusCode::FORBIDDEN),
            (
                AppError::LimitReached {
                    resource: "phone_numbers".into(),
                    current: 1,
                    limit: 1,
                },
                StatusCode::FORBIDDEN,
            ),
            (
                AppError::InvalidSignature("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::Internal("boom".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
