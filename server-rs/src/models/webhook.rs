use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    Stripe,
    Flutterwave,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::Stripe => "stripe",
            PaymentProvider::Flutterwave => "flutterwave",
        }
    }
}

impl TryFrom<String> for PaymentProvider {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "stripe" => Ok(PaymentProvider::Stripe),
            "flutterwave" => Ok(PaymentProvider::Flutterwave),
            other => Err(format!("unknown payment provider '{}'", other)),
        }
    }
}

impl fmt::Display for PaymentProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub provider: PaymentProvider,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub error: Option<String>,
    pub attempts: i32,
    pub received_at: DateTime<Utc>,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub provider: PaymentProvider,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Outcome of trying to take processing rights for a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookClaim {
    /// First delivery, or a retry of a failed/stale attempt.
    Claimed { attempt: i32 },
    /// Already processed, or another delivery holds a fresh claim.
    Duplicate { processed: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct BillingNotification {
    pub id: Uuid,
    pub tenant_id: String,
    pub kind: String,
    pub message: String,
    pub reference_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub tenant_id: String,
    pub kind: String,
    pub message: String,
    pub reference_id: String,
}
