use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::webhook::PaymentProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    /// Collapses a provider status string into the three states billing cares about.
    pub fn from_provider(status: &str) -> Option<Self> {
        match status {
            "active" | "trialing" => Some(SubscriptionStatus::Active),
            "past_due" | "unpaid" | "incomplete" | "paused" => Some(SubscriptionStatus::PastDue),
            "canceled" | "cancelled" | "incomplete_expired" => Some(SubscriptionStatus::Canceled),
            _ => None,
        }
    }
}

impl TryFrom<String> for SubscriptionStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(SubscriptionStatus::Active),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            other => Err(format!("unknown subscription status '{}'", other)),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub plan_id: String,
    #[sqlx(try_from = "String")]
    pub status: SubscriptionStatus,
    #[sqlx(try_from = "String")]
    pub provider: PaymentProvider,
    pub provider_subscription_id: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Insert-or-update keyed by `(provider, provider_subscription_id)`.
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub tenant_id: String,
    pub plan_id: String,
    pub status: SubscriptionStatus,
    pub provider: PaymentProvider,
    pub provider_subscription_id: String,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Fields left as `None` are not touched. A period end only ever moves forward.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub status: Option<SubscriptionStatus>,
    pub plan_id: Option<String>,
    pub current_period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddOnStatus {
    Active,
    Canceled,
}

impl AddOnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddOnStatus::Active => "active",
            AddOnStatus::Canceled => "canceled",
        }
    }
}

impl TryFrom<String> for AddOnStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(AddOnStatus::Active),
            "canceled" => Ok(AddOnStatus::Canceled),
            other => Err(format!("unknown add-on status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AddOnSubscription {
    pub id: Uuid,
    pub tenant_id: String,
    pub addon_id: String,
    pub quantity: i32,
    #[sqlx(try_from = "String")]
    pub status: AddOnStatus,
    pub created_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseAddOnRequest {
    pub add_on_id: String,
    pub quantity: Option<i32>,
}
