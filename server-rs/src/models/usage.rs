use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Consumption-metered resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageResource {
    Sms,
    Email,
    VoiceMinutes,
}

impl UsageResource {
    pub const ALL: [UsageResource; 3] = [
        UsageResource::Sms,
        UsageResource::Email,
        UsageResource::VoiceMinutes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UsageResource::Sms => "sms",
            UsageResource::Email => "email",
            UsageResource::VoiceMinutes => "voice_minutes",
        }
    }

    /// Counter column on `billing_usage_periods`.
    pub fn counter_column(&self) -> &'static str {
        match self {
            UsageResource::Sms => "sms_count_used",
            UsageResource::Email => "email_count_used",
            UsageResource::VoiceMinutes => "voice_minutes_used",
        }
    }
}

impl fmt::Display for UsageResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Count-bound resources checked before provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitResource {
    PhoneNumbers,
}

impl LimitResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitResource::PhoneNumbers => "phone_numbers",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "phone_numbers" | "phoneNumbers" => Some(LimitResource::PhoneNumbers),
            _ => None,
        }
    }
}

impl fmt::Display for LimitResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct UsagePeriod {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub sms_count_used: i64,
    pub email_count_used: i64,
    pub voice_minutes_used: i64,
}

impl UsagePeriod {
    pub fn used(&self, resource: UsageResource) -> i64 {
        match resource {
            UsageResource::Sms => self.sms_count_used,
            UsageResource::Email => self.email_count_used,
            UsageResource::VoiceMinutes => self.voice_minutes_used,
        }
    }
}

/// Split of a usage request between the included quota and billable overage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    pub covered_by_quota: i64,
    pub overage_quantity: i64,
    pub cost: i64,
}

/// `quota = None` is unlimited and never produces overage. Returns `None` when the cost
/// does not fit in an `i64`.
pub fn quote(quota: Option<i64>, used: i64, quantity: i64, rate: i64) -> Option<Quote> {
    let covered_by_quota = match quota {
        None => quantity,
        Some(quota) => quota.saturating_sub(used).max(0).min(quantity),
    };
    let overage_quantity = quantity - covered_by_quota;
    Some(Quote {
        covered_by_quota,
        overage_quantity,
        cost: overage_quantity.checked_mul(rate)?,
    })
}

/// Result of a metered usage call.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageOutcome {
    pub allowed: bool,
    pub cost_minor_units: i64,
    pub is_overage: bool,
    pub covered_by_quota: i64,
    pub overage_quantity: i64,
    /// Counter value after the call, when a period was recorded against.
    pub used_after: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub resource: UsageResource,
    pub used: i64,
    pub quota: Option<i64>,
    pub remaining: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub plan_id: String,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub resources: Vec<ResourceUsage>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitCheck {
    pub resource: LimitResource,
    pub allowed: bool,
    /// `None` when the effective limit is unlimited.
    pub limit: Option<i64>,
    pub current: i64,
}

#[derive(Debug, Deserialize)]
pub struct RecordUsageRequest {
    pub resource: UsageResource,
    pub quantity: i64,
}
