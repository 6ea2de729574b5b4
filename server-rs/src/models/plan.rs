use serde::Serialize;

use crate::models::usage::{LimitResource, UsageResource};

/// Included quotas for a plan. `None` means unlimited.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Quotas {
    pub voice_minutes: Option<i64>,
    pub sms_messages: Option<i64>,
    pub emails: Option<i64>,
    pub phone_numbers: Option<i64>,
}

impl Quotas {
    pub fn for_usage(&self, resource: UsageResource) -> Option<i64> {
        match resource {
            UsageResource::Sms => self.sms_messages,
            UsageResource::Email => self.emails,
            UsageResource::VoiceMinutes => self.voice_minutes,
        }
    }

    pub fn for_limit(&self, resource: LimitResource) -> Option<i64> {
        match resource {
            LimitResource::PhoneNumbers => self.phone_numbers,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Plan {
    pub id: &'static str,
    pub name: &'static str,
    /// Minor currency units per month; `None` for custom-priced plans.
    pub monthly_price: Option<i64>,
    /// Credited to the wallet on every paid subscription invoice.
    pub monthly_wallet_grant: i64,
    pub quotas: Quotas,
    pub features: &'static [&'static str],
}

/// Partial quota delta contributed by one unit of an add-on.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitIncrease {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_numbers: Option<i64>,
}

impl LimitIncrease {
    pub fn for_limit(&self, resource: LimitResource) -> i64 {
        match resource {
            LimitResource::PhoneNumbers => self.phone_numbers.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddOn {
    pub id: &'static str,
    pub name: &'static str,
    pub monthly_price: i64,
    pub limit_increase: LimitIncrease,
    /// Feature flag unlocked by the add-on, for add-ons that carry no limit delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feature: Option<&'static str>,
}

/// Per-unit overage prices in minor currency units.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverageRates {
    pub sms_message: i64,
    pub voice_minute: i64,
    pub email: Option<i64>,
}

impl OverageRates {
    pub fn for_usage(&self, resource: UsageResource) -> i64 {
        match resource {
            UsageResource::Sms => self.sms_message,
            UsageResource::VoiceMinutes => self.voice_minute,
            UsageResource::Email => self.email.unwrap_or(0),
        }
    }
}

pub const ALL_FEATURES: &[&str] = &[
    "voice_agents",
    "sms_channel",
    "email_channel",
    "whatsapp_channel",
    "knowledge_base",
    "call_recording",
    "custom_branding",
    "priority_support",
];

pub const PLANS: &[Plan] = &[
    Plan {
        id: "starter",
        name: "Starter",
        monthly_price: Some(4_900),
        monthly_wallet_grant: 500,
        quotas: Quotas {
            voice_minutes: Some(300),
            sms_messages: Some(1_500),
            emails: Some(5_000),
            phone_numbers: Some(1),
        },
        features: &["voice_agents", "sms_channel", "email_channel"],
    },
    Plan {
        id: "pro",
        name: "Pro",
        monthly_price: Some(14_900),
        monthly_wallet_grant: 2_000,
        quotas: Quotas {
            voice_minutes: Some(1_500),
            sms_messages: Some(10_000),
            emails: Some(25_000),
            phone_numbers: Some(5),
        },
        features: &[
            "voice_agents",
            "sms_channel",
            "email_channel",
            "whatsapp_channel",
            "knowledge_base",
            "call_recording",
        ],
    },
    Plan {
        id: "enterprise",
        name: "Enterprise",
        monthly_price: None,
        monthly_wallet_grant: 0,
        quotas: Quotas {
            voice_minutes: None,
            sms_messages: None,
            emails: None,
            phone_numbers: None,
        },
        features: ALL_FEATURES,
    },
];

pub const ADDONS: &[AddOn] = &[
    AddOn {
        id: "phone_number",
        name: "Additional phone number",
        monthly_price: 1_500,
        limit_increase: LimitIncrease {
            phone_numbers: Some(1),
        },
        feature: None,
    },
    AddOn {
        id: "call_recording",
        name: "Call recording",
        monthly_price: 1_000,
        limit_increase: LimitIncrease {
            phone_numbers: None,
        },
        feature: Some("call_recording"),
    },
    AddOn {
        id: "custom_branding",
        name: "Custom branding",
        monthly_price: 2_500,
        limit_increase: LimitIncrease {
            phone_numbers: None,
        },
        feature: Some("custom_branding"),
    },
];

pub const OVERAGE_RATE: OverageRates = OverageRates {
    sms_message: 3,
    voice_minute: 12,
    email: None,
};

pub fn find_plan(plan_id: &str) -> Option<&'static Plan> {
    PLANS.iter().find(|p| p.id == plan_id)
}

pub fn find_addon(addon_id: &str) -> Option<&'static AddOn> {
    ADDONS.iter().find(|a| a.id == addon_id)
}
