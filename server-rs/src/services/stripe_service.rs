use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;

use crate::config::StripeConfig;
use crate::error::{AppError, AppResult};
use crate::models::{PaymentProvider, SubscriptionStatus};
use crate::services::reconciler::{BillingAction, ProviderEvent};

type HmacSha256 = Hmac<Sha256>;

/// Checks a `Stripe-Signature` header (`t=timestamp,v1=signature[,v1=...]`) against the
/// raw request body. Any matching `v1` entry is accepted.
pub fn verify_signature(
    payload: &[u8],
    signature_header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> AppResult<()> {
    if secret.is_empty() {
        return Err(AppError::InvalidSignature(
            "Stripe webhook secret is not configured".into(),
        ));
    }

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in signature_header.split(',') {
        let mut kv = part.trim().splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = Some(value),
            (Some("v1"), Some(value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp
        .ok_or_else(|| AppError::InvalidSignature("missing timestamp".into()))?;
    if signatures.is_empty() {
        return Err(AppError::InvalidSignature("missing v1 signature".into()));
    }
    let ts: i64 = timestamp
        .parse()
        .map_err(|_| AppError::InvalidSignature("malformed timestamp".into()))?;
    if ts.abs_diff(now) > tolerance_secs.unsigned_abs() {
        return Err(AppError::InvalidSignature(
            "timestamp outside tolerance".into(),
        ));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::Internal("HMAC key error".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(payload);

    let matched = signatures.iter().any(|sig| match hex::decode(sig) {
        Ok(bytes) => mac.clone().verify_slice(&bytes).is_ok(),
        Err(_) => false,
    });
    if !matched {
        return Err(AppError::InvalidSignature("signature mismatch".into()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct StripeEnvelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
}

pub fn parse_event(payload: &[u8]) -> AppResult<ProviderEvent> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook payload: {}", e)))?;
    let envelope: StripeEnvelope = serde_json::from_value(value.clone())
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook payload: {}", e)))?;
    Ok(ProviderEvent {
        provider: PaymentProvider::Stripe,
        event_id: envelope.id,
        event_type: envelope.event_type,
        payload: value,
    })
}

fn timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value.as_i64().and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn non_empty(value: &Value) -> Option<String> {
    value
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn required(value: &Value, what: &str) -> AppResult<String> {
    non_empty(value)
        .ok_or_else(|| AppError::BadRequest(format!("Stripe event is missing {}", what)))
}

/// Stripe sends some references either as an id or as the expanded object.
fn id_or_object(value: &Value) -> Option<String> {
    non_empty(value).or_else(|| non_empty(&value["id"]))
}

fn plan_from(metadata: &Value, price_id: Option<&str>, config: &StripeConfig) -> Option<String> {
    non_empty(&metadata["planId"]).or_else(|| {
        price_id
            .and_then(|p| config.plan_for_price(p))
            .map(str::to_string)
    })
}

pub fn normalize_event(event: &ProviderEvent, config: &StripeConfig) -> AppResult<BillingAction> {
    let object = &event.payload["data"]["object"];

    let action = match event.event_type.as_str() {
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            let tenant_id = non_empty(&object["metadata"]["tenantId"])
                .or_else(|| non_empty(&object["client_reference_id"]));

            match object["mode"].as_str() {
                Some("subscription") => {
                    let price_id = object["line_items"]["data"][0]["price"]["id"].as_str();
                    BillingAction::SubscriptionActivated {
                        tenant_id: tenant_id.ok_or_else(|| {
                            AppError::BadRequest("Checkout session has no tenant".into())
                        })?,
                        plan_id: plan_from(&object["metadata"], price_id, config).ok_or_else(
                            || AppError::BadRequest("Checkout session has no known plan".into()),
                        )?,
                        provider_subscription_id: id_or_object(&object["subscription"])
                            .ok_or_else(|| {
                                AppError::BadRequest("Checkout session has no subscription".into())
                            })?,
                        current_period_end: timestamp(
                            &object["subscription"]["current_period_end"],
                        ),
                    }
                }
                Some("payment") if object["payment_status"].as_str() == Some("paid") => {
                    let amount = object["amount_total"].as_i64().unwrap_or(0);
                    if amount <= 0 {
                        return Err(AppError::BadRequest("Top-up has no amount".into()));
                    }
                    BillingAction::TopUp {
                        tenant_id: tenant_id.ok_or_else(|| {
                            AppError::BadRequest("Checkout session has no tenant".into())
                        })?,
                        amount,
                        reference_id: id_or_object(&object["payment_intent"])
                            .map_or_else(|| required(&object["id"], "session id"), Ok)?,
                    }
                }
                _ => BillingAction::Unrecognized {
                    event_type: event.event_type.clone(),
                },
            }
        }

        "invoice.paid" | "invoice.payment_succeeded" => {
            match id_or_object(&object["subscription"]) {
                Some(provider_subscription_id) => {
                    let metadata = &object["subscription_details"]["metadata"];
                    let line = &object["lines"]["data"][0];
                    BillingAction::SubscriptionRenewed {
                        provider_subscription_id,
                        tenant_id: non_empty(&metadata["tenantId"]),
                        plan_id: plan_from(metadata, line["price"]["id"].as_str(), config),
                        reference_id: required(&object["id"], "invoice id")?,
                        period_start: timestamp(&line["period"]["start"]),
                        period_end: timestamp(&line["period"]["end"]),
                    }
                }
                // One-off invoices carry no subscription effect.
                None => BillingAction::Unrecognized {
                    event_type: event.event_type.clone(),
                },
            }
        }

        "invoice.payment_failed" => match id_or_object(&object["subscription"]) {
            Some(provider_subscription_id) => BillingAction::SubscriptionPaymentFailed {
                provider_subscription_id,
                reference_id: required(&object["id"], "invoice id")?,
            },
            None => BillingAction::Unrecognized {
                event_type: event.event_type.clone(),
            },
        },

        "customer.subscription.updated" => {
            let item = &object["items"]["data"][0];
            BillingAction::SubscriptionUpdated {
                provider_subscription_id: required(&object["id"], "subscription id")?,
                status: object["status"]
                    .as_str()
                    .and_then(SubscriptionStatus::from_provider),
                plan_id: plan_from(&object["metadata"], item["price"]["id"].as_str(), config),
                current_period_end: timestamp(&object["current_period_end"])
                    .or_else(|| timestamp(&item["current_period_end"])),
            }
        }

        "customer.subscription.deleted" => BillingAction::SubscriptionCanceled {
            provider_subscription_id: required(&object["id"], "subscription id")?,
        },

        other => BillingAction::Unrecognized {
            event_type: other.to_string(),
        },
    };

    Ok(action)
}

#[cfg(test)]
pub(crate) fn sign(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.", timestamp).as_bytes());
    mac.update(payload);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
