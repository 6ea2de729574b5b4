use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::config::FlutterwaveConfig;
use crate::error::{AppError, AppResult};
use crate::models::PaymentProvider;
use crate::services::reconciler::{BillingAction, ProviderEvent};

type HmacSha256 = Hmac<Sha256>;

/// Accepts either the legacy `verif-hash` header (the shared secret hash itself) or a
/// `flutterwave-signature` header carrying base64 HMAC-SHA256 of the body.
pub fn verify_signature(
    payload: &[u8],
    verif_hash: Option<&str>,
    signature: Option<&str>,
    secret_hash: &str,
) -> AppResult<()> {
    if secret_hash.is_empty() {
        return Err(AppError::InvalidSignature(
            "Flutterwave secret hash is not configured".into(),
        ));
    }

    if let Some(signature) = signature {
        let expected = STANDARD
            .decode(signature.trim())
            .map_err(|_| AppError::InvalidSignature("malformed signature".into()))?;
        let mut mac = HmacSha256::new_from_slice(secret_hash.as_bytes())
            .map_err(|_| AppError::Internal("HMAC key error".into()))?;
        mac.update(payload);
        return mac
            .verify_slice(&expected)
            .map_err(|_| AppError::InvalidSignature("signature mismatch".into()));
    }

    match verif_hash {
        Some(hash) if bool::from(hash.as_bytes().ct_eq(secret_hash.as_bytes())) => Ok(()),
        Some(_) => Err(AppError::InvalidSignature("verif-hash mismatch".into())),
        None => Err(AppError::InvalidSignature("missing signature header".into())),
    }
}

/// Flutterwave reuses transaction ids across event kinds, so the idempotency key
/// combines the event name with the data id.
pub fn parse_event(payload: &[u8]) -> AppResult<ProviderEvent> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| AppError::BadRequest(format!("Invalid webhook payload: {}", e)))?;

    let event_type = value["event"]
        .as_str()
        .or_else(|| value["event.type"].as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::BadRequest("Flutterwave event has no type".into()))?
        .to_string();
    let data_id = match &value["data"]["id"] {
        Value::Number(n) => n.to_string(),
        Value::String(s) if !s.is_empty() => s.clone(),
        _ => return Err(AppError::BadRequest("Flutterwave event has no data id".into())),
    };

    Ok(ProviderEvent {
        provider: PaymentProvider::Flutterwave,
        event_id: format!("{}:{}", event_type, data_id),
        event_type,
        payload: value,
    })
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn tenant_of(payload: &Value) -> Option<String> {
    [
        &payload["meta_data"]["tenant_id"],
        &payload["data"]["meta"]["tenant_id"],
        &payload["data"]["meta_data"]["tenant_id"],
    ]
    .into_iter()
    .find_map(scalar)
}

/// Flutterwave reports amounts in major units.
fn to_minor_units(amount: &Value) -> Option<i64> {
    let major = match amount {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    let minor = (major * 100.0).round();
    (minor.is_finite() && minor > 0.0).then_some(minor as i64)
}

fn subscription_key(payment_plan: &str, customer_id: &str) -> String {
    format!("{}-{}", payment_plan, customer_id)
}

pub fn normalize_event(
    event: &ProviderEvent,
    config: &FlutterwaveConfig,
) -> AppResult<BillingAction> {
    let payload = &event.payload;
    let data = &payload["data"];

    let action = match event.event_type.as_str() {
        "charge.completed" => {
            let successful = data["status"].as_str() == Some("successful");
            let reference_id = scalar(&data["id"])
                .ok_or_else(|| AppError::BadRequest("Charge has no transaction id".into()))?;
            let customer_id = scalar(&data["customer"]["id"]);

            match scalar(&data["payment_plan"]) {
                Some(payment_plan) => {
                    let customer_id = customer_id.ok_or_else(|| {
                        AppError::BadRequest("Plan charge has no customer".into())
                    })?;
                    let provider_subscription_id = subscription_key(&payment_plan, &customer_id);
                    if successful {
                        BillingAction::SubscriptionRenewed {
                            provider_subscription_id,
                            tenant_id: tenant_of(payload),
                            plan_id: config
                                .plan_for_payment_plan(&payment_plan)
                                .map(str::to_string),
                            reference_id,
                            period_start: None,
                            period_end: None,
                        }
                    } else {
                        BillingAction::SubscriptionPaymentFailed {
                            provider_subscription_id,
                            reference_id,
                        }
                    }
                }
                None if successful => BillingAction::TopUp {
                    tenant_id: tenant_of(payload)
                        .ok_or_else(|| AppError::BadRequest("Charge has no tenant".into()))?,
                    amount: to_minor_units(&data["amount"])
                        .ok_or_else(|| AppError::BadRequest("Charge has no amount".into()))?,
                    reference_id,
                },
                // A failed one-off charge moves no money.
                None => BillingAction::Unrecognized {
                    event_type: event.event_type.clone(),
                },
            }
        }

        "subscription.cancelled" => {
            let payment_plan = scalar(&data["plan"]["id"])
                .or_else(|| scalar(&data["payment_plan"]))
                .ok_or_else(|| AppError::BadRequest("Cancellation has no plan".into()))?;
            let customer_id = scalar(&data["customer"]["id"])
                .ok_or_else(|| AppError::BadRequest("Cancellation has no customer".into()))?;
            BillingAction::SubscriptionCanceled {
                provider_subscription_id: subscription_key(&payment_plan, &customer_id),
            }
        }

        other => BillingAction::Unrecognized {
            event_type: other.to_string(),
        },
    };

    Ok(action)
}

#[cfg(test)]
pub(crate) fn sign(payload: &[u8], secret_hash: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret_hash.as_bytes()).unwrap();
    mac.update(payload);
    STANDARD.encode(mac.finalize().into_bytes())
}
