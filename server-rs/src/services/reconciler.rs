//! Applies payment-provider webhook events to the ledger exactly once.
//!
//! Each delivery is claimed in `webhook_events` before anything else happens. The claim is
//! the idempotency lock: a processed or in-flight event is acknowledged without side
//! effects, a failed or abandoned one is claimed again and re-applied. Every side effect
//! below is itself keyed (ledger postings by reference id, subscriptions by provider id,
//! periods by start), so re-applying a partially applied event is safe.

use chrono::{DateTime, Duration, Months, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::{
    find_plan, NewNotification, NewWebhookEvent, PaymentProvider, Subscription,
    SubscriptionPatch, SubscriptionStatus, SubscriptionUpsert, TransactionType, WebhookClaim,
};
use crate::services::{flutterwave, stripe_service, usage_meters, wallet};
use crate::store::BillingStore;

/// A verified, parsed delivery.
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub provider: PaymentProvider,
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
}

/// Provider-independent billing effect of one event.
#[derive(Debug, Clone, PartialEq)]
pub enum BillingAction {
    SubscriptionActivated {
        tenant_id: String,
        plan_id: String,
        provider_subscription_id: String,
        current_period_end: Option<DateTime<Utc>>,
    },
    TopUp {
        tenant_id: String,
        amount: i64,
        reference_id: String,
    },
    /// A paid subscription invoice. Carries tenant and plan when the provider sends
    /// them, which lets the first charge of a subscription create it.
    SubscriptionRenewed {
        provider_subscription_id: String,
        tenant_id: Option<String>,
        plan_id: Option<String>,
        reference_id: String,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
    },
    SubscriptionPaymentFailed {
        provider_subscription_id: String,
        reference_id: String,
    },
    SubscriptionUpdated {
        provider_subscription_id: String,
        status: Option<SubscriptionStatus>,
        plan_id: Option<String>,
        current_period_end: Option<DateTime<Utc>>,
    },
    SubscriptionCanceled {
        provider_subscription_id: String,
    },
    Unrecognized {
        event_type: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    Ignored,
}

pub async fn process(
    store: &dyn BillingStore,
    config: &Config,
    event: ProviderEvent,
) -> AppResult<WebhookOutcome> {
    let provider = event.provider;
    let claim = store
        .claim_webhook_event(
            NewWebhookEvent {
                provider,
                event_id: event.event_id.clone(),
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
            },
            Duration::seconds(config.webhooks.reclaim_after_secs),
        )
        .await?;

    let attempt = match claim {
        WebhookClaim::Duplicate { processed } => {
            tracing::info!(
                provider = %provider,
                event_id = %event.event_id,
                processed,
                "Duplicate webhook delivery acknowledged"
            );
            return Ok(WebhookOutcome::Duplicate);
        }
        WebhookClaim::Claimed { attempt } => attempt,
    };

    match handle(store, config, &event).await {
        Ok(outcome) => {
            store.complete_webhook_event(provider, &event.event_id).await?;
            tracing::info!(
                provider = %provider,
                event_id = %event.event_id,
                event_type = %event.event_type,
                attempt,
                "Webhook processed"
            );
            Ok(outcome)
        }
        Err(e) => {
            tracing::error!(
                provider = %provider,
                event_id = %event.event_id,
                event_type = %event.event_type,
                attempt,
                error = %e,
                "Webhook processing failed"
            );
            if let Err(mark_err) = store
                .fail_webhook_event(provider, &event.event_id, &e.to_string())
                .await
            {
                tracing::error!(
                    event_id = %event.event_id,
                    error = %mark_err,
                    "Could not record webhook failure"
                );
            }
            Err(e)
        }
    }
}

async fn handle(
    store: &dyn BillingStore,
    config: &Config,
    event: &ProviderEvent,
) -> AppResult<WebhookOutcome> {
    let action = match event.provider {
        PaymentProvider::Stripe => stripe_service::normalize_event(event, &config.stripe)?,
        PaymentProvider::Flutterwave => flutterwave::normalize_event(event, &config.flutterwave)?,
    };
    apply(store, event.provider, action).await
}

fn one_month_after(start: DateTime<Utc>) -> DateTime<Utc> {
    start
        .checked_add_months(Months::new(1))
        .unwrap_or(start + Duration::days(30))
}

pub async fn apply(
    store: &dyn BillingStore,
    provider: PaymentProvider,
    action: BillingAction,
) -> AppResult<WebhookOutcome> {
    match action {
        BillingAction::SubscriptionActivated {
            tenant_id,
            plan_id,
            provider_subscription_id,
            current_period_end,
        } => {
            let now = Utc::now();
            let period_end = current_period_end.unwrap_or_else(|| one_month_after(now));
            let sub = store
                .upsert_subscription(SubscriptionUpsert {
                    tenant_id,
                    plan_id,
                    status: SubscriptionStatus::Active,
                    provider,
                    provider_subscription_id,
                    current_period_end: Some(period_end),
                })
                .await?;
            if is_canceled(&sub, "activation") {
                return Ok(WebhookOutcome::Processed);
            }
            usage_meters::open_period(store, sub.id, now, period_end).await?;
            tracing::info!(
                tenant_id = %sub.tenant_id,
                plan_id = %sub.plan_id,
                "Subscription activated"
            );
        }

        BillingAction::TopUp {
            tenant_id,
            amount,
            reference_id,
        } => {
            wallet::credit(
                store,
                &tenant_id,
                amount,
                TransactionType::TopUp,
                Some(&reference_id),
                &format!("{} top-up", provider),
            )
            .await?;
        }

        BillingAction::SubscriptionRenewed {
            provider_subscription_id,
            tenant_id,
            plan_id,
            reference_id,
            period_start,
            period_end,
        } => {
            let start = period_start.unwrap_or_else(Utc::now);
            let end = period_end.unwrap_or_else(|| one_month_after(start));

            let sub = match (tenant_id, plan_id) {
                (Some(tenant_id), Some(plan_id)) => {
                    store
                        .upsert_subscription(SubscriptionUpsert {
                            tenant_id,
                            plan_id,
                            status: SubscriptionStatus::Active,
                            provider,
                            provider_subscription_id,
                            current_period_end: Some(end),
                        })
                        .await?
                }
                (_, plan_id) => {
                    let existing =
                        require_subscription(store, provider, &provider_subscription_id).await?;
                    store
                        .patch_subscription(
                            existing.id,
                            SubscriptionPatch {
                                status: Some(SubscriptionStatus::Active),
                                plan_id,
                                current_period_end: Some(end),
                            },
                        )
                        .await?
                }
            };
            if is_canceled(&sub, "renewal") {
                return Ok(WebhookOutcome::Processed);
            }

            let plan = find_plan(&sub.plan_id)
                .ok_or_else(|| AppError::Internal(format!("Unknown plan '{}'", sub.plan_id)))?;
            if plan.monthly_wallet_grant > 0 {
                wallet::credit(
                    store,
                    &sub.tenant_id,
                    plan.monthly_wallet_grant,
                    TransactionType::MonthlyGrant,
                    Some(&reference_id),
                    &format!("{} plan monthly credit", plan.name),
                )
                .await?;
            }
            usage_meters::open_period(store, sub.id, start, end).await?;
        }

        BillingAction::SubscriptionPaymentFailed {
            provider_subscription_id,
            reference_id,
        } => {
            let Some(sub) = find_subscription(store, provider, &provider_subscription_id).await?
            else {
                return Ok(WebhookOutcome::Processed);
            };
            if is_canceled(&sub, "payment failure") {
                return Ok(WebhookOutcome::Processed);
            }
            store
                .patch_subscription(
                    sub.id,
                    SubscriptionPatch {
                        status: Some(SubscriptionStatus::PastDue),
                        ..Default::default()
                    },
                )
                .await?;
            store
                .create_notification(NewNotification {
                    tenant_id: sub.tenant_id.clone(),
                    kind: "payment_failed".into(),
                    message: "Your subscription payment failed. \
                        Update your payment method to keep your plan active."
                        .into(),
                    reference_id,
                })
                .await?;
            tracing::warn!(tenant_id = %sub.tenant_id, "Subscription payment failed");
        }

        BillingAction::SubscriptionUpdated {
            provider_subscription_id,
            status,
            plan_id,
            current_period_end,
        } => {
            let Some(sub) = find_subscription(store, provider, &provider_subscription_id).await?
            else {
                return Ok(WebhookOutcome::Processed);
            };
            if is_canceled(&sub, "update") {
                return Ok(WebhookOutcome::Processed);
            }
            store
                .patch_subscription(
                    sub.id,
                    SubscriptionPatch {
                        status,
                        plan_id,
                        current_period_end,
                    },
                )
                .await?;
        }

        BillingAction::SubscriptionCanceled {
            provider_subscription_id,
        } => {
            let Some(sub) = find_subscription(store, provider, &provider_subscription_id).await?
            else {
                return Ok(WebhookOutcome::Processed);
            };
            store
                .patch_subscription(
                    sub.id,
                    SubscriptionPatch {
                        status: Some(SubscriptionStatus::Canceled),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!(tenant_id = %sub.tenant_id, "Subscription canceled");
        }

        BillingAction::Unrecognized { event_type } => {
            tracing::info!(
                provider = %provider,
                event_type = %event_type,
                "Ignoring unhandled webhook event"
            );
            return Ok(WebhookOutcome::Ignored);
        }
    }

    Ok(WebhookOutcome::Processed)
}

/// Cancellation is terminal. Late events for a canceled subscription are acknowledged
/// without side effects.
fn is_canceled(sub: &Subscription, event: &str) -> bool {
    if sub.status != SubscriptionStatus::Canceled {
        return false;
    }
    tracing::warn!(
        tenant_id = %sub.tenant_id,
        provider_subscription_id = %sub.provider_subscription_id,
        event = %event,
        "Ignoring lifecycle event for canceled subscription"
    );
    true
}

/// Lifecycle events for subscriptions this service never saw are logged and dropped.
async fn find_subscription(
    store: &dyn BillingStore,
    provider: PaymentProvider,
    provider_subscription_id: &str,
) -> AppResult<Option<Subscription>> {
    let sub = store
        .subscription_by_provider_id(provider, provider_subscription_id)
        .await?;
    if sub.is_none() {
        tracing::warn!(
            provider = %provider,
            provider_subscription_id = %provider_subscription_id,
            "Webhook references an unknown subscription"
        );
    }
    Ok(sub)
}

async fn require_subscription(
    store: &dyn BillingStore,
    provider: PaymentProvider,
    provider_subscription_id: &str,
) -> AppResult<Subscription> {
    store
        .subscription_by_provider_id(provider, provider_subscription_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(format!(
                "Subscription {} not found for {}",
                provider_subscription_id, provider
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::store::memory::MemoryStore;
    use serde_json::json;

    fn flutterwave_top_up(event_id: u64, amount: f64) -> ProviderEvent {
        ProviderEvent {
            provider: PaymentProvider::Flutterwave,
            event_id: format!("charge.completed:{}", event_id),
            event_type: "charge.completed".into(),
            payload: json!({
                "event": "charge.completed",
                "data": {
                    "id": event_id,
                    "tx_ref": "ref-1",
                    "amount": amount,
                    "currency": "USD",
                    "status": "successful",
                    "customer": { "id": 77, "email": "ops@example.com" }
                },
                "meta_data": { "tenant_id": "t1" }
            }),
        }
    }

    fn stripe_event(id: &str, event_type: &str, object: Value) -> ProviderEvent {
        ProviderEvent {
            provider: PaymentProvider::Stripe,
            event_id: id.into(),
            event_type: event_type.into(),
            payload: json!({ "id": id, "type": event_type, "data": { "object": object } }),
        }
    }

    #[tokio::test]
    async fn duplicate_top_up_credits_once() {
        let store = MemoryStore::new();
        let config = test_config();

        let first = process(&store, &config, flutterwave_top_up(9001, 10.0)).await.unwrap();
        let second = process(&store, &config, flutterwave_top_up(9001, 10.0)).await.unwrap();

        assert_eq!(first, WebhookOutcome::Processed);
        assert_eq!(second, WebhookOutcome::Duplicate);
        let txs = store.transactions_for("t1");
        assert_eq!(txs.len(), 1);
        assert_eq!(txs[0].amount, 1_000);
        assert_eq!(txs[0].tx_type, TransactionType::TopUp);
    }

    #[tokio::test]
    async fn checkout_then_invoice_activates_and_grants() {
        let store = MemoryStore::new();
        let config = test_config();

        let checkout = stripe_event(
            "evt_1",
            "checkout.session.completed",
            json!({
                "id": "cs_1",
                "mode": "subscription",
                "subscription": "sub_123",
                "client_reference_id": "t1",
                "metadata": { "planId": "pro" }
            }),
        );
        process(&store, &config, checkout).await.unwrap();

        let sub = store.active_subscription("t1").await.unwrap().unwrap();
        assert_eq!(sub.plan_id, "pro");
        assert_eq!(store.periods_for(sub.id).len(), 1);

        let now = Utc::now().timestamp();
        let invoice = stripe_event(
            "evt_2",
            "invoice.paid",
            json!({
                "id": "in_1",
                "subscription": "sub_123",
                "lines": {
                    "data": [ { "period": { "start": now - 60, "end": now + 86_400 * 30 } } ]
                }
            }),
        );
        process(&store, &config, invoice.clone()).await.unwrap();
        // Redelivery under a new event id must not grant twice.
        let mut redelivered = invoice;
        redelivered.event_id = "evt_3".into();
        process(&store, &config, redelivered).await.unwrap();

        assert_eq!(wallet::balance(&store, "t1").await.unwrap(), 2_000);
        assert_eq!(store.periods_for(sub.id).len(), 1);
    }

    #[tokio::test]
    async fn payment_failure_marks_past_due_and_notifies() {
        let store = MemoryStore::new();
        let config = test_config();
        let (sub, _) = store.seed_subscription("t1", "starter").await;

        let failed = stripe_event(
            "evt_f",
            "invoice.payment_failed",
            json!({ "id": "in_9", "subscription": sub.provider_subscription_id }),
        );
        process(&store, &config, failed).await.unwrap();

        assert!(store.active_subscription("t1").await.unwrap().is_none());
        let notes = store.notifications("t1", 10).await.unwrap();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].kind, "payment_failed");
        assert_eq!(wallet::balance(&store, "t1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancellation_keeps_the_row() {
        let store = MemoryStore::new();
        let config = test_config();
        let (sub, _) = store.seed_subscription("t1", "starter").await;

        let deleted = stripe_event(
            "evt_d",
            "customer.subscription.deleted",
            json!({ "id": sub.provider_subscription_id, "status": "canceled" }),
        );
        process(&store, &config, deleted).await.unwrap();

        let row = store
            .subscription_by_provider_id(PaymentProvider::Stripe, &sub.provider_subscription_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn unrecognized_events_are_acknowledged() {
        let store = MemoryStore::new();
        let config = test_config();
        let event = stripe_event("evt_u", "customer.created", json!({ "id": "cus_1" }));

        let outcome = process(&store, &config, event).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(store.webhook_event(PaymentProvider::Stripe, "evt_u").unwrap().processed);
    }

    #[tokio::test]
    async fn failed_event_is_recorded_and_retried() {
        let store = MemoryStore::new();
        let config = test_config();
        // Renewal for a subscription that does not exist yet.
        let invoice = stripe_event(
            "evt_r",
            "invoice.paid",
            json!({ "id": "in_r", "subscription": "sub_later" }),
        );

        assert!(process(&store, &config, invoice.clone()).await.is_err());
        let row = store.webhook_event(PaymentProvider::Stripe, "evt_r").unwrap();
        assert!(!row.processed);
        assert!(row.error.is_some());
        assert_eq!(store.failed_webhook_events(10).await.unwrap().len(), 1);

        store
            .upsert_subscription(SubscriptionUpsert {
                tenant_id: "t1".into(),
                plan_id: "starter".into(),
                status: SubscriptionStatus::Active,
                provider: PaymentProvider::Stripe,
                provider_subscription_id: "sub_later".into(),
                current_period_end: None,
            })
            .await
            .unwrap();

        assert_eq!(
            process(&store, &config, invoice).await.unwrap(),
            WebhookOutcome::Processed
        );
        let row = store.webhook_event(PaymentProvider::Stripe, "evt_r").unwrap();
        assert!(row.processed);
        assert_eq!(row.attempts, 2);
        assert_eq!(wallet::balance(&store, "t1").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn stale_claims_are_reclaimed() {
        let store = MemoryStore::new();
        let config = test_config();
        let event = flutterwave_top_up(42, 5.0);

        // Simulate a worker that claimed the event and died.
        store
            .claim_webhook_event(
                NewWebhookEvent {
                    provider: event.provider,
                    event_id: event.event_id.clone(),
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                },
                Duration::seconds(300),
            )
            .await
            .unwrap();
        assert_eq!(
            process(&store, &config, event.clone()).await.unwrap(),
            WebhookOutcome::Duplicate
        );

        store.age_webhook_claim(event.provider, &event.event_id, Duration::seconds(600));
        assert_eq!(
            process(&store, &config, event).await.unwrap(),
            WebhookOutcome::Processed
        );
        assert_eq!(wallet::balance(&store, "t1").await.unwrap(), 500);
    }

    #[tokio::test]
    async fn partially_applied_renewal_does_not_double_grant() {
        let store = MemoryStore::new();
        let (sub, period) = store.seed_subscription("t1", "starter").await;
        let action = BillingAction::SubscriptionRenewed {
            provider_subscription_id: sub.provider_subscription_id.clone(),
            tenant_id: None,
            plan_id: None,
            reference_id: "in_7".into(),
            period_start: Some(period.period_start),
            period_end: Some(period.period_end),
        };

        apply(&store, PaymentProvider::Stripe, action.clone()).await.unwrap();
        apply(&store, PaymentProvider::Stripe, action).await.unwrap();

        assert_eq!(wallet::balance(&store, "t1").await.unwrap(), 500);
        assert_eq!(store.transactions_for("t1").len(), 1);
        assert_eq!(store.periods_for(sub.id).len(), 1);
    }

    #[tokio::test]
    async fn late_events_do_not_revive_a_canceled_subscription() {
        let store = MemoryStore::new();
        let (sub, period) = store.seed_subscription("t1", "starter").await;
        let stripe = PaymentProvider::Stripe;
        let sub_id = sub.provider_subscription_id.clone();

        apply(
            &store,
            stripe,
            BillingAction::SubscriptionCanceled {
                provider_subscription_id: sub_id.clone(),
            },
        )
        .await
        .unwrap();

        let late = [
            BillingAction::SubscriptionRenewed {
                provider_subscription_id: sub_id.clone(),
                tenant_id: None,
                plan_id: None,
                reference_id: "in_late".into(),
                period_start: Some(period.period_end),
                period_end: Some(period.period_end + Duration::days(30)),
            },
            BillingAction::SubscriptionRenewed {
                provider_subscription_id: sub_id.clone(),
                tenant_id: Some("t1".into()),
                plan_id: Some("pro".into()),
                reference_id: "in_later".into(),
                period_start: Some(period.period_end),
                period_end: Some(period.period_end + Duration::days(30)),
            },
            BillingAction::SubscriptionPaymentFailed {
                provider_subscription_id: sub_id.clone(),
                reference_id: "in_failed".into(),
            },
            BillingAction::SubscriptionUpdated {
                provider_subscription_id: sub_id.clone(),
                status: Some(SubscriptionStatus::Active),
                plan_id: Some("pro".into()),
                current_period_end: None,
            },
        ];
        for action in late {
            assert_eq!(
                apply(&store, stripe, action).await.unwrap(),
                WebhookOutcome::Processed
            );
        }

        let row = store
            .subscription_by_provider_id(stripe, &sub_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, SubscriptionStatus::Canceled);
        assert!(store.active_subscription("t1").await.unwrap().is_none());
        assert_eq!(wallet::balance(&store, "t1").await.unwrap(), 0);
        assert!(store.transactions_for("t1").is_empty());
        assert_eq!(store.periods_for(sub.id).len(), 1);
        assert!(store.notifications("t1", 10).await.unwrap().is_empty());
    }
}
