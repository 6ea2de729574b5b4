//! In-memory `BillingStore` for tests. One mutex guards all state, so every call is
//! atomic and linearizable the same way a database transaction would be.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AddOnStatus, AddOnSubscription, BillingNotification, LedgerDrift, LedgerPosting,
    LimitResource, NewNotification, NewWalletEntry, NewWebhookEvent, PaymentProvider,
    Subscription, SubscriptionPatch, SubscriptionStatus, SubscriptionUpsert, UsagePeriod,
    UsageResource, Wallet, WalletTransaction, WebhookClaim, WebhookEvent,
};
use crate::store::{AddOnPurchase, BillingStore, UsageCommit, UsageReceipt};

#[derive(Default)]
struct State {
    wallets: HashMap<String, Wallet>,
    transactions: Vec<WalletTransaction>,
    subscriptions: Vec<Subscription>,
    periods: Vec<UsagePeriod>,
    addons: Vec<AddOnSubscription>,
    /// (tenant, resource, status)
    resources: Vec<(String, LimitResource, String)>,
    webhooks: Vec<WebhookEvent>,
    notifications: Vec<BillingNotification>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Seeds a provisioned resource row, as the provisioning collaborator would.
    pub fn add_resource(&self, tenant_id: &str, resource: LimitResource, status: &str) {
        self.lock()
            .resources
            .push((tenant_id.to_string(), resource, status.to_string()));
    }

    pub fn transactions_for(&self, tenant_id: &str) -> Vec<WalletTransaction> {
        let state = self.lock();
        let Some(wallet) = state.wallets.get(tenant_id) else {
            return Vec::new();
        };
        state
            .transactions
            .iter()
            .filter(|t| t.wallet_id == wallet.id)
            .cloned()
            .collect()
    }

    pub fn webhook_event(&self, provider: PaymentProvider, event_id: &str) -> Option<WebhookEvent> {
        self.lock()
            .webhooks
            .iter()
            .find(|w| w.provider == provider && w.event_id == event_id)
            .cloned()
    }

    pub fn periods_for(&self, subscription_id: Uuid) -> Vec<UsagePeriod> {
        self.lock()
            .periods
            .iter()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect()
    }

    /// Active subscription on `plan_id` with a usage period around now.
    pub async fn seed_subscription(
        &self,
        tenant_id: &str,
        plan_id: &str,
    ) -> (Subscription, UsagePeriod) {
        let now = Utc::now();
        let sub = self
            .upsert_subscription(SubscriptionUpsert {
                tenant_id: tenant_id.to_string(),
                plan_id: plan_id.to_string(),
                status: SubscriptionStatus::Active,
                provider: PaymentProvider::Stripe,
                provider_subscription_id: format!("sub_{}", tenant_id),
                current_period_end: Some(now + Duration::days(30)),
            })
            .await
            .unwrap();
        let period = self
            .open_usage_period(sub.id, now - Duration::days(1), now + Duration::days(30))
            .await
            .unwrap();
        (sub, period)
    }

    /// Rewinds a webhook claim so tests can exercise stale-claim recovery.
    pub fn age_webhook_claim(&self, provider: PaymentProvider, event_id: &str, by: Duration) {
        let mut state = self.lock();
        if let Some(event) = state
            .webhooks
            .iter_mut()
            .find(|w| w.provider == provider && w.event_id == event_id)
        {
            event.claimed_at -= by;
        }
    }
}

fn post_entry(state: &mut State, entry: &NewWalletEntry) -> AppResult<LedgerPosting> {
    let now = Utc::now();
    let wallet = state
        .wallets
        .entry(entry.tenant_id.clone())
        .or_insert_with(|| Wallet {
            id: Uuid::new_v4(),
            tenant_id: entry.tenant_id.clone(),
            balance: 0,
            created_at: now,
            updated_at: now,
        });

    if let Some(reference_id) = &entry.reference_id {
        if let Some(existing) = state.transactions.iter().find(|t| {
            t.wallet_id == wallet.id
                && t.tx_type == entry.tx_type
                && t.reference_id.as_deref() == Some(reference_id.as_str())
        }) {
            return Ok(LedgerPosting {
                transaction: existing.clone(),
                balance: wallet.balance,
                duplicate: true,
            });
        }
    }

    if wallet.balance + entry.amount < 0 {
        return Err(AppError::InsufficientFunds {
            required: -entry.amount,
            available: wallet.balance,
        });
    }

    wallet.balance += entry.amount;
    wallet.updated_at = now;

    let transaction = WalletTransaction {
        id: Uuid::new_v4(),
        wallet_id: wallet.id,
        amount: entry.amount,
        balance_after: wallet.balance,
        tx_type: entry.tx_type,
        reference_id: entry.reference_id.clone(),
        description: entry.description.clone(),
        created_at: now,
    };
    let balance = wallet.balance;
    state.transactions.push(transaction.clone());

    Ok(LedgerPosting {
        transaction,
        balance,
        duplicate: false,
    })
}

fn counter_mut(period: &mut UsagePeriod, resource: UsageResource) -> &mut i64 {
    match resource {
        UsageResource::Sms => &mut period.sms_count_used,
        UsageResource::Email => &mut period.email_count_used,
        UsageResource::VoiceMinutes => &mut period.voice_minutes_used,
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn post_wallet_entry(&self, entry: NewWalletEntry) -> AppResult<LedgerPosting> {
        post_entry(&mut self.lock(), &entry)
    }

    async fn wallet(&self, tenant_id: &str) -> AppResult<Option<Wallet>> {
        Ok(self.lock().wallets.get(tenant_id).cloned())
    }

    async fn wallet_transactions(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> AppResult<Vec<WalletTransaction>> {
        let mut rows = self.transactions_for(tenant_id);
        rows.reverse();
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn ledger_drift(&self) -> AppResult<Vec<LedgerDrift>> {
        let state = self.lock();
        let mut drift = Vec::new();
        for wallet in state.wallets.values() {
            let sum: i64 = state
                .transactions
                .iter()
                .filter(|t| t.wallet_id == wallet.id)
                .map(|t| t.amount)
                .sum();
            if sum != wallet.balance {
                drift.push(LedgerDrift {
                    wallet_id: wallet.id,
                    tenant_id: wallet.tenant_id.clone(),
                    balance: wallet.balance,
                    transaction_sum: sum,
                });
            }
        }
        Ok(drift)
    }

    async fn active_subscription(&self, tenant_id: &str) -> AppResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .filter(|s| s.tenant_id == tenant_id && s.status == SubscriptionStatus::Active)
            .max_by_key(|s| s.updated_at)
            .cloned())
    }

    async fn subscription_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_subscription_id: &str,
    ) -> AppResult<Option<Subscription>> {
        Ok(self
            .lock()
            .subscriptions
            .iter()
            .find(|s| {
                s.provider == provider && s.provider_subscription_id == provider_subscription_id
            })
            .cloned())
    }

    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> AppResult<Subscription> {
        let mut state = self.lock();
        let now = Utc::now();
        if let Some(existing) = state.subscriptions.iter_mut().find(|s| {
            s.provider == upsert.provider
                && s.provider_subscription_id == upsert.provider_subscription_id
        }) {
            existing.plan_id = upsert.plan_id;
            if existing.status != SubscriptionStatus::Canceled {
                existing.status = upsert.status;
            }
            existing.current_period_end =
                existing.current_period_end.max(upsert.current_period_end);
            existing.updated_at = now;
            return Ok(existing.clone());
        }

        let sub = Subscription {
            id: Uuid::new_v4(),
            tenant_id: upsert.tenant_id,
            plan_id: upsert.plan_id,
            status: upsert.status,
            provider: upsert.provider,
            provider_subscription_id: upsert.provider_subscription_id,
            current_period_end: upsert.current_period_end,
            created_at: now,
            updated_at: now,
        };
        state.subscriptions.push(sub.clone());
        Ok(sub)
    }

    async fn patch_subscription(
        &self,
        subscription_id: Uuid,
        patch: SubscriptionPatch,
    ) -> AppResult<Subscription> {
        let mut state = self.lock();
        let sub = state
            .subscriptions
            .iter_mut()
            .find(|s| s.id == subscription_id)
            .ok_or_else(|| {
                AppError::NotFound(format!("Subscription {} not found", subscription_id))
            })?;
        if let Some(status) = patch.status {
            if sub.status != SubscriptionStatus::Canceled {
                sub.status = status;
            }
        }
        if let Some(plan_id) = patch.plan_id {
            sub.plan_id = plan_id;
        }
        sub.current_period_end = sub.current_period_end.max(patch.current_period_end);
        sub.updated_at = Utc::now();
        Ok(sub.clone())
    }

    async fn current_usage_period(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<UsagePeriod>> {
        Ok(self
            .lock()
            .periods
            .iter()
            .filter(|p| {
                p.subscription_id == subscription_id && p.period_start <= at && at < p.period_end
            })
            .max_by_key(|p| p.period_start)
            .cloned())
    }

    async fn open_usage_period(
        &self,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<UsagePeriod> {
        let mut state = self.lock();
        if let Some(existing) = state
            .periods
            .iter_mut()
            .filter(|p| {
                p.subscription_id == subscription_id && p.period_start < end && start < p.period_end
            })
            .max_by_key(|p| p.period_start)
        {
            existing.period_end = existing.period_end.max(end);
            return Ok(existing.clone());
        }

        let period = UsagePeriod {
            id: Uuid::new_v4(),
            subscription_id,
            period_start: start,
            period_end: end,
            sms_count_used: 0,
            email_count_used: 0,
            voice_minutes_used: 0,
        };
        state.periods.push(period.clone());
        Ok(period)
    }

    async fn commit_usage(&self, commit: UsageCommit) -> AppResult<UsageReceipt> {
        let mut state = self.lock();
        let index = state
            .periods
            .iter()
            .position(|p| p.id == commit.period_id)
            .ok_or(AppError::NoUsagePeriod)?;

        let (quote, charge) = commit.price(state.periods[index].used(commit.resource))?;
        // post_entry validates before it mutates, so a failed debit leaves the counter alone.
        if let Some(charge) = &charge {
            post_entry(&mut state, charge)?;
        }

        let period = &mut state.periods[index];
        *counter_mut(period, commit.resource) += commit.quantity;
        Ok(UsageReceipt {
            period: period.clone(),
            quote,
        })
    }

    async fn addon_subscriptions(
        &self,
        tenant_id: &str,
        active_only: bool,
    ) -> AppResult<Vec<AddOnSubscription>> {
        Ok(self
            .lock()
            .addons
            .iter()
            .filter(|a| {
                a.tenant_id == tenant_id && (!active_only || a.status == AddOnStatus::Active)
            })
            .cloned()
            .collect())
    }

    async fn purchase_addon(&self, purchase: AddOnPurchase) -> AppResult<AddOnSubscription> {
        let mut state = self.lock();
        if let Some(charge) = &purchase.charge {
            post_entry(&mut state, charge)?;
        }
        let row = AddOnSubscription {
            id: Uuid::new_v4(),
            tenant_id: purchase.tenant_id,
            addon_id: purchase.addon_id,
            quantity: purchase.quantity,
            status: AddOnStatus::Active,
            created_at: Utc::now(),
            canceled_at: None,
        };
        state.addons.push(row.clone());
        Ok(row)
    }

    async fn cancel_addon(&self, tenant_id: &str, addon_id: &str) -> AppResult<u64> {
        let mut state = self.lock();
        let now = Utc::now();
        let mut changed = 0;
        for addon in state.addons.iter_mut().filter(|a| {
            a.tenant_id == tenant_id && a.addon_id == addon_id && a.status == AddOnStatus::Active
        }) {
            addon.status = AddOnStatus::Canceled;
            addon.canceled_at = Some(now);
            changed += 1;
        }
        Ok(changed)
    }

    async fn count_active_resources(
        &self,
        tenant_id: &str,
        resource: LimitResource,
    ) -> AppResult<i64> {
        Ok(self
            .lock()
            .resources
            .iter()
            .filter(|(t, r, status)| {
                t == tenant_id && *r == resource && status != "released" && status != "inactive"
            })
            .count() as i64)
    }

    async fn claim_webhook_event(
        &self,
        event: NewWebhookEvent,
        reclaim_after: Duration,
    ) -> AppResult<WebhookClaim> {
        let mut state = self.lock();
        let now = Utc::now();
        if let Some(existing) = state
            .webhooks
            .iter_mut()
            .find(|w| w.provider == event.provider && w.event_id == event.event_id)
        {
            let reclaimable = !existing.processed
                && (existing.error.is_some() || existing.claimed_at < now - reclaim_after);
            if !reclaimable {
                return Ok(WebhookClaim::Duplicate {
                    processed: existing.processed,
                });
            }
            existing.attempts += 1;
            existing.error = None;
            existing.claimed_at = now;
            return Ok(WebhookClaim::Claimed {
                attempt: existing.attempts,
            });
        }

        state.webhooks.push(WebhookEvent {
            id: Uuid::new_v4(),
            provider: event.provider,
            event_id: event.event_id,
            event_type: event.event_type,
            payload: event.payload,
            processed: false,
            error: None,
            attempts: 1,
            received_at: now,
            claimed_at: now,
        });
        Ok(WebhookClaim::Claimed { attempt: 1 })
    }

    async fn complete_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> AppResult<()> {
        let mut state = self.lock();
        if let Some(event) = state
            .webhooks
            .iter_mut()
            .find(|w| w.provider == provider && w.event_id == event_id)
        {
            event.processed = true;
            event.error = None;
        }
        Ok(())
    }

    async fn fail_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error: &str,
    ) -> AppResult<()> {
        let mut state = self.lock();
        if let Some(event) = state
            .webhooks
            .iter_mut()
            .find(|w| w.provider == provider && w.event_id == event_id)
        {
            event.error = Some(error.to_string());
        }
        Ok(())
    }

    async fn failed_webhook_events(&self, limit: i64) -> AppResult<Vec<WebhookEvent>> {
        let mut rows: Vec<WebhookEvent> = self
            .lock()
            .webhooks
            .iter()
            .filter(|w| !w.processed && w.error.is_some())
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn create_notification(&self, notification: NewNotification) -> AppResult<()> {
        let mut state = self.lock();
        let exists = state.notifications.iter().any(|n| {
            n.tenant_id == notification.tenant_id
                && n.kind == notification.kind
                && n.reference_id == notification.reference_id
        });
        if !exists {
            state.notifications.push(BillingNotification {
                id: Uuid::new_v4(),
                tenant_id: notification.tenant_id,
                kind: notification.kind,
                message: notification.message,
                reference_id: notification.reference_id,
                created_at: Utc::now(),
            });
        }
        Ok(())
    }

    async fn notifications(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> AppResult<Vec<BillingNotification>> {
        let mut rows: Vec<BillingNotification> = self
            .lock()
            .notifications
            .iter()
            .filter(|n| n.tenant_id == tenant_id)
            .cloned()
            .collect();
        rows.reverse();
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn health_check(&self) -> bool {
        true
    }
}
