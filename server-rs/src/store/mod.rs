//! Persistence seam for the billing engine.
//!
//! Every method is one atomic unit: either all of its writes become visible or none do.
//! `PgBillingStore` runs each unit in a single PostgreSQL transaction; the in-memory
//! store used by the tests holds one lock for the duration of a call.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    quote, AddOnSubscription, BillingNotification, LedgerDrift, LedgerPosting, LimitResource,
    NewNotification, NewWalletEntry, NewWebhookEvent, PaymentProvider, Quote, Subscription,
    SubscriptionPatch, SubscriptionUpsert, TransactionType, UsagePeriod, UsageResource, Wallet,
    WalletTransaction, WebhookClaim, WebhookEvent,
};

#[cfg(test)]
pub mod memory;
pub mod postgres;

pub use postgres::PgBillingStore;

/// Metered usage against a period. The store prices it against the locked counter.
#[derive(Debug, Clone)]
pub struct UsageCommit {
    pub tenant_id: String,
    pub period_id: Uuid,
    pub resource: UsageResource,
    pub quantity: i64,
    /// `None` is unlimited.
    pub quota: Option<i64>,
    /// Minor units per overage unit.
    pub rate: i64,
}

impl UsageCommit {
    /// Quotes the commit against the counter value `used` and builds the overage debit.
    pub fn price(&self, used: i64) -> AppResult<(Quote, Option<NewWalletEntry>)> {
        let out_of_range = || AppError::BadRequest("Usage quantity is out of range".into());
        used.checked_add(self.quantity).ok_or_else(out_of_range)?;
        let quote = quote(self.quota, used, self.quantity, self.rate).ok_or_else(out_of_range)?;

        let charge = (quote.cost > 0).then(|| NewWalletEntry {
            tenant_id: self.tenant_id.clone(),
            amount: -quote.cost,
            tx_type: TransactionType::Usage,
            reference_id: None,
            description: format!(
                "{} overage: {} x {}",
                self.resource, quote.overage_quantity, self.rate
            ),
        });
        Ok((quote, charge))
    }
}

#[derive(Debug, Clone)]
pub struct UsageReceipt {
    pub period: UsagePeriod,
    pub quote: Quote,
}

#[derive(Debug, Clone)]
pub struct AddOnPurchase {
    pub tenant_id: String,
    pub addon_id: String,
    pub quantity: i32,
    pub charge: Option<NewWalletEntry>,
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Wallet ledger

    /// Applies a signed amount to the tenant's wallet (creating it at zero if needed)
    /// and appends the matching transaction. Fails with `InsufficientFunds` when the
    /// balance would go negative. A repeated `(tx_type, reference_id)` returns the
    /// original posting with `duplicate = true`.
    async fn post_wallet_entry(&self, entry: NewWalletEntry) -> AppResult<LedgerPosting>;

    async fn wallet(&self, tenant_id: &str) -> AppResult<Option<Wallet>>;

    /// Most recent first.
    async fn wallet_transactions(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> AppResult<Vec<WalletTransaction>>;

    /// Wallets whose balance differs from the sum of their transactions.
    async fn ledger_drift(&self) -> AppResult<Vec<LedgerDrift>>;

    // Subscriptions

    async fn active_subscription(&self, tenant_id: &str) -> AppResult<Option<Subscription>>;

    async fn subscription_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_subscription_id: &str,
    ) -> AppResult<Option<Subscription>>;

    /// `canceled` is terminal: neither this nor `patch_subscription` moves a canceled
    /// row to another status.
    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> AppResult<Subscription>;

    async fn patch_subscription(
        &self,
        subscription_id: Uuid,
        patch: SubscriptionPatch,
    ) -> AppResult<Subscription>;

    // Usage periods

    async fn current_usage_period(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<UsagePeriod>>;

    /// Opens `[start, end)` for the subscription. A period overlapping that window is
    /// extended instead, so repeated or overlapping openings converge on one row.
    async fn open_usage_period(
        &self,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<UsagePeriod>;

    /// Locks the period counter, quotes the usage against it, debits any overage and
    /// increments the counter. Concurrent commits on one period queue behind the lock.
    /// A failed debit leaves the counter untouched.
    async fn commit_usage(&self, commit: UsageCommit) -> AppResult<UsageReceipt>;

    // Add-ons

    async fn addon_subscriptions(
        &self,
        tenant_id: &str,
        active_only: bool,
    ) -> AppResult<Vec<AddOnSubscription>>;

    /// Debits the charge (if any) and records the active add-on together.
    async fn purchase_addon(&self, purchase: AddOnPurchase) -> AppResult<AddOnSubscription>;

    /// Cancels every active row of the add-on; returns how many rows changed.
    async fn cancel_addon(&self, tenant_id: &str, addon_id: &str) -> AppResult<u64>;

    // Provisioned resources

    async fn count_active_resources(
        &self,
        tenant_id: &str,
        resource: LimitResource,
    ) -> AppResult<i64>;

    // Webhook idempotency

    async fn claim_webhook_event(
        &self,
        event: NewWebhookEvent,
        reclaim_after: Duration,
    ) -> AppResult<WebhookClaim>;

    async fn complete_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> AppResult<()>;

    async fn fail_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error: &str,
    ) -> AppResult<()>;

    async fn failed_webhook_events(&self, limit: i64) -> AppResult<Vec<WebhookEvent>>;

    // Notifications

    /// Idempotent per `(tenant_id, kind, reference_id)`.
    async fn create_notification(&self, notification: NewNotification) -> AppResult<()>;

    async fn notifications(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> AppResult<Vec<BillingNotification>>;

    async fn health_check(&self) -> bool;
}
