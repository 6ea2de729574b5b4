use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    AddOnStatus, AddOnSubscription, BillingNotification, LedgerDrift, LedgerPosting,
    LimitResource, NewNotification, NewWalletEntry, NewWebhookEvent, PaymentProvider,
    Subscription, SubscriptionPatch, SubscriptionUpsert, UsagePeriod, Wallet, WalletTransaction,
    WebhookClaim, WebhookEvent,
};
use crate::store::{AddOnPurchase, BillingStore, UsageCommit, UsageReceipt};

const USAGE_PERIOD_COLUMNS: &str = "id, subscription_id, period_start, period_end, \
     sms_count_used, email_count_used, voice_minutes_used";

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Wallet posting on an open transaction. The wallet row stays locked until the
/// surrounding transaction ends, which serializes postings per tenant.
async fn post_entry_in(
    conn: &mut PgConnection,
    entry: &NewWalletEntry,
) -> AppResult<LedgerPosting> {
    let wallet_id: Uuid = sqlx::query_scalar(
        r#"INSERT INTO wallets (id, tenant_id, balance, created_at, updated_at)
        VALUES ($1, $2, 0, NOW(), NOW())
        ON CONFLICT (tenant_id) DO UPDATE SET updated_at = wallets.updated_at
        RETURNING id"#,
    )
    .bind(Uuid::new_v4())
    .bind(&entry.tenant_id)
    .fetch_one(&mut *conn)
    .await?;

    if let Some(reference_id) = &entry.reference_id {
        let existing: Option<WalletTransaction> = sqlx::query_as(
            r#"SELECT * FROM wallet_transactions
            WHERE wallet_id = $1 AND tx_type = $2 AND reference_id = $3"#,
        )
        .bind(wallet_id)
        .bind(entry.tx_type.as_str())
        .bind(reference_id)
        .fetch_optional(&mut *conn)
        .await?;

        if let Some(transaction) = existing {
            let balance: i64 = sqlx::query_scalar("SELECT balance FROM wallets WHERE id = $1")
                .bind(wallet_id)
                .fetch_one(&mut *conn)
                .await?;
            return Ok(LedgerPosting {
                transaction,
                balance,
                duplicate: true,
            });
        }
    }

    let balance: Option<i64> = sqlx::query_scalar(
        r#"UPDATE wallets SET balance = balance + $2, updated_at = NOW()
        WHERE id = $1 AND balance + $2 >= 0
        RETURNING balance"#,
    )
    .bind(wallet_id)
    .bind(entry.amount)
    .fetch_optional(&mut *conn)
    .await?;

    let balance = match balance {
        Some(b) => b,
        None => {
            let available: i64 = sqlx::query_scalar("SELECT balance FROM wallets WHERE id = $1")
                .bind(wallet_id)
                .fetch_one(&mut *conn)
                .await?;
            return Err(AppError::InsufficientFunds {
                required: -entry.amount,
                available,
            });
        }
    };

    let transaction: WalletTransaction = sqlx::query_as(
        r#"INSERT INTO wallet_transactions
            (id, wallet_id, amount, balance_after, tx_type, reference_id, description, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
        RETURNING *"#,
    )
    .bind(Uuid::new_v4())
    .bind(wallet_id)
    .bind(entry.amount)
    .bind(balance)
    .bind(entry.tx_type.as_str())
    .bind(&entry.reference_id)
    .bind(&entry.description)
    .fetch_one(&mut *conn)
    .await?;

    Ok(LedgerPosting {
        transaction,
        balance,
        duplicate: false,
    })
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn post_wallet_entry(&self, entry: NewWalletEntry) -> AppResult<LedgerPosting> {
        let mut tx = self.pool.begin().await?;
        match post_entry_in(&mut tx, &entry).await {
            Ok(posting) => {
                tx.commit().await?;
                Ok(posting)
            }
            // A concurrent posting with the same reference won the insert.
            Err(AppError::Database(e)) if is_unique_violation(&e) => {
                drop(tx);
                let mut tx = self.pool.begin().await?;
                let posting = post_entry_in(&mut tx, &entry).await?;
                tx.commit().await?;
                Ok(posting)
            }
            Err(e) => Err(e),
        }
    }

    async fn wallet(&self, tenant_id: &str) -> AppResult<Option<Wallet>> {
        let wallet = sqlx::query_as("SELECT * FROM wallets WHERE tenant_id = $1")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(wallet)
    }

    async fn wallet_transactions(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> AppResult<Vec<WalletTransaction>> {
        let rows = sqlx::query_as(
            r#"SELECT t.* FROM wallet_transactions t
            JOIN wallets w ON w.id = t.wallet_id
            WHERE w.tenant_id = $1
            ORDER BY t.created_at DESC, t.id DESC
            LIMIT $2"#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn ledger_drift(&self) -> AppResult<Vec<LedgerDrift>> {
        let rows = sqlx::query_as(
            r#"SELECT w.id AS wallet_id, w.tenant_id, w.balance,
                COALESCE(SUM(t.amount), 0)::bigint AS transaction_sum
            FROM wallets w
            LEFT JOIN wallet_transactions t ON t.wallet_id = w.id
            GROUP BY w.id, w.tenant_id, w.balance
            HAVING w.balance <> COALESCE(SUM(t.amount), 0)"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn active_subscription(&self, tenant_id: &str) -> AppResult<Option<Subscription>> {
        let sub = sqlx::query_as(
            r#"SELECT * FROM billing_subscriptions
            WHERE tenant_id = $1 AND status = 'active'
            ORDER BY updated_at DESC LIMIT 1"#,
        )
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn subscription_by_provider_id(
        &self,
        provider: PaymentProvider,
        provider_subscription_id: &str,
    ) -> AppResult<Option<Subscription>> {
        let sub = sqlx::query_as(
            r#"SELECT * FROM billing_subscriptions
            WHERE provider = $1 AND provider_subscription_id = $2"#,
        )
        .bind(provider.as_str())
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn upsert_subscription(&self, upsert: SubscriptionUpsert) -> AppResult<Subscription> {
        let sub = sqlx::query_as(
            r#"INSERT INTO billing_subscriptions
                (id, tenant_id, plan_id, status, provider, provider_subscription_id,
                 current_period_end, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), NOW())
            ON CONFLICT (provider, provider_subscription_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                status = CASE WHEN billing_subscriptions.status = 'canceled'
                    THEN billing_subscriptions.status ELSE EXCLUDED.status END,
                current_period_end = GREATEST(
                    billing_subscriptions.current_period_end,
                    EXCLUDED.current_period_end
                ),
                updated_at = NOW()
            RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(&upsert.tenant_id)
        .bind(&upsert.plan_id)
        .bind(upsert.status.as_str())
        .bind(upsert.provider.as_str())
        .bind(&upsert.provider_subscription_id)
        .bind(upsert.current_period_end)
        .fetch_one(&self.pool)
        .await?;
        Ok(sub)
    }

    async fn patch_subscription(
        &self,
        subscription_id: Uuid,
        patch: SubscriptionPatch,
    ) -> AppResult<Subscription> {
        let sub: Option<Subscription> = sqlx::query_as(
            r#"UPDATE billing_subscriptions SET
                status = CASE WHEN status = 'canceled' THEN status ELSE COALESCE($2, status) END,
                plan_id = COALESCE($3, plan_id),
                current_period_end = GREATEST(current_period_end, $4),
                updated_at = NOW()
            WHERE id = $1
            RETURNING *"#,
        )
        .bind(subscription_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(&patch.plan_id)
        .bind(patch.current_period_end)
        .fetch_optional(&self.pool)
        .await?;

        sub.ok_or_else(|| {
            AppError::NotFound(format!("Subscription {} not found", subscription_id))
        })
    }

    async fn current_usage_period(
        &self,
        subscription_id: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Option<UsagePeriod>> {
        let sql = format!(
            r#"SELECT {} FROM billing_usage_periods
            WHERE subscription_id = $1 AND period_start <= $2 AND $2 < period_end
            ORDER BY period_start DESC LIMIT 1"#,
            USAGE_PERIOD_COLUMNS
        );
        let period = sqlx::query_as(&sql)
            .bind(subscription_id)
            .bind(at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(period)
    }

    async fn open_usage_period(
        &self,
        subscription_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<UsagePeriod> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent openings for the same subscription.
        sqlx::query("SELECT id FROM billing_subscriptions WHERE id = $1 FOR UPDATE")
            .bind(subscription_id)
            .fetch_optional(&mut *tx)
            .await?;

        let overlap_sql = format!(
            r#"SELECT {} FROM billing_usage_periods
            WHERE subscription_id = $1 AND period_start < $3 AND $2 < period_end
            ORDER BY period_start DESC LIMIT 1"#,
            USAGE_PERIOD_COLUMNS
        );
        let overlapping: Option<UsagePeriod> = sqlx::query_as(&overlap_sql)
            .bind(subscription_id)
            .bind(start)
            .bind(end)
            .fetch_optional(&mut *tx)
            .await?;

        let period: UsagePeriod = match overlapping {
            Some(existing) => {
                let sql = format!(
                    r#"UPDATE billing_usage_periods
                    SET period_end = GREATEST(period_end, $2), updated_at = NOW()
                    WHERE id = $1
                    RETURNING {}"#,
                    USAGE_PERIOD_COLUMNS
                );
                sqlx::query_as(&sql)
                    .bind(existing.id)
                    .bind(end)
                    .fetch_one(&mut *tx)
                    .await?
            }
            None => {
                let sql = format!(
                    r#"INSERT INTO billing_usage_periods
                        (id, subscription_id, period_start, period_end,
                         sms_count_used, email_count_used, voice_minutes_used,
                         created_at, updated_at)
                    VALUES ($1, $2, $3, $4, 0, 0, 0, NOW(), NOW())
                    RETURNING {}"#,
                    USAGE_PERIOD_COLUMNS
                );
                sqlx::query_as(&sql)
                    .bind(Uuid::new_v4())
                    .bind(subscription_id)
                    .bind(start)
                    .bind(end)
                    .fetch_one(&mut *tx)
                    .await?
            }
        };

        tx.commit().await?;
        Ok(period)
    }

    async fn commit_usage(&self, commit: UsageCommit) -> AppResult<UsageReceipt> {
        let mut tx = self.pool.begin().await?;

        let lock_sql = format!(
            "SELECT {} FROM billing_usage_periods WHERE id = $1 FOR UPDATE",
            USAGE_PERIOD_COLUMNS
        );
        let locked: Option<UsagePeriod> = sqlx::query_as(&lock_sql)
            .bind(commit.period_id)
            .fetch_optional(&mut *tx)
            .await?;
        let locked = locked.ok_or(AppError::NoUsagePeriod)?;

        let (quote, charge) = commit.price(locked.used(commit.resource))?;
        if let Some(charge) = &charge {
            post_entry_in(&mut tx, charge).await?;
        }

        let update_sql = format!(
            r#"UPDATE billing_usage_periods
            SET {col} = {col} + $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {cols}"#,
            col = commit.resource.counter_column(),
            cols = USAGE_PERIOD_COLUMNS
        );
        let period: UsagePeriod = sqlx::query_as(&update_sql)
            .bind(commit.period_id)
            .bind(commit.quantity)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(UsageReceipt { period, quote })
    }

    async fn addon_subscriptions(
        &self,
        tenant_id: &str,
        active_only: bool,
    ) -> AppResult<Vec<AddOnSubscription>> {
        let rows = sqlx::query_as(
            r#"SELECT * FROM billing_addons
            WHERE tenant_id = $1 AND ($2 = false OR status = 'active')
            ORDER BY created_at"#,
        )
        .bind(tenant_id)
        .bind(active_only)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn purchase_addon(&self, purchase: AddOnPurchase) -> AppResult<AddOnSubscription> {
        let mut tx = self.pool.begin().await?;

        if let Some(charge) = &purchase.charge {
            post_entry_in(&mut tx, charge).await?;
        }

        let row: AddOnSubscription = sqlx::query_as(
            r#"INSERT INTO billing_addons (id, tenant_id, addon_id, quantity, status, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            RETURNING *"#,
        )
        .bind(Uuid::new_v4())
        .bind(&purchase.tenant_id)
        .bind(&purchase.addon_id)
        .bind(purchase.quantity)
        .bind(AddOnStatus::Active.as_str())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn cancel_addon(&self, tenant_id: &str, addon_id: &str) -> AppResult<u64> {
        let result = sqlx::query(
            r#"UPDATE billing_addons SET status = 'canceled', canceled_at = NOW()
            WHERE tenant_id = $1 AND addon_id = $2 AND status = 'active'"#,
        )
        .bind(tenant_id)
        .bind(addon_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn count_active_resources(
        &self,
        tenant_id: &str,
        resource: LimitResource,
    ) -> AppResult<i64> {
        let count = match resource {
            LimitResource::PhoneNumbers => {
                sqlx::query_scalar::<_, i64>(
                    r#"SELECT COUNT(*)::bigint FROM phone_numbers
                    WHERE tenant_id = $1 AND status NOT IN ('released', 'inactive')"#,
                )
                .bind(tenant_id)
                .fetch_one(&self.pool)
                .await?
            }
        };
        Ok(count)
    }

    async fn claim_webhook_event(
        &self,
        event: NewWebhookEvent,
        reclaim_after: Duration,
    ) -> AppResult<WebhookClaim> {
        let attempt: Option<i32> = sqlx::query_scalar(
            r#"INSERT INTO webhook_events
                (id, provider, event_id, event_type, payload, processed, attempts,
                 received_at, claimed_at)
            VALUES ($1, $2, $3, $4, $5, false, 1, NOW(), NOW())
            ON CONFLICT (provider, event_id) DO UPDATE SET
                attempts = webhook_events.attempts + 1,
                error = NULL,
                claimed_at = NOW()
            WHERE webhook_events.processed = false
              AND (webhook_events.error IS NOT NULL
                   OR webhook_events.claimed_at < NOW() - make_interval(secs => $6))
            RETURNING attempts"#,
        )
        .bind(Uuid::new_v4())
        .bind(event.provider.as_str())
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(reclaim_after.num_seconds() as f64)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(attempt) = attempt {
            return Ok(WebhookClaim::Claimed { attempt });
        }

        let processed: Option<bool> = sqlx::query_scalar(
            "SELECT processed FROM webhook_events WHERE provider = $1 AND event_id = $2",
        )
        .bind(event.provider.as_str())
        .bind(&event.event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(WebhookClaim::Duplicate {
            processed: processed.unwrap_or(false),
        })
    }

    async fn complete_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
    ) -> AppResult<()> {
        sqlx::query(
            r#"UPDATE webhook_events SET processed = true, error = NULL, processed_at = NOW()
            WHERE provider = $1 AND event_id = $2"#,
        )
        .bind(provider.as_str())
        .bind(event_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_webhook_event(
        &self,
        provider: PaymentProvider,
        event_id: &str,
        error: &str,
    ) -> AppResult<()> {
        sqlx::query("UPDATE webhook_events SET error = $3 WHERE provider = $1 AND event_id = $2")
            .bind(provider.as_str())
            .bind(event_id)
            .bind(error)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn failed_webhook_events(&self, limit: i64) -> AppResult<Vec<WebhookEvent>> {
        let rows = sqlx::query_as(
            r#"SELECT id, provider, event_id, event_type, payload, processed, error,
                attempts, received_at, claimed_at
            FROM webhook_events
            WHERE processed = false AND error IS NOT NULL
            ORDER BY received_at DESC
            LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create_notification(&self, notification: NewNotification) -> AppResult<()> {
        sqlx::query(
            r#"INSERT INTO billing_notifications
                (id, tenant_id, kind, message, reference_id, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (tenant_id, kind, reference_id) DO NOTHING"#,
        )
        .bind(Uuid::new_v4())
        .bind(&notification.tenant_id)
        .bind(&notification.kind)
        .bind(&notification.message)
        .bind(&notification.reference_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn notifications(
        &self,
        tenant_id: &str,
        limit: i64,
    ) -> AppResult<Vec<BillingNotification>> {
        let rows = sqlx::query_as(
            r#"SELECT * FROM billing_notifications
            WHERE tenant_id = $1
            ORDER BY created_at DESC
            LIMIT $2"#,
        )
        .bind(tenant_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn health_check(&self) -> bool {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }
}
