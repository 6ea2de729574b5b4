use crate::error::{AppError, AppResult};
use crate::models::{LedgerDrift, LedgerPosting, NewWalletEntry, TransactionType, WalletTransaction};
use crate::store::BillingStore;

const MAX_TRANSACTION_PAGE: i64 = 200;

pub async fn credit(
    store: &dyn BillingStore,
    tenant_id: &str,
    amount: i64,
    tx_type: TransactionType,
    reference_id: Option<&str>,
    description: &str,
) -> AppResult<LedgerPosting> {
    if amount <= 0 {
        return Err(AppError::BadRequest("Credit amount must be positive".into()));
    }
    post(store, tenant_id, amount, tx_type, reference_id, description).await
}

/// Fails with `InsufficientFunds` when `amount` exceeds the balance.
pub async fn debit(
    store: &dyn BillingStore,
    tenant_id: &str,
    amount: i64,
    tx_type: TransactionType,
    reference_id: Option<&str>,
    description: &str,
) -> AppResult<LedgerPosting> {
    if amount <= 0 {
        return Err(AppError::BadRequest("Debit amount must be positive".into()));
    }
    post(store, tenant_id, -amount, tx_type, reference_id, description).await
}

/// Compensates a usage charge. Keyed by `reference_id`, so repeating it is harmless.
pub async fn refund(
    store: &dyn BillingStore,
    tenant_id: &str,
    amount: i64,
    reference_id: &str,
    description: &str,
) -> AppResult<LedgerPosting> {
    if reference_id.trim().is_empty() {
        return Err(AppError::BadRequest("Refunds need a reference id".into()));
    }
    credit(
        store,
        tenant_id,
        amount,
        TransactionType::Refund,
        Some(reference_id),
        description,
    )
    .await
}

async fn post(
    store: &dyn BillingStore,
    tenant_id: &str,
    amount: i64,
    tx_type: TransactionType,
    reference_id: Option<&str>,
    description: &str,
) -> AppResult<LedgerPosting> {
    let posting = store
        .post_wallet_entry(NewWalletEntry {
            tenant_id: tenant_id.to_string(),
            amount,
            tx_type,
            reference_id: reference_id.map(str::to_string),
            description: description.to_string(),
        })
        .await?;

    if posting.duplicate {
        tracing::info!(
            tenant_id = %tenant_id,
            tx_type = %tx_type,
            reference_id = ?reference_id,
            "Wallet posting already applied"
        );
    } else {
        tracing::info!(
            tenant_id = %tenant_id,
            tx_type = %tx_type,
            amount,
            balance = posting.balance,
            "Wallet posting applied"
        );
    }
    Ok(posting)
}

/// Tenants without a wallet have a zero balance.
pub async fn balance(store: &dyn BillingStore, tenant_id: &str) -> AppResult<i64> {
    Ok(store.wallet(tenant_id).await?.map(|w| w.balance).unwrap_or(0))
}

pub async fn transactions(
    store: &dyn BillingStore,
    tenant_id: &str,
    limit: Option<i64>,
) -> AppResult<Vec<WalletTransaction>> {
    let limit = limit.unwrap_or(50).clamp(1, MAX_TRANSACTION_PAGE);
    store.wallet_transactions(tenant_id, limit).await
}

pub async fn verify_ledger(store: &dyn BillingStore) -> AppResult<Vec<LedgerDrift>> {
    let drift = store.ledger_drift().await?;
    for d in &drift {
        tracing::error!(
            tenant_id = %d.tenant_id,
            wallet_id = %d.wallet_id,
            balance = d.balance,
            transaction_sum = d.transaction_sum,
            "Wallet balance drifted from its transactions"
        );
    }
    Ok(drift)
}
