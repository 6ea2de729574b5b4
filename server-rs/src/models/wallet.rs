use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: Uuid,
    pub tenant_id: String,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    MonthlyGrant,
    TopUp,
    Usage,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::MonthlyGrant => "monthly_grant",
            TransactionType::TopUp => "top_up",
            TransactionType::Usage => "usage",
            TransactionType::Refund => "refund",
        }
    }
}

impl TryFrom<String> for TransactionType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "monthly_grant" => Ok(TransactionType::MonthlyGrant),
            "top_up" => Ok(TransactionType::TopUp),
            "usage" => Ok(TransactionType::Usage),
            "refund" => Ok(TransactionType::Refund),
            other => Err(format!("unknown transaction type '{}'", other)),
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    pub amount: i64,
    pub balance_after: i64,
    #[sqlx(try_from = "String")]
    pub tx_type: TransactionType,
    pub reference_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// A signed ledger movement. Negative amounts are debits.
#[derive(Debug, Clone)]
pub struct NewWalletEntry {
    pub tenant_id: String,
    pub amount: i64,
    pub tx_type: TransactionType,
    pub reference_id: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerPosting {
    pub transaction: WalletTransaction,
    pub balance: i64,
    /// The reference id had already been posted; nothing changed.
    pub duplicate: bool,
}

/// A wallet whose balance disagrees with the sum of its transactions.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDrift {
    pub wallet_id: Uuid,
    pub tenant_id: String,
    pub balance: i64,
    pub transaction_sum: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundRequest {
    pub amount: i64,
    pub reference_id: String,
    pub description: Option<String>,
}
