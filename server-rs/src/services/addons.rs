use crate::error::{AppError, AppResult};
use crate::models::{find_addon, AddOnSubscription, NewWalletEntry, TransactionType};
use crate::store::{AddOnPurchase, BillingStore};

const MAX_QUANTITY: i32 = 100;

/// Debits `price × quantity` and activates the add-on in one atomic unit.
pub async fn purchase(
    store: &dyn BillingStore,
    tenant_id: &str,
    addon_id: &str,
    quantity: i32,
) -> AppResult<AddOnSubscription> {
    let addon = find_addon(addon_id)
        .ok_or_else(|| AppError::NotFound(format!("Add-on '{}' not found", addon_id)))?;
    if !(1..=MAX_QUANTITY).contains(&quantity) {
        return Err(AppError::BadRequest(format!(
            "Quantity must be between 1 and {}",
            MAX_QUANTITY
        )));
    }

    let cost = addon.monthly_price * i64::from(quantity);
    let charge = (cost > 0).then(|| NewWalletEntry {
        tenant_id: tenant_id.to_string(),
        amount: -cost,
        tx_type: TransactionType::Usage,
        reference_id: None,
        description: format!("{} x {}", addon.name, quantity),
    });

    let row = store
        .purchase_addon(AddOnPurchase {
            tenant_id: tenant_id.to_string(),
            addon_id: addon.id.to_string(),
            quantity,
            charge,
        })
        .await?;

    tracing::info!(
        tenant_id = %tenant_id,
        addon_id = %addon.id,
        quantity,
        cost,
        "Add-on purchased"
    );
    Ok(row)
}

/// Takes effect on the next limit check. Already-provisioned resources are left alone.
pub async fn cancel(store: &dyn BillingStore, tenant_id: &str, addon_id: &str) -> AppResult<()> {
    let canceled = store.cancel_addon(tenant_id, addon_id).await?;
    if canceled == 0 {
        return Err(AppError::NotFound(format!(
            "No active add-on '{}' to cancel",
            addon_id
        )));
    }
    tracing::info!(tenant_id = %tenant_id, addon_id = %addon_id, canceled, "Add-on canceled");
    Ok(())
}

pub async fn list(store: &dyn BillingStore, tenant_id: &str) -> AppResult<Vec<AddOnSubscription>> {
    store.addon_subscriptions(tenant_id, false).await
}
