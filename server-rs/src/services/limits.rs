//! Point-in-time capacity checks for count-bound resources.
//!
//! Nothing is reserved: two provisioning requests racing past the same check can both
//! pass. Callers that need a hard cap re-check on their own write path.

use crate::error::{AppError, AppResult};
use crate::models::{find_addon, LimitCheck, LimitResource};
use crate::services::usage_meters::active_plan;
use crate::store::BillingStore;

/// Plan quota plus active add-on increments. `None` is unlimited.
pub async fn effective_limit(
    store: &dyn BillingStore,
    tenant_id: &str,
    plan_quota: Option<i64>,
    resource: LimitResource,
) -> AppResult<Option<i64>> {
    let Some(base) = plan_quota else {
        return Ok(None);
    };

    let mut limit = base;
    for addon in store.addon_subscriptions(tenant_id, true).await? {
        match find_addon(&addon.addon_id) {
            Some(def) => {
                limit += def.limit_increase.for_limit(resource) * i64::from(addon.quantity);
            }
            None => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    addon_id = %addon.addon_id,
                    "Active add-on missing from catalog"
                );
            }
        }
    }
    Ok(Some(limit))
}

pub async fn check_limit(
    store: &dyn BillingStore,
    tenant_id: &str,
    resource: LimitResource,
) -> AppResult<LimitCheck> {
    let current = store.count_active_resources(tenant_id, resource).await?;

    let (_, plan) = match active_plan(store, tenant_id).await {
        Ok(found) => found,
        Err(AppError::NoActiveSubscription) => {
            return Ok(LimitCheck {
                resource,
                allowed: false,
                limit: Some(0),
                current,
            });
        }
        Err(e) => return Err(e),
    };

    let limit =
        effective_limit(store, tenant_id, plan.quotas.for_limit(resource), resource).await?;
    Ok(LimitCheck {
        resource,
        allowed: limit.map_or(true, |l| current < l),
        limit,
        current,
    })
}

/// Like `check_limit`, but a full tenant becomes `LimitReached`.
pub async fn require_capacity(
    store: &dyn BillingStore,
    tenant_id: &str,
    resource: LimitResource,
) -> AppResult<LimitCheck> {
    let check = check_limit(store, tenant_id, resource).await?;
    if !check.allowed {
        tracing::info!(
            tenant_id = %tenant_id,
            resource = %resource,
            current = check.current,
            limit = ?check.limit,
            "Provisioning blocked by limit"
        );
        return Err(AppError::LimitReached {
            resource: resource.to_string(),
            current: check.current,
            limit: check.limit.unwrap_or(0),
        });
    }
    Ok(check)
}
