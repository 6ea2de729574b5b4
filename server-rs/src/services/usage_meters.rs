use chrono::{DateTime, Utc};

use crate::error::{AppError, AppResult};
use crate::models::{
    find_plan, Plan, ResourceUsage, Subscription, UsageOutcome, UsagePeriod, UsageResource,
    UsageSummary, OVERAGE_RATE,
};
use crate::store::{BillingStore, UsageCommit, UsageReceipt};

/// Largest quantity a single usage call may meter.
pub const MAX_USAGE_QUANTITY: i64 = 1_000_000;

pub(crate) async fn active_plan(
    store: &dyn BillingStore,
    tenant_id: &str,
) -> AppResult<(Subscription, &'static Plan)> {
    let sub = store
        .active_subscription(tenant_id)
        .await?
        .ok_or(AppError::NoActiveSubscription)?;
    let plan = find_plan(&sub.plan_id)
        .ok_or_else(|| AppError::Internal(format!("Unknown plan '{}'", sub.plan_id)))?;
    Ok((sub, plan))
}

/// Meters `quantity` units of `resource`. Overage is debited from the wallet in the same
/// atomic unit as the counter increment; if the debit fails nothing is recorded.
pub async fn record_usage(
    store: &dyn BillingStore,
    tenant_id: &str,
    resource: UsageResource,
    quantity: i64,
) -> AppResult<UsageOutcome> {
    if !(1..=MAX_USAGE_QUANTITY).contains(&quantity) {
        return Err(AppError::BadRequest(format!(
            "Quantity must be between 1 and {}",
            MAX_USAGE_QUANTITY
        )));
    }

    let (sub, plan) = active_plan(store, tenant_id).await?;
    let quota = plan.quotas.for_usage(resource);
    let rate = OVERAGE_RATE.for_usage(resource);

    let period = match store.current_usage_period(sub.id, Utc::now()).await? {
        Some(period) => period,
        None if quota.is_none() => {
            tracing::debug!(
                tenant_id = %tenant_id,
                resource = %resource,
                "Unlimited usage outside any period"
            );
            return Ok(UsageOutcome {
                allowed: true,
                cost_minor_units: 0,
                is_overage: false,
                covered_by_quota: quantity,
                overage_quantity: 0,
                used_after: None,
            });
        }
        None => return Err(AppError::NoUsagePeriod),
    };

    let UsageReceipt { period, quote: q } = store
        .commit_usage(UsageCommit {
            tenant_id: tenant_id.to_string(),
            period_id: period.id,
            resource,
            quantity,
            quota,
            rate,
        })
        .await?;

    if q.overage_quantity > 0 {
        tracing::info!(
            tenant_id = %tenant_id,
            resource = %resource,
            overage = q.overage_quantity,
            cost = q.cost,
            "Usage billed as overage"
        );
    }
    Ok(UsageOutcome {
        allowed: true,
        cost_minor_units: q.cost,
        is_overage: q.overage_quantity > 0,
        covered_by_quota: q.covered_by_quota,
        overage_quantity: q.overage_quantity,
        used_after: Some(period.used(resource)),
    })
}

pub async fn usage_summary(store: &dyn BillingStore, tenant_id: &str) -> AppResult<UsageSummary> {
    let (sub, plan) = active_plan(store, tenant_id).await?;
    let period = store.current_usage_period(sub.id, Utc::now()).await?;

    let resources = UsageResource::ALL
        .iter()
        .map(|&resource| {
            let used = period.as_ref().map(|p| p.used(resource)).unwrap_or(0);
            let quota = plan.quotas.for_usage(resource);
            ResourceUsage {
                resource,
                used,
                quota,
                remaining: quota.map(|q| (q - used).max(0)),
            }
        })
        .collect();

    Ok(UsageSummary {
        plan_id: sub.plan_id,
        period_start: period.as_ref().map(|p| p.period_start),
        period_end: period.as_ref().map(|p| p.period_end),
        resources,
    })
}

/// Opens (or extends) the usage window `[start, end)` for a subscription.
pub async fn open_period(
    store: &dyn BillingStore,
    subscription_id: uuid::Uuid,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> AppResult<UsagePeriod> {
    if end <= start {
        return Err(AppError::BadRequest("Usage period must end after it starts".into()));
    }
    let period = store.open_usage_period(subscription_id, start, end).await?;
    tracing::info!(
        subscription_id = %subscription_id,
        period_start = %period.period_start,
        period_end = %period.period_end,
        "Usage period open"
    );
    Ok(period)
}
