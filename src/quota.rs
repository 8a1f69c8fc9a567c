//! Per-tenant quota enforcement: daily limits come from the usage
//! aggregates, monthly limits from the rate-limit counter window.

use crate::models::{Error, Tenant, TenantId, UsageDelta, month_anchor, monthly_key};
use crate::store::{TenantStore, UsageStore};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// Resolved limits; 0 means "no limit".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub daily: i64,
    pub monthly: i64,
}

#[derive(Clone)]
pub struct QuotaEngine {
    tenants: Arc<dyn TenantStore>,
    usage: Arc<dyn UsageStore>,
}

fn first_nonzero(candidates: impl IntoIterator<Item = Option<i64>>) -> i64 {
    candidates
        .into_iter()
        .flatten()
        .find(|v| *v != 0)
        .unwrap_or(0)
}

impl QuotaEngine {
    pub fn new(tenants: Arc<dyn TenantStore>, usage: Arc<dyn UsageStore>) -> Self {
        Self { tenants, usage }
    }

    pub async fn limits_for(&self, tenant: &Tenant) -> Result<Limits, Error> {
        let plan = self
            .tenants
            .plan(tenant.plan_id)
            .await?
            .ok_or(Error::NotFound("plan"))?;

        Ok(Limits {
            daily: first_nonzero([tenant.daily_limit_override, plan.emails_per_day()]),
            monthly: first_nonzero([
                tenant.monthly_limit_override,
                plan.emails_per_month(),
                Some(plan.included_messages),
            ]),
        })
    }

    /// Enforces both windows for an ingest of `recipients` messages.
    /// Exactly at the limit passes; strictly greater fails.
    pub async fn check(
        &self,
        tenant: &Tenant,
        recipients: i64,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let limits = self.limits_for(tenant).await?;

        if limits.daily > 0 {
            let today = self.usage.sent_on(tenant.id, now.date_naive()).await?;
            if today + recipients > limits.daily {
                return Err(Error::QuotaExceeded(format!(
                    "daily limit of {} reached ({today} sent today)",
                    limits.daily
                )));
            }
        }

        if limits.monthly > 0 {
            let anchor = month_anchor(now);
            let current = self
                .usage
                .counter(tenant.id, &monthly_key(anchor), anchor)
                .await?;
            if current + recipients > limits.monthly {
                return Err(Error::QuotaExceeded(format!(
                    "monthly limit of {} reached ({current} sent this month)",
                    limits.monthly
                )));
            }
        }

        Ok(())
    }

    /// Makes sure the monthly counter row exists before any enqueue, so the
    /// post-enqueue increment cannot double-create it.
    pub async fn ensure_month(&self, tenant: TenantId, now: DateTime<Utc>) -> Result<(), Error> {
        let anchor = month_anchor(now);
        self.usage
            .ensure_counter(tenant, &monthly_key(anchor), anchor)
            .await
    }

    /// Counts `enqueued` successfully appended jobs against both windows.
    /// The usage aggregate is best-effort and never fails the ingest.
    pub async fn commit(
        &self,
        tenant: TenantId,
        enqueued: i64,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        if enqueued == 0 {
            return Ok(());
        }

        let anchor = month_anchor(now);
        self.usage
            .incr_counter(tenant, &monthly_key(anchor), anchor, enqueued)
            .await?;

        if let Err(err) = self
            .usage
            .add_usage(tenant, now.date_naive(), UsageDelta::sent(enqueued))
            .await
        {
            warn!(tenant = %tenant, "failed to update usage aggregate: {err}");
        }

        Ok(())
    }
}
