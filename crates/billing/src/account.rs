//! Account entitlement record
//!
//! One row per account. Every transition in this crate produces a complete
//! new record, so status and plan are always written together.

use serde::{Deserialize, Serialize};
use siteline_shared::{AccountId, SubscriptionPlan, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

/// Persisted entitlement state of one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntitlement {
    pub account_id: AccountId,
    pub subscription_status: SubscriptionStatus,
    pub subscription_plan: SubscriptionPlan,
    pub provider_subscription_id: Option<String>,
    pub provider_order_id: Option<String>,
    pub provider_customer_id: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_started_at: Option<OffsetDateTime>,
    /// First trial start; set once and never cleared by any transition
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_consumed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    /// Paid-through date of the current billing period
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_ends_at: Option<OffsetDateTime>,
    /// Hard end date reported by the provider when a subscription ends
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_ends_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl AccountEntitlement {
    /// Fresh record for a newly created account: no plan, no status
    pub fn new(account_id: AccountId, now: OffsetDateTime) -> Self {
        Self {
            account_id,
            subscription_status: SubscriptionStatus::None,
            subscription_plan: SubscriptionPlan::None,
            provider_subscription_id: None,
            provider_order_id: None,
            provider_customer_id: None,
            trial_started_at: None,
            trial_consumed_at: None,
            trial_ends_at: None,
            current_period_ends_at: None,
            subscription_ends_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_lifetime(&self) -> bool {
        self.subscription_plan == SubscriptionPlan::Lifetime
            && self.subscription_status == SubscriptionStatus::Active
    }

    /// Whether a trial was ever started on this account
    ///
    /// Paid upserts clear `trial_started_at`, so the durable marker decides.
    pub fn trial_used(&self) -> bool {
        self.trial_consumed_at.is_some() || self.trial_started_at.is_some()
    }

    /// Record with a trial starting at `now`
    pub fn with_trial_started(&self, now: OffsetDateTime, length: Duration) -> Self {
        Self {
            subscription_status: SubscriptionStatus::Trial,
            subscription_plan: SubscriptionPlan::Trial,
            trial_started_at: Some(now),
            trial_consumed_at: self.trial_consumed_at.or(Some(now)),
            trial_ends_at: Some(now + length),
            updated_at: now,
            ..self.clone()
        }
    }

    /// Record with lifetime access
    ///
    /// Trial dates other than the end are kept as they were.
    pub fn with_lifetime(&self, now: OffsetDateTime) -> Self {
        Self {
            subscription_status: SubscriptionStatus::Active,
            subscription_plan: SubscriptionPlan::Lifetime,
            trial_ends_at: None,
            current_period_ends_at: None,
            subscription_ends_at: None,
            updated_at: now,
            ..self.clone()
        }
    }

    /// Equality that ignores `updated_at`, used to detect no-op transitions
    pub fn same_state_as(&self, other: &Self) -> bool {
        Self {
            updated_at: other.updated_at,
            ..self.clone()
        } == *other
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for AccountEntitlement {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let account_id: Uuid = row.try_get("account_id")?;
        let status: String = row.try_get("subscription_status")?;
        let plan: String = row.try_get("subscription_plan")?;

        Ok(Self {
            account_id: AccountId(account_id),
            subscription_status: status.parse().map_err(|e: String| {
                sqlx::Error::ColumnDecode {
                    index: "subscription_status".into(),
                    source: e.into(),
                }
            })?,
            subscription_plan: plan.parse().map_err(|e: String| sqlx::Error::ColumnDecode {
                index: "subscription_plan".into(),
                source: e.into(),
            })?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            provider_order_id: row.try_get("provider_order_id")?,
            provider_customer_id: row.try_get("provider_customer_id")?,
            trial_started_at: row.try_get("trial_started_at")?,
            trial_consumed_at: row.try_get("trial_consumed_at")?,
            trial_ends_at: row.try_get("trial_ends_at")?,
            current_period_ends_at: row.try_get("current_period_ends_at")?,
            subscription_ends_at: row.try_get("subscription_ends_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
