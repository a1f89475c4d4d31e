//! Unified Entitlement Module
//!
//! Single source of truth for "may this account use paid features right now?".
//! `has_paid_access` is the only implementation of that rule; the snapshot in
//! `Entitlement::compute` explains the answer but never re-derives it.
//!
//! Evaluation order, first match wins:
//! 1. Lifetime plan with active status
//! 2. Active status, or cancelled/past due with an end date still ahead
//! 3. Trial still running
//! 4. Everything else is denied
//!
//! Operator and demo bypasses live in [`crate::gate::AccessGate`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use siteline_shared::{AccountId, SubscriptionPlan, SubscriptionStatus};
use time::OffsetDateTime;

use crate::account::AccountEntitlement;
use crate::error::BillingResult;
use crate::events::EntitlementEvent;
use crate::store::EntitlementStore;

/// The access predicate
pub fn has_paid_access(record: &AccountEntitlement, now: OffsetDateTime) -> bool {
    if record.is_lifetime() {
        return true;
    }

    match record.subscription_status {
        SubscriptionStatus::Active => true,
        SubscriptionStatus::Cancelled | SubscriptionStatus::PastDue => paid_through(record)
            .map(|ends_at| ends_at > now)
            .unwrap_or(false),
        SubscriptionStatus::Trial => record.trial_ends_at.map(|ends| ends > now).unwrap_or(false),
        _ => false,
    }
}

/// Later of the two end dates a cancelled or past-due record may carry
fn paid_through(record: &AccountEntitlement) -> Option<OffsetDateTime> {
    match (record.current_period_ends_at, record.subscription_ends_at) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Explains an access decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementState {
    Lifetime,
    /// Subscription active and in good standing
    Active,
    /// Cancelled but still inside the paid period
    CancelledGrace,
    /// Payment failed but the paid period has not ended
    PastDueGrace,
    Trialing,
    TrialExpired,
    /// Paid access that has run out
    Lapsed,
    /// Never had access
    None,
}

impl std::fmt::Display for EntitlementState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntitlementState::Lifetime => write!(f, "lifetime"),
            EntitlementState::Active => write!(f, "active"),
            EntitlementState::CancelledGrace => write!(f, "cancelled_grace"),
            EntitlementState::PastDueGrace => write!(f, "past_due_grace"),
            EntitlementState::Trialing => write!(f, "trialing"),
            EntitlementState::TrialExpired => write!(f, "trial_expired"),
            EntitlementState::Lapsed => write!(f, "lapsed"),
            EntitlementState::None => write!(f, "none"),
        }
    }
}

/// Source that determined the entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementSource {
    Lifetime,
    Subscription,
    Trial,
    None,
}

/// Entitlement snapshot for one account at one instant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    pub account_id: AccountId,
    pub state: EntitlementState,
    pub source: EntitlementSource,
    pub plan: SubscriptionPlan,
    pub has_access: bool,
    /// When access ends, if it is time limited
    #[serde(with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

impl Entitlement {
    /// Pure function: compute the snapshot from a record
    pub fn compute(record: &AccountEntitlement, now: OffsetDateTime) -> Self {
        let has_access = has_paid_access(record, now);

        let (state, source, expires_at) = if record.is_lifetime() {
            (EntitlementState::Lifetime, EntitlementSource::Lifetime, None)
        } else {
            match record.subscription_status {
                SubscriptionStatus::Active => (
                    EntitlementState::Active,
                    EntitlementSource::Subscription,
                    record.current_period_ends_at,
                ),
                SubscriptionStatus::Cancelled if has_access => (
                    EntitlementState::CancelledGrace,
                    EntitlementSource::Subscription,
                    paid_through(record),
                ),
                SubscriptionStatus::PastDue if has_access => (
                    EntitlementState::PastDueGrace,
                    EntitlementSource::Subscription,
                    paid_through(record),
                ),
                SubscriptionStatus::Trial if has_access => (
                    EntitlementState::Trialing,
                    EntitlementSource::Trial,
                    record.trial_ends_at,
                ),
                SubscriptionStatus::Trial => {
                    (EntitlementState::TrialExpired, EntitlementSource::None, None)
                }
                SubscriptionStatus::None if record.trial_used() => {
                    (EntitlementState::TrialExpired, EntitlementSource::None, None)
                }
                SubscriptionStatus::None => {
                    (EntitlementState::None, EntitlementSource::None, None)
                }
                _ => (EntitlementState::Lapsed, EntitlementSource::None, None),
            }
        };

        Self {
            account_id: record.account_id,
            state,
            source,
            plan: record.subscription_plan,
            has_access,
            expires_at,
            computed_at: now,
        }
    }
}

/// Read side of the entitlement engine
#[derive(Clone)]
pub struct EntitlementService {
    store: Arc<dyn EntitlementStore>,
}

impl EntitlementService {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Create the record for a new account (idempotent)
    pub async fn ensure_account(&self, account_id: AccountId) -> BillingResult<AccountEntitlement> {
        self.store.create_account(account_id).await
    }

    pub async fn get_record(&self, account_id: AccountId) -> BillingResult<Option<AccountEntitlement>> {
        self.store.get_account(account_id).await
    }

    /// Entitlement snapshot for an account at `now`, `None` without a record
    pub async fn compute_entitlement(
        &self,
        account_id: AccountId,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Entitlement>> {
        Ok(self
            .store
            .get_account(account_id)
            .await?
            .map(|record| Entitlement::compute(&record, now)))
    }

    /// Audit trail for an account, newest first
    pub async fn history(
        &self,
        account_id: AccountId,
        limit: i64,
    ) -> BillingResult<Vec<EntitlementEvent>> {
        self.store.account_events(account_id, limit).await
    }
}
