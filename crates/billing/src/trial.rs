//! Self-service trial activation
//!
//! A trial can be started once per account, and only by an account that
//! does not already have paid access. The preconditions are checked against
//! the row read inside the store transaction. An authenticated account with
//! no row yet is provisioned first, so the first request always sees one.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use siteline_shared::AccountId;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::account::AccountEntitlement;
use crate::entitlement::has_paid_access;
use crate::error::BillingResult;
use crate::events::{ActorType, EntitlementEventBuilder, EntitlementEventType};
use crate::store::EntitlementStore;

/// Default trial length
pub const DEFAULT_TRIAL_DAYS: i64 = 30;

/// Why a trial was not started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialRejection {
    NotFound,
    TrialAlreadyUsed,
    AlreadyHasAccess,
}

impl TrialRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialRejection::NotFound => "not_found",
            TrialRejection::TrialAlreadyUsed => "trial_already_used",
            TrialRejection::AlreadyHasAccess => "already_has_access",
        }
    }
}

impl std::fmt::Display for TrialRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Started(AccountEntitlement),
    Rejected(TrialRejection),
}

/// Preconditions for starting a trial, in order
pub fn trial_rejection(record: &AccountEntitlement, now: OffsetDateTime) -> Option<TrialRejection> {
    if record.trial_used() {
        Some(TrialRejection::TrialAlreadyUsed)
    } else if has_paid_access(record, now) {
        Some(TrialRejection::AlreadyHasAccess)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct TrialService {
    store: Arc<dyn EntitlementStore>,
    trial_length: Duration,
}

impl TrialService {
    pub fn new(store: Arc<dyn EntitlementStore>, trial_length: Duration) -> Self {
        Self {
            store,
            trial_length,
        }
    }

    pub fn trial_length(&self) -> Duration {
        self.trial_length
    }

    /// Start a trial for `account_id`, requested by `actor`
    pub async fn start_trial(
        &self,
        account_id: AccountId,
        actor: Option<Uuid>,
    ) -> BillingResult<TrialOutcome> {
        self.start_trial_at(account_id, actor, OffsetDateTime::now_utc())
            .await
    }

    pub async fn start_trial_at(
        &self,
        account_id: AccountId,
        actor: Option<Uuid>,
        now: OffsetDateTime,
    ) -> BillingResult<TrialOutcome> {
        let length = self.trial_length;
        let start = |record: &AccountEntitlement| match trial_rejection(record, now) {
            Some(_) => None,
            None => Some(record.with_trial_started(now, length)),
        };
        let audit = EntitlementEventBuilder::new(EntitlementEventType::TrialStarted)
            .actor_opt(actor, ActorType::User)
            .data(serde_json::json!({ "trial_days": length.whole_days() }));

        self.store.create_account(account_id).await?;

        let Some(modification) = self.store.modify_account(account_id, &start, &audit).await? else {
            tracing::info!(account_id = %account_id, "Trial requested for unknown account");
            return Ok(TrialOutcome::Rejected(TrialRejection::NotFound));
        };

        match modification.after {
            Some(record) => {
                tracing::info!(
                    account_id = %account_id,
                    trial_ends_at = ?record.trial_ends_at,
                    "Trial started"
                );
                Ok(TrialOutcome::Started(record))
            }
            None => {
                // Same `now` as the mutator, so this reproduces its decision
                let reason = trial_rejection(&modification.before, now)
                    .unwrap_or(TrialRejection::TrialAlreadyUsed);
                tracing::info!(account_id = %account_id, reason = %reason, "Trial rejected");
                Ok(TrialOutcome::Rejected(reason))
            }
        }
    }
}
