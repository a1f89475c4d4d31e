//! Entitlement storage
//!
//! The account records, the webhook event ledger and the audit log live
//! behind one trait because a ledger insert and the account mutation it
//! triggers must commit or roll back together. Every write path in the crate
//! goes through [`EntitlementStore::modify_account`] or
//! [`EntitlementStore::ingest_event`]; both re-read the account inside their
//! own transaction and hand the current row to a mutator closure.
//!
//! A provider event that references an account with no row yet provisions
//! the row inside the same transaction, so a payment is never lost to a
//! delivery that beats account setup.

mod memory;
mod postgres;

pub use memory::MemoryEntitlementStore;
pub use postgres::PgEntitlementStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use siteline_shared::AccountId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::AccountEntitlement;
use crate::error::BillingResult;
use crate::events::{ActorType, EntitlementEvent, EntitlementEventBuilder, EntitlementEventType};

/// Computes the next record from the current one; `None` leaves it untouched
pub type AccountMutator<'a> =
    &'a (dyn Fn(&AccountEntitlement) -> Option<AccountEntitlement> + Send + Sync);

/// Result of [`EntitlementStore::modify_account`] on an existing account
#[derive(Debug, Clone)]
pub struct Modification {
    /// Row as read inside the transaction
    pub before: AccountEntitlement,
    /// Row as written, `None` when the mutator declined
    pub after: Option<AccountEntitlement>,
}

/// A provider event about to be recorded in the ledger
#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub event_id: String,
    pub event_name: String,
    pub account_id: Option<AccountId>,
    pub payload: serde_json::Value,
    pub received_at: OffsetDateTime,
}

impl NewWebhookEvent {
    /// Audit entry written when this event changes an account
    pub fn audit(&self) -> EntitlementEventBuilder {
        EntitlementEventBuilder::new(EntitlementEventType::ProviderEventApplied)
            .actor_opt(None, ActorType::Provider)
            .provider_event(self.event_id.clone())
            .data(serde_json::json!({ "event_name": self.event_name }))
    }
}

/// What happened to a delivered provider event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The ledger already held the event id; nothing was written
    Duplicate,
    /// The account changed
    Applied(AccountEntitlement),
    /// The event was valid but left the account as it was
    Unchanged,
    /// Event type this system does not act on
    Ignored,
    /// The payload carried no account reference
    NoAccount,
}

impl IngestOutcome {
    /// Label stored in the ledger's `outcome` column
    pub fn ledger_label(&self) -> &'static str {
        match self {
            IngestOutcome::Duplicate => "duplicate",
            IngestOutcome::Applied(_) => "applied",
            IngestOutcome::Unchanged => "unchanged",
            IngestOutcome::Ignored => "ignored",
            IngestOutcome::NoAccount => "no_account",
        }
    }

    /// Decide the outcome for a non-duplicate event
    ///
    /// `current` is the locked row of the referenced account, `None` only
    /// when the event carries no account reference.
    pub(crate) fn resolve(
        current: Option<&AccountEntitlement>,
        mutate: Option<AccountMutator<'_>>,
    ) -> Self {
        let Some(mutate) = mutate else {
            return IngestOutcome::Ignored;
        };
        let Some(record) = current else {
            return IngestOutcome::NoAccount;
        };
        match mutate(record) {
            Some(next) if !next.same_state_as(record) => IngestOutcome::Applied(next),
            _ => IngestOutcome::Unchanged,
        }
    }
}

/// A ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub event_id: String,
    pub event_name: String,
    pub account_id: Option<AccountId>,
    pub outcome: String,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for WebhookEventRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let account_id: Option<Uuid> = row.try_get("account_id")?;
        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            event_name: row.try_get("event_name")?,
            account_id: account_id.map(AccountId),
            outcome: row.try_get("outcome")?,
            payload: row.try_get("payload")?,
            received_at: row.try_get("received_at")?,
        })
    }
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Create the record for an account; returns the existing one if present
    async fn create_account(&self, account_id: AccountId) -> BillingResult<AccountEntitlement>;

    async fn get_account(&self, account_id: AccountId)
        -> BillingResult<Option<AccountEntitlement>>;

    /// Read-check-write on one account in a single transaction
    ///
    /// Returns `None` when the account does not exist. When the mutator
    /// produces a new record it is written together with the audit event.
    async fn modify_account(
        &self,
        account_id: AccountId,
        mutate: AccountMutator<'_>,
        audit: &EntitlementEventBuilder,
    ) -> BillingResult<Option<Modification>>;

    /// Record a provider event in the ledger and apply it, atomically
    ///
    /// `mutate` is `None` for events that are recorded but never applied.
    /// When `mutate` is set and the referenced account has no row, the row
    /// is created first. A failure while writing the account rolls the
    /// ledger row back, so a redelivery of the same event is applied again.
    async fn ingest_event(
        &self,
        event: &NewWebhookEvent,
        mutate: Option<AccountMutator<'_>>,
    ) -> BillingResult<IngestOutcome>;

    /// Ledger rows, newest first
    async fn recent_webhook_events(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>>;

    /// Audit events for one account, newest first
    async fn account_events(
        &self,
        account_id: AccountId,
        limit: i64,
    ) -> BillingResult<Vec<EntitlementEvent>>;

    /// Cheap connectivity check for readiness probes
    async fn ping(&self) -> BillingResult<()>;
}
