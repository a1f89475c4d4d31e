//! Entitlement Events Module
//!
//! Append-only audit log of every entitlement mutation. Events are written by
//! the store in the same transaction as the mutation they describe and carry
//! a snapshot of the record after the change, so "why does this account have
//! access?" can always be answered from the log.

use serde::{Deserialize, Serialize};
use siteline_shared::AccountId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::AccountEntitlement;

/// Types of entitlement events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntitlementEventType {
    TrialStarted,
    LifetimeGranted,
    /// A webhook changed the record
    ProviderEventApplied,
}

impl std::fmt::Display for EntitlementEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntitlementEventType::TrialStarted => "TRIAL_STARTED",
            EntitlementEventType::LifetimeGranted => "LIFETIME_GRANTED",
            EntitlementEventType::ProviderEventApplied => "PROVIDER_EVENT_APPLIED",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through UI
    User,
    /// Operator using the admin override
    Admin,
    /// Payment provider webhook
    Provider,
    /// System automation
    System,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::Provider => write!(f, "provider"),
            ActorType::System => write!(f, "system"),
        }
    }
}

/// A stored entitlement event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementEvent {
    pub id: Uuid,
    pub account_id: AccountId,
    pub event_type: String,
    pub actor_type: String,
    pub actor_id: Option<Uuid>,
    pub event_data: serde_json::Value,
    pub provider_event_id: Option<String>,
    pub entitlement_snapshot: Option<serde_json::Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EntitlementEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let account_id: Uuid = row.try_get("account_id")?;
        Ok(Self {
            id: row.try_get("id")?,
            account_id: AccountId(account_id),
            event_type: row.try_get("event_type")?,
            actor_type: row.try_get("actor_type")?,
            actor_id: row.try_get("actor_id")?,
            event_data: row.try_get("event_data")?,
            provider_event_id: row.try_get("provider_event_id")?,
            entitlement_snapshot: row.try_get("entitlement_snapshot")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Builder for entitlement events
///
/// The store completes the event with the post-mutation snapshot via
/// [`EntitlementEventBuilder::finish`].
#[derive(Debug, Clone)]
pub struct EntitlementEventBuilder {
    event_type: EntitlementEventType,
    event_data: serde_json::Value,
    provider_event_id: Option<String>,
    actor_id: Option<Uuid>,
    actor_type: ActorType,
}

impl EntitlementEventBuilder {
    /// Create a new event builder
    pub fn new(event_type: EntitlementEventType) -> Self {
        Self {
            event_type,
            event_data: serde_json::json!({}),
            provider_event_id: None,
            actor_id: None,
            actor_type: ActorType::System,
        }
    }

    /// Set the event data
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    /// Set the ledger id of the provider event that caused the change
    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.provider_event_id = Some(event_id.into());
        self
    }

    /// Set the actor (user who triggered the event)
    pub fn actor(mut self, actor_id: Uuid, actor_type: ActorType) -> Self {
        self.actor_id = Some(actor_id);
        self.actor_type = actor_type;
        self
    }

    /// Set the actor with an optional user ID
    pub fn actor_opt(mut self, actor_id: Option<Uuid>, actor_type: ActorType) -> Self {
        self.actor_id = actor_id;
        self.actor_type = actor_type;
        self
    }

    /// Complete the event for the record as it looks after the mutation
    pub fn finish(&self, after: &AccountEntitlement, now: OffsetDateTime) -> EntitlementEvent {
        EntitlementEvent {
            id: Uuid::new_v4(),
            account_id: after.account_id,
            event_type: self.event_type.to_string(),
            actor_type: self.actor_type.to_string(),
            actor_id: self.actor_id,
            event_data: self.event_data.clone(),
            provider_event_id: self.provider_event_id.clone(),
            entitlement_snapshot: serde_json::to_value(after).ok(),
            created_at: now,
        }
    }
}
