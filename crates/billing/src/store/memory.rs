//! In-process store for tests and local development
//!
//! Every operation runs under one mutex, which gives the same atomicity the
//! Postgres store gets from its transaction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use siteline_shared::AccountId;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AccountMutator, EntitlementStore, IngestOutcome, Modification, NewWebhookEvent,
    WebhookEventRecord,
};
use crate::account::AccountEntitlement;
use crate::error::{BillingError, BillingResult};
use crate::events::{EntitlementEvent, EntitlementEventBuilder};

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<AccountId, AccountEntitlement>,
    ledger: Vec<WebhookEventRecord>,
    events: Vec<EntitlementEvent>,
    account_writes: u64,
}

#[derive(Default)]
pub struct MemoryEntitlementStore {
    state: Mutex<MemoryState>,
    fail_account_writes: AtomicBool,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed or overwrite a record directly, bypassing the audit log
    pub async fn put_account(&self, record: AccountEntitlement) {
        self.state
            .lock()
            .await
            .accounts
            .insert(record.account_id, record);
    }

    /// Make every subsequent account write fail, as a lost connection would
    pub fn set_fail_account_writes(&self, fail: bool) {
        self.fail_account_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of account mutations committed so far
    pub async fn account_writes(&self) -> u64 {
        self.state.lock().await.account_writes
    }

    pub async fn ledger_len(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    fn check_writable(&self) -> BillingResult<()> {
        if self.fail_account_writes.load(Ordering::SeqCst) {
            return Err(BillingError::Database(
                "account write failed: connection reset".to_string(),
            ));
        }
        Ok(())
    }
}

impl MemoryState {
    fn commit_account(
        &mut self,
        next: &AccountEntitlement,
        audit: &EntitlementEventBuilder,
    ) {
        self.accounts.insert(next.account_id, next.clone());
        self.events.push(audit.finish(next, next.updated_at));
        self.account_writes += 1;
    }
}

#[async_trait]
impl EntitlementStore for MemoryEntitlementStore {
    async fn create_account(&self, account_id: AccountId) -> BillingResult<AccountEntitlement> {
        let mut state = self.state.lock().await;
        let record = state
            .accounts
            .entry(account_id)
            .or_insert_with(|| AccountEntitlement::new(account_id, OffsetDateTime::now_utc()));
        Ok(record.clone())
    }

    async fn get_account(
        &self,
        account_id: AccountId,
    ) -> BillingResult<Option<AccountEntitlement>> {
        Ok(self.state.lock().await.accounts.get(&account_id).cloned())
    }

    async fn modify_account(
        &self,
        account_id: AccountId,
        mutate: AccountMutator<'_>,
        audit: &EntitlementEventBuilder,
    ) -> BillingResult<Option<Modification>> {
        let mut state = self.state.lock().await;
        let Some(before) = state.accounts.get(&account_id).cloned() else {
            return Ok(None);
        };

        let after = mutate(&before);
        if let Some(next) = &after {
            self.check_writable()?;
            state.commit_account(next, audit);
        }

        Ok(Some(Modification { before, after }))
    }

    async fn ingest_event(
        &self,
        event: &NewWebhookEvent,
        mutate: Option<AccountMutator<'_>>,
    ) -> BillingResult<IngestOutcome> {
        let mut state = self.state.lock().await;
        if state.ledger.iter().any(|row| row.event_id == event.event_id) {
            return Ok(IngestOutcome::Duplicate);
        }

        let current = match (mutate.is_some(), event.account_id) {
            (true, Some(id)) => Some(
                state
                    .accounts
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| AccountEntitlement::new(id, event.received_at)),
            ),
            _ => None,
        };
        let outcome = IngestOutcome::resolve(current.as_ref(), mutate);

        // Nothing has been written yet, so failing here leaves no ledger row
        // and no provisioned account
        if let IngestOutcome::Applied(next) = &outcome {
            self.check_writable()?;
            state.commit_account(next, &event.audit());
        } else if let Some(record) = current {
            state.accounts.entry(record.account_id).or_insert(record);
        }

        state.ledger.push(WebhookEventRecord {
            id: Uuid::new_v4(),
            event_id: event.event_id.clone(),
            event_name: event.event_name.clone(),
            account_id: event.account_id,
            outcome: outcome.ledger_label().to_string(),
            payload: event.payload.clone(),
            received_at: event.received_at,
        });

        Ok(outcome)
    }

    async fn recent_webhook_events(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state.ledger.iter().rev().take(limit).cloned().collect())
    }

    async fn account_events(
        &self,
        account_id: AccountId,
        limit: i64,
    ) -> BillingResult<Vec<EntitlementEvent>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(state
            .events
            .iter()
            .rev()
            .filter(|e| e.account_id == account_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn ping(&self) -> BillingResult<()> {
        Ok(())
    }
}
