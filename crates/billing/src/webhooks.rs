//! Payment provider webhook ingestion
//!
//! verify -> parse -> deduplicate and apply. Deduplication and application
//! happen in one store transaction (see [`EntitlementStore::ingest_event`]),
//! so a redelivered event is either skipped entirely or, if its first
//! delivery failed mid-way, applied as if it were new.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use siteline_shared::AccountId;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::account::AccountEntitlement;
use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;
use crate::provider::ProviderEvent;
use crate::store::{
    AccountMutator, EntitlementStore, IngestOutcome, NewWebhookEvent, WebhookEventRecord,
};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC of the raw body
pub const SIGNATURE_HEADER: &str = "x-signature";

/// Check the HMAC-SHA256 signature of a raw webhook body
///
/// The comparison runs in constant time. A missing or non-hex signature fails
/// the same way a wrong one does.
pub fn verify_signature(secret: &str, body: &[u8], signature: Option<&str>) -> BillingResult<()> {
    let signature = signature
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            tracing::warn!("Webhook request without signature");
            BillingError::WebhookSignatureInvalid
        })?;

    let received = hex::decode(signature).map_err(|_| {
        tracing::warn!("Webhook signature is not valid hex");
        BillingError::WebhookSignatureInvalid
    })?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(body);
    let computed = mac.finalize().into_bytes();

    if bool::from(computed.as_slice().ct_eq(received.as_slice())) {
        Ok(())
    } else {
        tracing::warn!("Webhook signature mismatch");
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Hex HMAC-SHA256 of a body, as the provider would send it
pub fn sign(secret: &str, body: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Result of one webhook delivery
#[derive(Debug, Clone, Serialize)]
pub struct WebhookReceipt {
    pub event_id: String,
    pub event_name: String,
    pub account_id: Option<AccountId>,
    /// `duplicate`, `applied`, `unchanged`, `ignored` or `no_account`
    pub outcome: &'static str,
    #[serde(skip)]
    pub record: Option<AccountEntitlement>,
}

#[derive(Clone)]
pub struct WebhookIngestor {
    store: Arc<dyn EntitlementStore>,
    catalog: PlanCatalog,
    secret: String,
}

impl WebhookIngestor {
    pub fn new(store: Arc<dyn EntitlementStore>, catalog: PlanCatalog, secret: String) -> Self {
        Self {
            store,
            catalog,
            secret,
        }
    }

    /// Verify, parse and apply one delivery
    pub async fn ingest(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> BillingResult<WebhookReceipt> {
        self.ingest_at(body, signature, OffsetDateTime::now_utc()).await
    }

    pub async fn ingest_at(
        &self,
        body: &[u8],
        signature: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookReceipt> {
        verify_signature(&self.secret, body, signature)?;

        let event = ProviderEvent::parse(body, &self.catalog).map_err(|e| {
            tracing::warn!(error = %e, "Rejecting malformed webhook payload");
            e
        })?;

        tracing::info!(
            event_id = %event.event_id,
            event_name = %event.event_name,
            account_id = ?event.account_id,
            "Processing billing webhook event"
        );

        if event.account_id.is_none() && !event.action.is_ignored() {
            tracing::warn!(
                event_id = %event.event_id,
                event_name = %event.event_name,
                "Webhook event has no account reference; recording without effect"
            );
        }

        let ledger_entry = NewWebhookEvent {
            event_id: event.event_id.clone(),
            event_name: event.event_name.clone(),
            account_id: event.account_id,
            payload: event.raw.clone(),
            received_at: now,
        };

        let action = &event.action;
        let mutate = move |record: &AccountEntitlement| action.apply(record, now);
        let mutator = (!action.is_ignored()).then_some(&mutate as AccountMutator<'_>);

        let outcome = self
            .store
            .ingest_event(&ledger_entry, mutator)
            .await
            .map_err(|e| {
                tracing::error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to apply webhook event; provider will retry"
                );
                e
            })?;

        match &outcome {
            IngestOutcome::Duplicate => tracing::info!(
                event_id = %event.event_id,
                event_name = %event.event_name,
                "Duplicate webhook event, skipping"
            ),
            IngestOutcome::Applied(record) => tracing::info!(
                event_id = %event.event_id,
                account_id = %record.account_id,
                status = %record.subscription_status,
                plan = %record.subscription_plan,
                "Entitlement updated from webhook"
            ),
            IngestOutcome::NoAccount => tracing::warn!(
                event_id = %event.event_id,
                event_name = %event.event_name,
                "Webhook carries no account reference; recorded without effect"
            ),
            other => tracing::debug!(
                event_id = %event.event_id,
                outcome = other.ledger_label(),
                "Webhook event recorded"
            ),
        }

        let record = match &outcome {
            IngestOutcome::Applied(record) => Some(record.clone()),
            _ => None,
        };

        Ok(WebhookReceipt {
            event_id: event.event_id,
            event_name: event.event_name,
            account_id: event.account_id,
            outcome: outcome.ledger_label(),
            record,
        })
    }

    /// Recent ledger rows for operators, newest first
    pub async fn recent_events(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        self.store.recent_webhook_events(limit.clamp(1, 500)).await
    }
}
