// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Siteline Billing Module
//!
//! The subscription entitlement engine: decides whether an account may use
//! paid features and keeps that decision consistent across the three writers
//! of an account's entitlement record.
//!
//! ## Features
//!
//! - **Entitlement**: one access predicate plus an explanatory snapshot
//! - **Webhooks**: signed, idempotent ingestion of payment provider events
//! - **Trials**: one self-service trial per account
//! - **Grants**: operator lifetime grants outside the provider
//! - **Access Gate**: staff and demo bypasses in front of the predicate
//! - **Audit Log**: every mutation recorded with a snapshot of the result

pub mod account;
pub mod checkout;
pub mod config;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gate;
pub mod grants;
pub mod plans;
pub mod provider;
pub mod store;
pub mod trial;
pub mod webhooks;

// Account
pub use account::AccountEntitlement;

// Checkout
pub use checkout::{CheckoutLinks, CheckoutPlan};

// Config
pub use config::BillingConfig;

// Entitlement
pub use entitlement::{
    has_paid_access, Entitlement, EntitlementService, EntitlementSource, EntitlementState,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{ActorType, EntitlementEvent, EntitlementEventBuilder, EntitlementEventType};

// Gate
pub use gate::{AccessDecision, AccessGate, AccessReason, Viewer};

// Grants
pub use grants::LifetimeGrantService;

// Plans
pub use plans::PlanCatalog;

// Provider
pub use provider::{ProviderAction, ProviderEvent};

// Store
pub use store::{
    EntitlementStore, IngestOutcome, MemoryEntitlementStore, PgEntitlementStore,
    WebhookEventRecord,
};

// Trial
pub use trial::{TrialOutcome, TrialRejection, TrialService};

// Webhooks
pub use webhooks::{verify_signature, WebhookIngestor, WebhookReceipt, SIGNATURE_HEADER};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub store: Arc<dyn EntitlementStore>,
    pub entitlements: EntitlementService,
    pub webhooks: WebhookIngestor,
    pub trials: TrialService,
    pub grants: LifetimeGrantService,
    pub gate: AccessGate,
    pub checkout: CheckoutLinks,
}

impl BillingService {
    /// Create a Postgres-backed billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        Self::new(config, Arc::new(PgEntitlementStore::new(pool)))
    }

    /// Create a billing service with explicit config and store
    pub fn new(config: BillingConfig, store: Arc<dyn EntitlementStore>) -> BillingResult<Self> {
        config.validate()?;
        Ok(Self {
            entitlements: EntitlementService::new(store.clone()),
            webhooks: WebhookIngestor::new(
                store.clone(),
                config.catalog.clone(),
                config.webhook_secret.clone(),
            ),
            trials: TrialService::new(store.clone(), config.trial_length),
            grants: LifetimeGrantService::new(store.clone()),
            gate: AccessGate::new(config.demo_accounts.iter().copied(), config.upgrade_url.clone()),
            checkout: CheckoutLinks::new(&config.checkout_base_url, config.catalog)?,
            store,
        })
    }
}
