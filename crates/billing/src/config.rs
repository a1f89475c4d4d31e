//! Billing configuration

use siteline_shared::AccountId;
use time::Duration;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;
use crate::trial::DEFAULT_TRIAL_DAYS;

const MIN_WEBHOOK_SECRET_LEN: usize = 16;

/// Longest trial the engine accepts
pub const MAX_TRIAL_DAYS: i64 = 3650;

/// Configuration for the entitlement engine
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret the provider signs webhook bodies with
    pub webhook_secret: String,
    /// Variant ids for each plan
    pub catalog: PlanCatalog,
    /// Hosted checkout root, e.g. `https://store.example.com/checkout`
    pub checkout_base_url: String,
    pub trial_length: Duration,
    /// Where the access gate sends viewers without paid access
    pub upgrade_url: String,
    /// Accounts that always pass the access gate
    pub demo_accounts: Vec<AccountId>,
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        let webhook_secret = std::env::var("BILLING_WEBHOOK_SECRET")
            .map_err(|_| BillingError::Config("BILLING_WEBHOOK_SECRET not set".to_string()))?;
        if webhook_secret.len() < MIN_WEBHOOK_SECRET_LEN {
            return Err(BillingError::Config(format!(
                "BILLING_WEBHOOK_SECRET must be at least {} characters",
                MIN_WEBHOOK_SECRET_LEN
            )));
        }

        let trial_days = match std::env::var("TRIAL_LENGTH_DAYS") {
            Ok(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|days| (1..=MAX_TRIAL_DAYS).contains(days))
                .ok_or_else(|| {
                    BillingError::Config(format!(
                        "TRIAL_LENGTH_DAYS must be between 1 and {}: {}",
                        MAX_TRIAL_DAYS, raw
                    ))
                })?,
            Err(_) => DEFAULT_TRIAL_DAYS,
        };

        let demo_accounts = std::env::var("DEMO_ACCOUNT_IDS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<AccountId>()
                    .map_err(|e| BillingError::Config(format!("DEMO_ACCOUNT_IDS entry {}: {}", s, e)))
            })
            .collect::<BillingResult<Vec<_>>>()?;

        let config = Self {
            webhook_secret,
            catalog: PlanCatalog::from_lists(
                &std::env::var("BILLING_VARIANT_MONTHLY").unwrap_or_default(),
                &std::env::var("BILLING_VARIANT_ANNUAL").unwrap_or_default(),
                &std::env::var("BILLING_VARIANT_LIFETIME").unwrap_or_default(),
            ),
            checkout_base_url: std::env::var("BILLING_CHECKOUT_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000/checkout".to_string()),
            trial_length: Duration::days(trial_days),
            upgrade_url: std::env::var("UPGRADE_URL")
                .unwrap_or_else(|_| "/billing/upgrade".to_string()),
            demo_accounts,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks that hold however the config was built
    pub fn validate(&self) -> BillingResult<()> {
        if self.trial_length <= Duration::ZERO || self.trial_length > Duration::days(MAX_TRIAL_DAYS) {
            return Err(BillingError::Config(format!(
                "trial length must be between 1 and {} days",
                MAX_TRIAL_DAYS
            )));
        }
        Ok(())
    }
}
