//! Billing error types

use thiserror::Error;

/// Entitlement engine errors
///
/// Duplicate deliveries, events without an account reference and trial
/// precondition failures are outcomes, not errors, and never show up here.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unknown plan: {0}")]
    UnknownPlan(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Whether the caller (or the payment provider) should retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Database(_) | BillingError::Internal(_))
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
