//! Billing routes: provider webhook, trial, status and checkout

use axum::{
    body::Bytes,
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use siteline_billing::{
    AccessDecision, AccountEntitlement, BillingError, CheckoutPlan, Entitlement, TrialOutcome,
    TrialRejection, WebhookReceipt, SIGNATURE_HEADER,
};
use time::OffsetDateTime;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Older provider integrations send the signature under this name
const LEGACY_SIGNATURE_HEADER: &str = "signature";

/// Response from a trial request
#[derive(Debug, Serialize)]
pub struct TrialResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<TrialRejection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<AccountEntitlement>,
}

/// Billing status for the caller's account
#[derive(Debug, Serialize)]
pub struct BillingStatusResponse {
    pub record: AccountEntitlement,
    pub entitlement: Entitlement,
    pub access: AccessDecision,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan: CheckoutPlan,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub plan: CheckoutPlan,
    pub url: String,
}

/// Handle payment provider webhook events
///
/// The body is taken as raw bytes so the signature is checked against
/// exactly what the provider sent. Storage failures answer 503 so the
/// provider retries the delivery.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookReceipt>> {
    tracing::info!(body_len = body.len(), "Billing webhook received");

    let signature = headers
        .get(SIGNATURE_HEADER)
        .or_else(|| headers.get(LEGACY_SIGNATURE_HEADER))
        .and_then(|v| v.to_str().ok());

    let receipt = state
        .billing
        .webhooks
        .ingest(&body, signature)
        .await
        .map_err(|e| {
            if e.is_retryable() {
                tracing::error!(error = %e, "Billing webhook failed; asking provider to retry");
                ApiError::ServiceUnavailable
            } else {
                ApiError::from(e)
            }
        })?;

    tracing::info!(
        event_id = %receipt.event_id,
        outcome = receipt.outcome,
        "Billing webhook processed"
    );

    Ok(Json(receipt))
}

/// Start the caller's one free trial
pub async fn start_trial(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<TrialResponse>> {
    let outcome = state
        .billing
        .trials
        .start_trial(auth_user.account_id, Some(auth_user.user_id))
        .await?;

    let response = match outcome {
        TrialOutcome::Started(record) => TrialResponse {
            success: true,
            reason: None,
            record: Some(record),
        },
        TrialOutcome::Rejected(reason) => TrialResponse {
            success: false,
            reason: Some(reason),
            record: None,
        },
    };

    Ok(Json(response))
}

/// Record, entitlement snapshot and access decision for the caller's account
///
/// The first call for an account provisions its record.
pub async fn get_status(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<BillingStatusResponse>> {
    let record = state
        .billing
        .entitlements
        .ensure_account(auth_user.account_id)
        .await?;

    let now = OffsetDateTime::now_utc();
    let entitlement = Entitlement::compute(&record, now);
    let access = state
        .billing
        .gate
        .evaluate(&auth_user.viewer(), Some(&record), now);

    Ok(Json(BillingStatusResponse {
        record,
        entitlement,
        access,
    }))
}

/// Access decision only, for the upgrade modal
pub async fn get_access(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<AccessDecision>> {
    let record = state
        .billing
        .entitlements
        .get_record(auth_user.account_id)
        .await?;

    Ok(Json(state.billing.gate.evaluate(
        &auth_user.viewer(),
        record.as_ref(),
        OffsetDateTime::now_utc(),
    )))
}

/// Provider checkout URL for the caller's account
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(req): Json<CheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let url = state
        .billing
        .checkout
        .checkout_url(req.plan, auth_user.account_id)
        .map_err(|e| match e {
            BillingError::Config(msg) => {
                tracing::warn!(plan = ?req.plan, error = %msg, "Checkout requested for unconfigured plan");
                ApiError::ServiceUnavailable
            }
            other => ApiError::from(other),
        })?;

    tracing::info!(
        account_id = %auth_user.account_id,
        plan = ?req.plan,
        "Checkout link created"
    );

    Ok(Json(CheckoutResponse {
        plan: req.plan,
        url,
    }))
}
