//! Operator routes for entitlement overrides and webhook inspection

use axum::{
    extract::{Extension, Path, Query, State},
    Json,
};
use serde::Deserialize;
use siteline_billing::{AccountEntitlement, EntitlementEvent, WebhookEventRecord};
use siteline_shared::AccountId;
use uuid::Uuid;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct GrantLifetimeRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

fn require_operator(auth_user: &AuthUser) -> ApiResult<()> {
    if auth_user.role.can_grant_entitlements() {
        Ok(())
    } else {
        tracing::warn!(
            user_id = %auth_user.user_id,
            role = %auth_user.role,
            "Non-operator attempted an operator action"
        );
        Err(ApiError::Forbidden)
    }
}

/// Grant lifetime access to an account
pub async fn grant_lifetime(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(account_id): Path<Uuid>,
    body: Option<Json<GrantLifetimeRequest>>,
) -> ApiResult<Json<AccountEntitlement>> {
    require_operator(&auth_user)?;
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let record = state
        .billing
        .grants
        .grant_lifetime(
            AccountId(account_id),
            auth_user.user_id,
            req.reason.as_deref(),
        )
        .await?;

    Ok(Json(record))
}

/// Recent provider webhook deliveries, newest first
pub async fn list_webhook_events(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<WebhookEventRecord>>> {
    require_operator(&auth_user)?;

    let events = state
        .billing
        .webhooks
        .recent_events(query.limit.unwrap_or(50))
        .await?;

    Ok(Json(events))
}

/// Audit trail of one account's entitlement, newest first
pub async fn account_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(account_id): Path<Uuid>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<EntitlementEvent>>> {
    require_operator(&auth_user)?;

    let events = state
        .billing
        .entitlements
        .history(AccountId(account_id), query.limit.unwrap_or(50).clamp(1, 500))
        .await?;

    Ok(Json(events))
}
