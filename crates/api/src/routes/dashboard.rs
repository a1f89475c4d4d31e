//! Paid dashboard surface
//!
//! Everything here is mounted behind `require_paid_access`, so handlers can
//! assume the gate already allowed the viewer.

use axum::{
    extract::{Extension, State},
    Json,
};
use serde::Serialize;
use siteline_billing::Entitlement;
use siteline_shared::AccountId;
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiResult, state::AppState};

#[derive(Debug, Serialize)]
pub struct DashboardEntitlementResponse {
    pub account_id: AccountId,
    /// `None` for staff and demo viewers whose account has no record
    pub entitlement: Option<Entitlement>,
}

pub async fn entitlement(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<DashboardEntitlementResponse>> {
    let entitlement = state
        .billing
        .entitlements
        .compute_entitlement(auth_user.account_id, OffsetDateTime::now_utc())
        .await?;

    Ok(Json(DashboardEntitlementResponse {
        account_id: auth_user.account_id,
        entitlement,
    }))
}
