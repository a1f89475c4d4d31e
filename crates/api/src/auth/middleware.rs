//! Authentication and paywall middleware

use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use siteline_billing::Viewer;
use siteline_shared::{AccountId, UserRole};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{error::ApiError, state::AppState};

use super::jwt::JwtError;

/// Authenticated user context, inserted into request extensions by [`require_auth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub account_id: AccountId,
    pub role: UserRole,
}

impl AuthUser {
    pub fn viewer(&self) -> Viewer {
        Viewer {
            user_id: self.user_id,
            account_id: self.account_id,
            role: self.role,
        }
    }
}

fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Require a valid bearer token
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(token) = extract_bearer_token(&request) else {
        tracing::debug!(path = %path, "require_auth: no bearer token");
        return ApiError::Unauthorized.into_response();
    };

    let claims = match state.jwt_manager.validate_token(token) {
        Ok(claims) => claims,
        Err(JwtError::Expired) => {
            tracing::debug!(path = %path, "require_auth: token expired");
            return ApiError::InvalidToken.into_response();
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "require_auth: token rejected");
            return ApiError::InvalidToken.into_response();
        }
    };

    let auth_user = AuthUser {
        user_id: claims.sub,
        account_id: AccountId(claims.account_id),
        role: UserRole::from_str_lossy(&claims.role),
    };
    tracing::debug!(
        path = %path,
        user_id = %auth_user.user_id,
        account_id = %auth_user.account_id,
        role = %auth_user.role,
        "require_auth: authentication successful"
    );

    request.extensions_mut().insert(auth_user);
    next.run(request).await
}

/// Run the access gate before a paid surface
///
/// Must be layered inside [`require_auth`]. Denied viewers get
/// `402 Payment Required` with the upgrade surface in both the `Location`
/// header and the body; the protected handler never runs.
pub async fn require_paid_access(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>().copied() else {
        return ApiError::Unauthorized.into_response();
    };
    let viewer = auth_user.viewer();
    let gate = &state.billing.gate;

    // Bypassed viewers never need the record
    let record = if viewer.role.bypasses_paywall() || gate.is_demo_account(viewer.account_id) {
        None
    } else {
        match state.billing.entitlements.get_record(viewer.account_id).await {
            Ok(record) => record,
            Err(e) => return ApiError::from(e).into_response(),
        }
    };

    let decision = gate.evaluate(&viewer, record.as_ref(), OffsetDateTime::now_utc());
    if decision.allowed {
        return next.run(request).await;
    }

    tracing::info!(
        account_id = %viewer.account_id,
        path = %request.uri().path(),
        "Paid surface denied by access gate"
    );
    payment_required_response(
        decision.redirect_to.as_deref().unwrap_or(gate.upgrade_url()),
        decision.message.as_deref().unwrap_or("Payment required"),
    )
}

fn payment_required_response(redirect_to: &str, message: &str) -> Response {
    let body = Json(json!({
        "error": {
            "code": "PAYMENT_REQUIRED",
            "message": message,
        },
        "redirect_to": redirect_to,
    }));

    let mut response = (StatusCode::PAYMENT_REQUIRED, body).into_response();
    if let Ok(location) = HeaderValue::from_str(redirect_to) {
        response.headers_mut().insert(header::LOCATION, location);
    }
    response
}
