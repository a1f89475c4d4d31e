//! Access gate
//!
//! The one call every paid surface makes before loading anything. Order:
//! platform staff, then demo accounts, then the entitlement predicate.

use std::collections::HashSet;

use serde::Serialize;
use siteline_shared::{AccountId, UserRole};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::AccountEntitlement;
use crate::entitlement::{Entitlement, EntitlementState};

/// Who is asking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Viewer {
    pub user_id: Uuid,
    pub account_id: AccountId,
    pub role: UserRole,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessReason {
    StaffBypass,
    DemoAccount,
    PaidAccess,
    NoPaidAccess,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessDecision {
    pub allowed: bool,
    pub reason: AccessReason,
    /// Upgrade surface to send a denied viewer to
    pub redirect_to: Option<String>,
    pub message: Option<String>,
}

impl AccessDecision {
    fn allow(reason: AccessReason) -> Self {
        Self {
            allowed: true,
            reason,
            redirect_to: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AccessGate {
    demo_accounts: HashSet<AccountId>,
    upgrade_url: String,
}

impl AccessGate {
    pub fn new(demo_accounts: impl IntoIterator<Item = AccountId>, upgrade_url: String) -> Self {
        Self {
            demo_accounts: demo_accounts.into_iter().collect(),
            upgrade_url,
        }
    }

    pub fn upgrade_url(&self) -> &str {
        &self.upgrade_url
    }

    pub fn is_demo_account(&self, account_id: AccountId) -> bool {
        self.demo_accounts.contains(&account_id)
    }

    /// Allow or deny, nothing else
    pub fn check_access(
        &self,
        viewer: &Viewer,
        record: Option<&AccountEntitlement>,
        now: OffsetDateTime,
    ) -> bool {
        self.evaluate(viewer, record, now).allowed
    }

    /// Full decision including where to send a denied viewer
    ///
    /// `record` is `None` when the viewer's account has no entitlement row,
    /// which is treated like an account that never paid.
    pub fn evaluate(
        &self,
        viewer: &Viewer,
        record: Option<&AccountEntitlement>,
        now: OffsetDateTime,
    ) -> AccessDecision {
        if viewer.role.bypasses_paywall() {
            return AccessDecision::allow(AccessReason::StaffBypass);
        }
        if self.is_demo_account(viewer.account_id) {
            return AccessDecision::allow(AccessReason::DemoAccount);
        }

        let state = match record {
            Some(record) => {
                let entitlement = Entitlement::compute(record, now);
                if entitlement.has_access {
                    return AccessDecision::allow(AccessReason::PaidAccess);
                }
                entitlement.state
            }
            None => EntitlementState::None,
        };

        AccessDecision {
            allowed: false,
            reason: AccessReason::NoPaidAccess,
            redirect_to: Some(self.upgrade_url.clone()),
            message: Some(denial_message(state).to_string()),
        }
    }
}

fn denial_message(state: EntitlementState) -> &'static str {
    match state {
        EntitlementState::TrialExpired => {
            "Your free trial has ended. Choose a plan to keep using your dashboards."
        }
        EntitlementState::Lapsed => {
            "Your subscription has ended. Renew to regain access to your dashboards."
        }
        _ => "Start a free trial or choose a plan to unlock your dashboards.",
    }
}
