//! Manual lifetime grants
//!
//! Operators can hand out lifetime access without going through the payment
//! provider (partners, refunds handled off-platform, support cases). The
//! grant is unconditional apart from the account having to exist.

use std::sync::Arc;

use siteline_shared::AccountId;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::account::AccountEntitlement;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, EntitlementEventBuilder, EntitlementEventType};
use crate::store::EntitlementStore;

#[derive(Clone)]
pub struct LifetimeGrantService {
    store: Arc<dyn EntitlementStore>,
}

impl LifetimeGrantService {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Grant lifetime access to an account on behalf of `admin_id`
    pub async fn grant_lifetime(
        &self,
        account_id: AccountId,
        admin_id: Uuid,
        reason: Option<&str>,
    ) -> BillingResult<AccountEntitlement> {
        let now = OffsetDateTime::now_utc();
        let grant = |record: &AccountEntitlement| Some(record.with_lifetime(now));
        let audit = EntitlementEventBuilder::new(EntitlementEventType::LifetimeGranted)
            .actor(admin_id, ActorType::Admin)
            .data(serde_json::json!({
                "reason": reason,
                "granted_at": now.unix_timestamp(),
            }));

        let modification = self
            .store
            .modify_account(account_id, &grant, &audit)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("account {}", account_id)))?;

        let record = modification
            .after
            .ok_or_else(|| BillingError::Internal("lifetime grant was not written".to_string()))?;

        tracing::warn!(
            account_id = %account_id,
            admin_id = %admin_id,
            previous_status = %modification.before.subscription_status,
            previous_plan = %modification.before.subscription_plan,
            reason = reason.unwrap_or(""),
            "Lifetime access granted manually"
        );

        Ok(record)
    }
}
