//! Hosted checkout links
//!
//! The provider hosts checkout; we only build the link. It carries the plan's
//! variant and the account id as custom data, which the provider echoes back
//! in every webhook for the resulting subscription or order.

use serde::{Deserialize, Serialize};
use siteline_shared::{AccountId, SubscriptionPlan};
use url::Url;

use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;

/// Billing interval offered at checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckoutPlan {
    Monthly,
    Annual,
    Lifetime,
}

impl From<CheckoutPlan> for SubscriptionPlan {
    fn from(plan: CheckoutPlan) -> Self {
        match plan {
            CheckoutPlan::Monthly => SubscriptionPlan::Monthly,
            CheckoutPlan::Annual => SubscriptionPlan::Annual,
            CheckoutPlan::Lifetime => SubscriptionPlan::Lifetime,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutLinks {
    base_url: Url,
    catalog: PlanCatalog,
}

impl CheckoutLinks {
    pub fn new(base_url: &str, catalog: PlanCatalog) -> BillingResult<Self> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| BillingError::Config(format!("invalid checkout base url: {}", e)))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { base_url, catalog })
    }

    /// Checkout URL for `plan`, tagged with the buying account
    pub fn checkout_url(&self, plan: CheckoutPlan, account_id: AccountId) -> BillingResult<String> {
        let variant = self.catalog.checkout_variant(plan.into())?;
        let mut url = self
            .base_url
            .join(&format!("buy/{}", variant))
            .map_err(|e| BillingError::Internal(format!("checkout url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("checkout[custom][account_id]", &account_id.to_string());
        Ok(url.into())
    }
}
