//! Plan catalog: payment provider variant ids to plans
//!
//! Static configuration, read-only after startup. A plan may have several
//! variant ids (old prices stay valid for existing subscribers); the first
//! one listed is offered at checkout.

use serde::{Deserialize, Serialize};
use siteline_shared::SubscriptionPlan;

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanCatalog {
    pub monthly: Vec<String>,
    pub annual: Vec<String>,
    pub lifetime: Vec<String>,
}

impl PlanCatalog {
    pub fn new(monthly: Vec<String>, annual: Vec<String>, lifetime: Vec<String>) -> Self {
        Self {
            monthly,
            annual,
            lifetime,
        }
    }

    /// Build from comma separated variant lists, e.g. `"1001, 1002"`
    pub fn from_lists(monthly: &str, annual: &str, lifetime: &str) -> Self {
        Self::new(split_list(monthly), split_list(annual), split_list(lifetime))
    }

    /// Plan a provider variant id belongs to
    pub fn plan_for_variant(&self, variant_id: &str) -> Option<SubscriptionPlan> {
        let variant_id = variant_id.trim();
        if self.monthly.iter().any(|v| v == variant_id) {
            Some(SubscriptionPlan::Monthly)
        } else if self.annual.iter().any(|v| v == variant_id) {
            Some(SubscriptionPlan::Annual)
        } else if self.lifetime.iter().any(|v| v == variant_id) {
            Some(SubscriptionPlan::Lifetime)
        } else {
            None
        }
    }

    pub fn is_lifetime_variant(&self, variant_id: &str) -> bool {
        self.plan_for_variant(variant_id) == Some(SubscriptionPlan::Lifetime)
    }

    /// Variant offered at checkout for a plan
    pub fn checkout_variant(&self, plan: SubscriptionPlan) -> BillingResult<&str> {
        let variants = match plan {
            SubscriptionPlan::Monthly => &self.monthly,
            SubscriptionPlan::Annual => &self.annual,
            SubscriptionPlan::Lifetime => &self.lifetime,
            SubscriptionPlan::None | SubscriptionPlan::Trial => {
                return Err(BillingError::UnknownPlan(format!(
                    "{} cannot be purchased",
                    plan
                )))
            }
        };

        variants
            .first()
            .map(String::as_str)
            .ok_or_else(|| BillingError::Config(format!("no variant configured for {} plan", plan)))
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
