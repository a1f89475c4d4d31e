//! Payment provider events
//!
//! Parses the provider's webhook payload, derives a stable event id when the
//! provider sends none, and turns each event into a [`ProviderAction`]: a pure
//! transition from the current account record to the next one.

use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};
use siteline_shared::{AccountId, SubscriptionPlan, SubscriptionStatus};
use time::OffsetDateTime;

use crate::account::AccountEntitlement;
use crate::error::{BillingError, BillingResult};
use crate::plans::PlanCatalog;

// =============================================================================
// Wire format
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderPayload {
    pub meta: PayloadMeta,
    pub data: PayloadData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadMeta {
    pub event_name: String,
    #[serde(default, alias = "webhook_id")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub custom_data: Option<CustomData>,
}

/// Values passed through checkout and echoed back on every event
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomData {
    #[serde(default, alias = "user_id", deserialize_with = "string_or_number")]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayloadData {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(deserialize_with = "required_string_or_number")]
    pub id: String,
    #[serde(default)]
    pub attributes: SubjectAttributes,
}

/// Attributes of the subscription, invoice or order the event is about
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubjectAttributes {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub variant_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub customer_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub order_id: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub subscription_id: Option<String>,
    #[serde(default)]
    pub first_order_item: Option<OrderItem>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub renews_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub trial_ends_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderItem {
    #[serde(default, deserialize_with = "string_or_number")]
    pub variant_id: Option<String>,
}

impl SubjectAttributes {
    fn variant(&self) -> Option<&str> {
        self.variant_id
            .as_deref()
            .or_else(|| self.first_order_item.as_ref()?.variant_id.as_deref())
    }
}

// Provider ids arrive as strings in some payloads and as numbers in others
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(D::Error::custom(format!(
            "expected string or number, got {}",
            other
        ))),
    }
}

fn required_string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;
    string_or_number(deserializer)?.ok_or_else(|| D::Error::custom("id must not be null"))
}

// =============================================================================
// Classification
// =============================================================================

/// Map a provider subscription status onto ours
pub fn map_subscription_status(status: &str) -> Option<SubscriptionStatus> {
    match status {
        "active" | "on_trial" => Some(SubscriptionStatus::Active),
        "past_due" | "unpaid" => Some(SubscriptionStatus::PastDue),
        "cancelled" | "paused" => Some(SubscriptionStatus::Cancelled),
        "expired" => Some(SubscriptionStatus::Expired),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionChange {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    /// `None` when the variant is missing or not in the catalog
    pub plan: Option<SubscriptionPlan>,
    pub status: SubscriptionStatus,
    pub renews_at: Option<OffsetDateTime>,
    pub ends_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionEnd {
    pub subscription_id: String,
    pub status: SubscriptionStatus,
    pub renews_at: Option<OffsetDateTime>,
    pub ends_at: Option<OffsetDateTime>,
}

/// What a provider event does to an account record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderAction {
    /// subscription_created, subscription_updated, subscription_payment_success
    UpsertSubscription(SubscriptionChange),
    /// subscription_cancelled, subscription_expired
    EndSubscription(SubscriptionEnd),
    /// A paid order for a lifetime variant
    GrantLifetime {
        order_id: String,
        customer_id: Option<String>,
    },
    RefundOrder {
        order_id: String,
    },
    /// Recorded in the ledger, never applied
    Ignore,
}

impl ProviderAction {
    pub fn classify(payload: &ProviderPayload, catalog: &PlanCatalog) -> BillingResult<Self> {
        let attrs = &payload.data.attributes;
        let event_name = payload.meta.event_name.as_str();

        let action = match event_name {
            "subscription_created" | "subscription_updated" | "subscription_payment_success" => {
                let is_invoice = event_name == "subscription_payment_success";
                let subscription_id = if is_invoice {
                    attrs
                        .subscription_id
                        .clone()
                        .ok_or_else(|| malformed("invoice without subscription_id"))?
                } else {
                    payload.data.id.clone()
                };
                // Invoices carry a payment status, not a subscription status
                let status = if is_invoice {
                    SubscriptionStatus::Active
                } else {
                    subscription_status(attrs)?
                };
                let plan = attrs
                    .variant()
                    .and_then(|v| catalog.plan_for_variant(v))
                    .filter(|p| matches!(p, SubscriptionPlan::Monthly | SubscriptionPlan::Annual));

                ProviderAction::UpsertSubscription(SubscriptionChange {
                    subscription_id,
                    customer_id: attrs.customer_id.clone(),
                    plan,
                    status,
                    renews_at: attrs.renews_at.or(attrs.trial_ends_at),
                    ends_at: attrs.ends_at,
                })
            }
            "subscription_cancelled" | "subscription_expired" => {
                let status = if event_name == "subscription_cancelled" {
                    SubscriptionStatus::Cancelled
                } else {
                    SubscriptionStatus::Expired
                };
                ProviderAction::EndSubscription(SubscriptionEnd {
                    subscription_id: payload.data.id.clone(),
                    status,
                    renews_at: attrs.renews_at,
                    ends_at: attrs.ends_at,
                })
            }
            "order_created" | "order_paid" => {
                let paid = attrs
                    .status
                    .as_deref()
                    .map_or(event_name == "order_paid", |s| s == "paid");
                let lifetime = attrs
                    .variant()
                    .map(|v| catalog.is_lifetime_variant(v))
                    .unwrap_or(false);

                if paid && lifetime {
                    ProviderAction::GrantLifetime {
                        order_id: payload.data.id.clone(),
                        customer_id: attrs.customer_id.clone(),
                    }
                } else {
                    ProviderAction::Ignore
                }
            }
            "order_refunded" => ProviderAction::RefundOrder {
                order_id: payload.data.id.clone(),
            },
            _ => ProviderAction::Ignore,
        };

        Ok(action)
    }

    pub fn is_ignored(&self) -> bool {
        matches!(self, ProviderAction::Ignore)
    }

    /// Next record, or `None` when the event leaves this account alone
    pub fn apply(
        &self,
        record: &AccountEntitlement,
        now: OffsetDateTime,
    ) -> Option<AccountEntitlement> {
        match self {
            ProviderAction::UpsertSubscription(change) => {
                // A lifetime purchase outranks any subscription traffic
                if record.is_lifetime() {
                    return None;
                }
                let plan = change
                    .plan
                    .or_else(|| {
                        matches!(
                            record.subscription_plan,
                            SubscriptionPlan::Monthly | SubscriptionPlan::Annual
                        )
                        .then_some(record.subscription_plan)
                    })
                    .unwrap_or(SubscriptionPlan::Monthly);

                Some(AccountEntitlement {
                    subscription_status: change.status,
                    subscription_plan: plan,
                    provider_subscription_id: Some(change.subscription_id.clone()),
                    provider_customer_id: change
                        .customer_id
                        .clone()
                        .or_else(|| record.provider_customer_id.clone()),
                    trial_started_at: None,
                    trial_ends_at: None,
                    current_period_ends_at: change.renews_at.or(record.current_period_ends_at),
                    subscription_ends_at: change.ends_at,
                    updated_at: now,
                    ..record.clone()
                })
            }
            ProviderAction::EndSubscription(end) => {
                if record.is_lifetime() {
                    return None;
                }
                if let Some(stored) = &record.provider_subscription_id {
                    if stored != &end.subscription_id {
                        return None;
                    }
                }

                Some(AccountEntitlement {
                    subscription_status: end.status,
                    provider_subscription_id: Some(end.subscription_id.clone()),
                    current_period_ends_at: end
                        .ends_at
                        .or(end.renews_at)
                        .or(record.current_period_ends_at),
                    subscription_ends_at: end.ends_at.or(record.subscription_ends_at),
                    updated_at: now,
                    ..record.clone()
                })
            }
            ProviderAction::GrantLifetime {
                order_id,
                customer_id,
            } => Some(AccountEntitlement {
                provider_order_id: Some(order_id.clone()),
                provider_customer_id: customer_id
                    .clone()
                    .or_else(|| record.provider_customer_id.clone()),
                trial_started_at: None,
                ..record.with_lifetime(now)
            }),
            ProviderAction::RefundOrder { order_id } => {
                if record.provider_order_id.as_deref() != Some(order_id.as_str()) {
                    return None;
                }
                Some(AccountEntitlement {
                    subscription_status: SubscriptionStatus::Refunded,
                    subscription_plan: SubscriptionPlan::None,
                    provider_order_id: None,
                    current_period_ends_at: None,
                    subscription_ends_at: None,
                    updated_at: now,
                    ..record.clone()
                })
            }
            ProviderAction::Ignore => None,
        }
    }
}

fn subscription_status(attrs: &SubjectAttributes) -> BillingResult<SubscriptionStatus> {
    let raw = attrs
        .status
        .as_deref()
        .ok_or_else(|| malformed("subscription without status"))?;
    map_subscription_status(raw)
        .ok_or_else(|| malformed(&format!("unknown subscription status '{}'", raw)))
}

fn malformed(reason: &str) -> BillingError {
    BillingError::MalformedPayload(reason.to_string())
}

// =============================================================================
// Parsed event
// =============================================================================

/// A verified, parsed and classified provider event
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub event_id: String,
    pub event_name: String,
    pub account_id: Option<AccountId>,
    pub action: ProviderAction,
    pub raw: serde_json::Value,
}

impl ProviderEvent {
    pub fn parse(body: &[u8], catalog: &PlanCatalog) -> BillingResult<Self> {
        let raw: serde_json::Value = serde_json::from_slice(body)
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;
        let payload: ProviderPayload = serde_json::from_value(raw.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))?;

        if payload.meta.event_name.trim().is_empty() {
            return Err(malformed("empty event_name"));
        }

        let action = ProviderAction::classify(&payload, catalog)?;
        let account_id = account_reference(&payload);

        Ok(Self {
            event_id: event_id(&payload),
            event_name: payload.meta.event_name,
            account_id,
            action,
            raw,
        })
    }
}

fn account_reference(payload: &ProviderPayload) -> Option<AccountId> {
    let raw = payload.meta.custom_data.as_ref()?.account_id.as_deref()?;
    match raw.parse() {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(
                event_name = %payload.meta.event_name,
                account_ref = %raw,
                "Webhook carries an account reference that is not a valid id"
            );
            None
        }
    }
}

/// Provider event id, or a deterministic id derived from stable fields
///
/// Redeliveries of one event hash to the same id; a later change to the same
/// subject carries a new `updated_at` and hashes to a different one.
pub fn event_id(payload: &ProviderPayload) -> String {
    if let Some(id) = payload
        .meta
        .event_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
    {
        return id.to_string();
    }

    let attrs = &payload.data.attributes;
    let stamp = attrs
        .updated_at
        .or(attrs.created_at)
        .map(|t| t.unix_timestamp_nanos().to_string())
        .unwrap_or_default();

    let mut hasher = Sha256::new();
    for part in [
        payload.meta.event_name.as_str(),
        payload.data.kind.as_str(),
        payload.data.id.as_str(),
        stamp.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    format!("derived_{}", hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;
    use time::Duration;

    const NOW: OffsetDateTime = datetime!(2025-04-10 10:00 UTC);

    fn catalog() -> PlanCatalog {
        PlanCatalog::from_lists("100", "200", "300")
    }

    fn parse(value: serde_json::Value) -> BillingResult<ProviderEvent> {
        ProviderEvent::parse(value.to_string().as_bytes(), &catalog())
    }

    fn subscription(event: &str, status: &str, variant: u64) -> serde_json::Value {
        json!({
            "meta": { "event_name": event, "custom_data": { "account_id": AccountId::new().to_string() } },
            "data": {
                "type": "subscriptions",
                "id": "sub_1",
                "attributes": {
                    "status": status,
                    "variant_id": variant,
                    "customer_id": 77,
                    "renews_at": "2025-05-10T10:00:00Z",
                    "ends_at": null,
                    "updated_at": "2025-04-10T09:59:00Z"
                }
            }
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(map_subscription_status("on_trial"), Some(SubscriptionStatus::Active));
        assert_eq!(map_subscription_status("unpaid"), Some(SubscriptionStatus::PastDue));
        assert_eq!(map_subscription_status("paused"), Some(SubscriptionStatus::Cancelled));
        assert_eq!(map_subscription_status("expired"), Some(SubscriptionStatus::Expired));
        assert_eq!(map_subscription_status("weird"), None);
    }

    #[test]
    fn test_numeric_ids_are_accepted() {
        let event = parse(subscription("subscription_created", "active", 200)).unwrap();
        match event.action {
            ProviderAction::UpsertSubscription(change) => {
                assert_eq!(change.plan, Some(SubscriptionPlan::Annual));
                assert_eq!(change.customer_id.as_deref(), Some("77"));
                assert_eq!(change.renews_at, Some(datetime!(2025-05-10 10:00 UTC)));
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert!(event.account_id.is_some());
    }

    #[test]
    fn test_missing_event_name_is_malformed() {
        let result = parse(json!({ "meta": {}, "data": { "type": "orders", "id": "1" } }));
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    }

    #[test]
    fn test_unknown_status_is_malformed() {
        let result = parse(subscription("subscription_updated", "frozen", 100));
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    }

    #[test]
    fn test_not_json_is_malformed() {
        let result = ProviderEvent::parse(b"<xml/>", &catalog());
        assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    }

    #[test]
    fn test_derived_event_id_is_stable() {
        let a = parse(subscription("subscription_updated", "active", 100)).unwrap();
        let b = parse(subscription("subscription_updated", "active", 100)).unwrap();
        assert_eq!(a.event_id, b.event_id);
        assert!(a.event_id.starts_with("derived_"));

        let mut later = subscription("subscription_updated", "active", 100);
        later["data"]["attributes"]["updated_at"] = json!("2025-04-11T09:59:00Z");
        let c = parse(later).unwrap();
        assert_ne!(a.event_id, c.event_id);
    }

    #[test]
    fn test_provider_event_id_wins() {
        let mut value = subscription("subscription_updated", "active", 100);
        value["meta"]["event_id"] = json!("evt_abc");
        assert_eq!(parse(value).unwrap().event_id, "evt_abc");
    }

    #[test]
    fn test_invalid_account_reference_is_dropped() {
        let mut value = subscription("subscription_updated", "active", 100);
        value["meta"]["custom_data"]["account_id"] = json!("not-a-uuid");
        assert_eq!(parse(value).unwrap().account_id, None);
    }

    #[test]
    fn test_user_id_alias() {
        let id = AccountId::new();
        let mut value = subscription("subscription_updated", "active", 100);
        value["meta"]["custom_data"] = json!({ "user_id": id.to_string() });
        assert_eq!(parse(value).unwrap().account_id, Some(id));
    }

    #[test]
    fn test_non_lifetime_order_is_ignored() {
        let value = json!({
            "meta": { "event_name": "order_created" },
            "data": { "type": "orders", "id": 9, "attributes": {
                "status": "paid", "first_order_item": { "variant_id": 100 }
            } }
        });
        assert!(parse(value).unwrap().action.is_ignored());
    }

    #[test]
    fn test_pending_lifetime_order_is_ignored() {
        let value = json!({
            "meta": { "event_name": "order_created" },
            "data": { "type": "orders", "id": 9, "attributes": {
                "status": "pending", "first_order_item": { "variant_id": 300 }
            } }
        });
        assert!(parse(value).unwrap().action.is_ignored());
    }

    #[test]
    fn test_upsert_clears_trial_and_keeps_paid_plan_for_unknown_variant() {
        let mut record = AccountEntitlement::new(AccountId::new(), NOW)
            .with_trial_started(NOW - Duration::days(3), Duration::days(30));
        record.subscription_plan = SubscriptionPlan::Annual;

        let action = ProviderAction::UpsertSubscription(SubscriptionChange {
            subscription_id: "sub_9".into(),
            customer_id: None,
            plan: None,
            status: SubscriptionStatus::Active,
            renews_at: Some(NOW + Duration::days(365)),
            ends_at: None,
        });
        let next = action.apply(&record, NOW).unwrap();
        assert_eq!(next.subscription_plan, SubscriptionPlan::Annual);
        assert_eq!(next.trial_started_at, None);
        assert_eq!(next.trial_ends_at, None);
        assert_eq!(next.trial_consumed_at, Some(NOW - Duration::days(3)));
        assert!(next.trial_used());
        assert_eq!(next.provider_subscription_id.as_deref(), Some("sub_9"));
    }

    #[test]
    fn test_end_for_other_subscription_is_ignored() {
        let mut record = AccountEntitlement::new(AccountId::new(), NOW);
        record.subscription_status = SubscriptionStatus::Active;
        record.subscription_plan = SubscriptionPlan::Monthly;
        record.provider_subscription_id = Some("sub_current".into());

        let action = ProviderAction::EndSubscription(SubscriptionEnd {
            subscription_id: "sub_old".into(),
            status: SubscriptionStatus::Expired,
            renews_at: None,
            ends_at: Some(NOW),
        });
        assert_eq!(action.apply(&record, NOW), None);
    }

    #[test]
    fn test_lifetime_order_clears_every_expiry() {
        let mut record = AccountEntitlement::new(AccountId::new(), NOW)
            .with_trial_started(NOW, Duration::days(30));
        record.current_period_ends_at = Some(NOW + Duration::days(3));
        record.subscription_ends_at = Some(NOW + Duration::days(3));

        let action = ProviderAction::GrantLifetime {
            order_id: "ord_1".into(),
            customer_id: Some("cus_1".into()),
        };
        let next = action.apply(&record, NOW).unwrap();
        assert!(next.is_lifetime());
        assert_eq!(next.trial_started_at, None);
        assert_eq!(next.trial_ends_at, None);
        assert_eq!(next.trial_consumed_at, Some(NOW));
        assert_eq!(next.current_period_ends_at, None);
        assert_eq!(next.subscription_ends_at, None);
        assert_eq!(next.provider_order_id.as_deref(), Some("ord_1"));
    }

    #[test]
    fn test_refunded_lifetime_order_keeps_trial_used() {
        let record = AccountEntitlement::new(AccountId::new(), NOW)
            .with_trial_started(NOW, Duration::days(30));
        let lifetime = ProviderAction::GrantLifetime {
            order_id: "ord_1".into(),
            customer_id: None,
        }
        .apply(&record, NOW)
        .unwrap();
        let refunded = ProviderAction::RefundOrder {
            order_id: "ord_1".into(),
        }
        .apply(&lifetime, NOW + Duration::days(1))
        .unwrap();

        assert_eq!(refunded.subscription_status, SubscriptionStatus::Refunded);
        assert!(refunded.trial_used());

        // The manual grant path agrees
        let manual = record.with_lifetime(NOW);
        assert_eq!(manual.trial_consumed_at, refunded.trial_consumed_at);
    }
}
