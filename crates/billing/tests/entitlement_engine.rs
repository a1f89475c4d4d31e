//! Integration tests for the entitlement engine
//!
//! Every writer (webhooks, trials, grants) runs against the in-memory store,
//! which gives the same atomicity as the Postgres transaction.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use serde_json::json;
use siteline_billing::webhooks::sign;
use siteline_billing::{
    has_paid_access, AccountEntitlement, BillingConfig, BillingError, BillingService,
    EntitlementStore, MemoryEntitlementStore, PlanCatalog, TrialOutcome, TrialRejection,
};
use siteline_shared::{AccountId, SubscriptionPlan, SubscriptionStatus};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

// ============================================================================
// Test Utilities
// ============================================================================

const SECRET: &str = "test_webhook_secret_0123456789";
const MONTHLY: &str = "5001";
const ANNUAL: &str = "5002";
const LIFETIME: &str = "5003";

const T0: OffsetDateTime = datetime!(2025-03-01 12:00 UTC);

fn setup() -> (BillingService, Arc<MemoryEntitlementStore>) {
    let store = Arc::new(MemoryEntitlementStore::new());
    let config = BillingConfig {
        webhook_secret: SECRET.to_string(),
        catalog: PlanCatalog::from_lists(MONTHLY, ANNUAL, LIFETIME),
        checkout_base_url: "https://store.test/checkout".to_string(),
        trial_length: Duration::days(30),
        upgrade_url: "/billing/upgrade".to_string(),
        demo_accounts: Vec::new(),
    };
    let billing = BillingService::new(config, store.clone()).unwrap();
    (billing, store)
}

async fn new_account(store: &MemoryEntitlementStore) -> AccountId {
    let account_id = AccountId::new();
    store.create_account(account_id).await.unwrap();
    account_id
}

fn subscription_event(
    event_name: &str,
    account_id: AccountId,
    subscription_id: &str,
    attributes: serde_json::Value,
) -> Vec<u8> {
    json!({
        "meta": {
            "event_name": event_name,
            "custom_data": { "account_id": account_id.to_string() }
        },
        "data": {
            "type": "subscriptions",
            "id": subscription_id,
            "attributes": attributes
        }
    })
    .to_string()
    .into_bytes()
}

fn order_event(
    event_name: &str,
    account_id: AccountId,
    order_id: &str,
    variant: &str,
    status: &str,
) -> Vec<u8> {
    json!({
        "meta": {
            "event_name": event_name,
            "custom_data": { "account_id": account_id.to_string() }
        },
        "data": {
            "type": "orders",
            "id": order_id,
            "attributes": {
                "status": status,
                "customer_id": 42,
                "first_order_item": { "variant_id": variant },
                "created_at": "2025-03-01T11:00:00Z"
            }
        }
    })
    .to_string()
    .into_bytes()
}

async fn deliver(
    billing: &BillingService,
    body: &[u8],
    now: OffsetDateTime,
) -> Result<&'static str, BillingError> {
    let signature = sign(SECRET, body).unwrap();
    billing
        .webhooks
        .ingest_at(body, Some(&signature), now)
        .await
        .map(|receipt| receipt.outcome)
}

async fn record(store: &MemoryEntitlementStore, account_id: AccountId) -> AccountEntitlement {
    store.get_account(account_id).await.unwrap().unwrap()
}

// ============================================================================
// Idempotency
// ============================================================================

#[tokio::test]
async fn test_same_event_twice_mutates_once() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;

    let body = subscription_event(
        "subscription_created",
        account_id,
        "sub_1",
        json!({
            "status": "active",
            "variant_id": MONTHLY,
            "renews_at": "2025-04-01T12:00:00Z",
            "updated_at": "2025-03-01T12:00:00Z"
        }),
    );

    assert_eq!(deliver(&billing, &body, T0).await.unwrap(), "applied");
    let after_first = record(&store, account_id).await;

    let later = T0 + Duration::minutes(5);
    assert_eq!(deliver(&billing, &body, later).await.unwrap(), "duplicate");
    let after_second = record(&store, account_id).await;

    assert_eq!(after_first, after_second);
    assert_eq!(store.account_writes().await, 1);
    assert_eq!(store.ledger_len().await, 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_deliveries_apply_once() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;

    let body = subscription_event(
        "subscription_updated",
        account_id,
        "sub_race",
        json!({
            "status": "active",
            "variant_id": ANNUAL,
            "renews_at": "2026-03-01T12:00:00Z",
            "updated_at": "2025-03-01T12:00:00Z"
        }),
    );

    let mut handles = Vec::new();
    for _ in 0..2 {
        let billing = billing.clone();
        let body = body.clone();
        handles.push(tokio::spawn(async move { deliver(&billing, &body, T0).await }));
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }
    outcomes.sort();

    assert_eq!(outcomes, vec!["applied", "duplicate"]);
    assert_eq!(store.account_writes().await, 1);
    let r = record(&store, account_id).await;
    assert_eq!(r.subscription_plan, SubscriptionPlan::Annual);
    assert_eq!(store.account_events(account_id, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_account_write_rolls_back_ledger() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;

    let body = order_event("order_created", account_id, "ord_1", LIFETIME, "paid");

    store.set_fail_account_writes(true);
    let result = deliver(&billing, &body, T0).await;
    assert!(matches!(result, Err(BillingError::Database(_))));
    assert!(result.unwrap_err().is_retryable());
    assert_eq!(store.ledger_len().await, 0);
    assert_eq!(
        record(&store, account_id).await.subscription_plan,
        SubscriptionPlan::None
    );

    // Provider retries the same event once storage is back
    store.set_fail_account_writes(false);
    assert_eq!(deliver(&billing, &body, T0).await.unwrap(), "applied");
    assert!(record(&store, account_id).await.is_lifetime());
}

// ============================================================================
// Rejections and no-op outcomes
// ============================================================================

#[tokio::test]
async fn test_bad_signature_writes_nothing() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    let body = order_event("order_created", account_id, "ord_1", LIFETIME, "paid");

    let forged = sign("some_other_secret_value", &body).unwrap();
    let result = billing.webhooks.ingest_at(&body, Some(&forged), T0).await;
    assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));

    let missing = billing.webhooks.ingest_at(&body, None, T0).await;
    assert!(matches!(missing, Err(BillingError::WebhookSignatureInvalid)));

    assert_eq!(store.ledger_len().await, 0);
    assert_eq!(store.account_writes().await, 0);
}

#[tokio::test]
async fn test_malformed_body_is_rejected_before_ledger() {
    let (billing, store) = setup();
    let body = br#"{"meta": {"event_name": "order_created"}}"#;
    let result = deliver(&billing, body, T0).await;
    assert!(matches!(result, Err(BillingError::MalformedPayload(_))));
    assert_eq!(store.ledger_len().await, 0);
}

#[tokio::test]
async fn test_missing_account_reference_is_recorded_without_effect() {
    let (billing, store) = setup();
    let body = json!({
        "meta": { "event_name": "subscription_created" },
        "data": {
            "type": "subscriptions",
            "id": "sub_orphan",
            "attributes": { "status": "active", "variant_id": MONTHLY }
        }
    })
    .to_string();

    assert_eq!(
        deliver(&billing, body.as_bytes(), T0).await.unwrap(),
        "no_account"
    );
    assert_eq!(store.ledger_len().await, 1);
    assert_eq!(store.account_writes().await, 0);

    // The redelivery is a duplicate, not another no-op
    assert_eq!(
        deliver(&billing, body.as_bytes(), T0).await.unwrap(),
        "duplicate"
    );
}

#[tokio::test]
async fn test_event_before_account_row_is_applied() {
    let (billing, store) = setup();
    let account_id = AccountId::new();
    let body = subscription_event(
        "subscription_created",
        account_id,
        "sub_1",
        json!({ "status": "active", "variant_id": MONTHLY }),
    );

    assert_eq!(deliver(&billing, &body, T0).await.unwrap(), "applied");
    let r = record(&store, account_id).await;
    assert_eq!(r.subscription_status, SubscriptionStatus::Active);
    assert_eq!(r.subscription_plan, SubscriptionPlan::Monthly);

    // Later provisioning is a no-op on the row the webhook created
    assert_eq!(store.create_account(account_id).await.unwrap(), r);
    assert_eq!(deliver(&billing, &body, T0).await.unwrap(), "duplicate");
    assert_eq!(
        record(&store, account_id).await.subscription_status,
        SubscriptionStatus::Active
    );
}

#[tokio::test]
async fn test_failed_first_delivery_for_new_account_is_retried() {
    let (billing, store) = setup();
    let account_id = AccountId::new();
    let body = order_event("order_created", account_id, "ord_9", LIFETIME, "paid");

    store.set_fail_account_writes(true);
    assert!(deliver(&billing, &body, T0).await.unwrap_err().is_retryable());
    assert_eq!(store.ledger_len().await, 0);

    store.set_fail_account_writes(false);
    assert_eq!(deliver(&billing, &body, T0).await.unwrap(), "applied");
    assert!(record(&store, account_id).await.is_lifetime());
}

#[tokio::test]
async fn test_unknown_event_is_recorded() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    let body = json!({
        "meta": {
            "event_name": "license_key_created",
            "event_id": "evt_license_1",
            "custom_data": { "account_id": account_id.to_string() }
        },
        "data": { "type": "license-keys", "id": 7, "attributes": {} }
    })
    .to_string();

    assert_eq!(deliver(&billing, body.as_bytes(), T0).await.unwrap(), "ignored");
    let rows = billing.webhooks.recent_events(10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].event_id, "evt_license_1");
    assert_eq!(rows[0].event_name, "license_key_created");
    assert_eq!(store.account_writes().await, 0);
}

// ============================================================================
// Trial activation
// ============================================================================

#[tokio::test]
async fn test_second_trial_is_rejected() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;

    let first = billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();
    let TrialOutcome::Started(started) = first else {
        panic!("expected trial to start, got {:?}", first);
    };
    assert_eq!(started.trial_ends_at, Some(T0 + Duration::days(30)));

    let second = billing
        .trials
        .start_trial_at(account_id, None, T0 + Duration::days(1))
        .await
        .unwrap();
    assert_eq!(
        second,
        TrialOutcome::Rejected(TrialRejection::TrialAlreadyUsed)
    );
    assert_eq!(
        record(&store, account_id).await.trial_ends_at,
        Some(T0 + Duration::days(30))
    );
}

#[tokio::test]
async fn test_trial_rejected_for_paying_account() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    let body = subscription_event(
        "subscription_created",
        account_id,
        "sub_1",
        json!({ "status": "active", "variant_id": MONTHLY }),
    );
    deliver(&billing, &body, T0).await.unwrap();

    let outcome = billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TrialOutcome::Rejected(TrialRejection::AlreadyHasAccess)
    );
    assert_eq!(record(&store, account_id).await.trial_started_at, None);
}

#[tokio::test]
async fn test_trial_for_account_without_row() {
    let (billing, store) = setup();
    let account_id = AccountId::new();
    let outcome = billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();
    assert!(matches!(outcome, TrialOutcome::Started(_)));
    assert_eq!(
        record(&store, account_id).await.subscription_status,
        SubscriptionStatus::Trial
    );
}

#[tokio::test]
async fn test_trial_after_paid_period_lapses_is_rejected() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();

    let created = subscription_event(
        "subscription_created",
        account_id,
        "sub_1",
        json!({
            "status": "active",
            "variant_id": MONTHLY,
            "renews_at": "2025-04-01T12:00:00Z",
            "updated_at": "2025-03-02T12:00:00Z"
        }),
    );
    assert_eq!(deliver(&billing, &created, T0 + Duration::days(1)).await.unwrap(), "applied");
    let expired = subscription_event(
        "subscription_expired",
        account_id,
        "sub_1",
        json!({
            "status": "expired",
            "variant_id": MONTHLY,
            "ends_at": "2025-04-01T12:00:00Z",
            "updated_at": "2025-04-01T12:00:00Z"
        }),
    );
    assert_eq!(deliver(&billing, &expired, T0 + Duration::days(31)).await.unwrap(), "applied");

    let lapsed = record(&store, account_id).await;
    assert_eq!(lapsed.trial_started_at, None);
    assert!(!has_paid_access(&lapsed, T0 + Duration::days(60)));

    let outcome = billing
        .trials
        .start_trial_at(account_id, None, T0 + Duration::days(60))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TrialOutcome::Rejected(TrialRejection::TrialAlreadyUsed)
    );
    assert_eq!(record(&store, account_id).await, lapsed);
}

#[tokio::test]
async fn test_trial_after_refunded_lifetime_order_is_rejected() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();

    let paid = order_event("order_created", account_id, "ord_1", LIFETIME, "paid");
    assert_eq!(deliver(&billing, &paid, T0 + Duration::days(1)).await.unwrap(), "applied");
    let refund = order_event("order_refunded", account_id, "ord_1", LIFETIME, "refunded");
    assert_eq!(deliver(&billing, &refund, T0 + Duration::days(2)).await.unwrap(), "applied");
    assert_eq!(
        record(&store, account_id).await.subscription_status,
        SubscriptionStatus::Refunded
    );

    let outcome = billing
        .trials
        .start_trial_at(account_id, None, T0 + Duration::days(3))
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TrialOutcome::Rejected(TrialRejection::TrialAlreadyUsed)
    );
}

#[tokio::test]
async fn test_concurrent_trial_requests_start_one_trial() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;

    let a = billing.trials.start_trial_at(account_id, None, T0);
    let b = billing
        .trials
        .start_trial_at(account_id, None, T0 + Duration::seconds(1));
    let (a, b) = tokio::join!(a, b);

    let started = [a.unwrap(), b.unwrap()]
        .into_iter()
        .filter(|o| matches!(o, TrialOutcome::Started(_)))
        .count();
    assert_eq!(started, 1);
    assert_eq!(store.account_writes().await, 1);
}

#[tokio::test]
async fn test_trial_writes_audit_event() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    let user = Uuid::new_v4();
    billing
        .trials
        .start_trial_at(account_id, Some(user), T0)
        .await
        .unwrap();

    let events = billing.entitlements.history(account_id, 10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "TRIAL_STARTED");
    assert_eq!(events[0].actor_type, "user");
    assert_eq!(events[0].actor_id, Some(user));
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_trial_then_upgrade() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;

    billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();
    let trial = record(&store, account_id).await;
    assert!(has_paid_access(&trial, T0 + Duration::days(29)));
    assert!(!has_paid_access(&trial, T0 + Duration::days(30)));

    let upgrade_at = T0 + Duration::days(10);
    let body = subscription_event(
        "subscription_created",
        account_id,
        "sub_up",
        json!({
            "status": "active",
            "variant_id": ANNUAL,
            "customer_id": 99,
            "renews_at": "2026-03-11T12:00:00Z",
            "ends_at": null,
            "created_at": "2025-03-11T12:00:00Z"
        }),
    );
    assert_eq!(deliver(&billing, &body, upgrade_at).await.unwrap(), "applied");

    let paid = record(&store, account_id).await;
    assert_eq!(paid.subscription_status, SubscriptionStatus::Active);
    assert_eq!(paid.subscription_plan, SubscriptionPlan::Annual);
    assert_eq!(paid.trial_started_at, None);
    assert_eq!(paid.trial_ends_at, None);
    assert_eq!(paid.provider_subscription_id.as_deref(), Some("sub_up"));
    assert_eq!(paid.provider_customer_id.as_deref(), Some("99"));
    assert_eq!(
        paid.current_period_ends_at,
        Some(datetime!(2026-03-11 12:00 UTC))
    );
    // Beyond the old trial end
    assert!(has_paid_access(&paid, T0 + Duration::days(60)));
}

#[tokio::test]
async fn test_cancel_then_expire() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    let period_end = datetime!(2025-04-01 12:00 UTC);

    let created = subscription_event(
        "subscription_created",
        account_id,
        "sub_c",
        json!({ "status": "active", "variant_id": MONTHLY, "renews_at": "2025-04-01T12:00:00Z" }),
    );
    deliver(&billing, &created, T0).await.unwrap();

    let cancelled = subscription_event(
        "subscription_cancelled",
        account_id,
        "sub_c",
        json!({
            "status": "cancelled",
            "variant_id": MONTHLY,
            "ends_at": "2025-04-01T12:00:00Z",
            "updated_at": "2025-03-10T08:00:00Z"
        }),
    );
    assert_eq!(
        deliver(&billing, &cancelled, T0 + Duration::days(9)).await.unwrap(),
        "applied"
    );

    let r = record(&store, account_id).await;
    assert_eq!(r.subscription_status, SubscriptionStatus::Cancelled);
    assert_eq!(r.subscription_ends_at, Some(period_end));
    assert!(has_paid_access(&r, period_end - Duration::seconds(1)));
    assert!(!has_paid_access(&r, period_end));

    let expired = subscription_event(
        "subscription_expired",
        account_id,
        "sub_c",
        json!({
            "status": "expired",
            "ends_at": "2025-04-01T12:00:00Z",
            "updated_at": "2025-04-01T12:00:05Z"
        }),
    );
    assert_eq!(
        deliver(&billing, &expired, period_end).await.unwrap(),
        "applied"
    );
    let r = record(&store, account_id).await;
    assert_eq!(r.subscription_status, SubscriptionStatus::Expired);
    assert!(!has_paid_access(&r, period_end - Duration::days(1)));
}

#[tokio::test]
async fn test_refund_for_other_order_leaves_record() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;

    let paid = order_event("order_created", account_id, "ord_A", LIFETIME, "paid");
    assert_eq!(deliver(&billing, &paid, T0).await.unwrap(), "applied");
    let before = record(&store, account_id).await;
    assert!(before.is_lifetime());

    let refund_other = order_event("order_refunded", account_id, "ord_B", LIFETIME, "refunded");
    assert_eq!(
        deliver(&billing, &refund_other, T0).await.unwrap(),
        "unchanged"
    );
    assert_eq!(record(&store, account_id).await, before);

    let refund_match = order_event("order_refunded", account_id, "ord_A", LIFETIME, "refunded");
    assert_eq!(
        deliver(&billing, &refund_match, T0).await.unwrap(),
        "applied"
    );
    let r = record(&store, account_id).await;
    assert_eq!(r.subscription_status, SubscriptionStatus::Refunded);
    assert_eq!(r.subscription_plan, SubscriptionPlan::None);
    assert_eq!(r.provider_order_id, None);
    assert!(!has_paid_access(&r, T0));
}

#[tokio::test]
async fn test_lifetime_account_ignores_subscription_events() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    let paid = order_event("order_paid", account_id, "ord_L", LIFETIME, "paid");
    deliver(&billing, &paid, T0).await.unwrap();

    let expired = subscription_event(
        "subscription_expired",
        account_id,
        "sub_stale",
        json!({ "status": "expired", "ends_at": "2025-02-01T00:00:00Z" }),
    );
    assert_eq!(
        deliver(&billing, &expired, T0).await.unwrap(),
        "unchanged"
    );
    assert!(record(&store, account_id).await.is_lifetime());
}

#[tokio::test]
async fn test_manual_grant_then_status() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();

    let admin = Uuid::new_v4();
    let granted = billing
        .grants
        .grant_lifetime(account_id, admin, None)
        .await
        .unwrap();
    assert!(granted.is_lifetime());
    assert_eq!(granted.trial_ends_at, None);
    assert_eq!(granted.trial_started_at, Some(T0));

    let entitlement = billing
        .entitlements
        .compute_entitlement(account_id, T0 + Duration::days(400))
        .await
        .unwrap()
        .unwrap();
    assert!(entitlement.has_access);
    assert_eq!(entitlement.expires_at, None);

    // Lifetime holders cannot trial again
    let outcome = billing
        .trials
        .start_trial_at(account_id, None, T0)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        TrialOutcome::Rejected(TrialRejection::TrialAlreadyUsed)
    );

    let history = billing.entitlements.history(account_id, 10).await.unwrap();
    assert_eq!(history[0].event_type, "LIFETIME_GRANTED");
    assert_eq!(history[1].event_type, "TRIAL_STARTED");
}

#[tokio::test]
async fn test_checkout_link_round_trips_account_id() {
    let (billing, store) = setup();
    let account_id = new_account(&store).await;
    let url = billing
        .checkout
        .checkout_url(siteline_billing::CheckoutPlan::Lifetime, account_id)
        .unwrap();
    assert!(url.contains(&format!("buy/{}", LIFETIME)));
    assert!(url.contains(&account_id.to_string()));
}
