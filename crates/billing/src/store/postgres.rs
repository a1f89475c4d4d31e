//! Postgres-backed entitlement store
//!
//! Each write is one transaction. Account rows are locked with
//! `SELECT ... FOR UPDATE` before the mutator sees them, and the ledger's
//! unique constraint on `event_id` decides which of two racing deliveries of
//! the same event gets to apply it.

use async_trait::async_trait;
use siteline_shared::AccountId;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    AccountMutator, EntitlementStore, IngestOutcome, Modification, NewWebhookEvent,
    WebhookEventRecord,
};
use crate::account::AccountEntitlement;
use crate::error::{BillingError, BillingResult};
use crate::events::{EntitlementEvent, EntitlementEventBuilder};

const ACCOUNT_COLUMNS: &str = r#"
    account_id,
    subscription_status,
    subscription_plan,
    provider_subscription_id,
    provider_order_id,
    provider_customer_id,
    trial_started_at,
    trial_consumed_at,
    trial_ends_at,
    current_period_ends_at,
    subscription_ends_at,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PgEntitlementStore {
    pool: PgPool,
}

impl PgEntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_account(
        conn: &mut PgConnection,
        account_id: AccountId,
    ) -> BillingResult<Option<AccountEntitlement>> {
        let query = format!(
            "SELECT {} FROM account_entitlements WHERE account_id = $1 FOR UPDATE",
            ACCOUNT_COLUMNS
        );
        let record = sqlx::query_as::<_, AccountEntitlement>(&query)
            .bind(account_id.0)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    async fn insert_account(conn: &mut PgConnection, account_id: AccountId) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO account_entitlements (account_id)
            VALUES ($1)
            ON CONFLICT (account_id) DO NOTHING
            "#,
        )
        .bind(account_id.0)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn write_account(
        conn: &mut PgConnection,
        record: &AccountEntitlement,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE account_entitlements
            SET subscription_status = $2,
                subscription_plan = $3,
                provider_subscription_id = $4,
                provider_order_id = $5,
                provider_customer_id = $6,
                trial_started_at = $7,
                trial_consumed_at = COALESCE(trial_consumed_at, $8),
                trial_ends_at = $9,
                current_period_ends_at = $10,
                subscription_ends_at = $11,
                updated_at = $12
            WHERE account_id = $1
            "#,
        )
        .bind(record.account_id.0)
        .bind(record.subscription_status.to_string())
        .bind(record.subscription_plan.to_string())
        .bind(&record.provider_subscription_id)
        .bind(&record.provider_order_id)
        .bind(&record.provider_customer_id)
        .bind(record.trial_started_at)
        .bind(record.trial_consumed_at)
        .bind(record.trial_ends_at)
        .bind(record.current_period_ends_at)
        .bind(record.subscription_ends_at)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;

        if result.rows_affected() != 1 {
            return Err(BillingError::Database(format!(
                "account {} vanished during update",
                record.account_id
            )));
        }
        Ok(())
    }

    async fn insert_audit(conn: &mut PgConnection, event: &EntitlementEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlement_events (
                id,
                account_id,
                event_type,
                actor_type,
                actor_id,
                event_data,
                provider_event_id,
                entitlement_snapshot,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(event.id)
        .bind(event.account_id.0)
        .bind(&event.event_type)
        .bind(&event.actor_type)
        .bind(event.actor_id)
        .bind(&event.event_data)
        .bind(&event.provider_event_id)
        .bind(&event.entitlement_snapshot)
        .bind(event.created_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn commit_account(
        conn: &mut PgConnection,
        next: &AccountEntitlement,
        audit: &EntitlementEventBuilder,
    ) -> BillingResult<()> {
        Self::write_account(conn, next).await?;
        Self::insert_audit(conn, &audit.finish(next, next.updated_at)).await
    }
}

#[async_trait]
impl EntitlementStore for PgEntitlementStore {
    async fn create_account(&self, account_id: AccountId) -> BillingResult<AccountEntitlement> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_account(&mut conn, account_id).await?;
        drop(conn);

        self.get_account(account_id)
            .await?
            .ok_or_else(|| BillingError::Internal(format!("account {} not readable", account_id)))
    }

    async fn get_account(
        &self,
        account_id: AccountId,
    ) -> BillingResult<Option<AccountEntitlement>> {
        let query = format!(
            "SELECT {} FROM account_entitlements WHERE account_id = $1",
            ACCOUNT_COLUMNS
        );
        let record = sqlx::query_as::<_, AccountEntitlement>(&query)
            .bind(account_id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn modify_account(
        &self,
        account_id: AccountId,
        mutate: AccountMutator<'_>,
        audit: &EntitlementEventBuilder,
    ) -> BillingResult<Option<Modification>> {
        let mut tx = self.pool.begin().await?;

        let Some(before) = Self::lock_account(&mut tx, account_id).await? else {
            tx.rollback().await?;
            return Ok(None);
        };

        let after = mutate(&before);
        match &after {
            Some(next) => {
                Self::commit_account(&mut tx, next, audit).await?;
                tx.commit().await?;
            }
            None => tx.rollback().await?,
        }

        Ok(Some(Modification { before, after }))
    }

    async fn ingest_event(
        &self,
        event: &NewWebhookEvent,
        mutate: Option<AccountMutator<'_>>,
    ) -> BillingResult<IngestOutcome> {
        let mut tx = self.pool.begin().await?;

        // Lock first so a concurrent writer to the same account waits for us.
        // A row that does not exist yet is created inside this transaction.
        let current = match (mutate.is_some(), event.account_id) {
            (true, Some(id)) => {
                Self::insert_account(&mut tx, id).await?;
                let record = Self::lock_account(&mut tx, id).await?.ok_or_else(|| {
                    BillingError::Database(format!("account {} not readable after insert", id))
                })?;
                Some(record)
            }
            _ => None,
        };
        let outcome = IngestOutcome::resolve(current.as_ref(), mutate);

        // The unique constraint is the idempotency guard: a concurrent
        // delivery of the same event blocks here until we commit, then
        // inserts nothing.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events (event_id, event_name, account_id, outcome, payload, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_name)
        .bind(event.account_id.map(|id| id.0))
        .bind(outcome.ledger_label())
        .bind(&event.payload)
        .bind(event.received_at)
        .fetch_optional(&mut *tx)
        .await?;

        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(IngestOutcome::Duplicate);
        }

        if let IngestOutcome::Applied(next) = &outcome {
            // Dropping the transaction on error rolls the ledger row back too
            Self::commit_account(&mut tx, next, &event.audit()).await?;
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn recent_webhook_events(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows = sqlx::query_as::<_, WebhookEventRecord>(
            r#"
            SELECT id, event_id, event_name, account_id, outcome, payload, received_at
            FROM billing_webhook_events
            ORDER BY received_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn account_events(
        &self,
        account_id: AccountId,
        limit: i64,
    ) -> BillingResult<Vec<EntitlementEvent>> {
        let events = sqlx::query_as::<_, EntitlementEvent>(
            r#"
            SELECT
                id,
                account_id,
                event_type,
                actor_type,
                actor_id,
                event_data,
                provider_event_id,
                entitlement_snapshot,
                created_at
            FROM entitlement_events
            WHERE account_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(account_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn ping(&self) -> BillingResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
