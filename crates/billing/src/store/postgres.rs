//! Postgres store adapter

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use storefront_shared::{EntitlementFeature, SubscriptionStatus};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    AppRecord, Attribution, BillingEventStore, CatalogStore, CommissionStore, CreatorRecord,
    CustomerStore, EntitlementStore, EventLedger, LimitEnforcer, PaymentRecord,
    PaymentRecordStore, SubscriptionRecord, SubscriptionStore, UnmappedEvent,
};
use crate::commission::{CommissionAward, CommissionPolicy};
use crate::entitlement::{Entitlement, EntitlementData};
use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEvent, EventStatus};

const APP_COLUMNS: &str =
    "id, slug, title, owner_id, stripe_price_id, price_cents, status, state";

#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    user_id: String,
    id: String,
    feature: String,
    active: bool,
    data: Json<EntitlementData>,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = BillingError;

    fn try_from(row: EntitlementRow) -> Result<Self, Self::Error> {
        let feature: EntitlementFeature = row
            .feature
            .parse()
            .map_err(|e| BillingError::Database(format!("entitlement {}: {}", row.id, e)))?;
        Ok(Entitlement {
            id: row.id,
            user_id: row.user_id,
            feature,
            active: row.active,
            data: row.data.0,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: String,
    user_id: String,
    status: String,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    customer_id: Option<String>,
    price_id: Option<String>,
    last_event_at: OffsetDateTime,
}

impl From<SubscriptionRow> for SubscriptionRecord {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            status: row.status.parse().unwrap_or(SubscriptionStatus::Unknown),
            id: row.id,
            user_id: row.user_id,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            customer_id: row.customer_id,
            price_id: row.price_id,
            last_event_at: row.last_event_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BillingEventRow {
    id: Uuid,
    user_id: Option<String>,
    event_type: String,
    status: String,
    amount_cents: Option<i64>,
    subscription_id: Option<String>,
    stripe_event_id: Option<String>,
    actor_type: String,
    details: serde_json::Value,
    occurred_at: OffsetDateTime,
}

impl From<BillingEventRow> for BillingEvent {
    fn from(row: BillingEventRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            event_type: row.event_type,
            status: if row.status == "error" {
                EventStatus::Error
            } else {
                EventStatus::Success
            },
            amount_cents: row.amount_cents,
            subscription_id: row.subscription_id,
            stripe_event_id: row.stripe_event_id,
            actor_type: row.actor_type,
            details: row.details,
            occurred_at: row.occurred_at,
        }
    }
}

/// Store backed by the billing tables in Postgres
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CatalogStore for PgBillingStore {
    async fn list_apps(&self) -> BillingResult<Vec<AppRecord>> {
        let apps = sqlx::query_as::<_, AppRecord>(&format!(
            "SELECT {} FROM apps ORDER BY id",
            APP_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(apps)
    }

    async fn list_creators(&self) -> BillingResult<Vec<CreatorRecord>> {
        let creators = sqlx::query_as::<_, CreatorRecord>(
            r#"
            SELECT id, all_access_price_id, stripe_price_id, stripe_account_id
            FROM creators
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(creators)
    }

    async fn find_app(&self, id_or_slug: &str) -> BillingResult<Option<AppRecord>> {
        let by_id = sqlx::query_as::<_, AppRecord>(&format!(
            "SELECT {} FROM apps WHERE id = $1",
            APP_COLUMNS
        ))
        .bind(id_or_slug)
        .fetch_optional(&self.pool)
        .await?;
        if by_id.is_some() {
            return Ok(by_id);
        }

        let mut by_slug = sqlx::query_as::<_, AppRecord>(&format!(
            "SELECT {} FROM apps WHERE slug = $1 LIMIT 2",
            APP_COLUMNS
        ))
        .bind(id_or_slug)
        .fetch_all(&self.pool)
        .await?;
        if by_slug.len() > 1 {
            return Err(BillingError::AppSlugNotUnique(id_or_slug.to_string()));
        }
        Ok(by_slug.pop())
    }

    async fn set_app_price_id(&self, app_id: &str, price_id: &str) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE apps SET stripe_price_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(app_id)
        .bind(price_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::AppNotFound(app_id.to_string()));
        }
        Ok(())
    }

    async fn get_payout_account(&self, creator_id: &str) -> BillingResult<Option<String>> {
        let account: Option<(Option<String>,)> =
            sqlx::query_as("SELECT stripe_account_id FROM creators WHERE id = $1")
                .bind(creator_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(account.and_then(|(id,)| id))
    }

    async fn set_payout_account(&self, creator_id: &str, account_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO creators (id, stripe_account_id)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET
                stripe_account_id = EXCLUDED.stripe_account_id,
                updated_at = NOW()
            "#,
        )
        .bind(creator_id)
        .bind(account_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CustomerStore for PgBillingStore {
    async fn get_user_id_by_customer(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT user_id FROM customer_mappings WHERE customer_id = $1")
                .bind(customer_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(user_id,)| user_id))
    }

    async fn get_customer_for_user(&self, user_id: &str) -> BillingResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT customer_id FROM customer_mappings WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(customer_id,)| customer_id))
    }

    async fn set_customer_for_user(&self, user_id: &str, customer_id: &str) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // A customer belongs to one user; drop a stale mapping from someone else
        sqlx::query("DELETE FROM customer_mappings WHERE customer_id = $1 AND user_id <> $2")
            .bind(customer_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            INSERT INTO customer_mappings (user_id, customer_id)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE SET
                customer_id = EXCLUDED.customer_id,
                updated_at = NOW()
            WHERE customer_mappings.customer_id IS DISTINCT FROM EXCLUDED.customer_id
            "#,
        )
        .bind(user_id)
        .bind(customer_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for PgBillingStore {
    async fn upsert_entitlement(&self, entitlement: &Entitlement) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (user_id, id, feature, active, data)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, id) DO UPDATE SET
                feature = EXCLUDED.feature,
                active = EXCLUDED.active,
                data = EXCLUDED.data,
                updated_at = NOW()
            "#,
        )
        .bind(&entitlement.user_id)
        .bind(&entitlement.id)
        .bind(entitlement.feature.as_str())
        .bind(entitlement.active)
        .bind(Json(&entitlement.data))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_entitlements(&self, user_id: &str) -> BillingResult<Vec<Entitlement>> {
        let rows: Vec<EntitlementRow> = sqlx::query_as(
            r#"
            SELECT user_id, id, feature, active, data
            FROM entitlements
            WHERE user_id = $1
            ORDER BY id
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Entitlement::try_from).collect()
    }
}

#[async_trait]
impl SubscriptionStore for PgBillingStore {
    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscription_records
                (id, user_id, status, current_period_end, cancel_at_period_end,
                 customer_id, price_id, last_event_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                status = EXCLUDED.status,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                customer_id = EXCLUDED.customer_id,
                price_id = EXCLUDED.price_id,
                last_event_at = EXCLUDED.last_event_at,
                updated_at = NOW()
            WHERE subscription_records.last_event_at <= EXCLUDED.last_event_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(record.status.as_str())
        .bind(record.current_period_end)
        .bind(record.cancel_at_period_end)
        .bind(&record.customer_id)
        .bind(&record.price_id)
        .bind(record.last_event_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, status, current_period_end, cancel_at_period_end,
                   customer_id, price_id, last_event_at
            FROM subscription_records
            WHERE id = $1
            "#,
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRecord::from))
    }

    async fn list_subscriptions_for_user(
        &self,
        user_id: &str,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, status, current_period_end, cancel_at_period_end,
                   customer_id, price_id, last_event_at
            FROM subscription_records
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(SubscriptionRecord::from).collect())
    }
}

#[async_trait]
impl EventLedger for PgBillingStore {
    async fn has_processed(&self, event_id: &str, now: OffsetDateTime) -> BillingResult<bool> {
        let (seen,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1 AND expires_at > $2)",
        )
        .bind(event_id)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(seen)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        processed_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO processed_events (event_id, processed_at, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO UPDATE SET
                processed_at = EXCLUDED.processed_at,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(event_id)
        .bind(processed_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl PaymentRecordStore for PgBillingStore {
    async fn add_payment_record(&self, record: PaymentRecord) -> BillingResult<()> {
        // Later writes overlay only the fields they carry
        sqlx::query(
            r#"
            INSERT INTO payment_records
                (id, user_id, event_type, occurred_at, amount_cents, currency, customer_id,
                 creator_id, subscription_id, payment_intent_id, application_fee_cents, destination)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                event_type = EXCLUDED.event_type,
                user_id = COALESCE(EXCLUDED.user_id, payment_records.user_id),
                occurred_at = COALESCE(EXCLUDED.occurred_at, payment_records.occurred_at),
                amount_cents = COALESCE(EXCLUDED.amount_cents, payment_records.amount_cents),
                currency = COALESCE(EXCLUDED.currency, payment_records.currency),
                customer_id = COALESCE(EXCLUDED.customer_id, payment_records.customer_id),
                creator_id = COALESCE(EXCLUDED.creator_id, payment_records.creator_id),
                subscription_id = COALESCE(EXCLUDED.subscription_id, payment_records.subscription_id),
                payment_intent_id = COALESCE(EXCLUDED.payment_intent_id, payment_records.payment_intent_id),
                application_fee_cents = COALESCE(EXCLUDED.application_fee_cents, payment_records.application_fee_cents),
                destination = COALESCE(EXCLUDED.destination, payment_records.destination),
                updated_at = NOW()
            "#,
        )
        .bind(&record.id)
        .bind(&record.user_id)
        .bind(&record.event_type)
        .bind(record.occurred_at)
        .bind(record.amount_cents)
        .bind(&record.currency)
        .bind(&record.customer_id)
        .bind(&record.creator_id)
        .bind(&record.subscription_id)
        .bind(&record.payment_intent_id)
        .bind(record.application_fee_cents)
        .bind(&record.destination)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BillingEventStore for PgBillingStore {
    async fn insert_billing_event(&self, event: &BillingEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (id, user_id, event_type, status, amount_cents, subscription_id,
                 stripe_event_id, actor_type, details, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event.id)
        .bind(&event.user_id)
        .bind(&event.event_type)
        .bind(event.status.to_string())
        .bind(event.amount_cents)
        .bind(&event.subscription_id)
        .bind(&event.stripe_event_id)
        .bind(&event.actor_type)
        .bind(&event.details)
        .bind(event.occurred_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_type = %event.event_type,
                user_id = ?event.user_id,
                error = %e,
                "Failed to write billing event"
            );
            BillingError::from(e)
        })?;
        Ok(())
    }

    async fn list_billing_events_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let rows: Vec<BillingEventRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, event_type, status, amount_cents, subscription_id,
                   stripe_event_id, actor_type, details, occurred_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY occurred_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(BillingEvent::from).collect())
    }

    async fn insert_unmapped_event(&self, event: &UnmappedEvent) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO unmapped_events (event_id, event_type, payload, received_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&event.event_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.received_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CommissionStore for PgBillingStore {
    async fn award_commission(
        &self,
        user_id: &str,
        amount_cents: i64,
        policy: &CommissionPolicy,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CommissionAward>> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent awards for the same user
        let attribution: Option<Attribution> = sqlx::query_as(
            r#"
            SELECT user_id, ambassador_id, promo_code, redeemed_at,
                   commission_awarded, commission_awarded_at
            FROM referral_attributions
            WHERE user_id = $1
            FOR UPDATE
            "#,
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(award) = attribution.and_then(|a| policy.evaluate(&a, amount_cents, now)) else {
            tx.rollback().await?;
            return Ok(None);
        };

        sqlx::query(
            r#"
            INSERT INTO ambassadors (id, current_balance_cents, total_earned_cents)
            VALUES ($1, $2, $2)
            ON CONFLICT (id) DO UPDATE SET
                current_balance_cents = ambassadors.current_balance_cents + EXCLUDED.current_balance_cents,
                total_earned_cents = ambassadors.total_earned_cents + EXCLUDED.total_earned_cents,
                updated_at = NOW()
            "#,
        )
        .bind(&award.ambassador_id)
        .bind(award.commission_cents)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE promo_codes
            SET paid_conversions = paid_conversions + 1,
                revenue_cents = revenue_cents + $2,
                updated_at = NOW()
            WHERE code = $1
            "#,
        )
        .bind(&award.promo_code)
        .bind(award.amount_cents)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE referral_attributions
            SET commission_awarded = TRUE, commission_awarded_at = $2
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(award))
    }
}

#[async_trait]
impl LimitEnforcer for PgBillingStore {
    /// Queue a limit pass; an open request for the user absorbs duplicates
    async fn enforce_limit(&self, user_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO limit_enforcement_requests (user_id)
            VALUES ($1)
            ON CONFLICT (user_id) WHERE processed_at IS NULL DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        tracing::info!(user_id = %user_id, "Limit enforcement requested");
        Ok(())
    }
}
