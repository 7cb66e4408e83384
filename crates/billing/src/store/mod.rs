//! Persistence ports
//!
//! The engine reads and writes local state only through these traits. Two
//! adapters exist: [`PgBillingStore`] for production and
//! [`InMemoryBillingStore`] for tests and local runs.

mod memory;
mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use storefront_shared::SubscriptionStatus;
use time::OffsetDateTime;

use crate::commission::{CommissionAward, CommissionPolicy};
use crate::entitlement::Entitlement;
use crate::error::BillingResult;
use crate::events::BillingEvent;
use crate::provider::Subscription;

pub use memory::{AmbassadorBalance, InMemoryBillingStore, PromoCodeStats};
pub use postgres::PgBillingStore;

/// App catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AppRecord {
    pub id: String,
    pub slug: Option<String>,
    pub title: String,
    pub owner_id: Option<String>,
    pub stripe_price_id: Option<String>,
    /// Monthly subscription price, used when provisioning a price
    pub price_cents: Option<i64>,
    pub status: String,
    pub state: String,
}

impl AppRecord {
    pub fn is_live(&self) -> bool {
        self.status == "published" && self.state == "active"
    }
}

/// Creator catalog entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CreatorRecord {
    pub id: String,
    pub all_access_price_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub stripe_account_id: Option<String>,
}

impl CreatorRecord {
    /// All-access price, falling back to the legacy price column
    pub fn subscription_price_id(&self) -> Option<&str> {
        self.all_access_price_id
            .as_deref()
            .or(self.stripe_price_id.as_deref())
    }
}

/// Local projection of a provider subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub user_id: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub customer_id: Option<String>,
    pub price_id: Option<String>,
    /// Provider timestamp of the snapshot this record reflects
    pub last_event_at: OffsetDateTime,
}

impl SubscriptionRecord {
    pub fn from_subscription(sub: &Subscription, user_id: &str, observed_at: OffsetDateTime) -> Self {
        Self {
            id: sub.id.clone(),
            user_id: user_id.to_string(),
            status: sub.status,
            current_period_end: sub.period_end(),
            cancel_at_period_end: sub.cancel_at_period_end,
            customer_id: sub.customer_id().map(str::to_string),
            price_id: sub.first_price_id().map(str::to_string),
            last_event_at: observed_at,
        }
    }

    /// A record grants access only while its status allows it and the period has not elapsed
    pub fn grants_access(&self, now: OffsetDateTime) -> bool {
        self.status.grants_access() && self.current_period_end.map_or(true, |end| end > now)
    }
}

/// Money-movement audit entry keyed by provider object id
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: String,
    pub user_id: Option<String>,
    pub event_type: String,
    pub occurred_at: Option<OffsetDateTime>,
    /// Negative for refunds
    pub amount_cents: Option<i64>,
    pub currency: Option<String>,
    pub customer_id: Option<String>,
    pub creator_id: Option<String>,
    pub subscription_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub application_fee_cents: Option<i64>,
    pub destination: Option<String>,
}

impl PaymentRecord {
    /// Overlay the fields present in `newer` onto this record
    pub fn merge(&mut self, newer: PaymentRecord) {
        fn take<T>(slot: &mut Option<T>, value: Option<T>) {
            if value.is_some() {
                *slot = value;
            }
        }
        self.event_type = newer.event_type;
        take(&mut self.user_id, newer.user_id);
        take(&mut self.occurred_at, newer.occurred_at);
        take(&mut self.amount_cents, newer.amount_cents);
        take(&mut self.currency, newer.currency);
        take(&mut self.customer_id, newer.customer_id);
        take(&mut self.creator_id, newer.creator_id);
        take(&mut self.subscription_id, newer.subscription_id);
        take(&mut self.payment_intent_id, newer.payment_intent_id);
        take(&mut self.application_fee_cents, newer.application_fee_cents);
        take(&mut self.destination, newer.destination);
    }
}

/// Event that could not be tied to a user, kept for manual triage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmappedEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: OffsetDateTime,
}

/// Referral attribution for a referred user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Attribution {
    pub user_id: String,
    pub ambassador_id: String,
    pub promo_code: String,
    pub redeemed_at: OffsetDateTime,
    pub commission_awarded: bool,
    pub commission_awarded_at: Option<OffsetDateTime>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn list_apps(&self) -> BillingResult<Vec<AppRecord>>;

    async fn list_creators(&self) -> BillingResult<Vec<CreatorRecord>>;

    /// Look an app up by id, then by slug. Fails with `AppSlugNotUnique` when a
    /// slug matches more than one app.
    async fn find_app(&self, id_or_slug: &str) -> BillingResult<Option<AppRecord>>;

    async fn set_app_price_id(&self, app_id: &str, price_id: &str) -> BillingResult<()>;

    async fn get_payout_account(&self, creator_id: &str) -> BillingResult<Option<String>>;

    async fn set_payout_account(&self, creator_id: &str, account_id: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait CustomerStore: Send + Sync {
    async fn get_user_id_by_customer(&self, customer_id: &str) -> BillingResult<Option<String>>;

    async fn get_customer_for_user(&self, user_id: &str) -> BillingResult<Option<String>>;

    async fn set_customer_for_user(&self, user_id: &str, customer_id: &str) -> BillingResult<()>;
}

#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Insert or replace by `(user_id, id)`
    async fn upsert_entitlement(&self, entitlement: &Entitlement) -> BillingResult<()>;

    async fn list_entitlements(&self, user_id: &str) -> BillingResult<Vec<Entitlement>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Upsert unless the stored record reflects a newer provider snapshot.
    /// Returns whether the record was written.
    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool>;

    async fn get_subscription(&self, subscription_id: &str)
        -> BillingResult<Option<SubscriptionRecord>>;

    async fn list_subscriptions_for_user(&self, user_id: &str)
        -> BillingResult<Vec<SubscriptionRecord>>;
}

#[async_trait]
pub trait EventLedger: Send + Sync {
    /// True when the event id is recorded and its entry has not expired
    async fn has_processed(&self, event_id: &str, now: OffsetDateTime) -> BillingResult<bool>;

    async fn mark_processed(
        &self,
        event_id: &str,
        processed_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> BillingResult<()>;

    /// Delete expired entries, returning how many were removed
    async fn purge_expired(&self, now: OffsetDateTime) -> BillingResult<u64>;
}

#[async_trait]
pub trait PaymentRecordStore: Send + Sync {
    /// Insert, or merge into the record with the same id
    async fn add_payment_record(&self, record: PaymentRecord) -> BillingResult<()>;
}

#[async_trait]
pub trait BillingEventStore: Send + Sync {
    async fn insert_billing_event(&self, event: &BillingEvent) -> BillingResult<()>;

    async fn list_billing_events_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>>;

    async fn insert_unmapped_event(&self, event: &UnmappedEvent) -> BillingResult<()>;
}

#[async_trait]
pub trait CommissionStore: Send + Sync {
    /// Atomically evaluate `policy` against the user's attribution and, when it
    /// qualifies, credit the ambassador, bump the promo code counters and flag
    /// the attribution as awarded.
    async fn award_commission(
        &self,
        user_id: &str,
        amount_cents: i64,
        policy: &CommissionPolicy,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CommissionAward>>;
}

/// Downstream app-limit enforcement
#[async_trait]
pub trait LimitEnforcer: Send + Sync {
    async fn enforce_limit(&self, user_id: &str) -> BillingResult<()>;
}

/// Store handles shared by the billing services
#[derive(Clone)]
pub struct Stores {
    pub catalog: Arc<dyn CatalogStore>,
    pub customers: Arc<dyn CustomerStore>,
    pub entitlements: Arc<dyn EntitlementStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub ledger: Arc<dyn EventLedger>,
    pub payments: Arc<dyn PaymentRecordStore>,
    pub events: Arc<dyn BillingEventStore>,
    pub commissions: Arc<dyn CommissionStore>,
    pub limits: Arc<dyn LimitEnforcer>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self::from_shared(Arc::new(PgBillingStore::new(pool)))
    }

    pub fn in_memory(store: Arc<InMemoryBillingStore>) -> Self {
        Self::from_shared(store)
    }

    fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: CatalogStore
            + CustomerStore
            + EntitlementStore
            + SubscriptionStore
            + EventLedger
            + PaymentRecordStore
            + BillingEventStore
            + CommissionStore
            + LimitEnforcer
            + 'static,
    {
        Self {
            catalog: store.clone(),
            customers: store.clone(),
            entitlements: store.clone(),
            subscriptions: store.clone(),
            ledger: store.clone(),
            payments: store.clone(),
            events: store.clone(),
            commissions: store.clone(),
            limits: store,
        }
    }

    /// Replace the limit enforcer (e.g. with a direct call into the app service)
    pub fn with_limit_enforcer(mut self, limits: Arc<dyn LimitEnforcer>) -> Self {
        self.limits = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_payment_record_merge_keeps_existing_fields() {
        let mut record = PaymentRecord {
            id: "cs_1".into(),
            event_type: "checkout.session.completed".into(),
            amount_cents: Some(1200),
            customer_id: Some("cus_1".into()),
            ..Default::default()
        };
        record.merge(PaymentRecord {
            id: "cs_1".into(),
            event_type: "checkout.session.completed.sync".into(),
            subscription_id: Some("sub_1".into()),
            ..Default::default()
        });

        assert_eq!(record.amount_cents, Some(1200));
        assert_eq!(record.customer_id.as_deref(), Some("cus_1"));
        assert_eq!(record.subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(record.event_type, "checkout.session.completed.sync");
    }

    #[test]
    fn test_expired_subscription_does_not_grant_access() {
        let record = SubscriptionRecord {
            id: "sub_1".into(),
            user_id: "u1".into(),
            status: SubscriptionStatus::Active,
            current_period_end: Some(datetime!(2026-01-01 0:00 UTC)),
            cancel_at_period_end: false,
            customer_id: None,
            price_id: Some("price_gold".into()),
            last_event_at: datetime!(2025-12-01 0:00 UTC),
        };

        assert!(record.grants_access(datetime!(2025-12-15 0:00 UTC)));
        assert!(!record.grants_access(datetime!(2026-01-02 0:00 UTC)));
    }

    #[test]
    fn test_creator_price_prefers_all_access() {
        let creator = CreatorRecord {
            id: "c1".into(),
            all_access_price_id: Some("price_all".into()),
            stripe_price_id: Some("price_legacy".into()),
            stripe_account_id: None,
        };
        assert_eq!(creator.subscription_price_id(), Some("price_all"));
    }
}
