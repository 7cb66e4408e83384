//! In-memory store adapter
//!
//! All state sits behind a single mutex, which also gives the commission award
//! its atomicity. Every mutating call bumps a write counter so callers can
//! assert that a replay performed no writes.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use super::{
    AppRecord, Attribution, BillingEventStore, CatalogStore, CommissionStore, CreatorRecord,
    CustomerStore, EntitlementStore, EventLedger, LimitEnforcer, PaymentRecord,
    PaymentRecordStore, SubscriptionRecord, SubscriptionStore, UnmappedEvent,
};
use crate::commission::{CommissionAward, CommissionPolicy};
use crate::entitlement::Entitlement;
use crate::error::{BillingError, BillingResult};
use crate::events::BillingEvent;

/// Ambassador earnings in cents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmbassadorBalance {
    pub current_balance_cents: i64,
    pub total_earned_cents: i64,
}

/// Promo code conversion counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PromoCodeStats {
    pub paid_conversions: i64,
    pub revenue_cents: i64,
}

#[derive(Default)]
struct State {
    apps: BTreeMap<String, AppRecord>,
    creators: BTreeMap<String, CreatorRecord>,
    user_by_customer: HashMap<String, String>,
    customer_by_user: HashMap<String, String>,
    entitlements: BTreeMap<(String, String), Entitlement>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    processed: HashMap<String, OffsetDateTime>,
    payments: BTreeMap<String, PaymentRecord>,
    events: Vec<BillingEvent>,
    unmapped: Vec<UnmappedEvent>,
    attributions: HashMap<String, Attribution>,
    ambassadors: HashMap<String, AmbassadorBalance>,
    promo_codes: HashMap<String, PromoCodeStats>,
    limit_requests: Vec<String>,
    writes: u64,
}

#[derive(Default)]
pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding

    pub async fn insert_app(&self, app: AppRecord) {
        self.state.lock().await.apps.insert(app.id.clone(), app);
    }

    pub async fn insert_creator(&self, creator: CreatorRecord) {
        self.state
            .lock()
            .await
            .creators
            .insert(creator.id.clone(), creator);
    }

    pub async fn insert_attribution(&self, attribution: Attribution) {
        self.state
            .lock()
            .await
            .attributions
            .insert(attribution.user_id.clone(), attribution);
    }

    // Inspection

    pub async fn write_count(&self) -> u64 {
        self.state.lock().await.writes
    }

    pub async fn all_entitlements(&self) -> Vec<Entitlement> {
        self.state
            .lock()
            .await
            .entitlements
            .values()
            .cloned()
            .collect()
    }

    pub async fn payment_records(&self) -> Vec<PaymentRecord> {
        self.state.lock().await.payments.values().cloned().collect()
    }

    pub async fn billing_events(&self) -> Vec<BillingEvent> {
        self.state.lock().await.events.clone()
    }

    pub async fn unmapped_events(&self) -> Vec<UnmappedEvent> {
        self.state.lock().await.unmapped.clone()
    }

    pub async fn limit_requests(&self) -> Vec<String> {
        self.state.lock().await.limit_requests.clone()
    }

    pub async fn attribution(&self, user_id: &str) -> Option<Attribution> {
        self.state.lock().await.attributions.get(user_id).cloned()
    }

    pub async fn ambassador(&self, ambassador_id: &str) -> AmbassadorBalance {
        self.state
            .lock()
            .await
            .ambassadors
            .get(ambassador_id)
            .copied()
            .unwrap_or_default()
    }

    pub async fn promo_code(&self, code: &str) -> PromoCodeStats {
        self.state
            .lock()
            .await
            .promo_codes
            .get(code)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl CatalogStore for InMemoryBillingStore {
    async fn list_apps(&self) -> BillingResult<Vec<AppRecord>> {
        Ok(self.state.lock().await.apps.values().cloned().collect())
    }

    async fn list_creators(&self) -> BillingResult<Vec<CreatorRecord>> {
        Ok(self.state.lock().await.creators.values().cloned().collect())
    }

    async fn find_app(&self, id_or_slug: &str) -> BillingResult<Option<AppRecord>> {
        let state = self.state.lock().await;
        if let Some(app) = state.apps.get(id_or_slug) {
            return Ok(Some(app.clone()));
        }
        let matches: Vec<&AppRecord> = state
            .apps
            .values()
            .filter(|app| app.slug.as_deref() == Some(id_or_slug))
            .collect();
        match matches.as_slice() {
            [] => Ok(None),
            [app] => Ok(Some((*app).clone())),
            _ => Err(BillingError::AppSlugNotUnique(id_or_slug.to_string())),
        }
    }

    async fn set_app_price_id(&self, app_id: &str, price_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let app = state
            .apps
            .get_mut(app_id)
            .ok_or_else(|| BillingError::AppNotFound(app_id.to_string()))?;
        app.stripe_price_id = Some(price_id.to_string());
        state.writes += 1;
        Ok(())
    }

    async fn get_payout_account(&self, creator_id: &str) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .creators
            .get(creator_id)
            .and_then(|c| c.stripe_account_id.clone()))
    }

    async fn set_payout_account(&self, creator_id: &str, account_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state
            .creators
            .entry(creator_id.to_string())
            .or_insert_with(|| CreatorRecord {
                id: creator_id.to_string(),
                all_access_price_id: None,
                stripe_price_id: None,
                stripe_account_id: None,
            })
            .stripe_account_id = Some(account_id.to_string());
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl CustomerStore for InMemoryBillingStore {
    async fn get_user_id_by_customer(&self, customer_id: &str) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .user_by_customer
            .get(customer_id)
            .cloned())
    }

    async fn get_customer_for_user(&self, user_id: &str) -> BillingResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .await
            .customer_by_user
            .get(user_id)
            .cloned())
    }

    async fn set_customer_for_user(&self, user_id: &str, customer_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if state.customer_by_user.get(user_id).map(String::as_str) == Some(customer_id)
            && state.user_by_customer.get(customer_id).map(String::as_str) == Some(user_id)
        {
            return Ok(());
        }
        // One customer per user and one user per customer
        if let Some(previous_customer) = state.customer_by_user.remove(user_id) {
            state.user_by_customer.remove(&previous_customer);
        }
        if let Some(previous_user) = state.user_by_customer.remove(customer_id) {
            state.customer_by_user.remove(&previous_user);
        }
        state
            .customer_by_user
            .insert(user_id.to_string(), customer_id.to_string());
        state
            .user_by_customer
            .insert(customer_id.to_string(), user_id.to_string());
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl EntitlementStore for InMemoryBillingStore {
    async fn upsert_entitlement(&self, entitlement: &Entitlement) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.entitlements.insert(
            (entitlement.user_id.clone(), entitlement.id.clone()),
            entitlement.clone(),
        );
        state.writes += 1;
        Ok(())
    }

    async fn list_entitlements(&self, user_id: &str) -> BillingResult<Vec<Entitlement>> {
        Ok(self
            .state
            .lock()
            .await
            .entitlements
            .values()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryBillingStore {
    async fn upsert_subscription(&self, record: &SubscriptionRecord) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.subscriptions.get(&record.id) {
            if existing.last_event_at > record.last_event_at {
                return Ok(false);
            }
        }
        state.subscriptions.insert(record.id.clone(), record.clone());
        state.writes += 1;
        Ok(true)
    }

    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .get(subscription_id)
            .cloned())
    }

    async fn list_subscriptions_for_user(
        &self,
        user_id: &str,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EventLedger for InMemoryBillingStore {
    async fn has_processed(&self, event_id: &str, now: OffsetDateTime) -> BillingResult<bool> {
        Ok(self
            .state
            .lock()
            .await
            .processed
            .get(event_id)
            .is_some_and(|expires_at| *expires_at > now))
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        _processed_at: OffsetDateTime,
        expires_at: OffsetDateTime,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.processed.insert(event_id.to_string(), expires_at);
        state.writes += 1;
        Ok(())
    }

    async fn purge_expired(&self, now: OffsetDateTime) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.processed.len();
        state.processed.retain(|_, expires_at| *expires_at > now);
        let removed = (before - state.processed.len()) as u64;
        if removed > 0 {
            state.writes += 1;
        }
        Ok(removed)
    }
}

#[async_trait]
impl PaymentRecordStore for InMemoryBillingStore {
    async fn add_payment_record(&self, record: PaymentRecord) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        match state.payments.get_mut(&record.id) {
            Some(existing) => existing.merge(record),
            None => {
                state.payments.insert(record.id.clone(), record);
            }
        }
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl BillingEventStore for InMemoryBillingStore {
    async fn insert_billing_event(&self, event: &BillingEvent) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.events.push(event.clone());
        state.writes += 1;
        Ok(())
    }

    async fn list_billing_events_for_user(
        &self,
        user_id: &str,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<BillingEvent> = state
            .events
            .iter()
            .filter(|e| e.user_id.as_deref() == Some(user_id))
            .cloned()
            .collect();
        events.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        events.truncate(limit.max(0) as usize);
        Ok(events)
    }

    async fn insert_unmapped_event(&self, event: &UnmappedEvent) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.unmapped.push(event.clone());
        state.writes += 1;
        Ok(())
    }
}

#[async_trait]
impl CommissionStore for InMemoryBillingStore {
    async fn award_commission(
        &self,
        user_id: &str,
        amount_cents: i64,
        policy: &CommissionPolicy,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CommissionAward>> {
        let mut state = self.state.lock().await;
        let Some(attribution) = state.attributions.get(user_id).cloned() else {
            return Ok(None);
        };
        let Some(award) = policy.evaluate(&attribution, amount_cents, now) else {
            return Ok(None);
        };

        let balance = state
            .ambassadors
            .entry(award.ambassador_id.clone())
            .or_default();
        balance.current_balance_cents += award.commission_cents;
        balance.total_earned_cents += award.commission_cents;

        let promo = state.promo_codes.entry(award.promo_code.clone()).or_default();
        promo.paid_conversions += 1;
        promo.revenue_cents += award.amount_cents;

        if let Some(attribution) = state.attributions.get_mut(user_id) {
            attribution.commission_awarded = true;
            attribution.commission_awarded_at = Some(now);
        }
        state.writes += 1;
        Ok(Some(award))
    }
}

#[async_trait]
impl LimitEnforcer for InMemoryBillingStore {
    async fn enforce_limit(&self, user_id: &str) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        state.limit_requests.push(user_id.to_string());
        state.writes += 1;
        Ok(())
    }
}
