//! Subscription management
//!
//! User-initiated subscription changes and the post-redirect checkout sync.
//! Plan changes go straight to Stripe; local state catches up through the
//! `customer.subscription.updated` webhook.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use storefront_shared::{CheckoutMode, SubscriptionStatus};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::provider::{PaymentProvider, Subscription};
use crate::store::{CustomerStore, PaymentRecord, PaymentRecordStore, Stores};
use crate::sync::EntitlementSynchronizer;

/// Id and status of a subscription after a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionState {
    pub id: String,
    pub status: SubscriptionStatus,
}

impl From<&Subscription> for SubscriptionState {
    fn from(sub: &Subscription) -> Self {
        Self {
            id: sub.id.clone(),
            status: sub.status,
        }
    }
}

/// Direction of a plan change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlanChange {
    Upgrade,
    Downgrade,
}

impl PlanChange {
    fn action(&self) -> &'static str {
        match self {
            PlanChange::Upgrade => "upgrade",
            PlanChange::Downgrade => "downgrade",
        }
    }

    fn failure(&self, err: BillingError) -> BillingError {
        match self {
            PlanChange::Upgrade => BillingError::UpgradeFailed(err.to_string()),
            PlanChange::Downgrade => BillingError::DowngradeFailed(err.to_string()),
        }
    }
}

/// Subscription service
pub struct SubscriptionService {
    provider: Arc<dyn PaymentProvider>,
    customers: Arc<dyn CustomerStore>,
    payments: Arc<dyn PaymentRecordStore>,
    events: BillingEventLogger,
    sync: Arc<EntitlementSynchronizer>,
}

impl SubscriptionService {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        stores: &Stores,
        sync: Arc<EntitlementSynchronizer>,
    ) -> Self {
        Self {
            provider,
            customers: stores.customers.clone(),
            payments: stores.payments.clone(),
            events: BillingEventLogger::new(stores.events.clone()),
            sync,
        }
    }

    /// Reconcile a finished subscription checkout for the signed-in user
    /// without waiting for the webhook.
    ///
    /// Returns `None` for non-subscription sessions. Fails with
    /// `SessionMismatch` when the session was started by someone else.
    pub async fn sync_checkout_session(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> BillingResult<Option<SubscriptionState>> {
        let session = self
            .provider
            .retrieve_checkout_session(session_id, None)
            .await?;

        let Some(subscription_id) = session
            .subscription_id()
            .filter(|_| session.mode == CheckoutMode::Subscription)
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let owned = session.client_reference_id.as_deref() == Some(user_id)
            || session.metadata.get("userId").map(String::as_str) == Some(user_id);
        if !owned {
            tracing::warn!(
                session_id = %session_id,
                user_id = %user_id,
                "Checkout session sync attempted by another user"
            );
            return Err(BillingError::SessionMismatch);
        }

        let sub = self
            .provider
            .retrieve_subscription(&subscription_id, None)
            .await?;
        let now = OffsetDateTime::now_utc();
        self.sync.project(&sub, user_id, true, now).await?;

        let customer_id = session
            .customer_id()
            .or_else(|| sub.customer_id())
            .map(str::to_string);
        if let Some(customer_id) = &customer_id {
            self.customers
                .set_customer_for_user(user_id, customer_id)
                .await?;
        }

        let occurred_at = session
            .created
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or(now);
        self.payments
            .add_payment_record(PaymentRecord {
                id: session.id.clone(),
                user_id: Some(user_id.to_string()),
                event_type: BillingEventType::CheckoutSynced.to_string(),
                occurred_at: Some(occurred_at),
                amount_cents: session.amount_total,
                currency: session.currency.clone(),
                customer_id,
                subscription_id: Some(sub.id.clone()),
                ..Default::default()
            })
            .await?;

        self.events
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::CheckoutSynced)
                    .amount(session.amount_total.filter(|a| *a > 0))
                    .stripe_subscription(Some(sub.id.as_str()))
                    .details(json!({"sessionId": session.id}))
                    .actor_type(ActorType::User)
                    .occurred_at(occurred_at),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            subscription_id = %sub.id,
            status = %sub.status,
            "Checkout session synced"
        );
        Ok(Some(SubscriptionState::from(&sub)))
    }

    pub async fn upgrade_subscription(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<SubscriptionState> {
        self.change_plan(PlanChange::Upgrade, subscription_id, price_id, idempotency_key)
            .await
    }

    pub async fn downgrade_subscription(
        &self,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<SubscriptionState> {
        self.change_plan(PlanChange::Downgrade, subscription_id, price_id, idempotency_key)
            .await
    }

    /// Swap the first item's price, prorating, and clear any pending cancel
    async fn change_plan(
        &self,
        change: PlanChange,
        subscription_id: &str,
        price_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<SubscriptionState> {
        let result = async {
            let current = self
                .provider
                .retrieve_subscription(subscription_id, None)
                .await?;
            let item_id = current.items.data.first().map(|item| item.id.clone());
            self.provider
                .update_subscription(
                    subscription_id,
                    json!({
                        "cancel_at_period_end": false,
                        "proration_behavior": "create_prorations",
                        "items": [{"id": item_id, "price": price_id}],
                        "metadata": {"action": change.action()},
                    }),
                    idempotency_key,
                )
                .await
        }
        .await;

        match result {
            Ok(sub) => {
                tracing::info!(
                    subscription_id = %sub.id,
                    price_id = %price_id,
                    action = change.action(),
                    "Subscription plan changed"
                );
                Ok(SubscriptionState::from(&sub))
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    price_id = %price_id,
                    action = change.action(),
                    error = %e,
                    "Subscription plan change failed"
                );
                Err(change.failure(e))
            }
        }
    }

    /// Cancel at the end of the current period
    pub async fn cancel_subscription(
        &self,
        subscription_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<SubscriptionState> {
        match self
            .provider
            .update_subscription(
                subscription_id,
                json!({"cancel_at_period_end": true}),
                idempotency_key,
            )
            .await
        {
            Ok(sub) => {
                tracing::info!(subscription_id = %sub.id, "Subscription set to cancel at period end");
                Ok(SubscriptionState::from(&sub))
            }
            Err(e) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %e,
                    "Subscription cancel failed"
                );
                Err(BillingError::CancelFailed(e.to_string()))
            }
        }
    }
}
