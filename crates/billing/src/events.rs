//! Billing Events Module
//!
//! Append-only, ops-facing audit trail of what the billing engine did and why.
//! Unlike payment records, events may have no resolvable user (errors,
//! unmapped webhooks) and carry a status.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::store::{BillingEventStore, UnmappedEvent};

/// Types of billing events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingEventType {
    // Checkout
    CheckoutCompleted,
    CheckoutSynced,
    Purchase,

    // Subscription lifecycle
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    SubscriptionPaused,
    SubscriptionResumed,

    // Invoicing
    InvoicePaid,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    InvoicePaymentActionRequired,

    // Payments
    PaymentIntentSucceeded,
    ChargeRefunded,

    // Connect
    AccountUpdated,

    // Provider entitlements
    EntitlementSummaryUpdated,

    // Referrals
    CommissionAwarded,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CheckoutCompleted => "checkout.session.completed",
            Self::CheckoutSynced => "checkout.session.completed.sync",
            Self::Purchase => "purchase",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::SubscriptionPaused => "customer.subscription.paused",
            Self::SubscriptionResumed => "customer.subscription.resumed",
            Self::InvoicePaid => "invoice.paid",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
            Self::InvoicePaymentActionRequired => "invoice.payment_action_required",
            Self::PaymentIntentSucceeded => "payment_intent.succeeded",
            Self::ChargeRefunded => "charge.refunded",
            Self::AccountUpdated => "account.updated",
            Self::EntitlementSummaryUpdated => "entitlements.active_entitlement_summary.updated",
            Self::CommissionAwarded => "ambassador.commission_awarded",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome recorded on an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventStatus::Success => write!(f, "success"),
            EventStatus::Error => write!(f, "error"),
        }
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActorType {
    /// End user through UI
    User,
    /// System automation
    System,
    /// Stripe webhook
    Stripe,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::System => write!(f, "system"),
            ActorType::Stripe => write!(f, "stripe"),
        }
    }
}

/// A billing event record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingEvent {
    pub id: Uuid,
    pub user_id: Option<String>,
    pub event_type: String,
    pub status: EventStatus,
    pub amount_cents: Option<i64>,
    pub subscription_id: Option<String>,
    pub stripe_event_id: Option<String>,
    pub actor_type: String,
    pub details: serde_json::Value,
    pub occurred_at: OffsetDateTime,
}

/// Builder for creating billing events
pub struct BillingEventBuilder {
    user_id: Option<String>,
    event_type: BillingEventType,
    status: EventStatus,
    amount_cents: Option<i64>,
    subscription_id: Option<String>,
    stripe_event_id: Option<String>,
    actor_type: ActorType,
    details: serde_json::Value,
    occurred_at: Option<OffsetDateTime>,
}

impl BillingEventBuilder {
    pub fn new(user_id: impl Into<String>, event_type: BillingEventType) -> Self {
        Self::anonymous(event_type).user(user_id)
    }

    /// Event with no resolvable user
    pub fn anonymous(event_type: BillingEventType) -> Self {
        Self {
            user_id: None,
            event_type,
            status: EventStatus::Success,
            amount_cents: None,
            subscription_id: None,
            stripe_event_id: None,
            actor_type: ActorType::System,
            details: serde_json::json!({}),
            occurred_at: None,
        }
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn error(mut self) -> Self {
        self.status = EventStatus::Error;
        self
    }

    pub fn amount(mut self, amount_cents: Option<i64>) -> Self {
        self.amount_cents = amount_cents;
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: Option<impl Into<String>>) -> Self {
        self.subscription_id = subscription_id.map(Into::into);
        self
    }

    pub fn stripe_event(mut self, event_id: impl Into<String>) -> Self {
        self.stripe_event_id = Some(event_id.into());
        self
    }

    pub fn actor_type(mut self, actor_type: ActorType) -> Self {
        self.actor_type = actor_type;
        self
    }

    /// Set the details blob (null entries are dropped)
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = crate::payload::clean_undefined(details);
        self
    }

    pub fn occurred_at(mut self, at: OffsetDateTime) -> Self {
        self.occurred_at = Some(at);
        self
    }

    pub fn build(self) -> BillingEvent {
        BillingEvent {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            event_type: self.event_type.to_string(),
            status: self.status,
            amount_cents: self.amount_cents,
            subscription_id: self.subscription_id,
            stripe_event_id: self.stripe_event_id,
            actor_type: self.actor_type.to_string(),
            details: self.details,
            occurred_at: self.occurred_at.unwrap_or_else(OffsetDateTime::now_utc),
        }
    }
}

/// Service for logging and querying billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    store: Arc<dyn BillingEventStore>,
}

impl BillingEventLogger {
    pub fn new(store: Arc<dyn BillingEventStore>) -> Self {
        Self { store }
    }

    pub async fn log_event(&self, builder: BillingEventBuilder) -> BillingResult<Uuid> {
        let event = builder.build();
        self.store.insert_billing_event(&event).await?;

        tracing::debug!(
            billing_event_id = %event.id,
            event_type = %event.event_type,
            status = %event.status,
            user_id = ?event.user_id,
            "Billing event logged"
        );
        Ok(event.id)
    }

    /// Record an event that could not be tied to a user
    pub async fn quarantine(
        &self,
        event_id: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> BillingResult<()> {
        self.store
            .insert_unmapped_event(&UnmappedEvent {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                payload,
                received_at: OffsetDateTime::now_utc(),
            })
            .await?;

        tracing::error!(
            event_id = %event_id,
            event_type = %event_type,
            "Billing event quarantined: no user mapping"
        );
        Ok(())
    }

    pub async fn events_for_user(&self, user_id: &str, limit: i64) -> BillingResult<Vec<BillingEvent>> {
        self.store.list_billing_events_for_user(user_id, limit).await
    }
}
