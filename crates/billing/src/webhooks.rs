//! Stripe webhook reconciliation
//!
//! Verifies inbound events, skips ones already processed, and projects each
//! event onto local state: subscription records, entitlements, payment
//! records, the audit log and ambassador commissions. An event is marked
//! processed only after its handler returns `Ok`; a failed handler leaves it
//! unmarked so Stripe's retry runs it again from the top.

use std::collections::HashSet;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use storefront_shared::{CheckoutMode, EntitlementFeature, SubscriptionStatus};
use time::OffsetDateTime;

use crate::client::StripeConfig;
use crate::commission::{CommissionPolicy, CommissionTransactor};
use crate::connect::ConnectService;
use crate::entitlement::{entitlement_id, Entitlement, EntitlementData};
use crate::error::{best_effort, BillingError, BillingResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::IdempotencyGate;
use crate::provider::{
    Account, ActiveEntitlementSummary, Charge, Expandable, Invoice, PaymentIntent,
    PaymentProvider, Subscription,
};
use crate::store::{CustomerStore, EntitlementStore, PaymentRecord, PaymentRecordStore, Stores};
use crate::sync::EntitlementSynchronizer;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verified event envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    /// Connected account the event originated from
    #[serde(default)]
    pub account: Option<String>,
    pub data: EventData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl EventEnvelope {
    fn occurred_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }
}

/// Subscription lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Created,
    Updated,
    Deleted,
    Paused,
    Resumed,
}

impl SubscriptionChange {
    fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "customer.subscription.created" => Some(Self::Created),
            "customer.subscription.updated" => Some(Self::Updated),
            "customer.subscription.deleted" => Some(Self::Deleted),
            "customer.subscription.paused" => Some(Self::Paused),
            "customer.subscription.resumed" => Some(Self::Resumed),
            _ => None,
        }
    }

    /// Whether entitlements stay active after this change
    pub fn keeps_access(&self, status: SubscriptionStatus) -> bool {
        match self {
            Self::Paused | Self::Deleted => false,
            Self::Resumed => true,
            Self::Created | Self::Updated => status != SubscriptionStatus::Canceled,
        }
    }

    fn event_type(&self) -> BillingEventType {
        match self {
            Self::Created => BillingEventType::SubscriptionCreated,
            Self::Updated => BillingEventType::SubscriptionUpdated,
            Self::Deleted => BillingEventType::SubscriptionDeleted,
            Self::Paused => BillingEventType::SubscriptionPaused,
            Self::Resumed => BillingEventType::SubscriptionResumed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceChange {
    Paid,
    PaymentSucceeded,
    PaymentFailed,
    PaymentActionRequired,
}

impl InvoiceChange {
    fn from_event_type(event_type: &str) -> Option<Self> {
        match event_type {
            "invoice.paid" => Some(Self::Paid),
            "invoice.payment_succeeded" => Some(Self::PaymentSucceeded),
            "invoice.payment_failed" => Some(Self::PaymentFailed),
            "invoice.payment_action_required" => Some(Self::PaymentActionRequired),
            _ => None,
        }
    }

    fn event_type(&self) -> BillingEventType {
        match self {
            Self::Paid => BillingEventType::InvoicePaid,
            Self::PaymentSucceeded => BillingEventType::InvoicePaymentSucceeded,
            Self::PaymentFailed => BillingEventType::InvoicePaymentFailed,
            Self::PaymentActionRequired => BillingEventType::InvoicePaymentActionRequired,
        }
    }
}

/// Events the reconciler understands, each with the payload its branch needs
#[derive(Debug, Clone, PartialEq)]
pub enum BillingWebhookEvent {
    CheckoutCompleted {
        session_id: String,
    },
    Subscription {
        change: SubscriptionChange,
        subscription: Box<Subscription>,
    },
    Invoice {
        change: InvoiceChange,
        invoice: Box<Invoice>,
    },
    AccountUpdated {
        account: Box<Account>,
    },
    PaymentIntentSucceeded {
        payment_intent: Box<PaymentIntent>,
    },
    ChargeRefunded {
        charge: Box<Charge>,
    },
    EntitlementSummaryUpdated {
        summary: Box<ActiveEntitlementSummary>,
    },
    /// Acknowledged and marked processed without side effects
    Unhandled {
        event_type: String,
    },
}

#[derive(Deserialize)]
struct ObjectRef {
    id: String,
}

impl BillingWebhookEvent {
    /// Decode the event object for a known type.
    ///
    /// Unknown types become `Unhandled`; a known type whose object does not
    /// decode fails with `WebhookEventNotSupported`.
    pub fn parse(envelope: &EventEnvelope) -> BillingResult<Self> {
        let event_type = envelope.event_type.as_str();

        if let Some(change) = SubscriptionChange::from_event_type(event_type) {
            return Ok(Self::Subscription {
                change,
                subscription: decode(envelope)?,
            });
        }
        if let Some(change) = InvoiceChange::from_event_type(event_type) {
            return Ok(Self::Invoice {
                change,
                invoice: decode(envelope)?,
            });
        }

        Ok(match event_type {
            "checkout.session.completed" => Self::CheckoutCompleted {
                session_id: decode::<ObjectRef>(envelope)?.id,
            },
            "account.updated" => Self::AccountUpdated {
                account: decode(envelope)?,
            },
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded {
                payment_intent: decode(envelope)?,
            },
            "charge.refunded" => Self::ChargeRefunded {
                charge: decode(envelope)?,
            },
            "entitlements.active_entitlement_summary.updated" => Self::EntitlementSummaryUpdated {
                summary: decode(envelope)?,
            },
            other => Self::Unhandled {
                event_type: other.to_string(),
            },
        })
    }
}

fn decode<T: DeserializeOwned>(envelope: &EventEnvelope) -> BillingResult<T> {
    serde_json::from_value(envelope.data.object.clone()).map_err(|e| {
        tracing::error!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            error = %e,
            "Failed to decode webhook event object"
        );
        BillingError::WebhookEventNotSupported(format!("{}: {}", envelope.event_type, e))
    })
}

/// What handling an event did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookOutcome {
    pub event_id: String,
    pub event_type: String,
    /// Already processed; nothing was written
    pub duplicate: bool,
    /// No user could be resolved; the payload went to the unmapped-event log
    pub quarantined: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<CheckoutMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_total: Option<i64>,
}

impl WebhookOutcome {
    fn for_event(envelope: &EventEnvelope) -> Self {
        Self {
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            ..Default::default()
        }
    }
}

/// Check a `Stripe-Signature` header against the payload.
///
/// The header carries `t=<unix seconds>` and one or more `v1=<hex hmac>`
/// entries; any matching `v1` within the tolerance window is accepted.
pub fn verify_signature(
    secret: &str,
    payload: &str,
    header: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());

    // verify_slice compares in constant time
    let matched = signatures.iter().any(|candidate| {
        hex::decode(candidate)
            .map(|bytes| mac.clone().verify_slice(&bytes).is_ok())
            .unwrap_or(false)
    });
    if !matched {
        tracing::warn!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }
    Ok(())
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    webhook_secret: String,
    provider: Arc<dyn PaymentProvider>,
    customers: Arc<dyn CustomerStore>,
    entitlements: Arc<dyn EntitlementStore>,
    payments: Arc<dyn PaymentRecordStore>,
    gate: IdempotencyGate,
    events: BillingEventLogger,
    sync: Arc<EntitlementSynchronizer>,
    commissions: CommissionTransactor,
    connect: ConnectService,
}

impl WebhookHandler {
    pub fn new(
        config: &StripeConfig,
        provider: Arc<dyn PaymentProvider>,
        stores: &Stores,
        sync: Arc<EntitlementSynchronizer>,
        connect: ConnectService,
    ) -> Self {
        let events = BillingEventLogger::new(stores.events.clone());
        Self {
            webhook_secret: config.webhook_secret.clone(),
            provider,
            customers: stores.customers.clone(),
            entitlements: stores.entitlements.clone(),
            payments: stores.payments.clone(),
            gate: IdempotencyGate::new(
                stores.ledger.clone(),
                config.processed_event_retention_days,
            ),
            commissions: CommissionTransactor::new(
                stores.commissions.clone(),
                events.clone(),
                CommissionPolicy::from_config(config),
            ),
            events,
            sync,
            connect,
        }
    }

    /// Verify the signature header and parse the event envelope
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<EventEnvelope> {
        verify_signature(
            &self.webhook_secret,
            payload,
            signature,
            OffsetDateTime::now_utc().unix_timestamp(),
        )?;

        let envelope: EventEnvelope = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookEventNotSupported(format!("malformed event: {}", e))
        })?;

        tracing::debug!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            "Webhook signature verified"
        );
        Ok(envelope)
    }

    /// Handle a verified event exactly once
    pub async fn handle_event(&self, envelope: &EventEnvelope) -> BillingResult<WebhookOutcome> {
        if self.gate.has_processed(&envelope.id).await? {
            tracing::info!(
                event_id = %envelope.id,
                event_type = %envelope.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(WebhookOutcome {
                duplicate: true,
                ..WebhookOutcome::for_event(envelope)
            });
        }

        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            account = ?envelope.account,
            "Processing Stripe webhook event"
        );

        let event = BillingWebhookEvent::parse(envelope)?;
        let outcome = match self.process(envelope, event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook handler failed; event left unmarked for retry"
                );
                return Err(e);
            }
        };

        self.gate.mark_processed(&envelope.id).await?;
        Ok(outcome)
    }

    async fn process(
        &self,
        envelope: &EventEnvelope,
        event: BillingWebhookEvent,
    ) -> BillingResult<WebhookOutcome> {
        match event {
            BillingWebhookEvent::CheckoutCompleted { session_id } => {
                self.handle_checkout_completed(envelope, &session_id).await
            }
            BillingWebhookEvent::Subscription {
                change,
                subscription,
            } => {
                self.handle_subscription_change(envelope, change, &subscription)
                    .await
            }
            BillingWebhookEvent::Invoice { change, invoice } => {
                self.handle_invoice(envelope, change, &invoice).await
            }
            BillingWebhookEvent::AccountUpdated { account } => {
                self.handle_account_updated(envelope, &account).await
            }
            BillingWebhookEvent::PaymentIntentSucceeded { payment_intent } => {
                self.handle_payment_intent_succeeded(envelope, &payment_intent)
                    .await
            }
            BillingWebhookEvent::ChargeRefunded { charge } => {
                self.handle_charge_refunded(envelope, &charge).await
            }
            BillingWebhookEvent::EntitlementSummaryUpdated { summary } => {
                self.handle_entitlement_summary(envelope, &summary).await
            }
            BillingWebhookEvent::Unhandled { event_type } => {
                tracing::debug!(event_type = %event_type, "Unhandled webhook event type");
                Ok(WebhookOutcome::for_event(envelope))
            }
        }
    }

    async fn user_for_customer(&self, customer_id: Option<&str>) -> BillingResult<Option<String>> {
        match customer_id {
            Some(customer_id) => self.customers.get_user_id_by_customer(customer_id).await,
            None => Ok(None),
        }
    }

    /// Record an event that has no user and park its payload for triage
    async fn quarantine(
        &self,
        envelope: &EventEnvelope,
        event_type: BillingEventType,
        details: serde_json::Value,
        payload: serde_json::Value,
    ) -> BillingResult<()> {
        self.events
            .log_event(
                BillingEventBuilder::anonymous(event_type)
                    .error()
                    .details(details)
                    .stripe_event(&envelope.id)
                    .actor_type(ActorType::Stripe)
                    .occurred_at(envelope.occurred_at()),
            )
            .await?;
        self.events
            .quarantine(&envelope.id, &envelope.event_type, payload)
            .await
    }

    async fn handle_checkout_completed(
        &self,
        envelope: &EventEnvelope,
        session_id: &str,
    ) -> BillingResult<WebhookOutcome> {
        let account = envelope.account.as_deref();
        let session = self
            .provider
            .retrieve_checkout_session(session_id, account)
            .await?;

        let customer_id = session.customer_id().map(str::to_string);
        let subscription_id = session.subscription_id().map(str::to_string);
        let payment_intent_id = session.payment_intent_id().map(str::to_string);
        let amount_total = session.amount_total;

        let payment_intent = match &session.payment_intent {
            Some(Expandable::Object(pi)) => Some((**pi).clone()),
            Some(Expandable::Id(id)) => Some(
                self.provider
                    .retrieve_payment_intent(id, account)
                    .await?,
            ),
            None => None,
        };
        let application_fee = payment_intent
            .as_ref()
            .and_then(|pi| pi.application_fee_amount);
        let destination = payment_intent
            .as_ref()
            .and_then(|pi| pi.destination())
            .map(str::to_string);

        let subscription = match (&session.subscription, session.mode) {
            (Some(Expandable::Object(sub)), CheckoutMode::Subscription) => Some((**sub).clone()),
            (Some(Expandable::Id(id)), CheckoutMode::Subscription) => {
                Some(self.provider.retrieve_subscription(id, account).await?)
            }
            _ => None,
        };

        let mut user_id = session
            .client_reference_id
            .clone()
            .filter(|u| !u.is_empty())
            .or_else(|| session.metadata.get("userId").cloned())
            .or_else(|| {
                subscription
                    .as_ref()
                    .and_then(|s| s.metadata.get("userId").cloned())
            });
        if user_id.is_none() {
            user_id = self.user_for_customer(customer_id.as_deref()).await?;
        }

        let mut outcome = WebhookOutcome {
            session_id: Some(session.id.clone()),
            subscription_id: subscription_id.clone(),
            payment_intent_id: payment_intent_id.clone(),
            mode: Some(session.mode),
            amount_total,
            ..WebhookOutcome::for_event(envelope)
        };

        let Some(user_id) = user_id else {
            tracing::error!(
                session_id = %session.id,
                customer_id = ?customer_id,
                "Missing user id for checkout session"
            );
            self.quarantine(
                envelope,
                BillingEventType::CheckoutCompleted,
                json!({"sessionId": session.id, "stripeCustomerId": customer_id}),
                serde_json::to_value(&session)?,
            )
            .await?;
            outcome.quarantined = true;
            return Ok(outcome);
        };

        if let Some(sub) = &subscription {
            self.sync
                .project(sub, &user_id, true, envelope.occurred_at())
                .await?;
        }

        self.payments
            .add_payment_record(PaymentRecord {
                id: session.id.clone(),
                user_id: Some(user_id.clone()),
                event_type: envelope.event_type.clone(),
                occurred_at: Some(envelope.occurred_at()),
                amount_cents: amount_total,
                currency: session.currency.clone(),
                customer_id: customer_id.clone(),
                creator_id: session.metadata.get("creatorId").cloned(),
                subscription_id: subscription_id.clone(),
                payment_intent_id: payment_intent_id.clone(),
                application_fee_cents: application_fee,
                destination: destination.clone(),
            })
            .await?;

        let line_items = session.line_items.as_ref().map(|l| l.data.len());
        self.events
            .log_event(
                BillingEventBuilder::new(&user_id, BillingEventType::CheckoutCompleted)
                    .amount(amount_total.filter(|a| *a > 0))
                    .stripe_subscription(subscription_id.as_deref())
                    .details(json!({
                        "sessionId": session.id,
                        "mode": session.mode,
                        "destination": destination,
                        "applicationFee": application_fee,
                        "lineItems": line_items,
                        "paymentIntent": payment_intent_id,
                    }))
                    .stripe_event(&envelope.id)
                    .actor_type(ActorType::Stripe)
                    .occurred_at(envelope.occurred_at()),
            )
            .await?;

        if session.mode == CheckoutMode::Payment {
            if let Some(listing_id) = session.metadata.get("listingId") {
                self.entitlements
                    .upsert_entitlement(&Entitlement {
                        id: entitlement_id(EntitlementFeature::Purchase, listing_id),
                        user_id: user_id.clone(),
                        feature: EntitlementFeature::Purchase,
                        active: true,
                        data: EntitlementData {
                            listing_id: Some(listing_id.clone()),
                            payment_intent_id: payment_intent_id.clone(),
                            stripe_customer_id: customer_id.clone(),
                            ..Default::default()
                        },
                    })
                    .await?;
                self.events
                    .log_event(
                        BillingEventBuilder::new(&user_id, BillingEventType::Purchase)
                            .amount(amount_total.filter(|a| *a > 0))
                            .details(json!({
                                "listingId": listing_id,
                                "paymentIntent": payment_intent_id,
                            }))
                            .stripe_event(&envelope.id)
                            .actor_type(ActorType::Stripe)
                            .occurred_at(envelope.occurred_at()),
                    )
                    .await?;
            }
        }

        if let Some(amount) = amount_total.filter(|a| *a > 0) {
            best_effort(
                "award_commission",
                self.commissions.award(&user_id, amount, Some(&envelope.id)),
            )
            .await;
        }

        if let Some(customer_id) = &customer_id {
            self.customers
                .set_customer_for_user(&user_id, customer_id)
                .await?;
        }

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            mode = %session.mode,
            amount_total = ?amount_total,
            "Checkout session reconciled"
        );
        Ok(outcome)
    }

    async fn handle_subscription_change(
        &self,
        envelope: &EventEnvelope,
        change: SubscriptionChange,
        sub: &Subscription,
    ) -> BillingResult<WebhookOutcome> {
        let customer_id = sub.customer_id();
        let mut outcome = WebhookOutcome {
            subscription_id: Some(sub.id.clone()),
            ..WebhookOutcome::for_event(envelope)
        };

        let user_id = match sub.metadata.get("userId").filter(|u| !u.is_empty()) {
            Some(user_id) => Some(user_id.clone()),
            None => self.user_for_customer(customer_id).await?,
        };
        let Some(user_id) = user_id else {
            tracing::error!(
                subscription_id = %sub.id,
                customer_id = ?customer_id,
                "Missing user id for subscription event"
            );
            self.quarantine(
                envelope,
                change.event_type(),
                json!({"subscriptionId": sub.id, "stripeCustomerId": customer_id}),
                envelope.data.object.clone(),
            )
            .await?;
            outcome.quarantined = true;
            return Ok(outcome);
        };

        let active = change.keeps_access(sub.status);
        let applied = self
            .sync
            .project(sub, &user_id, active, envelope.occurred_at())
            .await?;

        let amount = sub.items.data.first().and_then(|i| i.price.unit_amount);
        self.events
            .log_event(
                BillingEventBuilder::new(&user_id, change.event_type())
                    .amount(amount)
                    .stripe_subscription(Some(sub.id.as_str()))
                    .details(json!({
                        "status": sub.status,
                        "active": active,
                        "stale": if applied { None } else { Some(true) },
                    }))
                    .stripe_event(&envelope.id)
                    .actor_type(ActorType::Stripe)
                    .occurred_at(envelope.occurred_at()),
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            status = %sub.status,
            active = active,
            applied = applied,
            "Subscription event reconciled"
        );
        Ok(outcome)
    }

    async fn handle_invoice(
        &self,
        envelope: &EventEnvelope,
        change: InvoiceChange,
        invoice: &Invoice,
    ) -> BillingResult<WebhookOutcome> {
        let customer_id = invoice.customer_id();
        let subscription_id = invoice.subscription.as_ref().map(|s| s.id().to_string());
        let user_id = self.user_for_customer(customer_id).await?;

        self.payments
            .add_payment_record(PaymentRecord {
                id: envelope.id.clone(),
                user_id: user_id.clone(),
                event_type: envelope.event_type.clone(),
                occurred_at: Some(envelope.occurred_at()),
                amount_cents: invoice.total,
                currency: invoice.currency.clone(),
                customer_id: customer_id.map(str::to_string),
                subscription_id: subscription_id.clone(),
                ..Default::default()
            })
            .await?;

        match &user_id {
            Some(user_id) => {
                let mut event = BillingEventBuilder::new(user_id, change.event_type())
                    .amount(invoice.total)
                    .stripe_subscription(subscription_id.as_deref())
                    .details(json!({"invoiceId": invoice.id, "status": invoice.status}))
                    .stripe_event(&envelope.id)
                    .actor_type(ActorType::Stripe)
                    .occurred_at(envelope.occurred_at());
                if change == InvoiceChange::PaymentFailed {
                    event = event.error();
                }
                self.events.log_event(event).await?;
            }
            None => tracing::warn!(
                invoice_id = %invoice.id,
                customer_id = ?customer_id,
                "Invoice event for unknown customer"
            ),
        }

        Ok(WebhookOutcome {
            subscription_id,
            amount_total: invoice.total,
            ..WebhookOutcome::for_event(envelope)
        })
    }

    async fn handle_account_updated(
        &self,
        envelope: &EventEnvelope,
        account: &Account,
    ) -> BillingResult<WebhookOutcome> {
        let refreshed = best_effort(
            "refresh_connect_status",
            self.connect.refresh_connect_status(account),
        )
        .await
        .flatten();

        if let Some((creator_id, status)) = refreshed {
            best_effort(
                "log_connect_status",
                self.events.log_event(
                    BillingEventBuilder::new(&creator_id, BillingEventType::AccountUpdated)
                        .details(serde_json::to_value(&status).unwrap_or_default())
                        .stripe_event(&envelope.id)
                        .actor_type(ActorType::Stripe)
                        .occurred_at(envelope.occurred_at()),
                ),
            )
            .await;
        }
        Ok(WebhookOutcome::for_event(envelope))
    }

    async fn handle_payment_intent_succeeded(
        &self,
        envelope: &EventEnvelope,
        payment_intent: &PaymentIntent,
    ) -> BillingResult<WebhookOutcome> {
        let customer_id = payment_intent.customer_id();
        let user_id = match payment_intent.metadata.get("userId").filter(|u| !u.is_empty()) {
            Some(user_id) => Some(user_id.clone()),
            None => self.user_for_customer(customer_id).await?,
        };

        self.payments
            .add_payment_record(PaymentRecord {
                id: payment_intent.id.clone(),
                user_id: user_id.clone(),
                event_type: envelope.event_type.clone(),
                occurred_at: Some(envelope.occurred_at()),
                amount_cents: Some(payment_intent.amount_received),
                currency: payment_intent.currency.clone(),
                customer_id: customer_id.map(str::to_string),
                payment_intent_id: Some(payment_intent.id.clone()),
                application_fee_cents: payment_intent.application_fee_amount,
                destination: payment_intent.destination().map(str::to_string),
                ..Default::default()
            })
            .await?;

        if let Some(user_id) = &user_id {
            self.events
                .log_event(
                    BillingEventBuilder::new(user_id, BillingEventType::PaymentIntentSucceeded)
                        .amount(Some(payment_intent.amount_received))
                        .details(json!({"paymentIntent": payment_intent.id}))
                        .stripe_event(&envelope.id)
                        .actor_type(ActorType::Stripe)
                        .occurred_at(envelope.occurred_at()),
                )
                .await?;
        }

        Ok(WebhookOutcome {
            payment_intent_id: Some(payment_intent.id.clone()),
            amount_total: Some(payment_intent.amount_received),
            ..WebhookOutcome::for_event(envelope)
        })
    }

    async fn handle_charge_refunded(
        &self,
        envelope: &EventEnvelope,
        charge: &Charge,
    ) -> BillingResult<WebhookOutcome> {
        let customer_id = charge.customer_id();
        let payment_intent_id = charge.payment_intent_id().map(str::to_string);
        let user_id = self.user_for_customer(customer_id).await?;
        let refunded = -charge.amount_refunded;

        self.payments
            .add_payment_record(PaymentRecord {
                id: charge.id.clone(),
                user_id: user_id.clone(),
                event_type: envelope.event_type.clone(),
                occurred_at: Some(envelope.occurred_at()),
                amount_cents: Some(refunded),
                currency: charge.currency.clone(),
                customer_id: customer_id.map(str::to_string),
                payment_intent_id: payment_intent_id.clone(),
                ..Default::default()
            })
            .await?;

        if let Some(user_id) = &user_id {
            self.events
                .log_event(
                    BillingEventBuilder::new(user_id, BillingEventType::ChargeRefunded)
                        .amount(Some(refunded))
                        .details(json!({
                            "chargeId": charge.id,
                            "paymentIntent": payment_intent_id,
                        }))
                        .stripe_event(&envelope.id)
                        .actor_type(ActorType::Stripe)
                        .occurred_at(envelope.occurred_at()),
                )
                .await?;

            if let Some(pi) = payment_intent_id.as_deref() {
                let purchases = self.entitlements.list_entitlements(user_id).await?;
                for entitlement in purchases.iter().filter(|e| {
                    e.active
                        && e.feature == EntitlementFeature::Purchase
                        && e.data.payment_intent_id.as_deref() == Some(pi)
                }) {
                    self.entitlements
                        .upsert_entitlement(&entitlement.deactivated())
                        .await?;
                    tracing::info!(
                        user_id = %user_id,
                        entitlement_id = %entitlement.id,
                        payment_intent_id = %pi,
                        "Purchase entitlement revoked after refund"
                    );
                }
            }
        }

        Ok(WebhookOutcome {
            payment_intent_id,
            amount_total: Some(refunded),
            ..WebhookOutcome::for_event(envelope)
        })
    }

    async fn handle_entitlement_summary(
        &self,
        envelope: &EventEnvelope,
        summary: &ActiveEntitlementSummary,
    ) -> BillingResult<WebhookOutcome> {
        let Some(user_id) = self.user_for_customer(Some(&summary.customer)).await? else {
            tracing::warn!(
                customer_id = %summary.customer,
                "Entitlement summary for unknown customer"
            );
            return Ok(WebhookOutcome::for_event(envelope));
        };

        let mut seen = HashSet::new();
        for item in &summary.entitlements.data {
            let lookup_key = item.lookup_key.clone().or_else(|| match &item.feature {
                Expandable::Object(feature) => feature.lookup_key.clone(),
                Expandable::Id(_) => None,
            });
            self.entitlements
                .upsert_entitlement(&Entitlement {
                    id: entitlement_id(EntitlementFeature::ProviderFeature, &item.id),
                    user_id: user_id.clone(),
                    feature: EntitlementFeature::ProviderFeature,
                    active: true,
                    data: EntitlementData {
                        stripe_entitlement_id: Some(item.id.clone()),
                        stripe_customer_id: Some(summary.customer.clone()),
                        lookup_key,
                        ..Default::default()
                    },
                })
                .await?;
            seen.insert(item.id.as_str());
        }

        let existing = self.entitlements.list_entitlements(&user_id).await?;
        let mut revoked = 0;
        for entitlement in existing.iter().filter(|e| {
            e.active
                && e.feature == EntitlementFeature::ProviderFeature
                && e.data.stripe_customer_id.as_deref() == Some(summary.customer.as_str())
                && !seen.contains(e.id.as_str())
        }) {
            self.entitlements
                .upsert_entitlement(&entitlement.deactivated())
                .await?;
            revoked += 1;
        }

        self.events
            .log_event(
                BillingEventBuilder::new(&user_id, BillingEventType::EntitlementSummaryUpdated)
                    .details(json!({
                        "count": summary.entitlements.data.len(),
                        "revoked": revoked,
                    }))
                    .stripe_event(&envelope.id)
                    .actor_type(ActorType::Stripe)
                    .occurred_at(envelope.occurred_at()),
            )
            .await?;

        Ok(WebhookOutcome::for_event(envelope))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sign_webhook;

    const SECRET: &str = "whsec_test_secret";

    fn envelope(event_type: &str, object: serde_json::Value) -> EventEnvelope {
        EventEnvelope {
            id: "evt_1".into(),
            event_type: event_type.into(),
            created: 1_700_000_000,
            account: None,
            data: EventData { object },
        }
    }

    #[test]
    fn test_signature_accepts_valid_header() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_webhook(SECRET, 1_700_000_000, payload);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_100).is_ok());
    }

    #[test]
    fn test_signature_accepts_any_v1_entry() {
        let payload = r#"{"id":"evt_1"}"#;
        let valid = sign_webhook(SECRET, 1_700_000_000, payload);
        let sig = valid.split_once(",v1=").map(|(_, s)| s).unwrap();
        let header = format!("t=1700000000,v1=deadbeef,v1={}", sig);
        assert!(verify_signature(SECRET, payload, &header, 1_700_000_000).is_ok());
    }

    #[test]
    fn test_signature_rejects_tampering() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_webhook(SECRET, 1_700_000_000, payload);

        let tampered = verify_signature(SECRET, r#"{"id":"evt_2"}"#, &header, 1_700_000_000);
        assert!(matches!(tampered, Err(BillingError::WebhookSignatureInvalid)));

        let wrong_secret = verify_signature("whsec_other", payload, &header, 1_700_000_000);
        assert!(matches!(wrong_secret, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_signature_rejects_stale_or_partial_headers() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign_webhook(SECRET, 1_700_000_000, payload);

        let late = verify_signature(SECRET, payload, &header, 1_700_000_000 + 301);
        assert!(matches!(late, Err(BillingError::WebhookSignatureInvalid)));
        assert!(verify_signature(SECRET, payload, "v1=abcd", 1_700_000_000).is_err());
        assert!(verify_signature(SECRET, payload, "t=1700000000", 1_700_000_000).is_err());
        assert!(verify_signature(SECRET, payload, "", 1_700_000_000).is_err());
    }

    #[test]
    fn test_parse_known_and_unknown_types() {
        let checkout = envelope("checkout.session.completed", json!({"id": "cs_1"}));
        assert_eq!(
            BillingWebhookEvent::parse(&checkout).unwrap(),
            BillingWebhookEvent::CheckoutCompleted {
                session_id: "cs_1".into()
            }
        );

        let paused = envelope(
            "customer.subscription.paused",
            json!({"id": "sub_1", "status": "paused"}),
        );
        assert!(matches!(
            BillingWebhookEvent::parse(&paused).unwrap(),
            BillingWebhookEvent::Subscription {
                change: SubscriptionChange::Paused,
                ..
            }
        ));

        let other = envelope("customer.created", json!({"id": "cus_1"}));
        assert_eq!(
            BillingWebhookEvent::parse(&other).unwrap(),
            BillingWebhookEvent::Unhandled {
                event_type: "customer.created".into()
            }
        );
    }

    #[test]
    fn test_parse_rejects_malformed_known_type() {
        let broken = envelope("charge.refunded", json!({"amount": 100}));
        assert!(matches!(
            BillingWebhookEvent::parse(&broken),
            Err(BillingError::WebhookEventNotSupported(_))
        ));
    }

    #[test]
    fn test_subscription_change_access() {
        use SubscriptionStatus::*;

        assert!(SubscriptionChange::Created.keeps_access(Active));
        assert!(SubscriptionChange::Updated.keeps_access(PastDue));
        assert!(!SubscriptionChange::Updated.keeps_access(Canceled));
        assert!(!SubscriptionChange::Deleted.keeps_access(Active));
        assert!(!SubscriptionChange::Paused.keeps_access(Active));
        assert!(SubscriptionChange::Resumed.keeps_access(Paused));
    }

    #[test]
    fn test_outcome_serializes_summary_fields() {
        let outcome = WebhookOutcome {
            session_id: Some("cs_1".into()),
            mode: Some(CheckoutMode::Payment),
            amount_total: Some(2000),
            ..WebhookOutcome::for_event(&envelope("checkout.session.completed", json!({})))
        };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({
                "eventId": "evt_1",
                "eventType": "checkout.session.completed",
                "duplicate": false,
                "quarantined": false,
                "sessionId": "cs_1",
                "mode": "payment",
                "amountTotal": 2000
            })
        );
    }
}
