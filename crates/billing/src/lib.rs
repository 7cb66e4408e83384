// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::type_complexity)] // Recorded-call tuples in the mock provider
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Storefront Billing Module
//!
//! Reconciles Stripe state into local entitlements for a creator storefront.
//!
//! ## Features
//!
//! - **Price Resolution**: Canonical price ids and a TTL-cached price-to-owner map
//! - **Checkout**: Hosted sessions for tiers, app and creator subscriptions and one-time purchases
//! - **Idempotency**: Processed-event ledger so redelivered webhooks are no-ops
//! - **Webhooks**: Signature verification and per-event reconciliation
//! - **Entitlements**: Deterministic sync of subscription snapshots to access grants
//! - **Commissions**: Atomic ambassador awards on first paid checkout
//! - **Connect**: Creator payout account onboarding, status and dashboard links
//! - **Metrics**: Creator subscriber counts and monthly revenue estimates
//! - **Refunds, Portal, History**: Thin wrappers over the provider

pub mod checkout;
pub mod client;
pub mod commission;
pub mod connect;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod history;
pub mod invariants;
pub mod ledger;
pub mod metrics;
pub mod payload;
pub mod portal;
pub mod prices;
pub mod provider;
pub mod refund;
pub mod store;
pub mod subscriptions;
pub mod sync;
pub mod webhooks;

#[cfg(test)]
mod testing;


use std::sync::Arc;

// Checkout
pub use checkout::{CheckoutCustomer, CheckoutOutcome, CheckoutService, PurchaseRequest};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Commission
pub use commission::{CommissionAward, CommissionPolicy, CommissionTransactor};

// Connect
pub use connect::{
    ConnectService, ConnectStatus, DashboardLink, OnboardingLink, OnboardingState,
};

// Error
pub use error::{best_effort, BillingError, BillingResult};

// Entitlement
pub use entitlement::{entitlement_id, Entitlement, EntitlementData, EntitlementService};

// Events
pub use events::{
    ActorType, BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType,
    EventStatus,
};

// History
pub use history::{HistoryService, InvoiceHistory, InvoiceSummary};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::IdempotencyGate;

// Metrics
pub use metrics::{
    AllAccessMetrics, AppMetrics, CreatorSubscriptionMetrics, MetricsService, MetricsTotals,
};

// Portal
pub use portal::{PortalLink, PortalService};

// Prices
pub use prices::{Package, PriceIdMap, PriceOwner, PriceResolver};

// Provider
pub use provider::{Metadata, PaymentProvider};

// Refund
pub use refund::{RefundResult, RefundService};

// Store
pub use store::{InMemoryBillingStore, PgBillingStore, Stores};

// Subscriptions
pub use subscriptions::{SubscriptionService, SubscriptionState};

// Sync
pub use sync::{EntitlementSynchronizer, SyncSummary};

// Webhooks
pub use webhooks::{
    verify_signature, BillingWebhookEvent, EventEnvelope, WebhookHandler, WebhookOutcome,
};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: Arc<StripeConfig>,
    pub prices: Arc<PriceResolver>,
    pub entitlements: EntitlementService,
    pub checkout: CheckoutService,
    pub webhooks: WebhookHandler,
    pub subscriptions: SubscriptionService,
    pub refunds: RefundService,
    pub portal: PortalService,
    pub connect: ConnectService,
    pub history: HistoryService,
    pub metrics: MetricsService,
    pub ledger: IdempotencyGate,
}

impl BillingService {
    /// Create a new billing service backed by Postgres and Stripe from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = StripeConfig::from_env()?;
        let stripe = Arc::new(StripeClient::new(config.clone()));
        Ok(Self::new(config, Stores::postgres(pool), stripe))
    }

    /// Create a new billing service with explicit config, stores and provider
    pub fn new(config: StripeConfig, stores: Stores, provider: Arc<dyn PaymentProvider>) -> Self {
        let config = Arc::new(config);
        let prices = Arc::new(PriceResolver::new(
            provider.clone(),
            stores.catalog.clone(),
            config.price_ids.clone(),
            config.price_map_ttl,
        ));
        let entitlements =
            EntitlementService::new(stores.entitlements.clone(), stores.subscriptions.clone());
        let sync = Arc::new(EntitlementSynchronizer::new(
            provider.clone(),
            prices.clone(),
            stores.entitlements.clone(),
            stores.subscriptions.clone(),
            stores.customers.clone(),
            stores.limits.clone(),
        ));
        let connect = ConnectService::new(config.clone(), provider.clone(), stores.catalog.clone());
        let events = BillingEventLogger::new(stores.events.clone());

        Self {
            checkout: CheckoutService::new(
                config.clone(),
                provider.clone(),
                prices.clone(),
                stores.catalog.clone(),
                entitlements.clone(),
            ),
            webhooks: WebhookHandler::new(
                &config,
                provider.clone(),
                &stores,
                sync.clone(),
                connect.clone(),
            ),
            subscriptions: SubscriptionService::new(provider.clone(), &stores, sync),
            refunds: RefundService::new(provider.clone()),
            portal: PortalService::new(config.clone(), provider.clone(), stores.customers.clone()),
            metrics: MetricsService::new(
                config.clone(),
                provider.clone(),
                prices.clone(),
                stores.catalog.clone(),
            ),
            history: HistoryService::new(provider, events),
            ledger: IdempotencyGate::new(
                stores.ledger.clone(),
                config.processed_event_retention_days,
            ),
            connect,
            entitlements,
            prices,
            config,
        }
    }
}
