//! Checkout session builder
//!
//! Forward-path entry points that ask Stripe for a hosted checkout session.
//! Every entry point validates locally and consults the same entitlement
//! queries the reconciler writes before calling the provider, so "already
//! subscribed" means the same thing on both paths.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use storefront_shared::CheckoutMode;
use time::OffsetDateTime;

use crate::client::StripeConfig;
use crate::entitlement::EntitlementService;
use crate::error::{BillingError, BillingResult};
use crate::payload::{build_checkout_payload, compute_platform_fee, to_stripe_percent};
use crate::prices::{PriceOwner, PriceResolver};
use crate::provider::{Metadata, PaymentProvider, SubscriptionQuery};
use crate::store::CatalogStore;

const SUBMIT_MESSAGE: &str = "Complete your purchase";

/// One-time purchase of a creator listing
#[derive(Debug, Clone, Deserialize)]
pub struct PurchaseRequest {
    pub creator_id: String,
    pub title: String,
    pub amount_cents: i64,
    pub currency: String,
    pub customer_email: Option<String>,
    pub customer_id: Option<String>,
    pub image: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Who is checking out
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutCustomer {
    pub email: Option<String>,
    pub customer_id: Option<String>,
}

/// Result of a checkout request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutOutcome {
    Session { id: String, url: Option<String> },
    AlreadySubscribed,
    PurchaseNotNeeded,
}

impl CheckoutOutcome {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            CheckoutOutcome::Session { id, .. } => Some(id),
            _ => None,
        }
    }
}

pub struct CheckoutService {
    config: Arc<StripeConfig>,
    provider: Arc<dyn PaymentProvider>,
    prices: Arc<PriceResolver>,
    catalog: Arc<dyn CatalogStore>,
    entitlements: EntitlementService,
}

impl CheckoutService {
    pub fn new(
        config: Arc<StripeConfig>,
        provider: Arc<dyn PaymentProvider>,
        prices: Arc<PriceResolver>,
        catalog: Arc<dyn CatalogStore>,
        entitlements: EntitlementService,
    ) -> Self {
        Self {
            config,
            provider,
            prices,
            catalog,
            entitlements,
        }
    }

    /// Checkout for a one-time purchase with the creator's revenue split
    pub async fn create_purchase_checkout(
        &self,
        request: &PurchaseRequest,
        user_id: &str,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutOutcome> {
        let destination = self
            .catalog
            .get_payout_account(&request.creator_id)
            .await?
            .ok_or_else(|| BillingError::CreatorNotOnboarded(request.creator_id.clone()))?;

        let (min_cents, max_cents) = (self.config.purchase_min_cents, self.config.purchase_max_cents);
        if request.amount_cents < min_cents || request.amount_cents > max_cents {
            return Err(BillingError::AmountOutOfRange {
                amount_cents: request.amount_cents,
                min_cents,
                max_cents,
            });
        }

        if let Some(listing_id) = request.metadata.get("listingId") {
            if self.entitlements.has_purchase(user_id, listing_id).await? {
                tracing::info!(
                    user_id = %user_id,
                    listing_id = %listing_id,
                    "Listing already purchased, skipping checkout"
                );
                return Ok(CheckoutOutcome::PurchaseNotNeeded);
            }
        }

        let fee = compute_platform_fee(request.amount_cents, self.config.platform_fee_percent);

        let mut metadata = Map::new();
        metadata.insert("creatorId".into(), json!(request.creator_id));
        for (key, value) in &request.metadata {
            metadata.insert(key.clone(), json!(value));
        }
        metadata.insert("userId".into(), json!(user_id));

        let mut fields = self.common_fields(request.customer_id.as_deref(), request.customer_email.as_deref());
        match request.customer_id {
            Some(_) => fields.insert("customer_update".into(), json!({ "address": "auto" })),
            None => fields.insert("customer_creation".into(), json!("always")),
        };
        fields.insert(
            "line_items".into(),
            json!([{
                "price_data": {
                    "currency": request.currency,
                    "unit_amount": request.amount_cents,
                    "product_data": {
                        "name": request.title,
                        "images": request.image.as_ref().map(|image| vec![image]),
                    },
                },
                "quantity": 1,
            }]),
        );
        fields.insert(
            "payment_intent_data".into(),
            json!({
                "application_fee_amount": fee,
                "transfer_data": { "destination": destination },
                "receipt_email": request.customer_email,
                "statement_descriptor": self.config.statement_descriptor,
            }),
        );
        fields.insert("metadata".into(), Value::Object(metadata));
        fields.insert("client_reference_id".into(), json!(user_id));

        let payload = build_checkout_payload(fields, CheckoutMode::Payment);
        let session = self
            .provider
            .create_checkout_session(payload, idempotency_key)
            .await?;

        tracing::info!(
            user_id = %user_id,
            creator_id = %request.creator_id,
            session_id = %session.id,
            amount_cents = request.amount_cents,
            application_fee = fee,
            "Purchase checkout session created"
        );
        Ok(CheckoutOutcome::Session {
            id: session.id,
            url: session.url,
        })
    }

    /// Subscription checkout for a price, unless the user already holds it
    pub async fn create_subscription_by_price_id(
        &self,
        price_id: &str,
        user_id: &str,
        customer: &CheckoutCustomer,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutOutcome> {
        let price_id = self.prices.resolve_price_id(price_id).await?;
        let now = OffsetDateTime::now_utc();
        if self
            .entitlements
            .has_active_subscription_for_price(user_id, &price_id, now)
            .await?
        {
            tracing::info!(user_id = %user_id, price_id = %price_id, "Already subscribed to price");
            return Ok(CheckoutOutcome::AlreadySubscribed);
        }
        self.create_fixed_subscription(&price_id, user_id, customer, idempotency_key)
            .await
    }

    pub async fn create_gold_subscription(
        &self,
        user_id: &str,
        customer: &CheckoutCustomer,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutOutcome> {
        let price_id = self
            .prices
            .package_ids()
            .gold
            .clone()
            .ok_or(BillingError::PriceIdMissing)?;
        self.create_subscription_by_price_id(&price_id, user_id, customer, idempotency_key)
            .await
    }

    pub async fn create_noads_subscription(
        &self,
        user_id: &str,
        customer: &CheckoutCustomer,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutOutcome> {
        let price_id = self
            .prices
            .package_ids()
            .noads
            .clone()
            .ok_or(BillingError::PriceIdMissing)?;
        self.create_subscription_by_price_id(&price_id, user_id, customer, idempotency_key)
            .await
    }

    /// Subscription checkout for a single app, by id or slug
    pub async fn create_app_subscription(
        &self,
        app_identifier: &str,
        user_id: &str,
        customer: &CheckoutCustomer,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutOutcome> {
        let app = self
            .catalog
            .find_app(app_identifier)
            .await?
            .ok_or_else(|| BillingError::AppNotFound(app_identifier.to_string()))?;
        if !app.is_live() {
            tracing::error!(
                app_id = %app.id,
                slug = ?app.slug,
                status = %app.status,
                state = %app.state,
                user_id = %user_id,
                "App is not live, refusing subscription checkout"
            );
            return Err(BillingError::AppInactive(app.id));
        }

        let now = OffsetDateTime::now_utc();
        if self
            .entitlements
            .has_app_access(user_id, &app.id, app.owner_id.as_deref(), now)
            .await?
        {
            tracing::info!(app_id = %app.id, user_id = %user_id, "App subscription checkout skipped");
            return Ok(CheckoutOutcome::AlreadySubscribed);
        }

        let owner = PriceOwner::App(app.id.clone());
        let price_id = match self.prices.find_price_id(&owner).await {
            Ok(price_id) => price_id,
            Err(e) => {
                tracing::warn!(app_id = %app.id, error = %e, "No catalog price for app, provisioning");
                self.prices.ensure_app_price(&app).await.map_err(|err| {
                    tracing::error!(
                        app_id = %app.id,
                        price_cents = ?app.price_cents,
                        error = %err,
                        "App subscription price missing"
                    );
                    err
                })?;
                self.prices.find_price_id(&owner).await?
            }
        };
        let price_id = self.prices.resolve_price_id(&price_id).await?;

        // Local state can lag the provider; ask Stripe directly when we know the customer
        if let Some(customer_id) = customer.customer_id.as_deref() {
            let live = self
                .provider
                .list_subscriptions(&SubscriptionQuery {
                    customer: Some(customer_id.to_string()),
                    price: Some(price_id.clone()),
                    status: Some("active".to_string()),
                    ..Default::default()
                })
                .await?;
            if !live.data.is_empty() {
                tracing::info!(
                    app_id = %app.id,
                    user_id = %user_id,
                    customer_id = %customer_id,
                    price_id = %price_id,
                    "App subscription checkout skipped: live subscription exists"
                );
                return Ok(CheckoutOutcome::AlreadySubscribed);
            }
        }

        let outcome = self
            .create_fixed_subscription(&price_id, user_id, customer, idempotency_key)
            .await?;
        tracing::info!(
            app_id = %app.id,
            user_id = %user_id,
            session_id = ?outcome.session_id(),
            "App subscription session created"
        );
        Ok(outcome)
    }

    /// Creator all-access checkout. `None` when the user already has access.
    pub async fn create_creator_all_access(
        &self,
        creator_id: &str,
        user_id: &str,
        customer: &CheckoutCustomer,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Option<CheckoutOutcome>> {
        let now = OffsetDateTime::now_utc();
        if self
            .entitlements
            .has_creator_all_access(user_id, creator_id, now)
            .await?
        {
            return Ok(None);
        }
        let price_id = self
            .prices
            .find_price_id(&PriceOwner::Creator(creator_id.to_string()))
            .await?;
        self.create_fixed_subscription(&price_id, user_id, customer, idempotency_key)
            .await
            .map(Some)
    }

    /// Subscription checkout for a fixed price, splitting revenue with the
    /// owning creator when the price belongs to one
    pub async fn create_fixed_subscription(
        &self,
        price_id: &str,
        user_id: &str,
        customer: &CheckoutCustomer,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutOutcome> {
        let price_id = self.prices.resolve_price_id(price_id).await?;
        let metadata = self.prices.price_metadata(&price_id).await?;

        let owner_id = if let Some(creator_id) = metadata.get("creatorId") {
            Some(creator_id.clone())
        } else if let Some(app_id) = metadata.get("appId") {
            let app = self.catalog.find_app(app_id).await?;
            Some(app.and_then(|a| a.owner_id).unwrap_or_default())
        } else {
            None
        };

        let destination = match owner_id.as_deref() {
            None => None,
            Some("") => {
                return Err(BillingError::CreatorNotOnboarded(price_id.clone()));
            }
            Some(owner_id) => Some(
                self.catalog
                    .get_payout_account(owner_id)
                    .await?
                    .ok_or_else(|| BillingError::CreatorNotOnboarded(owner_id.to_string()))?,
            ),
        };

        let mut subscription_data = json!({ "metadata": { "userId": user_id } });
        if let Some(destination) = destination.as_deref() {
            subscription_data["transfer_data"] = json!({ "destination": destination });
            subscription_data["application_fee_percent"] =
                json!(to_stripe_percent(self.config.platform_fee_percent));
        }

        let mut fields = self.common_fields(customer.customer_id.as_deref(), customer.email.as_deref());
        fields.insert("line_items".into(), json!([{ "price": price_id, "quantity": 1 }]));
        fields.insert("allow_promotion_codes".into(), json!(true));
        fields.insert("subscription_data".into(), subscription_data);
        fields.insert("metadata".into(), json!({ "userId": user_id }));
        fields.insert("client_reference_id".into(), json!(user_id));

        let payload = build_checkout_payload(fields, CheckoutMode::Subscription);
        let session = self
            .provider
            .create_checkout_session(payload, idempotency_key)
            .await?;

        tracing::info!(
            user_id = %user_id,
            price_id = %price_id,
            destination = ?destination,
            session_id = %session.id,
            "Subscription checkout session created"
        );
        Ok(CheckoutOutcome::Session {
            id: session.id,
            url: session.url,
        })
    }

    fn common_fields(&self, customer_id: Option<&str>, email: Option<&str>) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("customer".into(), json!(customer_id));
        fields.insert("customer_email".into(), json!(email));
        if self.config.automatic_tax {
            fields.insert("automatic_tax".into(), json!({ "enabled": true }));
        }
        fields.insert(
            "custom_text".into(),
            json!({ "submit": { "message": SUBMIT_MESSAGE } }),
        );
        fields.insert("success_url".into(), json!(self.config.success_url_with_session()));
        fields.insert("cancel_url".into(), json!(self.config.cancel_url));
        fields
    }
}
