//! Payment provider port
//!
//! Every call the engine makes to Stripe goes through [`PaymentProvider`]. The
//! production implementation lives in [`crate::client::StripeClient`]; tests use
//! a recording mock.
//!
//! The object types below deserialize straight from Stripe's JSON and only carry
//! the fields billing needs. Expandable references are modelled by
//! [`Expandable`], which accepts either a bare id or the embedded object.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use storefront_shared::{CheckoutMode, SubscriptionStatus};
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Stripe metadata (string to string)
pub type Metadata = BTreeMap<String, String>;

/// Objects that expose their Stripe id
pub trait ProviderObject {
    fn object_id(&self) -> &str;
}

/// Either an object id or the expanded object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(Box<T>),
}

impl<T: ProviderObject> Expandable<T> {
    pub fn id(&self) -> &str {
        match self {
            Expandable::Id(id) => id,
            Expandable::Object(obj) => obj.object_id(),
        }
    }

    pub fn as_object(&self) -> Option<&T> {
        match self {
            Expandable::Id(_) => None,
            Expandable::Object(obj) => Some(obj),
        }
    }
}

macro_rules! provider_object {
    ($($ty:ty),* $(,)?) => {
        $(impl ProviderObject for $ty {
            fn object_id(&self) -> &str {
                &self.id
            }
        })*
    };
}

/// A page of results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub has_more: bool,
}

impl<T> Default for List<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            has_more: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub default_price: Option<Expandable<Price>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recurring {
    pub interval: String,
    #[serde(default)]
    pub interval_count: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub id: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub unit_amount: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub recurring: Option<Recurring>,
    #[serde(default)]
    pub product: Option<Expandable<Product>>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionItem {
    pub id: String,
    pub price: Price,
    /// Newer API versions report the period on the item
    #[serde(default)]
    pub current_period_end: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub customer: Option<Expandable<Customer>>,
    #[serde(default)]
    pub items: List<SubscriptionItem>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: bool,
    #[serde(default)]
    pub created: Option<i64>,
}

impl Subscription {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id())
    }

    /// Period end from the subscription, falling back to the latest item period
    pub fn period_end(&self) -> Option<OffsetDateTime> {
        self.current_period_end
            .or_else(|| {
                self.items
                    .data
                    .iter()
                    .filter_map(|item| item.current_period_end)
                    .max()
            })
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
    }

    pub fn first_price_id(&self) -> Option<&str> {
        self.items.data.first().map(|item| item.price.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: String,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub quantity: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferData {
    #[serde(default)]
    pub destination: Option<Expandable<Account>>,
    #[serde(default)]
    pub amount: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_received: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable<Customer>>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub application_fee_amount: Option<i64>,
    #[serde(default)]
    pub transfer_data: Option<TransferData>,
}

impl PaymentIntent {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id())
    }

    pub fn destination(&self) -> Option<&str> {
        self.transfer_data
            .as_ref()
            .and_then(|t| t.destination.as_ref())
            .map(|d| d.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    pub mode: CheckoutMode,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub client_reference_id: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub customer: Option<Expandable<Customer>>,
    #[serde(default)]
    pub subscription: Option<Expandable<Subscription>>,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntent>>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub line_items: Option<List<LineItem>>,
    #[serde(default)]
    pub created: Option<i64>,
}

impl CheckoutSession {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id())
    }

    pub fn subscription_id(&self) -> Option<&str> {
        self.subscription.as_ref().map(|s| s.id())
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        self.payment_intent.as_ref().map(|p| p.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Charge {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub amount_refunded: i64,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable<Customer>>,
    #[serde(default)]
    pub payment_intent: Option<Expandable<PaymentIntent>>,
    #[serde(default)]
    pub refunded: bool,
}

impl Charge {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id())
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        self.payment_intent.as_ref().map(|p| p.id())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    #[serde(default)]
    pub customer: Option<Expandable<Customer>>,
    #[serde(default)]
    pub subscription: Option<Expandable<Subscription>>,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub invoice_pdf: Option<String>,
}

impl Invoice {
    pub fn customer_id(&self) -> Option<&str> {
        self.customer.as_ref().map(|c| c.id())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountRequirements {
    #[serde(default)]
    pub currently_due: Vec<String>,
    #[serde(default)]
    pub disabled_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub charges_enabled: bool,
    #[serde(default)]
    pub payouts_enabled: bool,
    #[serde(default)]
    pub details_submitted: bool,
    #[serde(default)]
    pub requirements: Option<AccountRequirements>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountLink {
    pub url: String,
    #[serde(default)]
    pub expires_at: Option<i64>,
}

/// Single-use link into a connected account's Express dashboard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginLink {
    pub url: String,
    #[serde(default)]
    pub created: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortalSession {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitlementFeatureRef {
    pub id: String,
    #[serde(default)]
    pub lookup_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEntitlement {
    pub id: String,
    pub feature: Expandable<EntitlementFeatureRef>,
    #[serde(default)]
    pub lookup_key: Option<String>,
}

/// Payload of `entitlements.active_entitlement_summary.updated`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEntitlementSummary {
    pub customer: String,
    #[serde(default)]
    pub entitlements: List<ActiveEntitlement>,
}

provider_object!(
    Product,
    Price,
    Customer,
    SubscriptionItem,
    Subscription,
    PaymentIntent,
    CheckoutSession,
    Charge,
    Invoice,
    Account,
    Refund,
    PortalSession,
    EntitlementFeatureRef,
);

/// Filters for listing subscriptions
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SubscriptionQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub starting_after: Option<String>,
}

/// Outbound calls to the payment provider.
///
/// `account` scopes a call to a connected account; `idempotency_key` is passed
/// through unchanged from the user action that triggered the call.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<Product>;

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<Price>;

    /// Find the product provisioned for an app (metadata `appId`)
    async fn find_app_product(&self, app_id: &str) -> BillingResult<Option<Product>>;

    async fn create_product(&self, params: serde_json::Value) -> BillingResult<Product>;

    /// Active prices of a product
    async fn list_prices(&self, product_id: &str) -> BillingResult<Vec<Price>>;

    async fn create_price(&self, params: serde_json::Value) -> BillingResult<Price>;

    async fn create_checkout_session(
        &self,
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutSession>;

    /// Retrieve a session with subscription, line items and customer expanded
    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
        account: Option<&str>,
    ) -> BillingResult<CheckoutSession>;

    /// Retrieve a subscription with item prices and products expanded
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        account: Option<&str>,
    ) -> BillingResult<Subscription>;

    async fn list_subscriptions(&self, query: &SubscriptionQuery)
        -> BillingResult<List<Subscription>>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Subscription>;

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
        account: Option<&str>,
    ) -> BillingResult<PaymentIntent>;

    async fn create_refund(
        &self,
        params: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Refund>;

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<PortalSession>;

    async fn list_invoices(&self, customer_id: &str, limit: u32) -> BillingResult<List<Invoice>>;

    async fn retrieve_account(&self, account_id: &str) -> BillingResult<Account>;

    async fn create_account(
        &self,
        params: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Account>;

    async fn update_account(
        &self,
        account_id: &str,
        params: serde_json::Value,
    ) -> BillingResult<Account>;

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> BillingResult<AccountLink>;

    async fn create_login_link(&self, account_id: &str) -> BillingResult<LoginLink>;
}
