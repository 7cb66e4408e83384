//! Test doubles shared by the billing unit tests

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use storefront_shared::SubscriptionStatus;
use tokio::sync::Mutex;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::{
    Account, AccountLink, CheckoutSession, Expandable, Invoice, List, LoginLink, PaymentIntent,
    PaymentProvider, PortalSession, Price, Product, Recurring, Refund, Subscription,
    SubscriptionItem, SubscriptionQuery,
};
use crate::store::AppRecord;

/// Recorded outbound write
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub target: Option<String>,
    pub params: Value,
    pub idempotency_key: Option<String>,
}

#[derive(Default)]
struct MockState {
    products: HashMap<String, Product>,
    prices: HashMap<String, Price>,
    sessions: HashMap<String, CheckoutSession>,
    subscriptions: HashMap<String, Subscription>,
    payment_intents: HashMap<String, PaymentIntent>,
    accounts: HashMap<String, Account>,
    invoices: Vec<Invoice>,

    product_retrievals: HashMap<String, usize>,
    created_prices: usize,
    created_sessions: Vec<RecordedCall>,
    sessions_by_key: HashMap<String, String>,
    session_retrievals: Vec<(String, Option<String>)>,
    subscription_retrievals: usize,
    subscription_updates: Vec<RecordedCall>,
    subscription_queries: Vec<SubscriptionQuery>,
    refunds: Vec<RecordedCall>,
    portal_sessions: Vec<(String, String)>,
    created_accounts: Vec<RecordedCall>,
    account_updates: Vec<RecordedCall>,
    account_links: Vec<(String, String, String)>,
    login_links: Vec<String>,

    failing: HashSet<&'static str>,
    next_id: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}_mock_{}", prefix, self.next_id)
    }

    fn check(&self, operation: &'static str) -> BillingResult<()> {
        if self.failing.contains(operation) {
            return Err(BillingError::StripeApi(format!("{} failed", operation)));
        }
        Ok(())
    }
}

fn missing(kind: &str, id: &str) -> BillingError {
    BillingError::StripeApi(format!("No such {}: '{}'", kind, id))
}

/// In-process payment provider with seeded objects and call recording
#[derive(Default)]
pub struct MockProvider {
    state: Mutex<MockState>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call to `operation` fail with a provider error
    pub async fn fail_on(&self, operation: &'static str) {
        self.state.lock().await.failing.insert(operation);
    }

    /// Undo `fail_on`
    pub async fn recover(&self, operation: &'static str) {
        self.state.lock().await.failing.remove(operation);
    }

    pub async fn add_product(&self, id: &str, default_price: Option<&str>) {
        self.state.lock().await.products.insert(
            id.to_string(),
            Product {
                id: id.to_string(),
                name: None,
                active: true,
                default_price: default_price.map(|p| Expandable::Id(p.to_string())),
                metadata: Default::default(),
            },
        );
    }

    pub async fn add_price(&self, id: &str, unit_amount: i64, interval: Option<&str>) {
        self.add_price_object(price(id, unit_amount, interval)).await;
    }

    pub async fn add_price_object(&self, price: Price) {
        self.state
            .lock()
            .await
            .prices
            .insert(price.id.clone(), price);
    }

    pub async fn add_session(&self, session: CheckoutSession) {
        self.state
            .lock()
            .await
            .sessions
            .insert(session.id.clone(), session);
    }

    pub async fn add_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn add_payment_intent(&self, payment_intent: PaymentIntent) {
        self.state
            .lock()
            .await
            .payment_intents
            .insert(payment_intent.id.clone(), payment_intent);
    }

    pub async fn add_account(&self, account: Account) {
        self.state
            .lock()
            .await
            .accounts
            .insert(account.id.clone(), account);
    }

    pub async fn add_invoice(&self, invoice: Invoice) {
        self.state.lock().await.invoices.push(invoice);
    }

    pub async fn product_retrievals(&self, id: &str) -> usize {
        self.state
            .lock()
            .await
            .product_retrievals
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub async fn created_prices(&self) -> usize {
        self.state.lock().await.created_prices
    }

    pub async fn created_sessions(&self) -> Vec<RecordedCall> {
        self.state.lock().await.created_sessions.clone()
    }

    pub async fn session_retrievals(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().await.session_retrievals.clone()
    }

    pub async fn subscription_retrievals(&self) -> usize {
        self.state.lock().await.subscription_retrievals
    }

    pub async fn subscription_updates(&self) -> Vec<RecordedCall> {
        self.state.lock().await.subscription_updates.clone()
    }

    pub async fn subscription_queries(&self) -> Vec<SubscriptionQuery> {
        self.state.lock().await.subscription_queries.clone()
    }

    pub async fn refunds(&self) -> Vec<RecordedCall> {
        self.state.lock().await.refunds.clone()
    }

    pub async fn portal_sessions(&self) -> Vec<(String, String)> {
        self.state.lock().await.portal_sessions.clone()
    }

    pub async fn created_accounts(&self) -> Vec<RecordedCall> {
        self.state.lock().await.created_accounts.clone()
    }

    pub async fn account_updates(&self) -> Vec<RecordedCall> {
        self.state.lock().await.account_updates.clone()
    }

    pub async fn login_links(&self) -> Vec<String> {
        self.state.lock().await.login_links.clone()
    }

    pub async fn account_links(&self) -> Vec<(String, String, String)> {
        self.state.lock().await.account_links.clone()
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<Product> {
        let mut state = self.state.lock().await;
        state.check("retrieve_product")?;
        *state
            .product_retrievals
            .entry(product_id.to_string())
            .or_default() += 1;
        state
            .products
            .get(product_id)
            .cloned()
            .ok_or_else(|| missing("product", product_id))
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<Price> {
        let state = self.state.lock().await;
        state.check("retrieve_price")?;
        state
            .prices
            .get(price_id)
            .cloned()
            .ok_or_else(|| missing("price", price_id))
    }

    async fn find_app_product(&self, app_id: &str) -> BillingResult<Option<Product>> {
        let state = self.state.lock().await;
        state.check("find_app_product")?;
        Ok(state
            .products
            .values()
            .find(|p| p.metadata.get("appId").map(String::as_str) == Some(app_id))
            .cloned())
    }

    async fn create_product(&self, params: Value) -> BillingResult<Product> {
        let mut state = self.state.lock().await;
        state.check("create_product")?;
        let id = state.next_id("prod");
        let product = Product {
            id: id.clone(),
            name: params["name"].as_str().map(str::to_string),
            active: true,
            default_price: None,
            metadata: serde_json::from_value(params["metadata"].clone()).unwrap_or_default(),
        };
        state.products.insert(id, product.clone());
        Ok(product)
    }

    async fn list_prices(&self, product_id: &str) -> BillingResult<Vec<Price>> {
        let state = self.state.lock().await;
        state.check("list_prices")?;
        Ok(state
            .prices
            .values()
            .filter(|p| p.active)
            .filter(|p| p.product.as_ref().map(|prod| prod.id()) == Some(product_id))
            .cloned()
            .collect())
    }

    async fn create_price(&self, params: Value) -> BillingResult<Price> {
        let mut state = self.state.lock().await;
        state.check("create_price")?;
        let id = state.next_id("price");
        let price = Price {
            id: id.clone(),
            active: true,
            unit_amount: params["unit_amount"].as_i64(),
            currency: params["currency"].as_str().map(str::to_string),
            recurring: params["recurring"]["interval"].as_str().map(|i| Recurring {
                interval: i.to_string(),
                interval_count: None,
            }),
            product: params["product"]
                .as_str()
                .map(|p| Expandable::Id(p.to_string())),
            metadata: serde_json::from_value(params["metadata"].clone()).unwrap_or_default(),
        };
        state.prices.insert(id, price.clone());
        state.created_prices += 1;
        Ok(price)
    }

    async fn create_checkout_session(
        &self,
        payload: Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutSession> {
        let mut state = self.state.lock().await;
        state.check("create_checkout_session")?;
        state.created_sessions.push(RecordedCall {
            target: None,
            params: payload.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
        });

        // Stripe replays the original response for a reused key
        if let Some(key) = idempotency_key {
            if let Some(existing) = state
                .sessions_by_key
                .get(key)
                .and_then(|id| state.sessions.get(id))
            {
                return Ok(existing.clone());
            }
        }

        let id = state.next_id("cs");
        let session = CheckoutSession {
            id: id.clone(),
            mode: serde_json::from_value(payload["mode"].clone())?,
            url: Some(format!("https://checkout.stripe.test/{}", id)),
            client_reference_id: payload["client_reference_id"].as_str().map(str::to_string),
            metadata: serde_json::from_value(payload["metadata"].clone()).unwrap_or_default(),
            customer: payload["customer"]
                .as_str()
                .map(|c| Expandable::Id(c.to_string())),
            subscription: None,
            payment_intent: None,
            amount_total: None,
            currency: None,
            line_items: None,
            created: None,
        };
        state.sessions.insert(id.clone(), session.clone());
        if let Some(key) = idempotency_key {
            state.sessions_by_key.insert(key.to_string(), id);
        }
        Ok(session)
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
        account: Option<&str>,
    ) -> BillingResult<CheckoutSession> {
        let mut state = self.state.lock().await;
        state.check("retrieve_checkout_session")?;
        state
            .session_retrievals
            .push((session_id.to_string(), account.map(str::to_string)));
        state
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| missing("checkout session", session_id))
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        _account: Option<&str>,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().await;
        state.check("retrieve_subscription")?;
        state.subscription_retrievals += 1;
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| missing("subscription", subscription_id))
    }

    async fn list_subscriptions(
        &self,
        query: &SubscriptionQuery,
    ) -> BillingResult<List<Subscription>> {
        let mut state = self.state.lock().await;
        state.check("list_subscriptions")?;
        state.subscription_queries.push(query.clone());

        let mut data: Vec<Subscription> = state
            .subscriptions
            .values()
            .filter(|s| query.customer.is_none() || s.customer_id() == query.customer.as_deref())
            .filter(|s| {
                query.price.as_deref().map_or(true, |price| {
                    s.items.data.iter().any(|item| item.price.id == price)
                })
            })
            .filter(|s| {
                query
                    .status
                    .as_deref()
                    .map_or(true, |status| s.status.as_str() == status)
            })
            .cloned()
            .collect();
        data.sort_by(|a, b| a.id.cmp(&b.id));
        if let Some(after) = query.starting_after.as_deref() {
            data.retain(|s| s.id.as_str() > after);
        }
        let mut has_more = false;
        if let Some(limit) = query.limit {
            has_more = data.len() > limit as usize;
            data.truncate(limit as usize);
        }
        Ok(List { data, has_more })
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().await;
        state.check("update_subscription")?;
        state.subscription_updates.push(RecordedCall {
            target: Some(subscription_id.to_string()),
            params: params.clone(),
            idempotency_key: idempotency_key.map(str::to_string),
        });

        let new_price = params["items"][0]["price"].as_str().map(str::to_string);
        let sub = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| missing("subscription", subscription_id))?;
        if let Some(flag) = params["cancel_at_period_end"].as_bool() {
            sub.cancel_at_period_end = flag;
        }
        if let (Some(price_id), Some(item)) = (new_price, sub.items.data.first_mut()) {
            item.price = price(&price_id, item.price.unit_amount.unwrap_or(0), None);
        }
        Ok(sub.clone())
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
        _account: Option<&str>,
    ) -> BillingResult<PaymentIntent> {
        let state = self.state.lock().await;
        state.check("retrieve_payment_intent")?;
        state
            .payment_intents
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| missing("payment intent", payment_intent_id))
    }

    async fn create_refund(
        &self,
        params: Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Refund> {
        let mut state = self.state.lock().await;
        state.check("create_refund")?;
        state.refunds.push(RecordedCall {
            target: params["payment_intent"].as_str().map(str::to_string),
            params,
            idempotency_key: idempotency_key.map(str::to_string),
        });
        Ok(Refund {
            id: state.next_id("re"),
            amount: 0,
            status: Some("succeeded".to_string()),
        })
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<PortalSession> {
        let mut state = self.state.lock().await;
        state.check("create_portal_session")?;
        state
            .portal_sessions
            .push((customer_id.to_string(), return_url.to_string()));
        let id = state.next_id("bps");
        Ok(PortalSession {
            url: format!("https://billing.stripe.test/{}", id),
            id,
        })
    }

    async fn list_invoices(&self, customer_id: &str, limit: u32) -> BillingResult<List<Invoice>> {
        let state = self.state.lock().await;
        state.check("list_invoices")?;
        let mut data: Vec<Invoice> = state
            .invoices
            .iter()
            .filter(|i| i.customer_id() == Some(customer_id))
            .cloned()
            .collect();
        // Stripe lists newest first
        data.sort_by(|a, b| b.created.cmp(&a.created));
        data.truncate(limit as usize);
        Ok(List {
            data,
            has_more: false,
        })
    }

    async fn retrieve_account(&self, account_id: &str) -> BillingResult<Account> {
        let state = self.state.lock().await;
        state.check("retrieve_account")?;
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| missing("account", account_id))
    }

    async fn create_account(
        &self,
        params: Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Account> {
        let mut state = self.state.lock().await;
        state.check("create_account")?;
        let id = state.next_id("acct");
        state.created_accounts.push(RecordedCall {
            target: Some(id.clone()),
            params,
            idempotency_key: idempotency_key.map(str::to_string),
        });
        let account = Account {
            id: id.clone(),
            charges_enabled: false,
            payouts_enabled: false,
            details_submitted: false,
            requirements: None,
        };
        state.accounts.insert(id, account.clone());
        Ok(account)
    }

    async fn update_account(&self, account_id: &str, params: Value) -> BillingResult<Account> {
        let mut state = self.state.lock().await;
        state.check("update_account")?;
        state.account_updates.push(RecordedCall {
            target: Some(account_id.to_string()),
            params,
            idempotency_key: None,
        });
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| missing("account", account_id))
    }

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> BillingResult<AccountLink> {
        let mut state = self.state.lock().await;
        state.check("create_account_link")?;
        state.account_links.push((
            account_id.to_string(),
            refresh_url.to_string(),
            return_url.to_string(),
        ));
        Ok(AccountLink {
            url: format!("https://connect.stripe.test/setup/{}", account_id),
            expires_at: None,
        })
    }

    async fn create_login_link(&self, account_id: &str) -> BillingResult<LoginLink> {
        let mut state = self.state.lock().await;
        state.check("create_login_link")?;
        state.login_links.push(account_id.to_string());
        Ok(LoginLink {
            url: format!("https://connect.stripe.test/express/{}", account_id),
            created: None,
        })
    }
}

// Fixtures

/// Configuration with a 10% platform fee and both platform packages set
pub fn test_config() -> StripeConfig {
    StripeConfig::from_lookup(|key| match key {
        "STRIPE_SECRET_KEY" => Some("sk_test_123".into()),
        "STRIPE_WEBHOOK_SECRET" => Some("whsec_test_secret".into()),
        "PLATFORM_FEE_PERCENT" => Some("10".into()),
        "GOLD_PRICE_ID" => Some("price_gold".into()),
        "NOADS_PRICE_ID" => Some("price_noads".into()),
        _ => None,
    })
    .unwrap()
}

pub fn app(id: &str, price_id: Option<&str>) -> AppRecord {
    AppRecord {
        id: id.to_string(),
        slug: Some(format!("{}-slug", id)),
        title: format!("App {}", id),
        owner_id: None,
        stripe_price_id: price_id.map(str::to_string),
        price_cents: None,
        status: "published".to_string(),
        state: "active".to_string(),
    }
}

pub fn price(id: &str, unit_amount: i64, interval: Option<&str>) -> Price {
    Price {
        id: id.to_string(),
        active: true,
        unit_amount: Some(unit_amount),
        currency: Some("usd".to_string()),
        recurring: interval.map(|i| Recurring {
            interval: i.to_string(),
            interval_count: None,
        }),
        product: None,
        metadata: Default::default(),
    }
}

/// Subscription with one item per `(item_id, price)` pair
pub fn subscription(
    id: &str,
    customer: &str,
    status: SubscriptionStatus,
    items: &[(&str, Price)],
) -> Subscription {
    Subscription {
        id: id.to_string(),
        status,
        customer: Some(Expandable::Id(customer.to_string())),
        items: List {
            data: items
                .iter()
                .map(|(item_id, price)| SubscriptionItem {
                    id: item_id.to_string(),
                    price: price.clone(),
                    current_period_end: None,
                })
                .collect(),
            has_more: false,
        },
        metadata: Default::default(),
        current_period_end: Some(4_102_444_800),
        cancel_at_period_end: false,
        created: Some(1_700_000_000),
    }
}

/// `Stripe-Signature` header for a payload signed at `timestamp`
pub fn sign_webhook(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}
