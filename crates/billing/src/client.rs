//! Stripe client configuration and transport

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::json;
use stripe::{Client, RequestStrategy, StripeError};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};
use crate::provider::{
    Account, AccountLink, CheckoutSession, Invoice, List, LoginLink, PaymentIntent,
    PaymentProvider, PortalSession, Price, Product, Refund, Subscription, SubscriptionQuery,
};

/// Platform package price ids (price or product ids; resolved lazily)
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    /// Platform tier A ("gold")
    pub gold: Option<String>,
    /// Platform tier B ("noads")
    pub noads: Option<String>,
}

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub success_url: String,
    pub cancel_url: String,
    /// ≤ 1 is a fraction, otherwise a percentage
    pub platform_fee_percent: f64,
    pub price_ids: PriceIds,
    pub automatic_tax: bool,
    /// Card statement text for one-time purchases
    pub statement_descriptor: Option<String>,
    pub price_map_ttl: Duration,
    pub attribution_window_days: i64,
    pub commission_rate_percent: u32,
    pub request_timeout: Duration,
    pub processed_event_retention_days: i64,
    pub purchase_min_cents: i64,
    pub purchase_max_cents: i64,
}

impl StripeConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> BillingResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| BillingError::Config(format!("{} must be set", key)))
        };
        let optional = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let public_base = optional("PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://localhost:5173".to_string());
        let public_base = public_base.trim_end_matches('/').to_string();

        Ok(Self {
            secret_key: required("STRIPE_SECRET_KEY")?,
            webhook_secret: required("STRIPE_WEBHOOK_SECRET")?,
            success_url: optional("STRIPE_SUCCESS_URL")
                .unwrap_or_else(|| format!("{}/billing/success", public_base)),
            cancel_url: optional("STRIPE_CANCEL_URL")
                .unwrap_or_else(|| format!("{}/billing/cancel", public_base)),
            platform_fee_percent: parse_or(&lookup, "PLATFORM_FEE_PERCENT", 0.0_f64).max(0.0),
            price_ids: PriceIds {
                gold: optional("GOLD_PRICE_ID"),
                noads: optional("NOADS_PRICE_ID"),
            },
            automatic_tax: parse_or(&lookup, "STRIPE_AUTOMATIC_TAX", false),
            statement_descriptor: optional("STRIPE_STATEMENT_DESCRIPTOR"),
            price_map_ttl: Duration::from_millis(parse_or(&lookup, "PRICE_ID_MAP_TTL_MS", 60_000)),
            attribution_window_days: parse_or(&lookup, "AMBASSADOR_ATTRIBUTION_WINDOW_DAYS", 60_i64)
                .clamp(1, 365),
            commission_rate_percent: parse_or(&lookup, "AMBASSADOR_COMMISSION_RATE_PERCENT", 80_u32)
                .min(100),
            request_timeout: Duration::from_secs(parse_or(
                &lookup,
                "STRIPE_REQUEST_TIMEOUT_SECS",
                20,
            )),
            processed_event_retention_days: parse_or(&lookup, "PROCESSED_EVENT_RETENTION_DAYS", 30_i64)
                .max(1),
            purchase_min_cents: parse_or(&lookup, "PURCHASE_MIN_CENTS", 50),
            purchase_max_cents: parse_or(&lookup, "PURCHASE_MAX_CENTS", 500_000),
        })
    }

    /// Success URL carrying the session id placeholder Stripe fills in
    pub fn success_url_with_session(&self) -> String {
        format!("{}?session_id={{CHECKOUT_SESSION_ID}}", self.success_url)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Copy + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) if raw.trim().is_empty() => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(
                key = key,
                value = %raw,
                default = ?default,
                "Invalid billing configuration value, using default"
            );
            default
        }),
    }
}

/// Stripe API client wrapper
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    fn scoped(&self, account: Option<&str>) -> BillingResult<Client> {
        match account {
            None => Ok(self.inner.clone()),
            Some(account) => {
                let account_id = account.parse::<stripe::AccountId>().map_err(|e| {
                    BillingError::InvalidInput(format!("Invalid account id {}: {}", account, e))
                })?;
                Ok(self.inner.clone().with_stripe_account(account_id))
            }
        }
    }

    fn idempotent(&self, idempotency_key: Option<&str>) -> Client {
        match idempotency_key {
            Some(key) => self
                .inner
                .clone()
                .with_strategy(RequestStrategy::Idempotent(key.to_string())),
            None => self.inner.clone(),
        }
    }

    /// Bound a request by the configured timeout
    async fn call<T, F>(&self, operation: &'static str, request: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::warn!(operation = operation, error = %e, "Stripe request failed");
                Err(classify(e))
            }
            Err(_) => {
                tracing::warn!(
                    operation = operation,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Stripe request timed out"
                );
                Err(BillingError::ProviderTimeout(operation.to_string()))
            }
        }
    }

    /// GET with retries on transient failures
    async fn retrieve<T>(
        &self,
        operation: &'static str,
        path: String,
        query: serde_json::Value,
        account: Option<&str>,
    ) -> BillingResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let client = self.scoped(account)?;
        let strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_secs(2))
            .map(jitter)
            .take(2);

        RetryIf::start(
            strategy,
            || self.call(operation, client.get_query(&path, query.clone())),
            |e: &BillingError| is_transient(e),
        )
        .await
    }

    async fn post<T>(
        &self,
        operation: &'static str,
        client: Client,
        path: String,
        form: serde_json::Value,
    ) -> BillingResult<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        self.call(operation, client.post_form(&path, form)).await
    }
}

fn classify(err: StripeError) -> BillingError {
    match &err {
        StripeError::Stripe(req) if req.http_status == 429 || req.http_status >= 500 => {
            BillingError::ProviderTimeout(err.to_string())
        }
        StripeError::Timeout | StripeError::ClientError(_) => {
            BillingError::ProviderTimeout(err.to_string())
        }
        _ => BillingError::from(err),
    }
}

fn is_transient(err: &BillingError) -> bool {
    matches!(err, BillingError::ProviderTimeout(_))
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn retrieve_product(&self, product_id: &str) -> BillingResult<Product> {
        self.retrieve(
            "products.retrieve",
            format!("/products/{}", product_id),
            json!({}),
            None,
        )
        .await
    }

    async fn retrieve_price(&self, price_id: &str) -> BillingResult<Price> {
        self.retrieve(
            "prices.retrieve",
            format!("/prices/{}", price_id),
            json!({}),
            None,
        )
        .await
    }

    async fn find_app_product(&self, app_id: &str) -> BillingResult<Option<Product>> {
        let found: List<Product> = self
            .retrieve(
                "products.search",
                "/products/search".to_string(),
                json!({ "query": format!("metadata['appId']:'{}'", app_id), "limit": 1 }),
                None,
            )
            .await?;
        Ok(found.data.into_iter().next())
    }

    async fn create_product(&self, params: serde_json::Value) -> BillingResult<Product> {
        self.post(
            "products.create",
            self.inner.clone(),
            "/products".to_string(),
            params,
        )
        .await
    }

    async fn list_prices(&self, product_id: &str) -> BillingResult<Vec<Price>> {
        let prices: List<Price> = self
            .retrieve(
                "prices.list",
                "/prices".to_string(),
                json!({ "product": product_id, "active": true, "limit": 100 }),
                None,
            )
            .await?;
        Ok(prices.data)
    }

    async fn create_price(&self, params: serde_json::Value) -> BillingResult<Price> {
        self.post(
            "prices.create",
            self.inner.clone(),
            "/prices".to_string(),
            params,
        )
        .await
    }

    async fn create_checkout_session(
        &self,
        payload: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<CheckoutSession> {
        self.post(
            "checkout.sessions.create",
            self.idempotent(idempotency_key),
            "/checkout/sessions".to_string(),
            payload,
        )
        .await
    }

    async fn retrieve_checkout_session(
        &self,
        session_id: &str,
        account: Option<&str>,
    ) -> BillingResult<CheckoutSession> {
        self.retrieve(
            "checkout.sessions.retrieve",
            format!("/checkout/sessions/{}", session_id),
            json!({ "expand": ["subscription", "line_items", "customer"] }),
            account,
        )
        .await
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
        account: Option<&str>,
    ) -> BillingResult<Subscription> {
        self.retrieve(
            "subscriptions.retrieve",
            format!("/subscriptions/{}", subscription_id),
            json!({ "expand": ["items.data.price.product"] }),
            account,
        )
        .await
    }

    async fn list_subscriptions(
        &self,
        query: &SubscriptionQuery,
    ) -> BillingResult<List<Subscription>> {
        self.retrieve(
            "subscriptions.list",
            "/subscriptions".to_string(),
            serde_json::to_value(query)?,
            None,
        )
        .await
    }

    async fn update_subscription(
        &self,
        subscription_id: &str,
        params: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Subscription> {
        self.post(
            "subscriptions.update",
            self.idempotent(idempotency_key),
            format!("/subscriptions/{}", subscription_id),
            params,
        )
        .await
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
        account: Option<&str>,
    ) -> BillingResult<PaymentIntent> {
        self.retrieve(
            "payment_intents.retrieve",
            format!("/payment_intents/{}", payment_intent_id),
            json!({}),
            account,
        )
        .await
    }

    async fn create_refund(
        &self,
        params: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Refund> {
        self.post(
            "refunds.create",
            self.idempotent(idempotency_key),
            "/refunds".to_string(),
            params,
        )
        .await
    }

    async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: &str,
    ) -> BillingResult<PortalSession> {
        self.post(
            "billing_portal.sessions.create",
            self.inner.clone(),
            "/billing_portal/sessions".to_string(),
            json!({ "customer": customer_id, "return_url": return_url }),
        )
        .await
    }

    async fn list_invoices(&self, customer_id: &str, limit: u32) -> BillingResult<List<Invoice>> {
        self.retrieve(
            "invoices.list",
            "/invoices".to_string(),
            json!({ "customer": customer_id, "limit": limit }),
            None,
        )
        .await
    }

    async fn retrieve_account(&self, account_id: &str) -> BillingResult<Account> {
        self.retrieve(
            "accounts.retrieve",
            format!("/accounts/{}", account_id),
            json!({}),
            None,
        )
        .await
    }

    async fn create_account(
        &self,
        params: serde_json::Value,
        idempotency_key: Option<&str>,
    ) -> BillingResult<Account> {
        self.post(
            "accounts.create",
            self.idempotent(idempotency_key),
            "/accounts".to_string(),
            params,
        )
        .await
    }

    async fn update_account(
        &self,
        account_id: &str,
        params: serde_json::Value,
    ) -> BillingResult<Account> {
        self.post(
            "accounts.update",
            self.inner.clone(),
            format!("/accounts/{}", account_id),
            params,
        )
        .await
    }

    async fn create_account_link(
        &self,
        account_id: &str,
        refresh_url: &str,
        return_url: &str,
    ) -> BillingResult<AccountLink> {
        self.post(
            "account_links.create",
            self.inner.clone(),
            "/account_links".to_string(),
            json!({
                "account": account_id,
                "refresh_url": refresh_url,
                "return_url": return_url,
                "type": "account_onboarding",
            }),
        )
        .await
    }

    async fn create_login_link(&self, account_id: &str) -> BillingResult<LoginLink> {
        self.post(
            "accounts.login_links.create",
            self.inner.clone(),
            format!("/accounts/{}/login_links", account_id),
            json!({}),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = StripeConfig::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", "sk_test_123"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_abc"),
        ]))
        .unwrap();

        assert_eq!(config.price_map_ttl, Duration::from_millis(60_000));
        assert_eq!(config.attribution_window_days, 60);
        assert_eq!(config.commission_rate_percent, 80);
        assert_eq!(config.processed_event_retention_days, 30);
        assert_eq!(config.purchase_min_cents, 50);
        assert_eq!(config.purchase_max_cents, 500_000);
        assert_eq!(config.success_url, "http://localhost:5173/billing/success");
        assert_eq!(
            config.success_url_with_session(),
            "http://localhost:5173/billing/success?session_id={CHECKOUT_SESSION_ID}"
        );
        assert!(!config.automatic_tax);
    }

    #[test]
    fn test_missing_secret_is_config_error() {
        let err = StripeConfig::from_lookup(lookup(&[("STRIPE_WEBHOOK_SECRET", "whsec_abc")]))
            .unwrap_err();
        assert!(matches!(err, BillingError::Config(_)));
    }

    #[test]
    fn test_limits_are_clamped_and_invalid_values_fall_back() {
        let config = StripeConfig::from_lookup(lookup(&[
            ("STRIPE_SECRET_KEY", "sk_test_123"),
            ("STRIPE_WEBHOOK_SECRET", "whsec_abc"),
            ("AMBASSADOR_ATTRIBUTION_WINDOW_DAYS", "9000"),
            ("AMBASSADOR_COMMISSION_RATE_PERCENT", "250"),
            ("PRICE_ID_MAP_TTL_MS", "soon"),
            ("PUBLIC_BASE_URL", "https://shop.example/"),
        ]))
        .unwrap();

        assert_eq!(config.attribution_window_days, 365);
        assert_eq!(config.commission_rate_percent, 100);
        assert_eq!(config.price_map_ttl, Duration::from_millis(60_000));
        assert_eq!(config.cancel_url, "https://shop.example/billing/cancel");
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_reads_process_environment() {
        std::env::set_var("STRIPE_SECRET_KEY", "sk_test_env");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_env");
        std::env::set_var("GOLD_PRICE_ID", "prod_gold");

        let config = StripeConfig::from_env().unwrap();
        assert_eq!(config.secret_key, "sk_test_env");
        assert_eq!(config.price_ids.gold.as_deref(), Some("prod_gold"));

        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
        std::env::remove_var("GOLD_PRICE_ID");
    }

    #[test]
    #[serial_test::serial]
    fn test_from_env_requires_secret_key() {
        std::env::remove_var("STRIPE_SECRET_KEY");
        std::env::set_var("STRIPE_WEBHOOK_SECRET", "whsec_env");

        assert!(StripeClient::from_env().is_err());

        std::env::remove_var("STRIPE_WEBHOOK_SECRET");
    }

    #[test]
    fn test_scoped_client_rejects_malformed_account() {
        let client = StripeClient::new(
            StripeConfig::from_lookup(lookup(&[
                ("STRIPE_SECRET_KEY", "sk_test_123"),
                ("STRIPE_WEBHOOK_SECRET", "whsec_abc"),
            ]))
            .unwrap(),
        );
        assert!(client.scoped(Some("acct_123")).is_ok());
        assert!(matches!(
            client.scoped(Some("cus_123")),
            Err(BillingError::InvalidInput(_))
        ));
    }
}
