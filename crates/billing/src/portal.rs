//! Stripe customer billing portal

use std::sync::Arc;

use serde::Serialize;

use crate::client::StripeConfig;
use crate::error::{BillingError, BillingResult};
use crate::provider::PaymentProvider;
use crate::store::CustomerStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalLink {
    pub url: String,
}

#[derive(Clone)]
pub struct PortalService {
    config: Arc<StripeConfig>,
    provider: Arc<dyn PaymentProvider>,
    customers: Arc<dyn CustomerStore>,
}

impl PortalService {
    pub fn new(
        config: Arc<StripeConfig>,
        provider: Arc<dyn PaymentProvider>,
        customers: Arc<dyn CustomerStore>,
    ) -> Self {
        Self {
            config,
            provider,
            customers,
        }
    }

    /// Portal session for a Stripe customer; returns to the success URL by default
    pub async fn create_portal_session(
        &self,
        customer_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<PortalLink> {
        let return_url = return_url
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.config.success_url);
        let session = self
            .provider
            .create_portal_session(customer_id, return_url)
            .await?;

        tracing::debug!(customer_id = %customer_id, "Billing portal session created");
        Ok(PortalLink { url: session.url })
    }

    /// Portal session for a user with a known Stripe customer
    pub async fn create_portal_session_for_user(
        &self,
        user_id: &str,
        return_url: Option<&str>,
    ) -> BillingResult<PortalLink> {
        let customer_id = self
            .customers
            .get_customer_for_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Stripe customer for user {}", user_id)))?;
        self.create_portal_session(&customer_id, return_url).await
    }
}
