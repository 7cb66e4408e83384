//! Refunds for one-time purchases
//!
//! Purchases settle on the creator's connected account, so a refund also
//! reverses the transfer and returns the platform's application fee. The
//! purchase entitlement is revoked when the resulting `charge.refunded`
//! webhook arrives.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::error::{BillingError, BillingResult};
use crate::payload::clean_undefined;
use crate::provider::PaymentProvider;

/// Result of a refund operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundResult {
    /// Stripe refund ID
    pub stripe_refund_id: String,
    pub payment_intent_id: String,
    /// Amount refunded in cents
    pub amount_cents: i64,
    pub status: Option<String>,
}

/// Refund service for handling Stripe refunds
#[derive(Clone)]
pub struct RefundService {
    provider: Arc<dyn PaymentProvider>,
}

impl RefundService {
    pub fn new(provider: Arc<dyn PaymentProvider>) -> Self {
        Self { provider }
    }

    /// Refund a payment, in full when `amount_cents` is `None`
    pub async fn refund_with_connect(
        &self,
        payment_intent_id: &str,
        amount_cents: Option<i64>,
        idempotency_key: Option<&str>,
    ) -> BillingResult<RefundResult> {
        if let Some(amount) = amount_cents {
            if amount <= 0 {
                return Err(BillingError::InvalidInput(format!(
                    "refund amount must be positive, got {}",
                    amount
                )));
            }
        }

        let params = clean_undefined(json!({
            "payment_intent": payment_intent_id,
            "amount": amount_cents,
            "reverse_transfer": true,
            "refund_application_fee": true,
        }));

        let refund = self
            .provider
            .create_refund(params, idempotency_key)
            .await
            .map_err(|e| {
                tracing::error!(
                    payment_intent_id = %payment_intent_id,
                    amount_cents = ?amount_cents,
                    error = %e,
                    "Stripe refund failed"
                );
                BillingError::RefundFailed(e.to_string())
            })?;

        tracing::info!(
            refund_id = %refund.id,
            payment_intent_id = %payment_intent_id,
            amount_cents = refund.amount,
            "Refund issued"
        );

        Ok(RefundResult {
            stripe_refund_id: refund.id,
            payment_intent_id: payment_intent_id.to_string(),
            amount_cents: amount_cents.unwrap_or(refund.amount),
            status: refund.status,
        })
    }
}
