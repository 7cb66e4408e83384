//! Billing error types

use std::future::Future;

use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    // Forward-path validation
    #[error("Creator has no connected payout account: {0}")]
    CreatorNotOnboarded(String),

    #[error("Amount {amount_cents} is outside the allowed range {min_cents}..={max_cents}")]
    AmountOutOfRange {
        amount_cents: i64,
        min_cents: i64,
        max_cents: i64,
    },

    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("App is not published and active: {0}")]
    AppInactive(String),

    #[error("App slug matches more than one app: {0}")]
    AppSlugNotUnique(String),

    // Price resolution
    #[error("Price id missing")]
    PriceIdMissing,

    #[error("Product has no default price: {0}")]
    ProductMissingPrice(String),

    #[error("No price found for {0}")]
    PriceNotFound(String),

    #[error("Checkout session belongs to another user")]
    SessionMismatch,

    // Provider-call wrappers
    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Upgrade failed: {0}")]
    UpgradeFailed(String),

    #[error("Downgrade failed: {0}")]
    DowngradeFailed(String),

    #[error("Cancel failed: {0}")]
    CancelFailed(String),

    // Webhooks
    #[error("Webhook signature invalid")]
    WebhookSignatureInvalid,

    #[error("Webhook payload not supported: {0}")]
    WebhookEventNotSupported(String),

    // Infrastructure
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Stripe request timed out: {0}")]
    ProviderTimeout(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable error code returned to forward-path callers
    pub fn code(&self) -> &'static str {
        match self {
            Self::CreatorNotOnboarded(_) => "creator_not_onboarded",
            Self::AmountOutOfRange { .. } => "amount_out_of_range",
            Self::AppNotFound(_) => "app_not_found",
            Self::AppInactive(_) => "app_inactive",
            Self::AppSlugNotUnique(_) => "app_slug_not_unique",
            Self::PriceIdMissing => "price_id_missing",
            Self::ProductMissingPrice(_) => "product_missing_price",
            Self::PriceNotFound(_) => "price_not_found",
            Self::SessionMismatch => "session_mismatch",
            Self::RefundFailed(_) => "refund_failed",
            Self::UpgradeFailed(_) => "upgrade_failed",
            Self::DowngradeFailed(_) => "downgrade_failed",
            Self::CancelFailed(_) => "cancel_failed",
            Self::WebhookSignatureInvalid => "webhook_signature_invalid",
            Self::WebhookEventNotSupported(_) => "webhook_event_not_supported",
            Self::StripeApi(_) => "stripe_error",
            Self::ProviderTimeout(_) => "stripe_timeout",
            Self::Database(_) => "database_error",
            Self::Config(_) => "config_error",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Whether the caller caused the error (as opposed to an upstream or internal fault)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::CreatorNotOnboarded(_)
                | Self::AmountOutOfRange { .. }
                | Self::AppNotFound(_)
                | Self::AppInactive(_)
                | Self::AppSlugNotUnique(_)
                | Self::PriceIdMissing
                | Self::PriceNotFound(_)
                | Self::SessionMismatch
                | Self::InvalidInput(_)
                | Self::NotFound(_)
        )
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        BillingError::StripeApi(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", err))
    }
}

/// Run a step whose failure must never abort the surrounding operation.
///
/// Failures are logged at warn level and collapse to `None`.
pub async fn best_effort<T, F>(operation: &'static str, fut: F) -> Option<T>
where
    F: Future<Output = BillingResult<T>>,
{
    match fut.await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(
                operation = operation,
                error = %e,
                code = e.code(),
                "Best-effort billing step failed"
            );
            None
        }
    }
}
