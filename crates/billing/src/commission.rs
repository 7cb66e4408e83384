//! Ambassador commission
//!
//! A referred user's first paid checkout inside the attribution window credits
//! the referring ambassador once. The qualification rule is pure; the store
//! applies it inside its own transaction so the check and the writes are
//! atomic.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::client::StripeConfig;
use crate::error::BillingResult;
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::store::{Attribution, CommissionStore};

/// Commission terms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionPolicy {
    pub window_days: i64,
    pub rate_percent: u32,
}

impl CommissionPolicy {
    pub fn from_config(config: &StripeConfig) -> Self {
        Self {
            window_days: config.attribution_window_days,
            rate_percent: config.commission_rate_percent,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.rate_percent > 0
    }

    /// Commission in cents, rounded half up
    pub fn commission_for(&self, amount_cents: i64) -> i64 {
        if amount_cents <= 0 {
            return 0;
        }
        (amount_cents * i64::from(self.rate_percent) + 50) / 100
    }

    /// Award owed for this attribution, if any
    pub fn evaluate(
        &self,
        attribution: &Attribution,
        amount_cents: i64,
        now: OffsetDateTime,
    ) -> Option<CommissionAward> {
        if attribution.commission_awarded || !self.is_enabled() {
            return None;
        }
        if now - attribution.redeemed_at >= Duration::days(self.window_days) {
            return None;
        }
        let commission_cents = self.commission_for(amount_cents);
        if commission_cents <= 0 {
            return None;
        }
        Some(CommissionAward {
            ambassador_id: attribution.ambassador_id.clone(),
            promo_code: attribution.promo_code.clone(),
            commission_cents,
            amount_cents,
        })
    }
}

/// A credited commission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionAward {
    pub ambassador_id: String,
    pub promo_code: String,
    pub commission_cents: i64,
    /// Checkout amount the commission was computed from
    pub amount_cents: i64,
}

/// Awards commissions and records them in the audit log
#[derive(Clone)]
pub struct CommissionTransactor {
    store: Arc<dyn CommissionStore>,
    events: BillingEventLogger,
    policy: CommissionPolicy,
}

impl CommissionTransactor {
    pub fn new(
        store: Arc<dyn CommissionStore>,
        events: BillingEventLogger,
        policy: CommissionPolicy,
    ) -> Self {
        Self {
            store,
            events,
            policy,
        }
    }

    pub fn policy(&self) -> CommissionPolicy {
        self.policy
    }

    /// Credit the user's ambassador for a paid checkout.
    ///
    /// Returns `None` when nothing is owed: no attribution, already awarded,
    /// outside the window, or a zero amount.
    pub async fn award(
        &self,
        user_id: &str,
        amount_cents: i64,
        stripe_event_id: Option<&str>,
    ) -> BillingResult<Option<CommissionAward>> {
        if amount_cents <= 0 || !self.policy.is_enabled() {
            return Ok(None);
        }

        let now = OffsetDateTime::now_utc();
        let Some(award) = self
            .store
            .award_commission(user_id, amount_cents, &self.policy, now)
            .await?
        else {
            tracing::debug!(user_id = %user_id, "No commission owed");
            return Ok(None);
        };

        let mut event = BillingEventBuilder::new(user_id, BillingEventType::CommissionAwarded)
            .amount(Some(award.commission_cents))
            .details(json!({
                "ambassadorId": award.ambassador_id,
                "promoCode": award.promo_code,
                "sourceAmount": award.amount_cents,
                "ratePercent": self.policy.rate_percent,
            }));
        if let Some(id) = stripe_event_id {
            event = event.stripe_event(id);
        }
        self.events.log_event(event).await?;

        tracing::info!(
            user_id = %user_id,
            ambassador_id = %award.ambassador_id,
            promo_code = %award.promo_code,
            commission_cents = award.commission_cents,
            "Ambassador commission awarded"
        );
        Ok(Some(award))
    }
}
