//! Processed-event ledger
//!
//! Marks provider events as handled so redeliveries are skipped. An event is
//! marked only after its handler succeeds; a failed handler leaves it
//! unmarked and the provider's retry runs the whole handler again.

use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::error::BillingResult;
use crate::store::EventLedger;

#[derive(Clone)]
pub struct IdempotencyGate {
    ledger: Arc<dyn EventLedger>,
    retention: Duration,
}

impl IdempotencyGate {
    pub fn new(ledger: Arc<dyn EventLedger>, retention_days: i64) -> Self {
        Self {
            ledger,
            retention: Duration::days(retention_days.max(1)),
        }
    }

    pub async fn has_processed(&self, event_id: &str) -> BillingResult<bool> {
        self.ledger
            .has_processed(event_id, OffsetDateTime::now_utc())
            .await
    }

    pub async fn mark_processed(&self, event_id: &str) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        self.ledger
            .mark_processed(event_id, now, now + self.retention)
            .await?;
        tracing::debug!(event_id = %event_id, "Event marked processed");
        Ok(())
    }

    /// Drop expired ledger entries
    pub async fn purge_expired(&self) -> BillingResult<u64> {
        let removed = self
            .ledger
            .purge_expired(OffsetDateTime::now_utc())
            .await?;
        if removed > 0 {
            tracing::info!(removed = removed, "Purged expired processed-event entries");
        }
        Ok(removed)
    }
}
