//! Billing Invariants Module
//!
//! Runnable consistency checks over the billing tables. They can be run after
//! a webhook replay or on a schedule to catch drift between the provider and
//! local state.
//!
//! Each check is a read-only SQL query; violations carry enough context to
//! find the offending rows.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;
use crate::events::BillingEventType;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected, empty when the violation is not tied to a user
    pub user_ids: Vec<String>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Access or money is wrong right now
    Critical,
    /// Local state disagrees with the provider
    High,
    /// Needs manual attention
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

impl InvariantCheckSummary {
    fn from_violations(
        checked_at: OffsetDateTime,
        checks_run: usize,
        violations: Vec<InvariantViolation>,
    ) -> Self {
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        Self {
            checked_at,
            checks_run,
            checks_passed: checks_run.saturating_sub(checks_failed),
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledEntitlementRow {
    user_id: String,
    entitlement_id: String,
    subscription_id: String,
    status: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ExpiredSubscriptionRow {
    subscription_id: String,
    user_id: String,
    status: String,
    current_period_end: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UnmappedEventRow {
    event_id: String,
    event_type: String,
    received_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct DuplicateCommissionRow {
    user_id: String,
    award_count: i64,
    total_cents: Option<i64>,
}

const CHECKS: [&str; 4] = [
    "active_entitlement_canceled_subscription",
    "expired_subscription_still_active",
    "unmapped_events_pending",
    "duplicate_commission_awards",
];

/// Service for running billing invariant checks
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_active_entitlement_canceled_subscription().await?);
        violations.extend(self.check_expired_subscription_still_active().await?);
        violations.extend(self.check_unmapped_events_pending().await?);
        violations.extend(self.check_duplicate_commission_awards().await?);

        Ok(InvariantCheckSummary::from_violations(
            now,
            CHECKS.len(),
            violations,
        ))
    }

    /// An active entitlement must not point at a canceled subscription
    async fn check_active_entitlement_canceled_subscription(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledEntitlementRow> = sqlx::query_as(
            r#"
            SELECT
                e.user_id,
                e.id AS entitlement_id,
                s.id AS subscription_id,
                s.status
            FROM entitlements e
            JOIN subscription_records s ON s.id = e.data->>'stripeSubscriptionId'
            WHERE e.active = TRUE
              AND s.status IN ('canceled', 'incomplete_expired')
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_entitlement_canceled_subscription".to_string(),
                description: format!(
                    "Entitlement '{}' is active but subscription {} is {}",
                    row.entitlement_id, row.subscription_id, row.status
                ),
                context: serde_json::json!({
                    "entitlement_id": row.entitlement_id,
                    "subscription_id": row.subscription_id,
                    "status": row.status,
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A subscription past its period end should have been renewed or ended
    ///
    /// A day of grace covers renewal webhooks that are still in flight.
    async fn check_expired_subscription_still_active(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ExpiredSubscriptionRow> = sqlx::query_as(
            r#"
            SELECT
                id AS subscription_id,
                user_id,
                status,
                current_period_end
            FROM subscription_records
            WHERE status IN ('active', 'trialing')
              AND current_period_end IS NOT NULL
              AND current_period_end < NOW() - INTERVAL '1 day'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "expired_subscription_still_active".to_string(),
                description: format!(
                    "Subscription {} is {} but its period ended at {}",
                    row.subscription_id, row.status, row.current_period_end
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "status": row.status,
                    "current_period_end": row.current_period_end.unix_timestamp(),
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Quarantined events waiting for manual triage
    async fn check_unmapped_events_pending(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnmappedEventRow> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, received_at
            FROM unmapped_events
            WHERE resolved_at IS NULL
            ORDER BY received_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unmapped_events_pending".to_string(),
                user_ids: vec![],
                description: format!(
                    "Event {} ({}) has no resolvable user",
                    row.event_id, row.event_type
                ),
                context: serde_json::json!({
                    "event_id": row.event_id,
                    "event_type": row.event_type,
                    "received_at": row.received_at.unix_timestamp(),
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// A referred user earns an ambassador at most one commission
    async fn check_duplicate_commission_awards(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateCommissionRow> = sqlx::query_as(
            r#"
            SELECT
                user_id,
                COUNT(*) AS award_count,
                SUM(amount_cents)::BIGINT AS total_cents
            FROM billing_events
            WHERE event_type = $1
              AND user_id IS NOT NULL
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .bind(BillingEventType::CommissionAwarded.as_str())
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "duplicate_commission_awards".to_string(),
                description: format!(
                    "User was awarded {} commissions (expected at most 1)",
                    row.award_count
                ),
                context: serde_json::json!({
                    "award_count": row.award_count,
                    "total_cents": row.total_cents,
                }),
                user_ids: vec![row.user_id],
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "active_entitlement_canceled_subscription" => {
                self.check_active_entitlement_canceled_subscription().await
            }
            "expired_subscription_still_active" => {
                self.check_expired_subscription_still_active().await
            }
            "unmapped_events_pending" => self.check_unmapped_events_pending().await,
            "duplicate_commission_awards" => self.check_duplicate_commission_awards().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        CHECKS.to_vec()
    }
}
