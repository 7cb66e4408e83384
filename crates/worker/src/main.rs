//! Storefront Background Worker
//!
//! Handles scheduled billing jobs:
//! - Processed-event ledger purge (daily at 3:00 UTC)
//! - Price id map refresh (every minute)
//! - Billing consistency checks (hourly)
//! - Heartbeat (every 5 minutes)

use std::sync::Arc;
use std::time::Duration;

use storefront_billing::{BillingService, InvariantCheckSummary, InvariantChecker};
use storefront_shared::{create_pool, run_migrations, DbConfig};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Log a consistency check run, one line per violation
fn log_invariant_summary(summary: &InvariantCheckSummary) {
    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "Billing consistency checks passed"
        );
        return;
    }

    warn!(
        checks_run = summary.checks_run,
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Billing consistency checks found violations"
    );
    for violation in &summary.violations {
        warn!(
            invariant = %violation.invariant,
            severity = %violation.severity,
            user_ids = ?violation.user_ids,
            context = %violation.context,
            "{}",
            violation.description
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Storefront Worker");

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = create_pool(&DbConfig::new(database_url)).await?;
    run_migrations(&pool).await?;
    info!("Database migrations applied");

    let billing = Arc::new(BillingService::from_env(pool.clone())?);
    let checker = InvariantChecker::new(pool);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Drop expired processed-event entries
    let purge_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let billing = purge_billing.clone();
            Box::pin(async move {
                match billing.ledger.purge_expired().await {
                    Ok(removed) => info!(removed = removed, "Processed-event purge complete"),
                    Err(e) => error!(error = %e, "Processed-event purge failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Processed-event purge (daily 3:00 UTC)");

    // Job 2: Rebuild the price id map from the catalog
    let refresh_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 * * * * *", move |_uuid, _l| {
            let billing = refresh_billing.clone();
            Box::pin(async move {
                match billing.prices.build_price_id_map(true).await {
                    Ok(map) => tracing::debug!(entries = map.len(), "Price id map refreshed"),
                    Err(e) => warn!(error = %e, "Price id map refresh failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Price id map refresh (every minute)");

    // Job 3: Consistency checks
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let checker = checker.clone();
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) => log_invariant_summary(&summary),
                    Err(e) => error!(error = %e, "Billing consistency checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing consistency checks (hourly)");

    // Job 4: Heartbeat
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Storefront Worker started successfully with {} scheduled jobs", 4);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
