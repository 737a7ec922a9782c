//! Staffly Background Worker
//!
//! Runs the scheduled subscription lifecycle sweeps:
//! - Trial expiry (hourly)
//! - Trial ending warnings (daily at 9:00 UTC)
//! - Auto-renewal collection (daily at 1:00 UTC)

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use staffly_billing::{
    BillingService, RenewalResult, TrialExpiryResult, TrialWarningResult,
};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    #[allow(clippy::expect_used)] // Fail-fast on startup if required config is missing
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Log results of a trial expiry sweep
fn log_expiry_results(results: &[TrialExpiryResult]) {
    let expired = results
        .iter()
        .filter(|r| matches!(r, TrialExpiryResult::Expired { .. }))
        .count();
    let errors = results
        .iter()
        .filter(|r| matches!(r, TrialExpiryResult::Error { .. }))
        .count();

    info!(expired = expired, errors = errors, "Trial expiry sweep complete");

    for result in results {
        if let TrialExpiryResult::Error { user_id, error } = result {
            error!(user_id = %user_id, error = %error, "Failed to expire trial");
        }
    }
}

/// Log results of a trial warning sweep
fn log_warning_results(results: &[TrialWarningResult]) {
    let warned = results
        .iter()
        .filter(|r| matches!(r, TrialWarningResult::Warned { .. }))
        .count();
    let already = results
        .iter()
        .filter(|r| matches!(r, TrialWarningResult::AlreadyWarned { .. }))
        .count();
    let errors = results
        .iter()
        .filter(|r| matches!(r, TrialWarningResult::Error { .. }))
        .count();

    info!(
        warned = warned,
        already_warned = already,
        errors = errors,
        "Trial warning sweep complete"
    );

    for result in results {
        if let TrialWarningResult::Error { user_id, error } = result {
            error!(user_id = %user_id, error = %error, "Failed to deliver trial warning");
        }
    }
}

/// Log results of an auto-renewal sweep
fn log_renewal_results(results: &[RenewalResult]) {
    let (renewed, suspended, already_claimed, errors) =
        staffly_billing::sweeps::summarize_renewals(results);

    info!(
        renewed = renewed,
        suspended = suspended,
        already_claimed = already_claimed,
        errors = errors,
        "Auto-renewal sweep complete"
    );

    for result in results {
        match result {
            RenewalResult::Suspended { user_id, reason } => {
                error!(user_id = %user_id, reason = %reason, "Renewal failed, tenant suspended");
            }
            RenewalResult::Error { user_id, error } => {
                error!(user_id = %user_id, error = %error, "Renewal sweep error");
            }
            _ => {}
        }
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

    info!("Starting Staffly Worker");

    let pool = create_db_pool().await?;

    let billing = Arc::new(BillingService::from_env(pool.clone())?);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Trial expiry sweep (hourly at minute 5)
    let expiry_sweeps = billing.clone();
    scheduler
        .add(Job::new_async("0 5 * * * *", move |_uuid, _l| {
            let billing = expiry_sweeps.clone();
            Box::pin(async move {
                info!("Running trial expiry sweep");
                match billing.sweeps.expire_trials().await {
                    Ok(results) => log_expiry_results(&results),
                    Err(e) => error!(error = %e, "Trial expiry sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial expiry sweep (hourly)");

    // Job 2: Trial warning sweep (daily at 9:00 UTC)
    let warning_sweeps = billing.clone();
    scheduler
        .add(Job::new_async("0 0 9 * * *", move |_uuid, _l| {
            let billing = warning_sweeps.clone();
            Box::pin(async move {
                info!("Running trial warning sweep");
                match billing.sweeps.warn_ending_trials().await {
                    Ok(results) => log_warning_results(&results),
                    Err(e) => error!(error = %e, "Trial warning sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Trial warning sweep (daily at 9:00 UTC)");

    // Job 3: Auto-renewal sweep (daily at 1:00 UTC)
    let renewal_sweeps = billing.clone();
    scheduler
        .add(Job::new_async("0 0 1 * * *", move |_uuid, _l| {
            let billing = renewal_sweeps.clone();
            Box::pin(async move {
                info!("Running auto-renewal sweep");
                match billing.sweeps.run_auto_renewals().await {
                    Ok(results) => log_renewal_results(&results),
                    Err(e) => error!(error = %e, "Auto-renewal sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Auto-renewal sweep (daily at 1:00 UTC)");

    // Job 4: Invariant checks (daily at 6:00 UTC)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 6 * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                info!("Running billing invariant checks");
                match billing.invariants.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "All billing invariants hold");
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant checks failed to run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Billing invariant checks (daily at 6:00 UTC)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Staffly Worker started successfully with {} scheduled jobs", 4);

    // Keep the main task running; the scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
