#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Stacker Background Worker
//!
//! Handles scheduled jobs including:
//! - Weekly billing cycle (opt-in via `ENABLE_SCHEDULED_BILLING`)
//! - Grace period expiry sweep (every 15 minutes)
//! - Billing invariant checks (hourly)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stacker_billing::{BillingCycleReport, BillingService, CycleOutcome};
use stacker_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Mondays 09:00 UTC
const DEFAULT_BILLING_CRON: &str = "0 0 9 * * Mon";

struct WorkerConfig {
    database_url: String,
    scheduled_billing: bool,
    billing_cron: String,
}

fn parse_flag(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("true" | "1" | "yes")
    )
}

impl WorkerConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            scheduled_billing: parse_flag(std::env::var("ENABLE_SCHEDULED_BILLING").ok().as_deref()),
            billing_cron: std::env::var("BILLING_CRON")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BILLING_CRON.to_string()),
        })
    }
}

/// Log results of a billing cycle
fn log_cycle_report(report: &BillingCycleReport) {
    info!(
        processed = report.processed,
        skipped = report.skipped,
        failed = report.failed,
        locked_out = report.locked_out,
        "Billing cycle complete"
    );

    for detail in &report.details {
        if let CycleOutcome::Failed {
            invoice_id,
            error,
            entered_grace,
        } = &detail.outcome
        {
            error!(
                merchant_id = %detail.merchant_id,
                invoice_id = ?invoice_id,
                entered_grace = *entered_grace,
                error = %error,
                "Merchant billing failed"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Stacker Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool)?);
    let scheduler = JobScheduler::new().await?;
    let mut jobs = 0;

    // Job 1: Weekly billing cycle
    // Off by default so an external cron calling the API stays the only trigger
    if config.scheduled_billing {
        let cycle_billing = billing.clone();
        scheduler
            .add(Job::new_async(config.billing_cron.as_str(), move |_uuid, _l| {
                let billing = cycle_billing.clone();
                Box::pin(async move {
                    info!("Running scheduled billing cycle");
                    match billing.cycle.run(OffsetDateTime::now_utc()).await {
                        Ok(report) => log_cycle_report(&report),
                        Err(e) => error!(error = %e, "Billing cycle aborted"),
                    }
                })
            })?)
            .await?;
        jobs += 1;
        info!(cron = %config.billing_cron, "Scheduled: Billing cycle");
    } else {
        warn!("Scheduled billing disabled (ENABLE_SCHEDULED_BILLING not set)");
    }

    // Job 2: Move expired grace periods to lockout (every 15 minutes)
    let sweep_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let billing = sweep_billing.clone();
            Box::pin(async move {
                match billing
                    .cycle
                    .sweep_expired_grace(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(0) => {}
                    Ok(locked_out) => info!(locked_out, "Expired grace periods locked out"),
                    Err(e) => error!(error = %e, "Grace period sweep failed"),
                }
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Grace period sweep (every 15 minutes)");

    // Job 3: Billing invariant checks (hourly)
    let invariant_billing = billing.clone();
    scheduler
        .add(Job::new_async("0 0 * * * *", move |_uuid, _l| {
            let billing = invariant_billing.clone();
            Box::pin(async move {
                match billing
                    .invariants
                    .run_all_checks(OffsetDateTime::now_utc())
                    .await
                {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Billing invariants healthy")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            warn!(
                                invariant = %violation.invariant,
                                severity = ?violation.severity,
                                merchant_ids = ?violation.merchant_ids,
                                description = %violation.description,
                                "Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => error!(error = %e, "Invariant check failed"),
                }
            })
        })?)
        .await?;
    jobs += 1;
    info!("Scheduled: Billing invariant checks (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Stacker Worker started with {} scheduled jobs", jobs);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag(Some("true")));
        assert!(parse_flag(Some(" TRUE ")));
        assert!(parse_flag(Some("1")));
        assert!(!parse_flag(Some("false")));
        assert!(!parse_flag(Some("")));
        assert!(!parse_flag(None));
    }
}
