// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Inkwell Background Worker
//!
//! Runs the billing jobs on a native schedule:
//! - Subscription renewals and past-due retries (hourly)
//! - Daily generation quota reset (local midnight of the billing timezone)
//! - Credit expiry sweep (daily)
//! - Failed webhook replay (every 10 minutes)
//! - Invariant checks (daily)
//!
//! Every job takes its own cross-process lock, so the worker can run next to
//! the API's cron endpoints or in several replicas.

use std::time::Duration;

use inkwell_billing::{BillingJobs, BillingPolicy, BillingService, InvariantChecker, JobReport};
use inkwell_shared::create_pool;
use time::{OffsetDateTime, UtcOffset};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

const RENEWAL_SCHEDULE: &str = "0 5 * * * *";
const CREDIT_EXPIRY_SCHEDULE: &str = "0 30 0 * * *";
const WEBHOOK_RETRY_SCHEDULE: &str = "0 */10 * * * *";
const INVARIANT_SCHEDULE: &str = "0 0 3 * * *";

#[derive(Debug, Clone, Copy)]
enum BillingJob {
    Renewal,
    QuotaReset,
    CreditExpiry,
    WebhookRetry,
}

impl BillingJob {
    async fn run(self, jobs: &BillingJobs) {
        let now = OffsetDateTime::now_utc();
        let result = match self {
            BillingJob::Renewal => jobs.run_renewal_sweep(now).await,
            BillingJob::QuotaReset => jobs.run_daily_quota_reset(now).await,
            BillingJob::CreditExpiry => jobs.run_credit_expiry_sweep(now).await,
            BillingJob::WebhookRetry => jobs.run_webhook_retry(now).await,
        };
        match result {
            Ok(report) => log_report(&report),
            Err(e) => error!(job = ?self, error = %e, "Billing job failed to run"),
        }
    }
}

fn log_report(report: &JobReport) {
    if report.skipped {
        info!(job = report.job, "Job skipped, another runner holds the lock");
    } else if report.success {
        info!(
            job = report.job,
            processed = report.processed,
            renewed = report.renewed,
            canceled = report.canceled,
            failed = report.failed,
            duration_ms = report.duration_ms,
            "Job complete"
        );
    } else {
        error!(
            job = report.job,
            processed = report.processed,
            failed = report.failed,
            error = ?report.error,
            "Job finished with errors"
        );
    }
}

/// Cron expression (UTC) firing at local midnight of `offset`
fn local_midnight_schedule(offset: UtcOffset) -> String {
    let minutes = (-i32::from(offset.whole_minutes())).rem_euclid(24 * 60);
    format!("0 {} {} * * *", minutes % 60, minutes / 60)
}

fn billing_job(schedule: &str, kind: BillingJob, jobs: BillingJobs) -> anyhow::Result<Job> {
    Ok(Job::new_async(schedule, move |_uuid, _l| {
        let jobs = jobs.clone();
        Box::pin(async move {
            kind.run(&jobs).await;
        })
    })?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,inkwell_billing=debug")),
        )
        .init();

    info!("Starting Inkwell Worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set for the worker"))?;
    let pool = create_pool(&database_url).await?;

    let policy = BillingPolicy::from_env()?;
    let billing = BillingService::from_env(pool.clone()).await?;

    let scheduler = JobScheduler::new().await?;

    scheduler
        .add(billing_job(
            RENEWAL_SCHEDULE,
            BillingJob::Renewal,
            billing.jobs.clone(),
        )?)
        .await?;
    info!("Scheduled: Subscription renewals ({})", RENEWAL_SCHEDULE);

    let quota_schedule = local_midnight_schedule(policy.tz_offset);
    scheduler
        .add(billing_job(
            &quota_schedule,
            BillingJob::QuotaReset,
            billing.jobs.clone(),
        )?)
        .await?;
    info!("Scheduled: Daily quota reset ({})", quota_schedule);

    scheduler
        .add(billing_job(
            CREDIT_EXPIRY_SCHEDULE,
            BillingJob::CreditExpiry,
            billing.jobs.clone(),
        )?)
        .await?;
    info!("Scheduled: Credit expiry sweep ({})", CREDIT_EXPIRY_SCHEDULE);

    scheduler
        .add(billing_job(
            WEBHOOK_RETRY_SCHEDULE,
            BillingJob::WebhookRetry,
            billing.jobs.clone(),
        )?)
        .await?;
    info!("Scheduled: Webhook retry ({})", WEBHOOK_RETRY_SCHEDULE);

    let invariant_pool = pool.clone();
    scheduler
        .add(Job::new_async(INVARIANT_SCHEDULE, move |_uuid, _l| {
            let checker = InvariantChecker::new(invariant_pool.clone());
            Box::pin(async move {
                match checker.run_all_checks().await {
                    Ok(summary) if summary.healthy => {
                        info!(checks_run = summary.checks_run, "Invariant checks passed")
                    }
                    Ok(summary) => {
                        for violation in &summary.violations {
                            error!(
                                invariant = %violation.invariant,
                                severity = %violation.severity,
                                affected_users = violation.user_ids.len(),
                                description = %violation.description,
                                "CRITICAL: Billing invariant violated"
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "Invariant checks could not run"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Invariant checks ({})", INVARIANT_SCHEDULE);

    info!("Starting job scheduler");
    scheduler.start().await?;
    info!("Inkwell Worker started with 5 scheduled jobs");

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_midnight_in_utc() {
        let kst = UtcOffset::from_hms(9, 0, 0).unwrap();
        assert_eq!(local_midnight_schedule(kst), "0 0 15 * * *");
        assert_eq!(local_midnight_schedule(UtcOffset::UTC), "0 0 0 * * *");

        let eastern = UtcOffset::from_hms(-5, 0, 0).unwrap();
        assert_eq!(local_midnight_schedule(eastern), "0 0 5 * * *");

        let india = UtcOffset::from_hms(5, 30, 0).unwrap();
        assert_eq!(local_midnight_schedule(india), "0 30 18 * * *");
    }

    #[test]
    fn test_schedules_parse() {
        for schedule in [
            RENEWAL_SCHEDULE,
            CREDIT_EXPIRY_SCHEDULE,
            WEBHOOK_RETRY_SCHEDULE,
            INVARIANT_SCHEDULE,
        ] {
            assert!(
                Job::new_async(schedule, |_uuid, _l| Box::pin(async {})).is_ok(),
                "bad schedule {}",
                schedule
            );
        }
    }
}
