//! Scheduled billing jobs
//!
//! Each job takes its own [`JobLock`] lease and reports `skipped` when another
//! runner holds it. Items are processed one by one, so a crash mid-run leaves
//! finished items finished and the next run picks up the rest. The same
//! functions back the worker's cron schedule and the API's cron endpoints.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use inkwell_shared::PlanCatalog;
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::BillingPolicy;
use crate::error::BillingResult;
use crate::lock::{JobLock, LockGuard};
use crate::models::{Subscription, SubscriptionStatus};
use crate::store::{BillingStore, SubscriptionCursor};
use crate::subscriptions::{RenewalOutcome, SubscriptionService};
use crate::webhooks::WebhookReconciler;

pub const RENEWAL_JOB: &str = "subscription_renewal";
pub const QUOTA_RESET_JOB: &str = "daily_quota_reset";
pub const CREDIT_EXPIRY_JOB: &str = "credit_expiry";
pub const WEBHOOK_RETRY_JOB: &str = "webhook_retry";

/// Upper bound on batches per run for sweeps that drain a backlog
const MAX_BATCHES: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub job: &'static str,
    pub success: bool,
    /// Another runner held the lock; nothing was done
    pub skipped: bool,
    pub processed: u32,
    pub renewed: u32,
    pub canceled: u32,
    pub failed: u32,
    pub duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobReport {
    fn new(job: &'static str, timestamp: OffsetDateTime) -> Self {
        Self {
            job,
            success: true,
            skipped: false,
            processed: 0,
            renewed: 0,
            canceled: 0,
            failed: 0,
            duration_ms: 0,
            timestamp,
            error: None,
        }
    }
}

#[derive(Clone)]
pub struct BillingJobs {
    store: Arc<dyn BillingStore>,
    subscriptions: SubscriptionService,
    webhooks: WebhookReconciler,
    catalog: Arc<PlanCatalog>,
    lock: Arc<dyn JobLock>,
    policy: BillingPolicy,
}

impl BillingJobs {
    pub fn new(
        store: Arc<dyn BillingStore>,
        subscriptions: SubscriptionService,
        webhooks: WebhookReconciler,
        catalog: Arc<PlanCatalog>,
        lock: Arc<dyn JobLock>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            subscriptions,
            webhooks,
            catalog,
            lock,
            policy,
        }
    }

    async fn acquire(&self, report: &mut JobReport) -> BillingResult<Option<LockGuard>> {
        let guard = self
            .lock
            .try_acquire(report.job, self.policy.job_lock_lease)
            .await?;
        if guard.is_none() {
            tracing::info!(job = report.job, "Job already running elsewhere, skipping");
            report.skipped = true;
        } else {
            tracing::info!(job = report.job, "Job started");
        }
        Ok(guard)
    }

    async fn finish(
        &self,
        guard: LockGuard,
        mut report: JobReport,
        started: Instant,
        outcome: BillingResult<()>,
    ) -> JobReport {
        if let Err(e) = self.lock.release(guard).await {
            tracing::warn!(job = report.job, error = %e, "Failed to release job lock");
        }

        report.duration_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(()) => tracing::info!(
                job = report.job,
                processed = report.processed,
                renewed = report.renewed,
                canceled = report.canceled,
                failed = report.failed,
                duration_ms = report.duration_ms,
                "Job finished"
            ),
            Err(e) => {
                tracing::error!(job = report.job, error = %e, "Job failed");
                report.success = false;
                report.error = Some(e.to_string());
            }
        }
        report
    }

    // =========================================================================
    // Renewal
    // =========================================================================

    /// Renew subscriptions ending within the lookahead, finalize scheduled
    /// cancellations, and retry past-due subscriptions whose retry time has come
    pub async fn run_renewal_sweep(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let started = Instant::now();
        let mut report = JobReport::new(RENEWAL_JOB, now);
        let Some(guard) = self.acquire(&mut report).await? else {
            return Ok(report);
        };
        let outcome = self.renew_due(now, &mut report).await;
        Ok(self.finish(guard, report, started, outcome).await)
    }

    async fn renew_due(&self, now: OffsetDateTime, report: &mut JobReport) -> BillingResult<()> {
        let until = now + self.policy.renewal_lookahead;
        let store = self.store.as_ref();
        self.renew_pages(report, now, move |after, limit| {
            store.list_due_subscriptions(until, after, limit)
        })
        .await?;
        self.renew_pages(report, now, move |after, limit| {
            store.list_retry_due_subscriptions(now, after, limit)
        })
        .await
    }

    /// Walk one listing page by page past the last row seen, so rows that stay
    /// due (skipped, unresolved, failing) never hide the ones behind them
    async fn renew_pages<F, Fut>(
        &self,
        report: &mut JobReport,
        now: OffsetDateTime,
        list: F,
    ) -> BillingResult<()>
    where
        F: Fn(Option<SubscriptionCursor>, i64) -> Fut,
        Fut: Future<Output = BillingResult<Vec<Subscription>>>,
    {
        let mut after = None;
        for _ in 0..MAX_BATCHES {
            let page = list(after, self.policy.batch_size).await?;
            let Some(last) = page.last() else {
                break;
            };
            let full = page.len() as i64 >= self.policy.batch_size;
            after = Some(match last.status {
                SubscriptionStatus::PastDue => {
                    SubscriptionCursor::new(last.next_retry_at.unwrap_or(now), last.id)
                }
                _ => SubscriptionCursor::new(last.current_period_end, last.id),
            });

            for sub in page {
                self.renew_one(&sub, now, report).await;
            }
            if !full {
                break;
            }
        }
        Ok(())
    }

    async fn renew_one(&self, sub: &Subscription, now: OffsetDateTime, report: &mut JobReport) {
        report.processed += 1;
        match self.subscriptions.process_renewal(sub.id, now).await {
            Ok(RenewalOutcome::Renewed { .. }) => report.renewed += 1,
            Ok(RenewalOutcome::Canceled { .. }) => report.canceled += 1,
            Ok(RenewalOutcome::PastDue { .. }) | Ok(RenewalOutcome::Unresolved { .. }) => {
                report.failed += 1
            }
            Ok(RenewalOutcome::Skipped { reason }) => {
                tracing::debug!(subscription_id = %sub.id, reason = reason, "Renewal skipped");
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(
                    subscription_id = %sub.id,
                    user_id = %sub.user_id,
                    error = %e,
                    "Renewal failed"
                );
            }
        }
    }

    // =========================================================================
    // Daily quota
    // =========================================================================

    /// Reset every profile's generation quota once per calendar day
    /// in the billing timezone
    pub async fn run_daily_quota_reset(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let started = Instant::now();
        let mut report = JobReport::new(QUOTA_RESET_JOB, now);
        let Some(guard) = self.acquire(&mut report).await? else {
            return Ok(report);
        };
        let outcome = self.reset_quotas(now, &mut report).await;
        Ok(self.finish(guard, report, started, outcome).await)
    }

    async fn reset_quotas(&self, now: OffsetDateTime, report: &mut JobReport) -> BillingResult<()> {
        let today = now.to_offset(self.policy.tz_offset).date();
        let free = self.catalog.free_plan();

        for _ in 0..MAX_BATCHES {
            let due = self
                .store
                .list_profiles_due_for_reset(today, self.policy.batch_size)
                .await?;
            if due.is_empty() {
                break;
            }

            let mut progressed = false;
            for (user_id, plan_id) in due {
                let quota = self
                    .catalog
                    .plan(&plan_id)
                    .map(|p| p.daily_generations)
                    .unwrap_or(free.daily_generations);
                match self.store.reset_daily_quota(user_id, today, quota).await {
                    Ok(applied) => {
                        progressed = true;
                        if applied {
                            report.processed += 1;
                        }
                    }
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(user_id = %user_id, error = %e, "Quota reset failed");
                    }
                }
            }
            if !progressed {
                break;
            }
        }

        tracing::info!(date = %today, reset = report.processed, "Daily quotas reset");
        Ok(())
    }

    // =========================================================================
    // Credit expiry
    // =========================================================================

    /// Expire the unconsumed remainder of grants past their `expires_at`
    pub async fn run_credit_expiry_sweep(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let started = Instant::now();
        let mut report = JobReport::new(CREDIT_EXPIRY_JOB, now);
        let Some(guard) = self.acquire(&mut report).await? else {
            return Ok(report);
        };
        let outcome = self.expire_credits(now, &mut report).await;
        Ok(self.finish(guard, report, started, outcome).await)
    }

    async fn expire_credits(
        &self,
        now: OffsetDateTime,
        report: &mut JobReport,
    ) -> BillingResult<()> {
        for _ in 0..MAX_BATCHES {
            let grants = self
                .store
                .list_expired_grants(now, self.policy.batch_size)
                .await?;
            if grants.is_empty() {
                break;
            }

            let mut progressed = false;
            for grant in grants {
                match self.store.expire_grant(grant.id, now).await {
                    Ok(Some(expiry)) => {
                        progressed = true;
                        report.processed += 1;
                        tracing::info!(
                            user_id = %grant.user_id,
                            grant_id = %grant.id,
                            expired = -expiry.amount,
                            new_balance = expiry.balance_after,
                            "Credits expired"
                        );
                    }
                    Ok(None) => progressed = true,
                    Err(e) => {
                        report.failed += 1;
                        tracing::error!(grant_id = %grant.id, error = %e, "Credit expiry failed");
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Webhook retry
    // =========================================================================

    /// Replay failed webhook deliveries that still have attempts left
    pub async fn run_webhook_retry(&self, now: OffsetDateTime) -> BillingResult<JobReport> {
        let started = Instant::now();
        let mut report = JobReport::new(WEBHOOK_RETRY_JOB, now);
        let Some(guard) = self.acquire(&mut report).await? else {
            return Ok(report);
        };
        let outcome = self.retry_webhooks(&mut report).await;
        Ok(self.finish(guard, report, started, outcome).await)
    }

    async fn retry_webhooks(&self, report: &mut JobReport) -> BillingResult<()> {
        let acks = self.webhooks.replay_failed(self.policy.batch_size).await?;
        for ack in acks {
            report.processed += 1;
            if !ack.accepted {
                report.failed += 1;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CreditTransactionType, NewCreditTransaction};
    use crate::subscriptions::SubscribeRequest;
    use inkwell_shared::BillingCycle;
    use time::Duration;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_held_lock_skips_the_run() {
        let (billing, _, _, _) = crate::edge_case_tests::harness().await;
        let guard = billing
            .lock
            .try_acquire(RENEWAL_JOB, std::time::Duration::from_secs(60))
            .await
            .unwrap()
            .unwrap();

        let report = billing
            .jobs
            .run_renewal_sweep(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(report.skipped);
        assert!(report.success);
        assert_eq!(report.processed, 0);

        billing.lock.release(guard).await.unwrap();
        let report = billing
            .jobs
            .run_renewal_sweep(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(!report.skipped);
    }

    #[tokio::test]
    async fn test_renewal_sweep_renews_due_subscription() {
        let (billing, gateway, _, _) = crate::edge_case_tests::harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "j@example.com").await.unwrap();
        let sub = billing
            .subscriptions
            .subscribe(
                user,
                SubscribeRequest {
                    plan_id: "pro".into(),
                    cycle: BillingCycle::Monthly,
                    auth_key: "auth".into(),
                    customer_key: "cust_j".into(),
                },
            )
            .await
            .unwrap();

        // a day and a half early is outside the 24h lookahead
        let early = sub.current_period_end - Duration::hours(36);
        let report = billing.jobs.run_renewal_sweep(early).await.unwrap();
        assert_eq!(report.processed, 0);

        let within = sub.current_period_end - Duration::hours(12);
        let report = billing.jobs.run_renewal_sweep(within).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.renewed, 1);
        assert_eq!(gateway.charge_count().await, 2);

        let report = billing.jobs.run_renewal_sweep(within).await.unwrap();
        assert_eq!(report.renewed, 0);
        assert_eq!(gateway.charge_count().await, 2);
    }

    #[tokio::test]
    async fn test_renewal_sweep_pages_past_stuck_rows() {
        let (billing, gateway, _, _) = crate::edge_case_tests::harness_with_policy(BillingPolicy {
            batch_size: 2,
            ..BillingPolicy::default()
        })
        .await;

        let mut period_end = OffsetDateTime::now_utc();
        for i in 0..5 {
            let user = Uuid::new_v4();
            billing
                .ensure_profile(user, &format!("page{}@example.com", i))
                .await
                .unwrap();
            let sub = billing
                .subscriptions
                .subscribe(
                    user,
                    SubscribeRequest {
                        plan_id: "pro".into(),
                        cycle: BillingCycle::Monthly,
                        auth_key: format!("auth_{}", i),
                        customer_key: format!("cust_page_{}", i),
                    },
                )
                .await
                .unwrap();
            period_end = period_end.max(sub.current_period_end);
        }
        assert_eq!(gateway.charge_count().await, 5);

        // the two oldest rows come back unresolved and stay due
        for _ in 0..2 {
            gateway
                .fail_next_charge(crate::error::PaymentError::unknown("TIMEOUT", "slow"))
                .await;
        }

        let report = billing
            .jobs
            .run_renewal_sweep(period_end - Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(report.processed, 5);
        assert_eq!(report.failed, 2);
        assert_eq!(report.renewed, 3);
    }

    #[tokio::test]
    async fn test_quota_reset_once_per_day() {
        let (billing, _, _, _) = crate::edge_case_tests::harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "q@example.com").await.unwrap();
        billing
            .ledger
            .consume_daily_generation(user, "gen-1")
            .await
            .unwrap();

        let now = OffsetDateTime::now_utc();
        let report = billing.jobs.run_daily_quota_reset(now).await.unwrap();
        assert!(report.success);
        assert_eq!(report.processed, 1);
        assert_eq!(billing.profile(user).await.unwrap().daily_generations_remaining, 3);

        billing
            .ledger
            .consume_daily_generation(user, "gen-2")
            .await
            .unwrap();
        let report = billing.jobs.run_daily_quota_reset(now).await.unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(billing.profile(user).await.unwrap().daily_generations_remaining, 2);

        let tomorrow = now + Duration::days(1);
        let report = billing.jobs.run_daily_quota_reset(tomorrow).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(billing.profile(user).await.unwrap().daily_generations_remaining, 3);
    }

    #[tokio::test]
    async fn test_expiry_sweep_expires_unspent_remainder() {
        let (billing, _, _, _) = crate::edge_case_tests::harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "e@example.com").await.unwrap();
        let now = OffsetDateTime::now_utc();

        billing
            .ledger
            .apply_transaction(NewCreditTransaction {
                user_id: user,
                tx_type: CreditTransactionType::Purchase,
                amount: 100,
                description: "old pack".into(),
                payment_id: None,
                expires_at: Some(now - Duration::days(1)),
                idempotency_key: Some("grant-old".into()),
            })
            .await
            .unwrap();
        billing
            .ledger
            .apply_transaction(NewCreditTransaction {
                user_id: user,
                tx_type: CreditTransactionType::Purchase,
                amount: 50,
                description: "new pack".into(),
                payment_id: None,
                expires_at: Some(now + Duration::days(30)),
                idempotency_key: Some("grant-new".into()),
            })
            .await
            .unwrap();
        billing
            .ledger
            .debit_credits(user, 30, "op-spend", "generation")
            .await
            .unwrap();

        // FIFO: the 30 spent came out of the old pack, 70 of it remains
        let report = billing.jobs.run_credit_expiry_sweep(now).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 50);

        let again = billing.jobs.run_credit_expiry_sweep(now).await.unwrap();
        assert_eq!(again.processed, 0);
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn test_restored_credits_still_expire() {
        let (billing, _, _, _) = crate::edge_case_tests::harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "r@example.com").await.unwrap();
        let now = OffsetDateTime::now_utc();

        billing
            .ledger
            .apply_transaction(NewCreditTransaction {
                user_id: user,
                tx_type: CreditTransactionType::Purchase,
                amount: 100,
                description: "expired pack".into(),
                payment_id: None,
                expires_at: Some(now - Duration::days(1)),
                idempotency_key: Some("grant-expired".into()),
            })
            .await
            .unwrap();
        billing
            .ledger
            .debit_credits(user, 100, "op-failed", "generation")
            .await
            .unwrap();
        billing
            .ledger
            .restore_credit(user, "op-failed")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 100);

        let report = billing.jobs.run_credit_expiry_sweep(now).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_webhook_retry_job_reports_replays() {
        let (billing, _, _, _) = crate::edge_case_tests::harness().await;
        let report = billing
            .jobs
            .run_webhook_retry(OffsetDateTime::now_utc())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.processed, 0);
        assert_eq!(report.job, WEBHOOK_RETRY_JOB);
    }
}
