//! Billing invariants
//!
//! Read-only consistency checks against the Postgres schema. Run them after a
//! deploy, a webhook replay or a manual correction. A violation carries enough
//! context to find the affected rows; nothing here writes.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Users affected
    pub user_ids: Vec<Uuid>,
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money or credits are wrong
    Critical,
    /// Data inconsistency that needs attention
    High,
    /// Potential issue, should investigate
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
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

const BALANCE_MATCHES_LEDGER: &str = "balance_matches_ledger";
const SINGLE_LIVE_SUBSCRIPTION: &str = "single_live_subscription";
const NON_NEGATIVE_BALANCE: &str = "non_negative_balance";
const COMPLETED_PAYMENT_HAS_PAID_AT: &str = "completed_payment_has_paid_at";
const NO_STALE_PENDING_PAYMENTS: &str = "no_stale_pending_payments";

#[derive(Debug, sqlx::FromRow)]
struct BalanceMismatchRow {
    user_id: Uuid,
    credits_balance: i64,
    ledger_balance: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct MultipleSubsRow {
    user_id: Uuid,
    sub_count: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct NegativeBalanceRow {
    user_id: Uuid,
    credits_balance: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    order_id: String,
    amount: i64,
    created_at: OffsetDateTime,
}

/// Service for running billing invariant checks
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

        for check in Self::available_checks() {
            violations.extend(self.run_check(check).await?);
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        if !violations.is_empty() {
            tracing::error!(
                violations = violations.len(),
                checks_failed = checks_failed,
                "CRITICAL: Billing invariant violations found"
            );
        }

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// The profile balance equals the `balance_after` of the user's newest
    /// ledger entry (or zero with no entries)
    async fn check_balance_matches_ledger(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BalanceMismatchRow> = sqlx::query_as(
            r#"
            SELECT p.user_id, p.credits_balance, latest.balance_after AS ledger_balance
            FROM billing_profiles p
            LEFT JOIN LATERAL (
                SELECT balance_after
                FROM credit_transactions t
                WHERE t.user_id = p.user_id
                ORDER BY t.seq DESC
                LIMIT 1
            ) latest ON TRUE
            WHERE p.credits_balance <> COALESCE(latest.balance_after, 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: BALANCE_MATCHES_LEDGER.to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Profile balance {} differs from ledger balance {}",
                    row.credits_balance,
                    row.ledger_balance.unwrap_or(0)
                ),
                context: serde_json::json!({
                    "credits_balance": row.credits_balance,
                    "ledger_balance": row.ledger_balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// At most one trialing/active/past_due/paused subscription per user
    async fn check_single_live_subscription(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<MultipleSubsRow> = sqlx::query_as(
            r#"
            SELECT user_id, COUNT(*) AS sub_count
            FROM subscriptions
            WHERE status IN ('trialing', 'active', 'past_due', 'paused')
            GROUP BY user_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: SINGLE_LIVE_SUBSCRIPTION.to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "User has {} live subscriptions (expected 1)",
                    row.sub_count
                ),
                context: serde_json::json!({ "subscription_count": row.sub_count }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_non_negative_balance(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeBalanceRow> = sqlx::query_as(
            r#"
            SELECT user_id, credits_balance
            FROM billing_profiles
            WHERE credits_balance < 0
            UNION
            SELECT user_id, MIN(balance_after) AS credits_balance
            FROM credit_transactions
            WHERE balance_after < 0
            GROUP BY user_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: NON_NEGATIVE_BALANCE.to_string(),
                user_ids: vec![row.user_id],
                description: format!("Negative credit balance {}", row.credits_balance),
                context: serde_json::json!({ "credits_balance": row.credits_balance }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    async fn check_completed_payment_has_paid_at(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, order_id, amount, created_at
            FROM payments
            WHERE status IN ('completed', 'partial_refunded', 'refunded')
              AND paid_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: COMPLETED_PAYMENT_HAS_PAID_AT.to_string(),
                user_ids: vec![row.user_id],
                description: format!("Settled payment {} has no paid_at", row.order_id),
                context: serde_json::json!({
                    "payment_id": row.id,
                    "order_id": row.order_id,
                    "amount": row.amount,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Pending payments older than a day were abandoned or lost a callback
    async fn check_no_stale_pending_payments(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<PaymentRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, order_id, amount, created_at
            FROM payments
            WHERE status = 'pending'
              AND created_at < NOW() - INTERVAL '24 hours'
            ORDER BY created_at
            LIMIT 500
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: NO_STALE_PENDING_PAYMENTS.to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Payment {} pending since {}",
                    row.order_id, row.created_at
                ),
                context: serde_json::json!({
                    "payment_id": row.id,
                    "order_id": row.order_id,
                    "amount": row.amount,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            BALANCE_MATCHES_LEDGER => self.check_balance_matches_ledger().await,
            SINGLE_LIVE_SUBSCRIPTION => self.check_single_live_subscription().await,
            NON_NEGATIVE_BALANCE => self.check_non_negative_balance().await,
            COMPLETED_PAYMENT_HAS_PAID_AT => self.check_completed_payment_has_paid_at().await,
            NO_STALE_PENDING_PAYMENTS => self.check_no_stale_pending_payments().await,
            _ => Ok(vec![]),
        }
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            BALANCE_MATCHES_LEDGER,
            SINGLE_LIVE_SUBSCRIPTION,
            NON_NEGATIVE_BALANCE,
            COMPLETED_PAYMENT_HAS_PAID_AT,
            NO_STALE_PENDING_PAYMENTS,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"balance_matches_ledger"));
        assert!(checks.contains(&"single_live_subscription"));
    }
}
