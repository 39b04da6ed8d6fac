//! Credit ledger
//!
//! Append-only transaction log with a denormalized balance on the profile.
//! Every write goes through [`BillingStore::apply_credit_transaction`], which
//! locks the profile row, appends the entry with its balance snapshot and
//! updates the balance in one transaction, so
//! `profile.credits_balance == latest entry.balance_after` always holds.
//!
//! Balances clamp at zero: `balance_n = max(0, balance_{n-1} + amount_n)`.
//! Usage debits are the exception and are rejected outright when the
//! balance cannot cover them.
//!
//! Idempotency keys:
//! - `usage:{operation}` / `restore:{operation}` for generation debits and their compensation
//! - `purchase:{payment_id}`, `grant:{payment_id}` for fulfilment
//! - `refund:{payment_id}:{refunded_total}` for refunds
//! - `expiry:{grant_id}` for the expiry sweep

use std::sync::Arc;

use inkwell_shared::PlanCatalog;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerting::AlertSink;
use crate::config::BillingPolicy;
use crate::error::{BillingError, BillingResult};
use crate::models::{
    BalanceMode, CreditTransaction, CreditTransactionType, NewCreditTransaction,
    RESTORE_KEY_PREFIX,
};
use crate::retry::with_persistence_retry;
use crate::store::{BillingStore, DailyQuotaOutcome, LedgerReceipt};

/// Fold signed amounts into a balance, clamping at zero after every step
pub fn fold_balance(amounts: impl IntoIterator<Item = i64>) -> i64 {
    amounts.into_iter().fold(0, |balance, amount| (balance + amount).max(0))
}

/// Unconsumed part of a credit grant under FIFO consumption.
///
/// `history` is the user's full ledger in chronological order. With `c_i`
/// the positive entries and `prefix_i` their running sum, everything that
/// has left the balance (`Σc − balance`) is attributed to the oldest grants
/// first, so grant `i` still holds `clamp(prefix_i − (Σc − balance), 0, c_i)`.
/// Restores are left out of `c`: they raise the balance and so shrink the
/// consumed total instead of becoming a grant of their own.
pub fn fifo_remainder(history: &[CreditTransaction], grant_id: Uuid, balance: i64) -> i64 {
    let total_credits: i64 = history.iter().filter(|t| t.is_credit()).map(|t| t.amount).sum();
    let consumed = (total_credits - balance).max(0);

    let mut prefix = 0i64;
    for tx in history.iter().filter(|t| t.is_credit()) {
        prefix += tx.amount;
        if tx.id == grant_id {
            return (prefix - consumed).clamp(0, tx.amount);
        }
    }
    0
}

pub(crate) fn usage_key(operation_id: &str) -> String {
    format!("usage:{}", operation_id)
}

pub(crate) fn restore_key(operation_id: &str) -> String {
    format!("{}{}", RESTORE_KEY_PREFIX, operation_id)
}

/// Credit ledger service
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn BillingStore>,
    catalog: Arc<PlanCatalog>,
    alerts: Arc<dyn AlertSink>,
    policy: BillingPolicy,
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn BillingStore>,
        catalog: Arc<PlanCatalog>,
        alerts: Arc<dyn AlertSink>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            catalog,
            alerts,
            policy,
        }
    }

    /// Apply one ledger entry atomically, clamping the balance at zero.
    ///
    /// Entries carrying an idempotency key that was already applied return
    /// the original row with `duplicate = true` and change nothing.
    pub async fn apply_transaction(
        &self,
        entry: NewCreditTransaction,
    ) -> BillingResult<LedgerReceipt> {
        self.apply(entry, BalanceMode::Clamp).await
    }

    /// Apply a debit that takes back at most the current balance. The stored
    /// entry carries the amount actually removed.
    pub async fn apply_truncated(
        &self,
        entry: NewCreditTransaction,
    ) -> BillingResult<LedgerReceipt> {
        self.apply(entry, BalanceMode::Truncate).await
    }

    async fn apply(
        &self,
        entry: NewCreditTransaction,
        mode: BalanceMode,
    ) -> BillingResult<LedgerReceipt> {
        if !entry.tx_type.accepts_amount(entry.amount) {
            return Err(BillingError::InvalidAmount(format!(
                "{} entries cannot carry amount {}",
                entry.tx_type, entry.amount
            )));
        }

        let user_id = entry.user_id;
        let tx_type = entry.tx_type;
        let receipt = self
            .store
            .apply_credit_transaction(entry, mode, OffsetDateTime::now_utc())
            .await?;
        let amount = receipt.transaction.amount;

        if receipt.duplicate {
            tracing::debug!(
                user_id = %user_id,
                tx_type = %tx_type,
                key = ?receipt.transaction.idempotency_key,
                "Ledger entry already applied"
            );
        } else {
            tracing::info!(
                user_id = %user_id,
                tx_type = %tx_type,
                amount = amount,
                new_balance = receipt.new_balance,
                "Ledger entry applied"
            );
        }
        Ok(receipt)
    }

    /// Spend credits for a generation. Rejects instead of clamping.
    pub async fn debit_credits(
        &self,
        user_id: Uuid,
        amount: i64,
        operation_id: &str,
        description: &str,
    ) -> BillingResult<LedgerReceipt> {
        if amount <= 0 {
            return Err(BillingError::InvalidAmount(
                "Debit amount must be positive".to_string(),
            ));
        }
        self.apply(
            NewCreditTransaction {
                user_id,
                tx_type: CreditTransactionType::Usage,
                amount: -amount,
                description: description.to_string(),
                payment_id: None,
                expires_at: None,
                idempotency_key: Some(usage_key(operation_id)),
            },
            BalanceMode::Strict,
        )
        .await
    }

    /// Compensate a usage debit whose generation failed downstream.
    ///
    /// Returns `None` when no debit was recorded for `operation_id`.
    /// Idempotent: a second call returns the first restore as a duplicate.
    pub async fn restore_credit(
        &self,
        user_id: Uuid,
        operation_id: &str,
    ) -> BillingResult<Option<LedgerReceipt>> {
        let Some(debit) = self
            .store
            .find_credit_transaction(&usage_key(operation_id))
            .await?
        else {
            tracing::warn!(
                user_id = %user_id,
                operation_id = %operation_id,
                "No usage debit found to restore"
            );
            return Ok(None);
        };

        if debit.user_id != user_id {
            return Err(BillingError::InvalidInput(
                "Operation belongs to a different user".to_string(),
            ));
        }

        let entry = NewCreditTransaction {
            user_id,
            tx_type: CreditTransactionType::AdminAdjustment,
            amount: -debit.amount,
            description: format!("Restore: {}", debit.description),
            payment_id: None,
            expires_at: None,
            idempotency_key: Some(restore_key(operation_id)),
        };

        let entry = &entry;
        let receipt = with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "restore_credit",
            serde_json::json!({
                "user_id": user_id,
                "operation_id": operation_id,
                "amount": -debit.amount,
            }),
            move || async move { self.apply(entry.clone(), BalanceMode::Clamp).await },
        )
        .await?;

        Ok(Some(receipt))
    }

    pub async fn consume_daily_generation(
        &self,
        user_id: Uuid,
        operation_id: &str,
    ) -> BillingResult<DailyQuotaOutcome> {
        let outcome = self
            .store
            .consume_daily_generation(user_id, operation_id)
            .await?;
        tracing::debug!(
            user_id = %user_id,
            remaining = outcome.remaining,
            applied = outcome.applied,
            "Daily generation consumed"
        );
        Ok(outcome)
    }

    /// Give back a consumed daily generation, capped at the plan quota
    pub async fn restore_daily_generation(
        &self,
        user_id: Uuid,
        operation_id: &str,
    ) -> BillingResult<DailyQuotaOutcome> {
        let profile = self
            .store
            .get_profile(user_id)
            .await?
            .ok_or_else(|| BillingError::ProfileNotFound(user_id.to_string()))?;
        let cap = self
            .catalog
            .plan(&profile.plan_id)
            .map(|p| p.daily_generations)
            .unwrap_or_else(|| self.catalog.free_plan().daily_generations);

        let store = &self.store;
        with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "restore_daily_generation",
            serde_json::json!({ "user_id": user_id, "operation_id": operation_id }),
            move || async move {
                store
                    .restore_daily_generation(user_id, operation_id, cap)
                    .await
            },
        )
        .await
    }

    /// Signed manual correction by an operator
    pub async fn admin_adjust(
        &self,
        user_id: Uuid,
        amount: i64,
        reason: &str,
        idempotency_key: Option<String>,
    ) -> BillingResult<LedgerReceipt> {
        if reason.trim().is_empty() {
            return Err(BillingError::InvalidInput(
                "An adjustment reason is required".to_string(),
            ));
        }
        let receipt = self
            .apply(
                NewCreditTransaction {
                    user_id,
                    tx_type: CreditTransactionType::AdminAdjustment,
                    amount,
                    description: format!("Admin adjustment: {}", reason),
                    payment_id: None,
                    expires_at: None,
                    idempotency_key: idempotency_key.map(|k| format!("admin:{}", k)),
                },
                BalanceMode::Clamp,
            )
            .await?;
        tracing::info!(
            user_id = %user_id,
            amount = amount,
            reason = %reason,
            "Admin credit adjustment"
        );
        Ok(receipt)
    }

    pub async fn balance(&self, user_id: Uuid) -> BillingResult<i64> {
        self.store
            .get_profile(user_id)
            .await?
            .map(|p| p.credits_balance)
            .ok_or_else(|| BillingError::ProfileNotFound(user_id.to_string()))
    }

    /// Newest entries first
    pub async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        self.store.credit_history(user_id, limit.clamp(1, 500)).await
    }
}
