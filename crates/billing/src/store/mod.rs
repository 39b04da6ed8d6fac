//! Persistence seam for the billing engine
//!
//! Every balance-bearing mutation is a single store call so that the
//! implementation can make it atomic (a Postgres transaction holding the
//! profile row lock, or the in-memory store's mutex).

mod memory;
mod postgres;

pub use memory::MemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use serde::Serialize;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{
    BalanceMode, BillingKey, CreditTransaction, NewCreditTransaction, Payment, PaymentStatus,
    PaymentUpdate, Profile, Subscription, WebhookLog, WebhookStatus,
};

/// Result of a ledger write
#[derive(Debug, Clone, Serialize)]
pub struct LedgerReceipt {
    pub transaction: CreditTransaction,
    pub new_balance: i64,
    /// The idempotency key had already been applied; `transaction` is the original row
    pub duplicate: bool,
}

/// Result of a daily-generation counter operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyQuotaOutcome {
    pub remaining: i32,
    /// False when the operation key had already been applied (or nothing to restore)
    pub applied: bool,
}

/// Keyset position in a subscription sweep: the sort timestamp and id of the
/// last row already seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionCursor {
    pub at: OffsetDateTime,
    pub id: Uuid,
}

impl SubscriptionCursor {
    pub fn new(at: OffsetDateTime, id: Uuid) -> Self {
        Self { at, id }
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // -------------------------------------------------------------------------
    // Profiles and daily quota
    // -------------------------------------------------------------------------

    /// Create the profile if missing; returns the current row either way
    async fn ensure_profile(
        &self,
        user_id: Uuid,
        email: &str,
        daily_generations: i32,
    ) -> BillingResult<Profile>;

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>>;

    /// Switch the entitled plan; `reset_quota_to` also overwrites today's remaining quota
    async fn set_profile_plan(
        &self,
        user_id: Uuid,
        plan_id: &str,
        reset_quota_to: Option<i32>,
    ) -> BillingResult<()>;

    /// Profiles whose quota was last reset before `today`, as `(user_id, plan_id)`
    async fn list_profiles_due_for_reset(
        &self,
        today: Date,
        limit: i64,
    ) -> BillingResult<Vec<(Uuid, String)>>;

    /// Reset to `quota` unless the profile was already reset on `today`
    async fn reset_daily_quota(&self, user_id: Uuid, today: Date, quota: i32)
        -> BillingResult<bool>;

    /// Decrement the remaining quota once per `operation_key`
    async fn consume_daily_generation(
        &self,
        user_id: Uuid,
        operation_key: &str,
    ) -> BillingResult<DailyQuotaOutcome>;

    /// Give back one generation for a consumed `operation_key`, at most once, capped at `cap`
    async fn restore_daily_generation(
        &self,
        user_id: Uuid,
        operation_key: &str,
        cap: i32,
    ) -> BillingResult<DailyQuotaOutcome>;

    // -------------------------------------------------------------------------
    // Credit ledger
    // -------------------------------------------------------------------------

    /// Append a ledger row and update the balance in one atomic unit
    async fn apply_credit_transaction(
        &self,
        entry: NewCreditTransaction,
        mode: BalanceMode,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerReceipt>;

    async fn find_credit_transaction(
        &self,
        idempotency_key: &str,
    ) -> BillingResult<Option<CreditTransaction>>;

    /// Newest first
    async fn credit_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>>;

    /// Positive entries past `expires_at` that the expiry sweep has not handled yet
    async fn list_expired_grants(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>>;

    /// Expire the unconsumed FIFO remainder of `grant_id` at most once.
    /// Returns the expiry entry, or `None` when there was nothing left or it already ran.
    async fn expire_grant(
        &self,
        grant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CreditTransaction>>;

    // -------------------------------------------------------------------------
    // Payments
    // -------------------------------------------------------------------------

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<()>;

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<Payment>>;

    async fn get_payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<Payment>>;

    async fn get_payment_by_key(&self, payment_key: &str) -> BillingResult<Option<Payment>>;

    /// Compare-and-set the status. `None` means the payment was not in `from`.
    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        update: PaymentUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Payment>>;

    async fn list_payments_for_user(&self, user_id: Uuid, limit: i64)
        -> BillingResult<Vec<Payment>>;

    // -------------------------------------------------------------------------
    // Billing keys
    // -------------------------------------------------------------------------

    /// Store a new default key, demoting the previous default
    async fn insert_billing_key(&self, key: &BillingKey) -> BillingResult<()>;

    async fn get_billing_key(&self, id: Uuid) -> BillingResult<Option<BillingKey>>;

    async fn default_billing_key(&self, user_id: Uuid) -> BillingResult<Option<BillingKey>>;

    // -------------------------------------------------------------------------
    // Subscriptions
    // -------------------------------------------------------------------------

    /// Fails with `SubscriptionAlreadyActive` if the user has a live subscription
    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()>;

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn live_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>>;

    async fn subscription_for_payment(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Option<Subscription>>;

    /// Write all mutable fields if `subscription.version` is still current.
    /// Returns the stored row with the bumped version, or `ConcurrentModification`.
    async fn update_subscription(&self, subscription: &Subscription)
        -> BillingResult<Subscription>;

    /// Active subscriptions with `current_period_end <= until`, ordered by
    /// `(current_period_end, id)` and starting strictly after `after`
    async fn list_due_subscriptions(
        &self,
        until: OffsetDateTime,
        after: Option<SubscriptionCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    /// Past-due subscriptions with `next_retry_at <= now`, ordered by
    /// `(next_retry_at, id)` and starting strictly after `after`
    async fn list_retry_due_subscriptions(
        &self,
        now: OffsetDateTime,
        after: Option<SubscriptionCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>>;

    // -------------------------------------------------------------------------
    // Webhook log
    // -------------------------------------------------------------------------

    async fn insert_webhook_log(&self, log: &WebhookLog) -> BillingResult<()>;

    async fn get_webhook_log(&self, id: Uuid) -> BillingResult<Option<WebhookLog>>;

    /// Record the outcome; a `Failed` outcome increments `retry_count`
    async fn finish_webhook_log(
        &self,
        id: Uuid,
        status: WebhookStatus,
        last_error: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookLog>;

    /// Newest first
    async fn list_webhook_logs(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>>;

    /// Failed logs with `retry_count < max_retries`, oldest first
    async fn list_retryable_webhook_logs(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>>;
}

/// Marker keys used by the stores
/// Resolve the amount an entry really applies against `balance` and the
/// balance after it. `Strict` debits beyond the balance are rejected.
pub(crate) fn settle_entry_amount(
    balance: i64,
    entry: &mut NewCreditTransaction,
    mode: BalanceMode,
) -> BillingResult<i64> {
    let raw = balance + entry.amount;
    if raw >= 0 {
        return Ok(raw);
    }
    match mode {
        BalanceMode::Strict => Err(BillingError::InsufficientCredits {
            balance,
            requested: -entry.amount,
        }),
        BalanceMode::Clamp => Ok(0),
        BalanceMode::Truncate => {
            entry.amount = -balance;
            Ok(0)
        }
    }
}

pub(crate) fn consume_marker(operation_key: &str) -> String {
    format!("gen:{}", operation_key)
}

pub(crate) fn restore_marker(operation_key: &str) -> String {
    format!("restore-gen:{}", operation_key)
}

pub(crate) fn expiry_key(grant_id: Uuid) -> String {
    format!("expiry:{}", grant_id)
}
