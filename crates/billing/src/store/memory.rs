//! In-memory store for tests and local development
//!
//! One `tokio::sync::Mutex` guards the whole state, which gives every trait
//! method the same all-or-nothing behaviour the Postgres store gets from a
//! transaction.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    consume_marker, expiry_key, restore_marker, settle_entry_amount, BillingStore,
    DailyQuotaOutcome, LedgerReceipt, SubscriptionCursor,
};
use crate::error::{BillingError, BillingResult};
use crate::ledger::fifo_remainder;
use crate::models::{
    BalanceMode, BillingKey, CreditTransaction, CreditTransactionType, NewCreditTransaction,
    Payment, PaymentStatus, PaymentUpdate, Profile, Subscription, SubscriptionStatus, WebhookLog,
    WebhookStatus,
};

#[derive(Default)]
struct MemoryState {
    profiles: HashMap<Uuid, Profile>,
    /// Append-only, in insertion order
    ledger: Vec<CreditTransaction>,
    markers: HashSet<String>,
    payments: HashMap<Uuid, Payment>,
    billing_keys: HashMap<Uuid, BillingKey>,
    subscriptions: HashMap<Uuid, Subscription>,
    webhook_logs: HashMap<Uuid, WebhookLog>,
}

impl MemoryState {
    fn profile_mut(&mut self, user_id: Uuid) -> BillingResult<&mut Profile> {
        self.profiles
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::ProfileNotFound(user_id.to_string()))
    }

    fn ledger_by_key(&self, key: &str) -> Option<&CreditTransaction> {
        self.ledger
            .iter()
            .find(|t| t.idempotency_key.as_deref() == Some(key))
    }

    fn has_live_subscription(&self, user_id: Uuid, except: Option<Uuid>) -> bool {
        self.subscriptions.values().any(|s| {
            s.user_id == user_id && s.status.is_live() && Some(s.id) != except
        })
    }

    fn append_entry(
        &mut self,
        entry: NewCreditTransaction,
        balance_after: i64,
        now: OffsetDateTime,
    ) -> BillingResult<CreditTransaction> {
        let transaction = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            tx_type: entry.tx_type,
            amount: entry.amount,
            balance_after,
            description: entry.description,
            payment_id: entry.payment_id,
            expires_at: entry.expires_at,
            idempotency_key: entry.idempotency_key,
            created_at: now,
        };
        self.ledger.push(transaction.clone());
        let profile = self.profile_mut(transaction.user_id)?;
        profile.credits_balance = balance_after;
        profile.updated_at = now;
        Ok(transaction)
    }
}

/// Mutex-guarded in-memory `BillingStore`
#[derive(Default)]
pub struct MemoryBillingStore {
    state: Mutex<MemoryState>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Full ledger for a user in insertion order (test helper)
    pub async fn ledger_for(&self, user_id: Uuid) -> Vec<CreditTransaction> {
        let state = self.state.lock().await;
        state
            .ledger
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect()
    }

    /// All subscriptions of a user, live or not (test helper)
    pub async fn subscriptions_for(&self, user_id: Uuid) -> Vec<Subscription> {
        let state = self.state.lock().await;
        state
            .subscriptions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect()
    }
}

fn keyset_page(
    rows: &mut Vec<(SubscriptionCursor, Subscription)>,
    after: Option<SubscriptionCursor>,
    limit: i64,
) -> Vec<Subscription> {
    rows.sort_by_key(|(c, _)| (c.at, c.id));
    rows.drain(..)
        .filter(|(c, _)| after.is_none_or(|a| (c.at, c.id) > (a.at, a.id)))
        .take(limit.max(0) as usize)
        .map(|(_, s)| s)
        .collect()
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn ensure_profile(
        &self,
        user_id: Uuid,
        email: &str,
        daily_generations: i32,
    ) -> BillingResult<Profile> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let profile = state.profiles.entry(user_id).or_insert_with(|| Profile {
            user_id,
            email: email.to_string(),
            plan_id: inkwell_shared::plans::FREE_PLAN_ID.to_string(),
            credits_balance: 0,
            daily_generations_remaining: daily_generations,
            daily_reset_on: None,
            created_at: now,
            updated_at: now,
        });
        Ok(profile.clone())
    }

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        Ok(self.state.lock().await.profiles.get(&user_id).cloned())
    }

    async fn set_profile_plan(
        &self,
        user_id: Uuid,
        plan_id: &str,
        reset_quota_to: Option<i32>,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let profile = state.profile_mut(user_id)?;
        profile.plan_id = plan_id.to_string();
        if let Some(quota) = reset_quota_to {
            profile.daily_generations_remaining = quota;
        }
        profile.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list_profiles_due_for_reset(
        &self,
        today: Date,
        limit: i64,
    ) -> BillingResult<Vec<(Uuid, String)>> {
        let state = self.state.lock().await;
        let mut due: Vec<(Uuid, String)> = state
            .profiles
            .values()
            .filter(|p| p.daily_reset_on.is_none_or(|d| d < today))
            .map(|p| (p.user_id, p.plan_id.clone()))
            .collect();
        due.sort_by_key(|(id, _)| *id);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn reset_daily_quota(
        &self,
        user_id: Uuid,
        today: Date,
        quota: i32,
    ) -> BillingResult<bool> {
        let mut state = self.state.lock().await;
        let profile = state.profile_mut(user_id)?;
        if profile.daily_reset_on.is_some_and(|d| d >= today) {
            return Ok(false);
        }
        profile.daily_generations_remaining = quota;
        profile.daily_reset_on = Some(today);
        profile.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn consume_daily_generation(
        &self,
        user_id: Uuid,
        operation_key: &str,
    ) -> BillingResult<DailyQuotaOutcome> {
        let mut state = self.state.lock().await;
        let marker = consume_marker(operation_key);
        let already = state.markers.contains(&marker);
        let profile = state.profile_mut(user_id)?;

        if already {
            return Ok(DailyQuotaOutcome {
                remaining: profile.daily_generations_remaining,
                applied: false,
            });
        }
        if profile.daily_generations_remaining <= 0 {
            return Err(BillingError::DailyQuotaExhausted);
        }
        profile.daily_generations_remaining -= 1;
        let remaining = profile.daily_generations_remaining;
        state.markers.insert(marker);

        Ok(DailyQuotaOutcome {
            remaining,
            applied: true,
        })
    }

    async fn restore_daily_generation(
        &self,
        user_id: Uuid,
        operation_key: &str,
        cap: i32,
    ) -> BillingResult<DailyQuotaOutcome> {
        let mut state = self.state.lock().await;
        let consumed = state.markers.contains(&consume_marker(operation_key));
        let marker = restore_marker(operation_key);
        let already = state.markers.contains(&marker);
        let profile = state.profile_mut(user_id)?;

        if !consumed || already {
            return Ok(DailyQuotaOutcome {
                remaining: profile.daily_generations_remaining,
                applied: false,
            });
        }
        profile.daily_generations_remaining = (profile.daily_generations_remaining + 1).min(cap);
        let remaining = profile.daily_generations_remaining;
        state.markers.insert(marker);

        Ok(DailyQuotaOutcome {
            remaining,
            applied: true,
        })
    }

    async fn apply_credit_transaction(
        &self,
        entry: NewCreditTransaction,
        mode: BalanceMode,
        now: OffsetDateTime,
    ) -> BillingResult<LedgerReceipt> {
        let mut state = self.state.lock().await;

        let balance = state.profile_mut(entry.user_id)?.credits_balance;

        if let Some(existing) = entry
            .idempotency_key
            .as_deref()
            .and_then(|key| state.ledger_by_key(key))
        {
            return Ok(LedgerReceipt {
                transaction: existing.clone(),
                new_balance: balance,
                duplicate: true,
            });
        }

        let mut entry = entry;
        let new_balance = settle_entry_amount(balance, &mut entry, mode)?;
        let transaction = state.append_entry(entry, new_balance, now)?;

        Ok(LedgerReceipt {
            transaction,
            new_balance,
            duplicate: false,
        })
    }

    async fn find_credit_transaction(
        &self,
        idempotency_key: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        Ok(self
            .state
            .lock()
            .await
            .ledger_by_key(idempotency_key)
            .cloned())
    }

    async fn credit_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .rev()
            .filter(|t| t.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_expired_grants(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let state = self.state.lock().await;
        let mut grants: Vec<CreditTransaction> = state
            .ledger
            .iter()
            .filter(|t| t.is_credit())
            .filter(|t| t.expires_at.is_some_and(|at| at <= now))
            .filter(|t| !state.markers.contains(&expiry_key(t.id)))
            .cloned()
            .collect();
        grants.sort_by_key(|t| t.expires_at);
        grants.truncate(limit.max(0) as usize);
        Ok(grants)
    }

    async fn expire_grant(
        &self,
        grant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CreditTransaction>> {
        let mut state = self.state.lock().await;
        let key = expiry_key(grant_id);
        if state.markers.contains(&key) {
            return Ok(None);
        }

        let grant = state
            .ledger
            .iter()
            .find(|t| t.id == grant_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("Credit grant {}", grant_id)))?;

        let balance = state.profile_mut(grant.user_id)?.credits_balance;
        let history: Vec<CreditTransaction> = state
            .ledger
            .iter()
            .filter(|t| t.user_id == grant.user_id)
            .cloned()
            .collect();
        let remainder = fifo_remainder(&history, grant_id, balance);

        state.markers.insert(key.clone());
        if remainder <= 0 {
            return Ok(None);
        }

        let entry = NewCreditTransaction {
            user_id: grant.user_id,
            tx_type: CreditTransactionType::Expiry,
            amount: -remainder,
            description: format!("Expired credits from {}", grant.description),
            payment_id: grant.payment_id,
            expires_at: None,
            idempotency_key: Some(key),
        };
        let new_balance = (balance - remainder).max(0);
        Ok(Some(state.append_entry(entry, new_balance, now)?))
    }

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let duplicate = state.payments.values().any(|p| {
            p.order_id == payment.order_id
                || (payment.payment_key.is_some() && p.payment_key == payment.payment_key)
        });
        if duplicate {
            return Err(BillingError::Database(format!(
                "duplicate order id {}",
                payment.order_id
            )));
        }
        state.payments.insert(payment.id, payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        Ok(self.state.lock().await.payments.get(&id).cloned())
    }

    async fn get_payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.order_id == order_id)
            .cloned())
    }

    async fn get_payment_by_key(&self, payment_key: &str) -> BillingResult<Option<Payment>> {
        let state = self.state.lock().await;
        Ok(state
            .payments
            .values()
            .find(|p| p.payment_key.as_deref() == Some(payment_key))
            .cloned())
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        update: PaymentUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Payment>> {
        let mut state = self.state.lock().await;

        if let Some(key) = update.payment_key.as_deref() {
            let taken = state
                .payments
                .values()
                .any(|p| p.id != id && p.payment_key.as_deref() == Some(key));
            if taken {
                return Err(BillingError::Database(format!(
                    "payment key {} already recorded",
                    key
                )));
            }
        }

        let Some(payment) = state.payments.get_mut(&id) else {
            return Err(BillingError::PaymentNotFound(id.to_string()));
        };
        if payment.status != from {
            return Ok(None);
        }

        payment.status = to;
        if update.payment_key.is_some() {
            payment.payment_key = update.payment_key;
        }
        if update.failure_code.is_some() {
            payment.failure_code = update.failure_code;
        }
        if update.failure_reason.is_some() {
            payment.failure_reason = update.failure_reason;
        }
        if update.gateway_secret.is_some() {
            payment.gateway_secret = update.gateway_secret;
        }
        if update.paid_at.is_some() {
            payment.paid_at = update.paid_at;
        }
        if let Some(refunded) = update.refunded_amount {
            payment.refunded_amount = refunded;
        }
        payment.updated_at = now;

        Ok(Some(payment.clone()))
    }

    async fn list_payments_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Payment>> {
        let state = self.state.lock().await;
        let mut payments: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        payments.truncate(limit.max(0) as usize);
        Ok(payments)
    }

    async fn insert_billing_key(&self, key: &BillingKey) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        for existing in state.billing_keys.values_mut() {
            if existing.user_id == key.user_id {
                existing.is_default = false;
            }
        }
        state.billing_keys.insert(key.id, key.clone());
        Ok(())
    }

    async fn get_billing_key(&self, id: Uuid) -> BillingResult<Option<BillingKey>> {
        Ok(self.state.lock().await.billing_keys.get(&id).cloned())
    }

    async fn default_billing_key(&self, user_id: Uuid) -> BillingResult<Option<BillingKey>> {
        let state = self.state.lock().await;
        Ok(state
            .billing_keys
            .values()
            .find(|k| k.user_id == user_id && k.is_default)
            .cloned())
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if subscription.status.is_live()
            && state.has_live_subscription(subscription.user_id, None)
        {
            return Err(BillingError::SubscriptionAlreadyActive);
        }
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&id).cloned())
    }

    async fn live_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.user_id == user_id && s.status.is_live())
            .cloned())
    }

    async fn subscription_for_payment(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let state = self.state.lock().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.latest_payment_id == Some(payment_id))
            .cloned())
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Subscription> {
        let mut state = self.state.lock().await;

        if subscription.status.is_live()
            && state.has_live_subscription(subscription.user_id, Some(subscription.id))
        {
            return Err(BillingError::SubscriptionAlreadyActive);
        }

        let stored = state
            .subscriptions
            .get_mut(&subscription.id)
            .ok_or(BillingError::SubscriptionNotFound)?;
        if stored.version != subscription.version {
            return Err(BillingError::ConcurrentModification(format!(
                "Subscription {} was modified by another process",
                subscription.id
            )));
        }

        let mut next = subscription.clone();
        next.version += 1;
        next.updated_at = OffsetDateTime::now_utc();
        *stored = next.clone();
        Ok(next)
    }

    async fn list_due_subscriptions(
        &self,
        until: OffsetDateTime,
        after: Option<SubscriptionCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut due: Vec<(SubscriptionCursor, Subscription)> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::Active && s.current_period_end <= until)
            .map(|s| (SubscriptionCursor::new(s.current_period_end, s.id), s.clone()))
            .collect();
        Ok(keyset_page(&mut due, after, limit))
    }

    async fn list_retry_due_subscriptions(
        &self,
        now: OffsetDateTime,
        after: Option<SubscriptionCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let state = self.state.lock().await;
        let mut due: Vec<(SubscriptionCursor, Subscription)> = state
            .subscriptions
            .values()
            .filter(|s| s.status == SubscriptionStatus::PastDue)
            .filter_map(|s| {
                s.next_retry_at
                    .filter(|at| *at <= now)
                    .map(|at| (SubscriptionCursor::new(at, s.id), s.clone()))
            })
            .collect();
        Ok(keyset_page(&mut due, after, limit))
    }

    async fn insert_webhook_log(&self, log: &WebhookLog) -> BillingResult<()> {
        self.state
            .lock()
            .await
            .webhook_logs
            .insert(log.id, log.clone());
        Ok(())
    }

    async fn get_webhook_log(&self, id: Uuid) -> BillingResult<Option<WebhookLog>> {
        Ok(self.state.lock().await.webhook_logs.get(&id).cloned())
    }

    async fn finish_webhook_log(
        &self,
        id: Uuid,
        status: WebhookStatus,
        last_error: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookLog> {
        let mut state = self.state.lock().await;
        let log = state
            .webhook_logs
            .get_mut(&id)
            .ok_or_else(|| BillingError::NotFound(format!("Webhook log {}", id)))?;

        log.status = status;
        log.last_error = last_error;
        match status {
            WebhookStatus::Failed => log.retry_count += 1,
            WebhookStatus::Processed => log.processed_at = Some(now),
            WebhookStatus::Pending => {}
        }
        Ok(log.clone())
    }

    async fn list_webhook_logs(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let state = self.state.lock().await;
        let mut logs: Vec<WebhookLog> = state
            .webhook_logs
            .values()
            .filter(|l| status.is_none_or(|s| l.status == s))
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }

    async fn list_retryable_webhook_logs(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let state = self.state.lock().await;
        let mut logs: Vec<WebhookLog> = state
            .webhook_logs
            .values()
            .filter(|l| l.status == WebhookStatus::Failed && l.retry_count < max_retries)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.created_at);
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }
}
