//! Postgres-backed `BillingStore`
//!
//! Balance and quota changes take the profile row lock (`SELECT ... FOR UPDATE`)
//! inside a transaction, so concurrent debits for the same user serialize.
//! Subscriptions use the `version` column for optimistic concurrency.

use async_trait::async_trait;
use inkwell_shared::BillingCycle;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{
    consume_marker, expiry_key, restore_marker, settle_entry_amount, BillingStore,
    DailyQuotaOutcome, LedgerReceipt, SubscriptionCursor,
};
use crate::error::{BillingError, BillingResult};
use crate::ledger::fifo_remainder;
use crate::models::{
    BalanceMode, BillingKey, CreditTransaction, CreditTransactionType, NewCreditTransaction,
    Payment, PaymentStatus, PaymentUpdate, Profile, Subscription, WebhookLog, WebhookStatus,
};

const PROFILE_COLUMNS: &str = "user_id, email, plan_id, credits_balance, \
    daily_generations_remaining, daily_reset_on, created_at, updated_at";

const CREDIT_TX_COLUMNS: &str = "id, user_id, tx_type, amount, balance_after, description, \
    payment_id, expires_at, idempotency_key, created_at";

const PAYMENT_COLUMNS: &str = "id, user_id, order_id, payment_key, payment_type, status, amount, \
    refunded_amount, metadata, failure_code, failure_reason, gateway_secret, paid_at, \
    created_at, updated_at";

const BILLING_KEY_COLUMNS: &str = "id, user_id, customer_key, encrypted_key, card_company, \
    card_number_masked, is_default, created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, billing_cycle, status, \
    current_period_start, current_period_end, cancel_at_period_end, canceled_at, retry_count, \
    next_retry_at, scheduled_plan_id, scheduled_cycle, billing_key_id, latest_payment_id, \
    version, created_at, updated_at";

const WEBHOOK_COLUMNS: &str =
    "id, event_type, payload, status, retry_count, last_error, processed_at, created_at";

const LIVE_SUBSCRIPTION_INDEX: &str = "idx_subscriptions_live_user";

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct ProfileRow {
    user_id: Uuid,
    email: String,
    plan_id: String,
    credits_balance: i64,
    daily_generations_remaining: i32,
    daily_reset_on: Option<Date>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl From<ProfileRow> for Profile {
    fn from(row: ProfileRow) -> Self {
        Profile {
            user_id: row.user_id,
            email: row.email,
            plan_id: row.plan_id,
            credits_balance: row.credits_balance,
            daily_generations_remaining: row.daily_generations_remaining,
            daily_reset_on: row.daily_reset_on,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CreditTxRow {
    id: Uuid,
    user_id: Uuid,
    tx_type: String,
    amount: i64,
    balance_after: i64,
    description: String,
    payment_id: Option<Uuid>,
    expires_at: Option<OffsetDateTime>,
    idempotency_key: Option<String>,
    created_at: OffsetDateTime,
}

impl TryFrom<CreditTxRow> for CreditTransaction {
    type Error = BillingError;

    fn try_from(row: CreditTxRow) -> Result<Self, Self::Error> {
        Ok(CreditTransaction {
            id: row.id,
            user_id: row.user_id,
            tx_type: row.tx_type.parse()?,
            amount: row.amount,
            balance_after: row.balance_after,
            description: row.description,
            payment_id: row.payment_id,
            expires_at: row.expires_at,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PaymentRow {
    id: Uuid,
    user_id: Uuid,
    order_id: String,
    payment_key: Option<String>,
    payment_type: String,
    status: String,
    amount: i64,
    refunded_amount: i64,
    metadata: serde_json::Value,
    failure_code: Option<String>,
    failure_reason: Option<String>,
    gateway_secret: Option<String>,
    paid_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<PaymentRow> for Payment {
    type Error = BillingError;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        Ok(Payment {
            id: row.id,
            user_id: row.user_id,
            order_id: row.order_id,
            payment_key: row.payment_key,
            payment_type: row.payment_type.parse()?,
            status: row.status.parse()?,
            amount: row.amount,
            refunded_amount: row.refunded_amount,
            metadata: serde_json::from_value(row.metadata)?,
            failure_code: row.failure_code,
            failure_reason: row.failure_reason,
            gateway_secret: row.gateway_secret,
            paid_at: row.paid_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BillingKeyRow {
    id: Uuid,
    user_id: Uuid,
    customer_key: String,
    encrypted_key: String,
    card_company: Option<String>,
    card_number_masked: Option<String>,
    is_default: bool,
    created_at: OffsetDateTime,
}

impl From<BillingKeyRow> for BillingKey {
    fn from(row: BillingKeyRow) -> Self {
        BillingKey {
            id: row.id,
            user_id: row.user_id,
            customer_key: row.customer_key,
            encrypted_key: row.encrypted_key,
            card_company: row.card_company,
            card_number_masked: row.card_number_masked,
            is_default: row.is_default,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: String,
    billing_cycle: String,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    canceled_at: Option<OffsetDateTime>,
    retry_count: i32,
    next_retry_at: Option<OffsetDateTime>,
    scheduled_plan_id: Option<String>,
    scheduled_cycle: Option<String>,
    billing_key_id: Option<Uuid>,
    latest_payment_id: Option<Uuid>,
    version: i64,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

fn parse_cycle(value: &str) -> BillingResult<BillingCycle> {
    value
        .parse()
        .map_err(|e| BillingError::Database(format!("Corrupt billing cycle: {}", e)))
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            billing_cycle: parse_cycle(&row.billing_cycle)?,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            canceled_at: row.canceled_at,
            retry_count: row.retry_count,
            next_retry_at: row.next_retry_at,
            scheduled_plan_id: row.scheduled_plan_id,
            scheduled_cycle: row.scheduled_cycle.as_deref().map(parse_cycle).transpose()?,
            billing_key_id: row.billing_key_id,
            latest_payment_id: row.latest_payment_id,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WebhookRow {
    id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    processed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<WebhookRow> for WebhookLog {
    type Error = BillingError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        Ok(WebhookLog {
            id: row.id,
            event_type: row.event_type,
            payload: row.payload,
            status: row.status.parse()?,
            retry_count: row.retry_count,
            last_error: row.last_error,
            processed_at: row.processed_at,
            created_at: row.created_at,
        })
    }
}

fn convert_all<R, T>(rows: Vec<R>) -> BillingResult<Vec<T>>
where
    T: TryFrom<R, Error = BillingError>,
{
    rows.into_iter().map(T::try_from).collect()
}

fn violates(e: &sqlx::Error, constraint: &str) -> bool {
    e.as_database_error()
        .and_then(|db| db.constraint())
        .is_some_and(|c| c == constraint)
}

// =============================================================================
// Store
// =============================================================================

#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the profile row and return the current balance
    async fn lock_profile(
        tx: &mut Transaction<'_, Postgres>,
        user_id: Uuid,
    ) -> BillingResult<ProfileRow> {
        let sql = format!(
            "SELECT {} FROM billing_profiles WHERE user_id = $1 FOR UPDATE",
            PROFILE_COLUMNS
        );
        sqlx::query_as::<_, ProfileRow>(&sql)
            .bind(user_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| BillingError::ProfileNotFound(user_id.to_string()))
    }

    async fn marker_exists(
        tx: &mut Transaction<'_, Postgres>,
        operation_key: &str,
    ) -> BillingResult<bool> {
        let found: Option<(String,)> =
            sqlx::query_as("SELECT operation_key FROM operation_markers WHERE operation_key = $1")
                .bind(operation_key)
                .fetch_optional(&mut **tx)
                .await?;
        Ok(found.is_some())
    }

    async fn insert_marker(
        tx: &mut Transaction<'_, Postgres>,
        operation_key: &str,
        user_id: Uuid,
    ) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO operation_markers (operation_key, user_id) VALUES ($1, $2) \
             ON CONFLICT (operation_key) DO NOTHING",
        )
        .bind(operation_key)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn append_entry(
        tx: &mut Transaction<'_, Postgres>,
        entry: NewCreditTransaction,
        balance_after: i64,
        now: OffsetDateTime,
    ) -> BillingResult<CreditTransaction> {
        let sql = format!(
            r#"
            INSERT INTO credit_transactions
                (id, user_id, tx_type, amount, balance_after, description,
                 payment_id, expires_at, idempotency_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING {}
            "#,
            CREDIT_TX_COLUMNS
        );
        let row: CreditTxRow = sqlx::query_as(&sql)
            .bind(Uuid::new_v4())
            .bind(entry.user_id)
            .bind(entry.tx_type.as_str())
            .bind(entry.amount)
            .bind(balance_after)
            .bind(&entry.description)
            .bind(entry.payment_id)
            .bind(entry.expires_at)
            .bind(&entry.idempotency_key)
            .bind(now)
            .fetch_one(&mut **tx)
            .await?;

        sqlx::query(
            "UPDATE billing_profiles SET credits_balance = $2, updated_at = $3 WHERE user_id = $1",
        )
        .bind(entry.user_id)
        .bind(balance_after)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        row.try_into()
    }

    async fn find_entry(
        tx: &mut Transaction<'_, Postgres>,
        idempotency_key: &str,
    ) -> BillingResult<Option<CreditTransaction>> {
        let sql = format!(
            "SELECT {} FROM credit_transactions WHERE idempotency_key = $1",
            CREDIT_TX_COLUMNS
        );
        sqlx::query_as::<_, CreditTxRow>(&sql)
            .bind(idempotency_key)
            .fetch_optional(&mut **tx)
            .await?
            .map(CreditTransaction::try_from)
            .transpose()
    }

    /// One keyset page of subscriptions matching `where_clause` (`$1` is `at`),
    /// ordered by `(sort_column, id)`
    async fn fetch_subscriptions(
        &self,
        where_clause: &str,
        sort_column: &str,
        at: OffsetDateTime,
        after: Option<SubscriptionCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let sql = format!(
            r#"
            SELECT {cols} FROM subscriptions
            WHERE {filter}
              AND ($3::timestamptz IS NULL OR ({sort}, id) > ($3, $4::uuid))
            ORDER BY {sort}, id
            LIMIT $2
            "#,
            cols = SUBSCRIPTION_COLUMNS,
            filter = where_clause,
            sort = sort_column,
        );
        let rows: Vec<SubscriptionRow> = sqlx::query_as(&sql)
            .bind(at)
            .bind(limit)
            .bind(after.map(|c| c.at))
            .bind(after.map(|c| c.id))
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn ensure_profile(
        &self,
        user_id: Uuid,
        email: &str,
        daily_generations: i32,
    ) -> BillingResult<Profile> {
        // No-op update so RETURNING yields the existing row on conflict
        let sql = format!(
            r#"
            INSERT INTO billing_profiles (user_id, email, plan_id, daily_generations_remaining)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id) DO UPDATE SET email = billing_profiles.email
            RETURNING {}
            "#,
            PROFILE_COLUMNS
        );
        let row: ProfileRow = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(email)
            .bind(inkwell_shared::plans::FREE_PLAN_ID)
            .bind(daily_generations)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.into())
    }

    async fn get_profile(&self, user_id: Uuid) -> BillingResult<Option<Profile>> {
        let sql = format!(
            "SELECT {} FROM billing_profiles WHERE user_id = $1",
            PROFILE_COLUMNS
        );
        let row: Option<ProfileRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Profile::from))
    }

    async fn set_profile_plan(
        &self,
        user_id: Uuid,
        plan_id: &str,
        reset_quota_to: Option<i32>,
    ) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE billing_profiles
            SET plan_id = $2,
                daily_generations_remaining = COALESCE($3, daily_generations_remaining),
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(plan_id)
        .bind(reset_quota_to)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::ProfileNotFound(user_id.to_string()));
        }
        Ok(())
    }

    async fn list_profiles_due_for_reset(
        &self,
        today: Date,
        limit: i64,
    ) -> BillingResult<Vec<(Uuid, String)>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT user_id, plan_id FROM billing_profiles
            WHERE daily_reset_on IS NULL OR daily_reset_on < $1
            ORDER BY user_id
            LIMIT $2
            "#,
        )
        .bind(today)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn reset_daily_quota(
        &self,
        user_id: Uuid,
        today: Date,
        quota: i32,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_profiles
            SET daily_generations_remaining = $3, daily_reset_on = $2, updated_at = NOW()
            WHERE user_id = $1 AND (daily_reset_on IS NULL OR daily_reset_on < $2)
            "#,
        )
        .bind(user_id)
        .bind(today)
        .bind(quota)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume_daily_generation(
        &self,
        user_id: Uuid,
        operation_key: &str,
    ) -> BillingResult<DailyQuotaOutcome> {
        let mut tx = self.pool.begin().await?;
        let profile = Self::lock_profile(&mut tx, user_id).await?;
        let marker = consume_marker(operation_key);

        if Self::marker_exists(&mut tx, &marker).await? {
            return Ok(DailyQuotaOutcome {
                remaining: profile.daily_generations_remaining,
                applied: false,
            });
        }
        if profile.daily_generations_remaining <= 0 {
            return Err(BillingError::DailyQuotaExhausted);
        }

        let (remaining,): (i32,) = sqlx::query_as(
            r#"
            UPDATE billing_profiles
            SET daily_generations_remaining = daily_generations_remaining - 1, updated_at = NOW()
            WHERE user_id = $1
            RETURNING daily_generations_remaining
            "#,
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;
        Self::insert_marker(&mut tx, &marker, user_id).await?;
        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;
        let profile = Self::lock_profile(&mut tx, user_id).await?;
        let marker = restore_marker(operation_key);

        let consumed = Self::marker_exists(&mut tx, &consume_marker(operation_key)).await?;
        if !consumed || Self::marker_exists(&mut tx, &marker).await? {
            return Ok(DailyQuotaOutcome {
                remaining: profile.daily_generations_remaining,
                applied: false,
            });
        }

        let (remaining,): (i32,) = sqlx::query_as(
            r#"
            UPDATE billing_profiles
            SET daily_generations_remaining = LEAST(daily_generations_remaining + 1, $2),
                updated_at = NOW()
            WHERE user_id = $1
            RETURNING daily_generations_remaining
            "#,
        )
        .bind(user_id)
        .bind(cap)
        .fetch_one(&mut *tx)
        .await?;
        Self::insert_marker(&mut tx, &marker, user_id).await?;
        tx.commit().await?;

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
        let mut tx = self.pool.begin().await?;
        let balance = Self::lock_profile(&mut tx, entry.user_id)
            .await?
            .credits_balance;

        if let Some(key) = entry.idempotency_key.as_deref() {
            if let Some(existing) = Self::find_entry(&mut tx, key).await? {
                return Ok(LedgerReceipt {
                    transaction: existing,
                    new_balance: balance,
                    duplicate: true,
                });
            }
        }

        let mut entry = entry;
        let new_balance = settle_entry_amount(balance, &mut entry, mode)?;

        let transaction = Self::append_entry(&mut tx, entry, new_balance, now).await?;
        tx.commit().await?;

        tracing::debug!(
            user_id = %transaction.user_id,
            tx_type = %transaction.tx_type,
            amount = transaction.amount,
            balance_after = new_balance,
            "Credit transaction recorded"
        );

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
        let sql = format!(
            "SELECT {} FROM credit_transactions WHERE idempotency_key = $1",
            CREDIT_TX_COLUMNS
        );
        sqlx::query_as::<_, CreditTxRow>(&sql)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await?
            .map(CreditTransaction::try_from)
            .transpose()
    }

    async fn credit_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let sql = format!(
            "SELECT {} FROM credit_transactions WHERE user_id = $1 ORDER BY seq DESC LIMIT $2",
            CREDIT_TX_COLUMNS
        );
        let rows: Vec<CreditTxRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_expired_grants(
        &self,
        now: OffsetDateTime,
        limit: i64,
    ) -> BillingResult<Vec<CreditTransaction>> {
        let sql = format!(
            r#"
            SELECT {} FROM credit_transactions t
            WHERE t.amount > 0
              AND t.expires_at IS NOT NULL
              AND t.expires_at <= $1
              AND NOT EXISTS (
                  SELECT 1 FROM operation_markers m
                  WHERE m.operation_key = 'expiry:' || t.id::text
              )
            ORDER BY t.expires_at
            LIMIT $2
            "#,
            CREDIT_TX_COLUMNS
        );
        let rows: Vec<CreditTxRow> = sqlx::query_as(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn expire_grant(
        &self,
        grant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<CreditTransaction>> {
        let mut tx = self.pool.begin().await?;

        let sql = format!(
            "SELECT {} FROM credit_transactions WHERE id = $1",
            CREDIT_TX_COLUMNS
        );
        let grant: CreditTransaction = sqlx::query_as::<_, CreditTxRow>(&sql)
            .bind(grant_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Credit grant {}", grant_id)))?
            .try_into()?;

        let balance = Self::lock_profile(&mut tx, grant.user_id)
            .await?
            .credits_balance;
        let key = expiry_key(grant_id);
        if Self::marker_exists(&mut tx, &key).await? {
            return Ok(None);
        }

        let sql = format!(
            "SELECT {} FROM credit_transactions WHERE user_id = $1 ORDER BY seq",
            CREDIT_TX_COLUMNS
        );
        let rows: Vec<CreditTxRow> = sqlx::query_as(&sql)
            .bind(grant.user_id)
            .fetch_all(&mut *tx)
            .await?;
        let history: Vec<CreditTransaction> = convert_all(rows)?;
        let remainder = fifo_remainder(&history, grant_id, balance);

        Self::insert_marker(&mut tx, &key, grant.user_id).await?;
        if remainder <= 0 {
            tx.commit().await?;
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
        let expiry = Self::append_entry(&mut tx, entry, new_balance, now).await?;
        tx.commit().await?;

        Ok(Some(expiry))
    }

    async fn insert_payment(&self, payment: &Payment) -> BillingResult<()> {
        let metadata = serde_json::to_value(&payment.metadata)?;
        sqlx::query(
            r#"
            INSERT INTO payments
                (id, user_id, order_id, payment_key, payment_type, status, amount,
                 refunded_amount, metadata, failure_code, failure_reason, gateway_secret,
                 paid_at, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(payment.id)
        .bind(payment.user_id)
        .bind(&payment.order_id)
        .bind(&payment.payment_key)
        .bind(payment.payment_type.as_str())
        .bind(payment.status.as_str())
        .bind(payment.amount)
        .bind(payment.refunded_amount)
        .bind(metadata)
        .bind(&payment.failure_code)
        .bind(&payment.failure_reason)
        .bind(&payment.gateway_secret)
        .bind(payment.paid_at)
        .bind(payment.created_at)
        .bind(payment.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_payment(&self, id: Uuid) -> BillingResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE id = $1", PAYMENT_COLUMNS);
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn get_payment_by_order_id(&self, order_id: &str) -> BillingResult<Option<Payment>> {
        let sql = format!("SELECT {} FROM payments WHERE order_id = $1", PAYMENT_COLUMNS);
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn get_payment_by_key(&self, payment_key: &str) -> BillingResult<Option<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE payment_key = $1",
            PAYMENT_COLUMNS
        );
        sqlx::query_as::<_, PaymentRow>(&sql)
            .bind(payment_key)
            .fetch_optional(&self.pool)
            .await?
            .map(Payment::try_from)
            .transpose()
    }

    async fn transition_payment(
        &self,
        id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        update: PaymentUpdate,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Payment>> {
        let sql = format!(
            r#"
            UPDATE payments
            SET status = $3,
                payment_key = COALESCE($4, payment_key),
                failure_code = COALESCE($5, failure_code),
                failure_reason = COALESCE($6, failure_reason),
                gateway_secret = COALESCE($7, gateway_secret),
                paid_at = COALESCE($8, paid_at),
                refunded_amount = COALESCE($9, refunded_amount),
                updated_at = $10
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            PAYMENT_COLUMNS
        );
        let row: Option<PaymentRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(&update.payment_key)
            .bind(&update.failure_code)
            .bind(&update.failure_reason)
            .bind(&update.gateway_secret)
            .bind(update.paid_at)
            .bind(update.refunded_amount)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(row.try_into()?)),
            None => {
                let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM payments WHERE id = $1")
                    .bind(id)
                    .fetch_optional(&self.pool)
                    .await?;
                match exists {
                    Some(_) => Ok(None),
                    None => Err(BillingError::PaymentNotFound(id.to_string())),
                }
            }
        }
    }

    async fn list_payments_for_user(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<Payment>> {
        let sql = format!(
            "SELECT {} FROM payments WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2",
            PAYMENT_COLUMNS
        );
        let rows: Vec<PaymentRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn insert_billing_key(&self, key: &BillingKey) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("UPDATE billing_keys SET is_default = FALSE WHERE user_id = $1 AND is_default")
            .bind(key.user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO billing_keys
                (id, user_id, customer_key, encrypted_key, card_company, card_number_masked,
                 is_default, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(key.id)
        .bind(key.user_id)
        .bind(&key.customer_key)
        .bind(&key.encrypted_key)
        .bind(&key.card_company)
        .bind(&key.card_number_masked)
        .bind(key.is_default)
        .bind(key.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_billing_key(&self, id: Uuid) -> BillingResult<Option<BillingKey>> {
        let sql = format!("SELECT {} FROM billing_keys WHERE id = $1", BILLING_KEY_COLUMNS);
        let row: Option<BillingKeyRow> = sqlx::query_as(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(BillingKey::from))
    }

    async fn default_billing_key(&self, user_id: Uuid) -> BillingResult<Option<BillingKey>> {
        let sql = format!(
            "SELECT {} FROM billing_keys WHERE user_id = $1 AND is_default",
            BILLING_KEY_COLUMNS
        );
        let row: Option<BillingKeyRow> = sqlx::query_as(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(BillingKey::from))
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO subscriptions
                (id, user_id, plan_id, billing_cycle, status, current_period_start,
                 current_period_end, cancel_at_period_end, canceled_at, retry_count,
                 next_retry_at, scheduled_plan_id, scheduled_cycle, billing_key_id,
                 latest_payment_id, version, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(subscription.id)
        .bind(subscription.user_id)
        .bind(&subscription.plan_id)
        .bind(subscription.billing_cycle.as_str())
        .bind(subscription.status.as_str())
        .bind(subscription.current_period_start)
        .bind(subscription.current_period_end)
        .bind(subscription.cancel_at_period_end)
        .bind(subscription.canceled_at)
        .bind(subscription.retry_count)
        .bind(subscription.next_retry_at)
        .bind(&subscription.scheduled_plan_id)
        .bind(subscription.scheduled_cycle.map(|c| c.as_str()))
        .bind(subscription.billing_key_id)
        .bind(subscription.latest_payment_id)
        .bind(subscription.version)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if violates(&e, LIVE_SUBSCRIPTION_INDEX) => {
                Err(BillingError::SubscriptionAlreadyActive)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_subscription(&self, id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!("SELECT {} FROM subscriptions WHERE id = $1", SUBSCRIPTION_COLUMNS);
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn live_subscription(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE user_id = $1 AND status <> 'canceled'",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn subscription_for_payment(
        &self,
        payment_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let sql = format!(
            "SELECT {} FROM subscriptions WHERE latest_payment_id = $1 LIMIT 1",
            SUBSCRIPTION_COLUMNS
        );
        sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Subscription::try_from)
            .transpose()
    }

    async fn update_subscription(
        &self,
        subscription: &Subscription,
    ) -> BillingResult<Subscription> {
        let sql = format!(
            r#"
            UPDATE subscriptions
            SET plan_id = $3,
                billing_cycle = $4,
                status = $5,
                current_period_start = $6,
                current_period_end = $7,
                cancel_at_period_end = $8,
                canceled_at = $9,
                retry_count = $10,
                next_retry_at = $11,
                scheduled_plan_id = $12,
                scheduled_cycle = $13,
                billing_key_id = $14,
                latest_payment_id = $15,
                version = version + 1,
                updated_at = NOW()
            WHERE id = $1 AND version = $2
            RETURNING {}
            "#,
            SUBSCRIPTION_COLUMNS
        );
        let result = sqlx::query_as::<_, SubscriptionRow>(&sql)
            .bind(subscription.id)
            .bind(subscription.version)
            .bind(&subscription.plan_id)
            .bind(subscription.billing_cycle.as_str())
            .bind(subscription.status.as_str())
            .bind(subscription.current_period_start)
            .bind(subscription.current_period_end)
            .bind(subscription.cancel_at_period_end)
            .bind(subscription.canceled_at)
            .bind(subscription.retry_count)
            .bind(subscription.next_retry_at)
            .bind(&subscription.scheduled_plan_id)
            .bind(subscription.scheduled_cycle.map(|c| c.as_str()))
            .bind(subscription.billing_key_id)
            .bind(subscription.latest_payment_id)
            .fetch_optional(&self.pool)
            .await;

        let row = match result {
            Ok(row) => row,
            Err(e) if violates(&e, LIVE_SUBSCRIPTION_INDEX) => {
                return Err(BillingError::SubscriptionAlreadyActive)
            }
            Err(e) => return Err(e.into()),
        };

        match row {
            Some(row) => row.try_into(),
            None => {
                let exists: Option<(i64,)> =
                    sqlx::query_as("SELECT version FROM subscriptions WHERE id = $1")
                        .bind(subscription.id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some((current,)) => {
                        tracing::warn!(
                            subscription_id = %subscription.id,
                            expected_version = subscription.version,
                            current_version = current,
                            "Subscription version conflict"
                        );
                        Err(BillingError::ConcurrentModification(format!(
                            "Subscription {} was modified by another process",
                            subscription.id
                        )))
                    }
                    None => Err(BillingError::SubscriptionNotFound),
                }
            }
        }
    }

    async fn list_due_subscriptions(
        &self,
        until: OffsetDateTime,
        after: Option<SubscriptionCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        self.fetch_subscriptions(
            "status = 'active' AND current_period_end <= $1",
            "current_period_end",
            until,
            after,
            limit,
        )
        .await
    }

    async fn list_retry_due_subscriptions(
        &self,
        now: OffsetDateTime,
        after: Option<SubscriptionCursor>,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        self.fetch_subscriptions(
            "status = 'past_due' AND next_retry_at <= $1",
            "next_retry_at",
            now,
            after,
            limit,
        )
        .await
    }

    async fn insert_webhook_log(&self, log: &WebhookLog) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_logs
                (id, event_type, payload, status, retry_count, last_error, processed_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(log.id)
        .bind(&log.event_type)
        .bind(&log.payload)
        .bind(log.status.as_str())
        .bind(log.retry_count)
        .bind(&log.last_error)
        .bind(log.processed_at)
        .bind(log.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_webhook_log(&self, id: Uuid) -> BillingResult<Option<WebhookLog>> {
        let sql = format!("SELECT {} FROM webhook_logs WHERE id = $1", WEBHOOK_COLUMNS);
        sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(WebhookLog::try_from)
            .transpose()
    }

    async fn finish_webhook_log(
        &self,
        id: Uuid,
        status: WebhookStatus,
        last_error: Option<String>,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookLog> {
        let sql = format!(
            r#"
            UPDATE webhook_logs
            SET status = $2,
                last_error = $3,
                retry_count = retry_count + CASE WHEN $2 = 'failed' THEN 1 ELSE 0 END,
                processed_at = CASE WHEN $2 = 'processed' THEN $4 ELSE processed_at END
            WHERE id = $1
            RETURNING {}
            "#,
            WEBHOOK_COLUMNS
        );
        sqlx::query_as::<_, WebhookRow>(&sql)
            .bind(id)
            .bind(status.as_str())
            .bind(last_error)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("Webhook log {}", id)))?
            .try_into()
    }

    async fn list_webhook_logs(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_logs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#,
            WEBHOOK_COLUMNS
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }

    async fn list_retryable_webhook_logs(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        let sql = format!(
            r#"
            SELECT {} FROM webhook_logs
            WHERE status = 'failed' AND retry_count < $1
            ORDER BY created_at
            LIMIT $2
            "#,
            WEBHOOK_COLUMNS
        );
        let rows: Vec<WebhookRow> = sqlx::query_as(&sql)
            .bind(max_retries)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        convert_all(rows)
    }
}
