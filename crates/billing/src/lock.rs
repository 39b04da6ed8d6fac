//! Cross-process locks for scheduled jobs
//!
//! A lock is a lease: it expires on its own if the holder dies, and release
//! only succeeds for the token that acquired it. Acquisition never waits; a
//! busy lock means another runner is already doing the work.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// Proof of holding a job lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGuard {
    pub job: String,
    pub token: String,
}

impl LockGuard {
    fn new(job: &str) -> Self {
        Self {
            job: job.to_string(),
            token: Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait JobLock: Send + Sync {
    /// `None` when another holder has an unexpired lease
    async fn try_acquire(&self, job: &str, lease: Duration) -> BillingResult<Option<LockGuard>>;

    /// Release if still held by `guard`; a lease that already expired is left alone
    async fn release(&self, guard: LockGuard) -> BillingResult<()>;
}

// =============================================================================
// Redis
// =============================================================================

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// `SET key token NX PX lease` with compare-and-delete release
#[derive(Clone)]
pub struct RedisJobLock {
    conn: redis::aio::ConnectionManager,
    prefix: String,
}

impl RedisJobLock {
    pub async fn connect(redis_url: &str) -> BillingResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = redis::aio::ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            prefix: "inkwell:job-lock:".to_string(),
        })
    }

    fn key(&self, job: &str) -> String {
        format!("{}{}", self.prefix, job)
    }
}

#[async_trait]
impl JobLock for RedisJobLock {
    async fn try_acquire(&self, job: &str, lease: Duration) -> BillingResult<Option<LockGuard>> {
        let guard = LockGuard::new(job);
        let mut conn = self.conn.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.key(job))
            .arg(&guard.token)
            .arg("NX")
            .arg("PX")
            .arg(lease.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.map(|_| guard))
    }

    async fn release(&self, guard: LockGuard) -> BillingResult<()> {
        let mut conn = self.conn.clone();
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(&guard.job))
            .arg(&guard.token)
            .invoke_async(&mut conn)
            .await?;
        if released == 0 {
            tracing::warn!(job = %guard.job, "Job lock lease expired before release");
        }
        Ok(())
    }
}

// =============================================================================
// Postgres
// =============================================================================

/// Lease rows in `job_locks`, taken over only once expired
#[derive(Clone)]
pub struct PgJobLock {
    pool: PgPool,
}

impl PgJobLock {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobLock for PgJobLock {
    async fn try_acquire(&self, job: &str, lease: Duration) -> BillingResult<Option<LockGuard>> {
        let guard = LockGuard::new(job);
        let expires_at = OffsetDateTime::now_utc() + lease;

        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO job_locks (job_name, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (job_name) DO UPDATE SET
                holder = EXCLUDED.holder,
                expires_at = EXCLUDED.expires_at
            WHERE job_locks.expires_at < NOW()
            RETURNING holder
            "#,
        )
        .bind(job)
        .bind(&guard.token)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|_| guard))
    }

    async fn release(&self, guard: LockGuard) -> BillingResult<()> {
        let result = sqlx::query("DELETE FROM job_locks WHERE job_name = $1 AND holder = $2")
            .bind(&guard.job)
            .bind(&guard.token)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            tracing::warn!(job = %guard.job, "Job lock lease expired before release");
        }
        Ok(())
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Single-process lock for tests and dev mode
#[derive(Clone, Default)]
pub struct MemoryJobLock {
    leases: Arc<Mutex<HashMap<String, (String, tokio::time::Instant)>>>,
}

impl MemoryJobLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLock for MemoryJobLock {
    async fn try_acquire(&self, job: &str, lease: Duration) -> BillingResult<Option<LockGuard>> {
        let mut leases = self.leases.lock().await;
        let now = tokio::time::Instant::now();
        if let Some((_, expires)) = leases.get(job) {
            if *expires > now {
                return Ok(None);
            }
        }
        let guard = LockGuard::new(job);
        leases.insert(job.to_string(), (guard.token.clone(), now + lease));
        Ok(Some(guard))
    }

    async fn release(&self, guard: LockGuard) -> BillingResult<()> {
        let mut leases = self.leases.lock().await;
        if leases
            .get(&guard.job)
            .is_some_and(|(token, _)| *token == guard.token)
        {
            leases.remove(&guard.job);
        }
        Ok(())
    }
}
