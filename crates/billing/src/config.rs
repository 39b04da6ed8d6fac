//! Billing configuration and policy parameters
//!
//! Everything is read from the environment (`.env` is honoured by the
//! binaries through dotenvy). Secrets are required; tunables fall back to
//! the defaults below.

use std::time::Duration;

use time::UtcOffset;

use crate::error::{BillingError, BillingResult};

pub const DEFAULT_GATEWAY_BASE_URL: &str = "https://api.tosspayments.com/v1";

/// Smallest amount the gateway will charge (KRW). Prorations below this are waived.
pub const MINIMUM_CHARGE_AMOUNT: i64 = 100;

/// Manual/scheduled webhook replays stop once a log reaches this many failures.
pub const WEBHOOK_MAX_RETRIES: i32 = 3;

fn env_required(key: &str) -> BillingResult<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(BillingError::Config(format!("{} is not set", key))),
    }
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> BillingResult<T> {
    match env_optional(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| BillingError::Config(format!("{} has an invalid value: {}", key, raw))),
        None => Ok(default),
    }
}

/// Payment gateway client configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub webhook_secret: String,
    pub timeout: Duration,
    pub max_retries: usize,
}

impl GatewayConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            base_url: env_optional("GATEWAY_BASE_URL")
                .unwrap_or_else(|| DEFAULT_GATEWAY_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            secret_key: env_required("GATEWAY_SECRET_KEY")?,
            webhook_secret: env_required("GATEWAY_WEBHOOK_SECRET")?,
            timeout: Duration::from_secs(env_parse("GATEWAY_TIMEOUT_SECS", 10u64)?),
            max_retries: env_parse("GATEWAY_MAX_RETRIES", 3usize)?,
        })
    }
}

/// Tunable retry and scheduling policy
#[derive(Debug, Clone)]
pub struct BillingPolicy {
    /// Failed renewals allowed before a past-due subscription is canceled
    pub renewal_max_retries: i32,
    /// Delay before the n-th renewal retry (index = retry_count - 1; last entry repeats)
    pub renewal_retry_delays: Vec<time::Duration>,
    /// How far ahead of `current_period_end` the renewal sweep picks up subscriptions
    pub renewal_lookahead: time::Duration,
    /// A pending renewal charge younger than this belongs to the run that claimed it
    pub renewal_settle_grace: time::Duration,
    /// Attempts for money-relevant persistence steps before alerting
    pub persistence_max_attempts: usize,
    pub persistence_base_delay: Duration,
    pub minimum_charge_amount: i64,
    pub webhook_max_retries: i32,
    pub job_lock_lease: Duration,
    pub batch_size: i64,
    /// Offset used to decide the calendar day for quota resets (KST by default)
    pub tz_offset: UtcOffset,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            renewal_max_retries: 3,
            renewal_retry_delays: vec![
                time::Duration::days(1),
                time::Duration::days(2),
                time::Duration::days(3),
            ],
            renewal_lookahead: time::Duration::hours(24),
            renewal_settle_grace: time::Duration::minutes(10),
            persistence_max_attempts: 4,
            persistence_base_delay: Duration::from_millis(100),
            minimum_charge_amount: MINIMUM_CHARGE_AMOUNT,
            webhook_max_retries: WEBHOOK_MAX_RETRIES,
            job_lock_lease: Duration::from_secs(15 * 60),
            batch_size: 100,
            tz_offset: UtcOffset::from_hms(9, 0, 0).unwrap_or(UtcOffset::UTC),
        }
    }
}

impl BillingPolicy {
    pub fn from_env() -> BillingResult<Self> {
        let defaults = Self::default();

        let tz_hours: i8 = env_parse("BILLING_TZ_OFFSET_HOURS", 9i8)?;
        let tz_offset = UtcOffset::from_hms(tz_hours, 0, 0)
            .map_err(|e| BillingError::Config(format!("BILLING_TZ_OFFSET_HOURS: {}", e)))?;

        let renewal_max_retries = env_parse("RENEWAL_MAX_RETRIES", defaults.renewal_max_retries)?;
        if renewal_max_retries < 1 {
            return Err(BillingError::Config(
                "RENEWAL_MAX_RETRIES must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            renewal_max_retries,
            renewal_lookahead: time::Duration::hours(env_parse("RENEWAL_LOOKAHEAD_HOURS", 24i64)?),
            tz_offset,
            ..defaults
        })
    }

    /// Delay before the retry following the `retry_count`-th failure
    pub fn renewal_retry_delay(&self, retry_count: i32) -> time::Duration {
        let idx = (retry_count.max(1) - 1) as usize;
        self.renewal_retry_delays
            .get(idx)
            .or_else(|| self.renewal_retry_delays.last())
            .copied()
            .unwrap_or_else(|| time::Duration::days(1))
    }
}

/// Top-level billing configuration
#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub gateway: GatewayConfig,
    /// Base64-encoded 32-byte AES-256-GCM key for billing keys at rest
    pub billing_key_encryption_key: String,
    pub redis_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub resend_api_key: Option<String>,
    pub email_from: String,
    pub plan_catalog_path: Option<String>,
    pub policy: BillingPolicy,
}

impl BillingConfig {
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            gateway: GatewayConfig::from_env()?,
            billing_key_encryption_key: env_required("BILLING_KEY_ENCRYPTION_KEY")?,
            redis_url: env_optional("REDIS_URL"),
            slack_webhook_url: env_optional("SLACK_BILLING_WEBHOOK_URL"),
            resend_api_key: env_optional("RESEND_API_KEY"),
            email_from: env_optional("BILLING_EMAIL_FROM")
                .unwrap_or_else(|| "Inkwell Billing <billing@inkwell.app>".to_string()),
            plan_catalog_path: env_optional("PLAN_CATALOG_PATH"),
            policy: BillingPolicy::from_env()?,
        })
    }

    /// Load the plan catalog, honouring `PLAN_CATALOG_PATH` when set
    pub fn load_catalog(&self) -> BillingResult<inkwell_shared::PlanCatalog> {
        match &self.plan_catalog_path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    BillingError::Config(format!("Cannot read plan catalog {}: {}", path, e))
                })?;
                inkwell_shared::PlanCatalog::from_json(&raw)
                    .map_err(|e| BillingError::Config(e.to_string()))
            }
            None => Ok(inkwell_shared::PlanCatalog::builtin()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "GATEWAY_BASE_URL",
            "GATEWAY_SECRET_KEY",
            "GATEWAY_WEBHOOK_SECRET",
            "GATEWAY_TIMEOUT_SECS",
            "GATEWAY_MAX_RETRIES",
            "BILLING_TZ_OFFSET_HOURS",
            "RENEWAL_MAX_RETRIES",
            "RENEWAL_LOOKAHEAD_HOURS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_gateway_config_requires_secret() {
        clear_env();
        std::env::set_var("GATEWAY_WEBHOOK_SECRET", "whsec");
        let err = GatewayConfig::from_env().unwrap_err();
        assert!(matches!(err, BillingError::Config(msg) if msg.contains("GATEWAY_SECRET_KEY")));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_gateway_config_defaults() {
        clear_env();
        std::env::set_var("GATEWAY_SECRET_KEY", "test_sk");
        std::env::set_var("GATEWAY_WEBHOOK_SECRET", "whsec");
        let config = GatewayConfig::from_env().unwrap();
        assert_eq!(config.base_url, DEFAULT_GATEWAY_BASE_URL);
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_policy_env_overrides() {
        clear_env();
        std::env::set_var("RENEWAL_MAX_RETRIES", "5");
        std::env::set_var("BILLING_TZ_OFFSET_HOURS", "0");
        let policy = BillingPolicy::from_env().unwrap();
        assert_eq!(policy.renewal_max_retries, 5);
        assert_eq!(policy.tz_offset, UtcOffset::UTC);

        std::env::set_var("RENEWAL_MAX_RETRIES", "zero");
        assert!(BillingPolicy::from_env().is_err());
        clear_env();
    }

    #[test]
    fn test_renewal_retry_delay_schedule() {
        let policy = BillingPolicy::default();
        assert_eq!(policy.renewal_retry_delay(1), time::Duration::days(1));
        assert_eq!(policy.renewal_retry_delay(2), time::Duration::days(2));
        assert_eq!(policy.renewal_retry_delay(3), time::Duration::days(3));
        // past the table the last delay repeats
        assert_eq!(policy.renewal_retry_delay(7), time::Duration::days(3));
    }
}
