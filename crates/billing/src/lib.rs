// Billing crate clippy configuration
#![allow(clippy::result_large_err)] // BillingError carries gateway error details
#![allow(clippy::too_many_arguments)] // Service constructors take their collaborators explicitly
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Inkwell Billing Module
//!
//! Credit ledger, subscriptions and payments against a card/virtual-account
//! payment gateway.
//!
//! ## Features
//!
//! - **Credit Ledger**: Append-only transactions with a clamped running balance, FIFO expiry
//! - **Daily Quota**: Per-plan generation allowance reset at local midnight
//! - **Subscriptions**: Billing-key recurring charges, prorated plan changes, cancel/resume/pause
//! - **Payments**: Orders, gateway confirmation with amount verification, exactly-once fulfilment
//! - **Refunds**: Full and partial, removing the proportional credits
//! - **Webhooks**: Signed gateway callbacks, logged and replayable
//! - **Jobs**: Renewal, quota reset, credit expiry and webhook retry under cross-process locks
//! - **Alerting**: Slack alerts for failures that need manual action

pub mod alerting;
pub mod config;
pub mod crypto;
pub mod email;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod jobs;
pub mod ledger;
pub mod lock;
pub mod models;
pub mod order_id;
pub mod payments;
pub mod proration;
pub mod refund;
pub mod retry;
pub mod store;
pub mod subscriptions;
pub mod webhooks;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[cfg(test)]
mod edge_case_tests;

// Alerting
pub use alerting::{Alert, AlertSeverity, AlertSink, LogAlertSink, SlackAlertSink};

// Config
pub use config::{BillingConfig, BillingPolicy, GatewayConfig};

// Crypto
pub use crypto::BillingKeyCipher;

// Email
pub use email::{BillingEmails, LogMailer, Mailer, ResendMailer};

// Error
pub use error::{BillingError, BillingResult, PaymentError, PaymentErrorKind};

// Gateway
pub use gateway::{GatewayPayment, GatewayPaymentStatus, HttpGatewayClient, PaymentGateway};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Jobs
pub use jobs::{BillingJobs, JobReport};

// Ledger
pub use ledger::CreditLedger;

// Locks
pub use lock::{JobLock, LockGuard, MemoryJobLock, PgJobLock, RedisJobLock};

// Models
pub use models::{
    BillingKey, CreditTransaction, CreditTransactionType, NewCreditTransaction, Payment,
    PaymentMetadata, PaymentStatus, PaymentType, Profile, Subscription, SubscriptionStatus,
    WebhookLog, WebhookStatus,
};

// Payments
pub use payments::{OrderRequest, PaymentService, PaymentSettler};

// Proration
pub use proration::{calculate_proration, ChangeType, ProrationResult};

// Refund
pub use refund::{RefundResult, RefundService};

// Store
pub use store::{BillingStore, DailyQuotaOutcome, LedgerReceipt, MemoryBillingStore, PgBillingStore};

// Subscriptions
pub use subscriptions::{PlanChangeOutcome, RenewalOutcome, SubscribeRequest, SubscriptionService};

// Webhooks
pub use webhooks::{ReconcileOutcome, WebhookAck, WebhookEvent, WebhookReconciler};

use std::sync::Arc;

use inkwell_shared::PlanCatalog;
use sqlx::PgPool;
use uuid::Uuid;

/// Collaborators the billing engine is assembled from
pub struct BillingDeps {
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub alerts: Arc<dyn AlertSink>,
    pub mailer: Arc<dyn Mailer>,
    pub lock: Arc<dyn JobLock>,
    pub catalog: Arc<PlanCatalog>,
    pub cipher: BillingKeyCipher,
    pub policy: BillingPolicy,
    pub webhook_secret: String,
}

/// Main billing service that combines all billing functionality
#[derive(Clone)]
pub struct BillingService {
    pub ledger: CreditLedger,
    pub payments: PaymentService,
    pub subscriptions: SubscriptionService,
    pub refunds: RefundService,
    pub webhooks: WebhookReconciler,
    pub jobs: BillingJobs,
    pub store: Arc<dyn BillingStore>,
    pub catalog: Arc<PlanCatalog>,
    pub lock: Arc<dyn JobLock>,
}

impl BillingService {
    /// Create a Postgres-backed billing service from environment variables
    pub async fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let catalog = Arc::new(config.load_catalog()?);
        let cipher = BillingKeyCipher::from_base64(&config.billing_key_encryption_key)?;
        let webhook_secret = config.gateway.webhook_secret.clone();
        let gateway: Arc<dyn PaymentGateway> = Arc::new(HttpGatewayClient::new(config.gateway)?);

        let alerts: Arc<dyn AlertSink> = match config.slack_webhook_url {
            Some(url) => Arc::new(SlackAlertSink::new(url)),
            None => {
                tracing::warn!("SLACK_BILLING_WEBHOOK_URL not set, billing alerts go to the log only");
                Arc::new(LogAlertSink)
            }
        };
        let mailer: Arc<dyn Mailer> = match config.resend_api_key {
            Some(key) => Arc::new(ResendMailer::new(key, config.email_from)),
            None => {
                tracing::warn!("RESEND_API_KEY not set, billing emails are logged only");
                Arc::new(LogMailer)
            }
        };
        let lock: Arc<dyn JobLock> = match config.redis_url {
            Some(url) => Arc::new(RedisJobLock::connect(&url).await?),
            None => Arc::new(PgJobLock::new(pool.clone())),
        };

        Ok(Self::with_components(BillingDeps {
            store: Arc::new(PgBillingStore::new(pool)),
            gateway,
            alerts,
            mailer,
            lock,
            catalog,
            cipher,
            policy: config.policy,
            webhook_secret,
        }))
    }

    /// Wire the services together over explicit collaborators
    pub fn with_components(deps: BillingDeps) -> Self {
        let BillingDeps {
            store,
            gateway,
            alerts,
            mailer,
            lock,
            catalog,
            cipher,
            policy,
            webhook_secret,
        } = deps;

        let ledger = CreditLedger::new(store.clone(), catalog.clone(), alerts.clone(), policy.clone());
        let settler = PaymentSettler::new(store.clone(), gateway.clone(), alerts.clone(), policy.clone());
        let subscriptions = SubscriptionService::new(
            store.clone(),
            gateway.clone(),
            catalog.clone(),
            ledger.clone(),
            settler.clone(),
            cipher,
            mailer,
            alerts.clone(),
            policy.clone(),
        );
        let payments = PaymentService::new(
            store.clone(),
            gateway.clone(),
            catalog.clone(),
            ledger.clone(),
            subscriptions.clone(),
            settler,
            alerts.clone(),
            policy.clone(),
        );
        let refunds = RefundService::new(
            store.clone(),
            gateway.clone(),
            ledger.clone(),
            alerts.clone(),
            policy.clone(),
        );
        let webhooks = WebhookReconciler::new(
            store.clone(),
            gateway,
            payments.clone(),
            refunds.clone(),
            alerts,
            webhook_secret,
            policy.webhook_max_retries,
        );
        let jobs = BillingJobs::new(
            store.clone(),
            subscriptions.clone(),
            webhooks.clone(),
            catalog.clone(),
            lock.clone(),
            policy,
        );

        Self {
            ledger,
            payments,
            subscriptions,
            refunds,
            webhooks,
            jobs,
            store,
            catalog,
            lock,
        }
    }

    /// Create the billing profile on first sight of a user, on the free plan
    pub async fn ensure_profile(&self, user_id: Uuid, email: &str) -> BillingResult<Profile> {
        let quota = self.catalog.free_plan().daily_generations;
        self.store.ensure_profile(user_id, email, quota).await
    }

    pub async fn profile(&self, user_id: Uuid) -> BillingResult<Profile> {
        self.store
            .get_profile(user_id)
            .await?
            .ok_or_else(|| BillingError::ProfileNotFound(user_id.to_string()))
    }
}
