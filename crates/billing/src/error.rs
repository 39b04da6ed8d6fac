//! Billing error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type BillingResult<T> = Result<T, BillingError>;

/// How a gateway failure should be treated by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentErrorKind {
    /// Rejected by the gateway (bad card, validation, auth). Do not retry.
    Terminal,
    /// 5xx or network failure. Safe to retry with backoff.
    Transient,
    /// Timed out or unreadable response. Re-query before retrying a charge.
    Unknown,
}

/// Typed gateway failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct PaymentError {
    pub code: String,
    pub message: String,
    pub kind: PaymentErrorKind,
}

impl PaymentError {
    pub fn terminal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind: PaymentErrorKind::Terminal,
        }
    }

    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind: PaymentErrorKind::Transient,
        }
    }

    pub fn unknown(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            kind: PaymentErrorKind::Unknown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == PaymentErrorKind::Transient
    }

    /// Human-readable reason shown to the user for common card rejections
    pub fn user_message(&self) -> &str {
        match self.code.as_str() {
            "REJECT_CARD_PAYMENT" | "REJECT_CARD_COMPANY" => "The card was declined by the issuer",
            "EXCEED_MAX_DAILY_PAYMENT_COUNT" | "EXCEED_MAX_PAYMENT_AMOUNT" => {
                "The card's payment limit has been exceeded"
            }
            "INVALID_CARD_EXPIRATION" => "The card has expired",
            "INVALID_STOPPED_CARD" => "The card has been suspended",
            "NOT_ENOUGH_BALANCE" => "Insufficient funds on the card",
            "INVALID_CARD_NUMBER" => "The card number is invalid",
            _ => &self.message,
        }
    }
}

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Lock backend error: {0}")]
    Lock(String),

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] PaymentError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Amount mismatch: expected {expected}, got {actual}")]
    AmountMismatch { expected: i64, actual: i64 },

    #[error("Unknown plan: {0}")]
    InvalidPlan(String),

    #[error("Unknown credit package: {0}")]
    InvalidPackage(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Subscription not found")]
    SubscriptionNotFound,

    #[error("User already has a live subscription")]
    SubscriptionAlreadyActive,

    #[error("Subscription is already canceled")]
    SubscriptionAlreadyCanceled,

    #[error("Invalid subscription transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid payment transition from {from} to {to}")]
    InvalidPaymentTransition { from: String, to: String },

    #[error("No billing key registered")]
    BillingKeyRequired,

    #[error("Insufficient credits: balance {balance}, requested {requested}")]
    InsufficientCredits { balance: i64, requested: i64 },

    #[error("Daily generation quota exhausted")]
    DailyQuotaExhausted,

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("Refund failed: {0}")]
    RefundFailed(String),

    #[error("Invalid webhook signature")]
    WebhookSignatureInvalid,

    #[error("Malformed webhook payload: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Webhook retry limit reached ({0} attempts)")]
    WebhookRetryExhausted(i32),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Stable machine-readable code
    pub fn code(&self) -> &str {
        match self {
            BillingError::Config(_) => "CONFIG_ERROR",
            BillingError::Database(_) => "DATABASE_ERROR",
            BillingError::Lock(_) => "LOCK_ERROR",
            BillingError::Gateway(e) => &e.code,
            BillingError::InvalidInput(_) => "INVALID_INPUT",
            BillingError::InvalidAmount(_) => "INVALID_AMOUNT",
            BillingError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            BillingError::InvalidPlan(_) => "INVALID_PLAN",
            BillingError::InvalidPackage(_) => "INVALID_PACKAGE",
            BillingError::NotFound(_) => "NOT_FOUND",
            BillingError::ProfileNotFound(_) => "PROFILE_NOT_FOUND",
            BillingError::PaymentNotFound(_) => "PAYMENT_NOT_FOUND",
            BillingError::SubscriptionNotFound => "SUBSCRIPTION_NOT_FOUND",
            BillingError::SubscriptionAlreadyActive => "SUBSCRIPTION_ALREADY_ACTIVE",
            BillingError::SubscriptionAlreadyCanceled => "SUBSCRIPTION_ALREADY_CANCELED",
            BillingError::InvalidTransition { .. } => "INVALID_TRANSITION",
            BillingError::InvalidPaymentTransition { .. } => "INVALID_PAYMENT_TRANSITION",
            BillingError::BillingKeyRequired => "BILLING_KEY_REQUIRED",
            BillingError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            BillingError::DailyQuotaExhausted => "DAILY_QUOTA_EXHAUSTED",
            BillingError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            BillingError::RefundFailed(_) => "REFUND_FAILED",
            BillingError::WebhookSignatureInvalid => "INVALID_SIGNATURE",
            BillingError::WebhookPayloadInvalid(_) => "INVALID_PAYLOAD",
            BillingError::WebhookRetryExhausted(_) => "WEBHOOK_RETRY_EXHAUSTED",
            BillingError::Encryption(_) => "ENCRYPTION_ERROR",
            BillingError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BillingError::Database(_)
            | BillingError::Lock(_)
            | BillingError::ConcurrentModification(_) => true,
            BillingError::Gateway(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(e: redis::RedisError) -> Self {
        BillingError::Lock(e.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(e: serde_json::Error) -> Self {
        BillingError::Internal(format!("JSON error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_error_kind_drives_retryability() {
        assert!(PaymentError::transient("PROVIDER_ERROR", "down").is_retryable());
        assert!(!PaymentError::terminal("REJECT_CARD_PAYMENT", "declined").is_retryable());
        assert!(!PaymentError::unknown("TIMEOUT", "timed out").is_retryable());
    }

    #[test]
    fn test_gateway_error_code_passthrough() {
        let err: BillingError = PaymentError::terminal("NOT_ENOUGH_BALANCE", "no money").into();
        assert_eq!(err.code(), "NOT_ENOUGH_BALANCE");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_user_message_mapping() {
        let e = PaymentError::terminal("INVALID_CARD_EXPIRATION", "raw gateway text");
        assert_eq!(e.user_message(), "The card has expired");
        let e = PaymentError::terminal("SOMETHING_ELSE", "raw gateway text");
        assert_eq!(e.user_message(), "raw gateway text");
    }

    #[test]
    fn test_database_errors_are_retryable() {
        assert!(BillingError::Database("connection reset".into()).is_retryable());
        assert!(!BillingError::SubscriptionAlreadyCanceled.is_retryable());
        assert_eq!(
            BillingError::AmountMismatch {
                expected: 100,
                actual: 1
            }
            .code(),
            "AMOUNT_MISMATCH"
        );
    }
}
