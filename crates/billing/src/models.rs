//! Domain records shared by the billing services and the stores

use std::fmt;
use std::str::FromStr;

use inkwell_shared::BillingCycle;
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingError;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = BillingError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(BillingError::Internal(format!(
                        "Unknown {} value: {}",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// Profile
// =============================================================================

/// Per-user entitlement snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Profile {
    pub user_id: Uuid,
    pub email: String,
    pub plan_id: String,
    pub credits_balance: i64,
    pub daily_generations_remaining: i32,
    /// Calendar day (billing timezone) the quota was last reset
    pub daily_reset_on: Option<Date>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    Subscription,
    CreditPurchase,
}

string_enum!(PaymentType {
    Subscription => "subscription",
    CreditPurchase => "credit_purchase",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
    Canceled,
    Refunded,
    PartialRefunded,
}

string_enum!(PaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Canceled => "canceled",
    Refunded => "refunded",
    PartialRefunded => "partial_refunded",
});

impl PaymentStatus {
    /// Monotonic status graph: pending → {completed, failed, canceled};
    /// completed → {refunded, partial_refunded}. Nothing else moves.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        matches!(
            (self, next),
            (Pending, Completed)
                | (Pending, Failed)
                | (Pending, Canceled)
                | (Completed, Refunded)
                | (Completed, PartialRefunded)
        )
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// What a payment buys. Stored as JSONB so the fulfilment step never has to
/// trust anything the client sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentMetadata {
    /// One period of a plan without a billing key
    PlanPass { plan_id: String, cycle: BillingCycle },
    /// First charge of a recurring subscription
    Subscription {
        plan_id: String,
        cycle: BillingCycle,
        billing_key_id: Uuid,
    },
    Renewal {
        subscription_id: Uuid,
        plan_id: String,
        cycle: BillingCycle,
        /// Period end being renewed; the renewal applies only while it is current
        #[serde(with = "time::serde::rfc3339")]
        renews_period_end: OffsetDateTime,
    },
    PlanChange {
        subscription_id: Uuid,
        from_plan_id: String,
        from_cycle: BillingCycle,
        to_plan_id: String,
        to_cycle: BillingCycle,
    },
    CreditPackage {
        package_id: String,
        credits: i64,
        validity_days: i64,
    },
}

impl PaymentMetadata {
    pub fn payment_type(&self) -> PaymentType {
        match self {
            PaymentMetadata::CreditPackage { .. } => PaymentType::CreditPurchase,
            _ => PaymentType::Subscription,
        }
    }

    /// Human-readable order name sent to the gateway
    pub fn order_name(&self) -> String {
        match self {
            PaymentMetadata::PlanPass { plan_id, cycle } => {
                format!("Inkwell {} ({} pass)", plan_id, cycle)
            }
            PaymentMetadata::Subscription { plan_id, cycle, .. }
            | PaymentMetadata::Renewal { plan_id, cycle, .. } => {
                format!("Inkwell {} ({})", plan_id, cycle)
            }
            PaymentMetadata::PlanChange {
                to_plan_id,
                to_cycle,
                ..
            } => format!("Inkwell {} ({}) plan change", to_plan_id, to_cycle),
            PaymentMetadata::CreditPackage { credits, .. } => {
                format!("Inkwell {} credits", credits)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_id: String,
    pub payment_key: Option<String>,
    pub payment_type: PaymentType,
    pub status: PaymentStatus,
    pub amount: i64,
    pub refunded_amount: i64,
    pub metadata: PaymentMetadata,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    /// Deposit-callback secret returned by the gateway at confirm time
    #[serde(skip_serializing)]
    pub gateway_secret: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Payment {
    pub fn new_pending(
        user_id: Uuid,
        order_id: String,
        amount: i64,
        metadata: PaymentMetadata,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            order_id,
            payment_key: None,
            payment_type: metadata.payment_type(),
            status: PaymentStatus::Pending,
            amount,
            refunded_amount: 0,
            metadata,
            failure_code: None,
            failure_reason: None,
            gateway_secret: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn refundable_amount(&self) -> i64 {
        (self.amount - self.refunded_amount).max(0)
    }
}

/// Fields written alongside a compare-and-set status change
#[derive(Debug, Clone, Default)]
pub struct PaymentUpdate {
    pub payment_key: Option<String>,
    pub failure_code: Option<String>,
    pub failure_reason: Option<String>,
    pub gateway_secret: Option<String>,
    pub paid_at: Option<OffsetDateTime>,
    pub refunded_amount: Option<i64>,
}

// =============================================================================
// Subscriptions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Paused,
    Canceled,
}

string_enum!(SubscriptionStatus {
    Trialing => "trialing",
    Active => "active",
    PastDue => "past_due",
    Paused => "paused",
    Canceled => "canceled",
});

impl SubscriptionStatus {
    /// Legal lifecycle edges. `Canceled` is absorbing.
    pub fn can_transition_to(&self, next: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        matches!(
            (self, next),
            (Trialing, Active)
                | (Trialing, Canceled)
                | (Active, Active)
                | (Active, PastDue)
                | (Active, Paused)
                | (Active, Canceled)
                | (PastDue, Active)
                | (PastDue, Canceled)
                | (Paused, Active)
                | (Paused, Canceled)
        )
    }

    /// Counts towards the one-live-subscription-per-user rule
    pub fn is_live(&self) -> bool {
        !matches!(self, SubscriptionStatus::Canceled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub billing_cycle: BillingCycle,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
    pub retry_count: i32,
    pub next_retry_at: Option<OffsetDateTime>,
    /// Downgrade / cycle change applied at the next renewal
    pub scheduled_plan_id: Option<String>,
    pub scheduled_cycle: Option<BillingCycle>,
    pub billing_key_id: Option<Uuid>,
    pub latest_payment_id: Option<Uuid>,
    /// Optimistic concurrency token, bumped by every store update
    pub version: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    /// Whole days left in the current period, rounded up
    pub fn days_remaining(&self, now: OffsetDateTime) -> i64 {
        days_until(self.current_period_end, now)
    }

    pub fn is_recurring(&self) -> bool {
        self.billing_key_id.is_some()
    }
}

/// Whole days from `now` until `end`, rounded up, never negative
pub fn days_until(end: OffsetDateTime, now: OffsetDateTime) -> i64 {
    let secs = (end - now).whole_seconds();
    if secs <= 0 {
        return 0;
    }
    (secs + 86_399) / 86_400
}

// =============================================================================
// Credit ledger
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditTransactionType {
    Purchase,
    SubscriptionGrant,
    Usage,
    Refund,
    Expiry,
    AdminAdjustment,
}

string_enum!(CreditTransactionType {
    Purchase => "purchase",
    SubscriptionGrant => "subscription_grant",
    Usage => "usage",
    Refund => "refund",
    Expiry => "expiry",
    AdminAdjustment => "admin_adjustment",
});

impl CreditTransactionType {
    /// Whether `amount` carries the sign this entry type requires
    pub fn accepts_amount(&self, amount: i64) -> bool {
        match self {
            CreditTransactionType::Purchase | CreditTransactionType::SubscriptionGrant => {
                amount > 0
            }
            CreditTransactionType::Usage
            | CreditTransactionType::Refund
            | CreditTransactionType::Expiry => amount < 0,
            CreditTransactionType::AdminAdjustment => amount != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    pub tx_type: CreditTransactionType,
    pub amount: i64,
    /// Balance snapshot after this entry
    pub balance_after: i64,
    pub description: String,
    pub payment_id: Option<Uuid>,
    pub expires_at: Option<OffsetDateTime>,
    pub idempotency_key: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Idempotency-key prefix of entries that compensate a usage debit
pub const RESTORE_KEY_PREFIX: &str = "restore:";

impl CreditTransaction {
    /// Positive entry that adds to the FIFO pool of spendable credits.
    /// Restores are not new credits, they undo consumption.
    pub fn is_credit(&self) -> bool {
        self.amount > 0 && !self.is_restore()
    }

    pub fn is_restore(&self) -> bool {
        self.idempotency_key
            .as_deref()
            .is_some_and(|k| k.starts_with(RESTORE_KEY_PREFIX))
    }
}

/// Ledger entry to be applied
#[derive(Debug, Clone)]
pub struct NewCreditTransaction {
    pub user_id: Uuid,
    pub tx_type: CreditTransactionType,
    pub amount: i64,
    pub description: String,
    pub payment_id: Option<Uuid>,
    pub expires_at: Option<OffsetDateTime>,
    pub idempotency_key: Option<String>,
}

/// How a debit that exceeds the balance is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceMode {
    /// Reject with `InsufficientCredits`
    Strict,
    /// Apply and clamp the resulting balance at zero
    Clamp,
    /// Like `Clamp`, but a debit is cut down to the balance and the entry
    /// records what was actually removed (possibly nothing)
    Truncate,
}

// =============================================================================
// Billing keys
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BillingKey {
    pub id: Uuid,
    pub user_id: Uuid,
    pub customer_key: String,
    #[serde(skip_serializing)]
    pub encrypted_key: String,
    pub card_company: Option<String>,
    pub card_number_masked: Option<String>,
    pub is_default: bool,
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Webhook log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookStatus {
    Pending,
    Processed,
    Failed,
}

string_enum!(WebhookStatus {
    Pending => "pending",
    Processed => "processed",
    Failed => "failed",
});

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebhookLog {
    pub id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: WebhookStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub processed_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_payment_status_is_monotonic() {
        use PaymentStatus::*;
        assert!(Pending.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Refunded));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Refunded.can_transition_to(PartialRefunded));
        assert!(!PartialRefunded.can_transition_to(Refunded));
        assert!(!PartialRefunded.can_transition_to(PartialRefunded));
        assert!(!Canceled.can_transition_to(Refunded));
        assert!(!Pending.can_transition_to(Refunded));
    }

    #[test]
    fn test_subscription_canceled_is_absorbing() {
        use SubscriptionStatus::*;
        for next in [Trialing, Active, PastDue, Paused, Canceled] {
            assert!(!Canceled.can_transition_to(next));
        }
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(!Paused.can_transition_to(PastDue));
        assert!(!Trialing.can_transition_to(PastDue));
    }

    #[test]
    fn test_transaction_sign_rules() {
        use CreditTransactionType::*;
        assert!(Purchase.accepts_amount(10));
        assert!(!Purchase.accepts_amount(-10));
        assert!(Usage.accepts_amount(-1));
        assert!(!Usage.accepts_amount(1));
        assert!(!Expiry.accepts_amount(0));
        assert!(AdminAdjustment.accepts_amount(-5));
        assert!(!AdminAdjustment.accepts_amount(0));
    }

    #[test]
    fn test_days_until_rounds_up() {
        let now = datetime!(2026-01-01 00:00:00 UTC);
        assert_eq!(days_until(datetime!(2026-01-16 00:00:00 UTC), now), 15);
        assert_eq!(days_until(datetime!(2026-01-15 00:00:01 UTC), now), 15);
        assert_eq!(days_until(datetime!(2025-12-31 00:00:00 UTC), now), 0);
    }

    #[test]
    fn test_metadata_serde_shape() {
        let meta = PaymentMetadata::CreditPackage {
            package_id: "credits_100".into(),
            credits: 100,
            validity_days: 365,
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert_eq!(json["kind"], "credit_package");
        assert_eq!(meta.payment_type(), PaymentType::CreditPurchase);
        let back: PaymentMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(PaymentStatus::PartialRefunded.as_str(), "partial_refunded");
        assert_eq!(
            "past_due".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::PastDue
        );
        assert!("bogus".parse::<WebhookStatus>().is_err());
    }
}
