// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing System
//!
//! Shared in-memory harness plus the race conditions that cut across modules:
//! - Concurrent debits against one balance
//! - Concurrent daily-quota consumption
//! - Duplicate confirms of one order
//! - Concurrent renewal sweeps of one subscription

use std::sync::Arc;
use std::time::Duration;

use inkwell_shared::PlanCatalog;

use crate::config::BillingPolicy;
use crate::crypto::BillingKeyCipher;
use crate::lock::MemoryJobLock;
use crate::store::MemoryBillingStore;
use crate::testing::{FakeGateway, RecordingAlertSink, RecordingMailer};
use crate::{BillingDeps, BillingService};

pub(crate) const WEBHOOK_SECRET: &str = "whsec_inkwell_test";

/// Billing service over the in-memory store and fake gateway
pub(crate) async fn harness() -> (
    BillingService,
    Arc<FakeGateway>,
    Arc<RecordingAlertSink>,
    Arc<RecordingMailer>,
) {
    harness_with_policy(BillingPolicy::default()).await
}

/// Same as [`harness`] with the given policy (persistence retries stay fast)
pub(crate) async fn harness_with_policy(
    policy: BillingPolicy,
) -> (
    BillingService,
    Arc<FakeGateway>,
    Arc<RecordingAlertSink>,
    Arc<RecordingMailer>,
) {
    let gateway = Arc::new(FakeGateway::new());
    let alerts = Arc::new(RecordingAlertSink::default());
    let mailer = Arc::new(RecordingMailer::default());
    let policy = BillingPolicy {
        persistence_base_delay: Duration::from_millis(1),
        ..policy
    };

    let billing = BillingService::with_components(BillingDeps {
        store: Arc::new(MemoryBillingStore::new()),
        gateway: gateway.clone(),
        alerts: alerts.clone(),
        mailer: mailer.clone(),
        lock: Arc::new(MemoryJobLock::new()),
        catalog: Arc::new(PlanCatalog::builtin()),
        cipher: BillingKeyCipher::from_bytes(&[7u8; 32]).unwrap(),
        policy,
        webhook_secret: WEBHOOK_SECRET.to_string(),
    });
    (billing, gateway, alerts, mailer)
}

#[cfg(test)]
mod ledger_race_tests {
    use super::harness;
    use crate::error::BillingError;
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    // =========================================================================
    // 20 parallel debits of 10 against a balance of 100: exactly 10 succeed
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_debits_never_overdraw() {
        let (billing, _, _, _) = harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "race@example.com").await.unwrap();
        billing
            .ledger
            .admin_adjust(user, 100, "seed balance", None)
            .await
            .unwrap();

        let barrier = Arc::new(Barrier::new(20));
        let mut handles = vec![];
        for i in 0..20 {
            let ledger = billing.ledger.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .debit_credits(user, 10, &format!("op-{}", i), "generation")
                    .await
            }));
        }

        let mut succeeded = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => succeeded += 1,
                Err(BillingError::InsufficientCredits { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        assert_eq!(succeeded, 10);
        assert_eq!(rejected, 10);
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 0);
    }

    // =========================================================================
    // The same operation id debited concurrently is charged once
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_operation_debits_once() {
        let (billing, _, _, _) = harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "dup@example.com").await.unwrap();
        billing
            .ledger
            .admin_adjust(user, 50, "seed balance", None)
            .await
            .unwrap();

        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];
        for _ in 0..8 {
            let ledger = billing.ledger.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger.debit_credits(user, 5, "op-shared", "generation").await
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            let receipt = handle.await.unwrap().unwrap();
            if !receipt.duplicate {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 45);
    }

    // =========================================================================
    // 10 parallel generations on a free quota of 3: exactly 3 succeed
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_quota_consumption_respects_limit() {
        let (billing, _, _, _) = harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "quota@example.com").await.unwrap();

        let barrier = Arc::new(Barrier::new(10));
        let mut handles = vec![];
        for i in 0..10 {
            let ledger = billing.ledger.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                ledger
                    .consume_daily_generation(user, &format!("gen-{}", i))
                    .await
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert!(outcome.applied);
                    allowed += 1;
                }
                Err(BillingError::DailyQuotaExhausted) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(allowed, 3);
        assert_eq!(
            billing.profile(user).await.unwrap().daily_generations_remaining,
            0
        );
    }
}

#[cfg(test)]
mod payment_race_tests {
    use super::harness;
    use crate::models::{CreditTransactionType, PaymentStatus};
    use crate::payments::OrderRequest;
    use uuid::Uuid;

    // =========================================================================
    // Double-submitted confirm: one fulfilment, one grant
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_duplicate_confirm_fulfils_once() {
        let (billing, _, _, _) = harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "double@example.com").await.unwrap();
        let order = billing
            .payments
            .create_order(
                user,
                OrderRequest::CreditPackage {
                    package_id: "credits_500".into(),
                },
            )
            .await
            .unwrap();

        let mut handles = vec![];
        for _ in 0..4 {
            let payments = billing.payments.clone();
            let order_id = order.order_id.clone();
            let amount = order.amount;
            handles.push(tokio::spawn(async move {
                payments
                    .confirm_payment(user, &order_id, "pk_double", amount)
                    .await
            }));
        }
        for handle in handles {
            let _ = handle.await.unwrap();
        }

        let payment = billing
            .store
            .get_payment(order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 500);

        let grants = billing
            .ledger
            .history(user, 50)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.tx_type == CreditTransactionType::Purchase)
            .count();
        assert_eq!(grants, 1);
    }

    // =========================================================================
    // Gateway reports a different total: payment fails, nothing is granted
    // =========================================================================
    #[tokio::test]
    async fn test_gateway_amount_mismatch_grants_nothing() {
        let (billing, gateway, alerts, _) = harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "tamper@example.com").await.unwrap();
        let order = billing
            .payments
            .create_order(
                user,
                OrderRequest::CreditPackage {
                    package_id: "credits_100".into(),
                },
            )
            .await
            .unwrap();

        gateway.report_amount(Some(100)).await;
        let err = billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_tamper", order.amount)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "AMOUNT_MISMATCH");

        let payment = billing
            .store
            .get_payment(order.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payment.status, PaymentStatus::Failed);
        assert_eq!(payment.failure_code.as_deref(), Some("AMOUNT_MISMATCH"));
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 0);
        assert!(!alerts.alerts().await.is_empty());
    }
}

#[cfg(test)]
mod subscription_race_tests {
    use super::harness;
    use crate::models::SubscriptionStatus;
    use crate::subscriptions::{RenewalOutcome, SubscribeRequest};
    use inkwell_shared::BillingCycle;
    use std::sync::Arc;
    use tokio::sync::Barrier;
    use uuid::Uuid;

    // =========================================================================
    // Two workers renewing the same subscription: one charge, one period
    // =========================================================================
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_renewal_charges_once() {
        let (billing, gateway, _, _) = harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "renew@example.com").await.unwrap();
        let sub = billing
            .subscriptions
            .subscribe(
                user,
                SubscribeRequest {
                    plan_id: "pro".into(),
                    cycle: BillingCycle::Monthly,
                    auth_key: "auth_ok".into(),
                    customer_key: "cust_renew".into(),
                },
            )
            .await
            .unwrap();

        let at = sub.current_period_end;
        let barrier = Arc::new(Barrier::new(5));
        let mut handles = vec![];
        for _ in 0..5 {
            let subscriptions = billing.subscriptions.clone();
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                subscriptions.process_renewal(sub.id, at).await
            }));
        }

        let mut renewed = 0;
        for handle in handles {
            if let Ok(RenewalOutcome::Renewed { .. }) = handle.await.unwrap() {
                renewed += 1;
            }
        }
        assert_eq!(renewed, 1);
        assert_eq!(gateway.charge_count().await, 2);

        let current = billing.subscriptions.current(user).await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::Active);
        assert_eq!(current.current_period_start, sub.current_period_end);
        // 300 at signup + 300 for the renewed period
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 600);
    }

    // =========================================================================
    // Terminal states accept no transition
    // =========================================================================
    #[test]
    fn test_canceled_is_terminal() {
        use SubscriptionStatus::*;
        for next in [Trialing, Active, PastDue, Paused] {
            assert!(!Canceled.can_transition_to(next));
        }
        assert!(Active.can_transition_to(PastDue));
        assert!(PastDue.can_transition_to(Active));
        assert!(Paused.can_transition_to(Active));
        assert!(!Paused.can_transition_to(PastDue));
    }
}
