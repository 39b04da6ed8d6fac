//! Payment orders, confirmation and fulfilment
//!
//! A payment row is written as `pending` before the gateway is contacted.
//! It leaves `pending` through a single compare-and-set. Fulfilment (grant
//! credits, activate or advance a subscription) is keyed per payment, so it
//! runs again whenever a completed payment is seen: the confirm retry, the
//! DONE webhook or a replay finish whatever a crashed first run left undone,
//! and find nothing to do otherwise.

use std::sync::Arc;

use inkwell_shared::{BillingCycle, PlanCatalog};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::alerting::{Alert, AlertSink};
use crate::config::BillingPolicy;
use crate::error::{BillingError, BillingResult, PaymentErrorKind};
use crate::gateway::{GatewayPayment, GatewayPaymentStatus, PaymentGateway};
use crate::ledger::CreditLedger;
use crate::models::{
    CreditTransactionType, NewCreditTransaction, Payment, PaymentMetadata, PaymentStatus,
    PaymentUpdate,
};
use crate::order_id::{self, OrderPrefix};
use crate::retry::with_persistence_retry;
use crate::store::BillingStore;
use crate::subscriptions::SubscriptionService;

pub const AMOUNT_MISMATCH_CODE: &str = "AMOUNT_MISMATCH";

/// What the client wants to buy; prices always come from the catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderRequest {
    /// One period of a plan, paid once, no renewal
    PlanPass { plan_id: String, cycle: BillingCycle },
    CreditPackage { package_id: String },
}

/// Outcome of trying to move a payment out of `pending`
#[derive(Debug, Clone)]
pub enum Settlement {
    /// This call completed the payment and must fulfil it
    Completed(Payment),
    /// Another path completed it first
    AlreadyCompleted(Payment),
    /// The payment is in a state the gateway outcome cannot move it from
    Conflict(Payment),
}

/// Moves payments out of `pending` exactly once
#[derive(Clone)]
pub struct PaymentSettler {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    alerts: Arc<dyn AlertSink>,
    policy: BillingPolicy,
}

impl PaymentSettler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        alerts: Arc<dyn AlertSink>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            alerts,
            policy,
        }
    }

    async fn current(&self, payment_id: Uuid) -> BillingResult<Payment> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))
    }

    fn classify(payment: Payment) -> Settlement {
        match payment.status {
            PaymentStatus::Completed
            | PaymentStatus::PartialRefunded
            | PaymentStatus::Refunded => Settlement::AlreadyCompleted(payment),
            _ => Settlement::Conflict(payment),
        }
    }

    /// Complete a pending payment the gateway reports as paid.
    ///
    /// The gateway's total is checked against the stored amount first; a
    /// mismatch fails the payment with `AMOUNT_MISMATCH`, cancels it at the
    /// gateway and raises a critical alert.
    pub async fn settle(
        &self,
        payment: &Payment,
        confirmed: &GatewayPayment,
    ) -> BillingResult<Settlement> {
        let current = self.current(payment.id).await?;
        if current.status != PaymentStatus::Pending {
            return Ok(Self::classify(current));
        }

        if confirmed.total_amount != current.amount {
            self.reject_mismatch(&current, confirmed).await?;
            return Err(BillingError::AmountMismatch {
                expected: current.amount,
                actual: confirmed.total_amount,
            });
        }

        let now = OffsetDateTime::now_utc();
        let update = PaymentUpdate {
            payment_key: Some(confirmed.payment_key.clone()),
            gateway_secret: confirmed.secret.clone(),
            paid_at: Some(now),
            ..PaymentUpdate::default()
        };

        let store = &self.store;
        let update = &update;
        let payment_id = current.id;
        let won = with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "complete_payment",
            serde_json::json!({
                "payment_id": current.id,
                "user_id": current.user_id,
                "order_id": current.order_id,
                "amount": current.amount,
                "payment_key": confirmed.payment_key,
            }),
            move || async move {
                store
                    .transition_payment(
                        payment_id,
                        PaymentStatus::Pending,
                        PaymentStatus::Completed,
                        update.clone(),
                        now,
                    )
                    .await
            },
        )
        .await?;

        match won {
            Some(completed) => {
                tracing::info!(
                    payment_id = %completed.id,
                    order_id = %completed.order_id,
                    user_id = %completed.user_id,
                    amount = completed.amount,
                    "Payment completed"
                );
                Ok(Settlement::Completed(completed))
            }
            None => Ok(Self::classify(self.current(payment.id).await?)),
        }
    }

    /// `pending → failed`; `None` if the payment already left `pending`
    pub async fn fail(
        &self,
        payment: &Payment,
        code: &str,
        reason: &str,
    ) -> BillingResult<Option<Payment>> {
        self.leave_pending(payment, PaymentStatus::Failed, code, reason)
            .await
    }

    /// `pending → canceled`; `None` if the payment already left `pending`
    pub async fn cancel_pending(
        &self,
        payment: &Payment,
        reason: &str,
    ) -> BillingResult<Option<Payment>> {
        self.leave_pending(payment, PaymentStatus::Canceled, "CANCELED", reason)
            .await
    }

    /// Record the payment key and deposit secret of a virtual-account payment.
    /// The payment stays `pending` until the deposit callback arrives.
    pub async fn await_deposit(
        &self,
        payment: &Payment,
        confirmed: &GatewayPayment,
    ) -> BillingResult<Payment> {
        let updated = self
            .store
            .transition_payment(
                payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Pending,
                PaymentUpdate {
                    payment_key: Some(confirmed.payment_key.clone()),
                    gateway_secret: confirmed.secret.clone(),
                    ..PaymentUpdate::default()
                },
                OffsetDateTime::now_utc(),
            )
            .await?;
        match updated {
            Some(waiting) => {
                tracing::info!(
                    order_id = %waiting.order_id,
                    "Payment waiting for deposit"
                );
                Ok(waiting)
            }
            None => self.current(payment.id).await,
        }
    }

    async fn leave_pending(
        &self,
        payment: &Payment,
        to: PaymentStatus,
        code: &str,
        reason: &str,
    ) -> BillingResult<Option<Payment>> {
        let updated = self
            .store
            .transition_payment(
                payment.id,
                PaymentStatus::Pending,
                to,
                PaymentUpdate {
                    failure_code: Some(code.to_string()),
                    failure_reason: Some(reason.to_string()),
                    ..PaymentUpdate::default()
                },
                OffsetDateTime::now_utc(),
            )
            .await?;
        if updated.is_some() {
            tracing::info!(
                payment_id = %payment.id,
                order_id = %payment.order_id,
                status = %to,
                code = %code,
                "Payment closed without completion"
            );
        }
        Ok(updated)
    }

    async fn reject_mismatch(
        &self,
        payment: &Payment,
        confirmed: &GatewayPayment,
    ) -> BillingResult<()> {
        tracing::error!(
            payment_id = %payment.id,
            order_id = %payment.order_id,
            expected = payment.amount,
            actual = confirmed.total_amount,
            "CRITICAL: gateway confirmed an amount different from the order"
        );

        self.store
            .transition_payment(
                payment.id,
                PaymentStatus::Pending,
                PaymentStatus::Failed,
                PaymentUpdate {
                    payment_key: Some(confirmed.payment_key.clone()),
                    failure_code: Some(AMOUNT_MISMATCH_CODE.to_string()),
                    failure_reason: Some(format!(
                        "Expected {} but gateway confirmed {}",
                        payment.amount, confirmed.total_amount
                    )),
                    ..PaymentUpdate::default()
                },
                OffsetDateTime::now_utc(),
            )
            .await?;

        let cancel_result = self
            .gateway
            .cancel_payment(&confirmed.payment_key, "Amount mismatch", None)
            .await;
        if let Err(e) = &cancel_result {
            tracing::error!(
                payment_key = %confirmed.payment_key,
                error = %e,
                "Failed to cancel mismatched payment at gateway"
            );
        }

        self.alerts
            .send_alert(Alert::critical(
                "Payment amount mismatch",
                serde_json::json!({
                    "payment_id": payment.id,
                    "user_id": payment.user_id,
                    "order_id": payment.order_id,
                    "expected": payment.amount,
                    "actual": confirmed.total_amount,
                    "payment_key": confirmed.payment_key,
                    "gateway_canceled": cancel_result.is_ok(),
                }),
            ))
            .await;
        Ok(())
    }
}

/// Orders, confirmation and fulfilment of payments
#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    ledger: CreditLedger,
    subscriptions: SubscriptionService,
    settler: PaymentSettler,
    alerts: Arc<dyn AlertSink>,
    policy: BillingPolicy,
}

impl PaymentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        ledger: CreditLedger,
        subscriptions: SubscriptionService,
        settler: PaymentSettler,
        alerts: Arc<dyn AlertSink>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            ledger,
            subscriptions,
            settler,
            alerts,
            policy,
        }
    }

    /// Price an order from the catalog and record it as `pending`
    pub async fn create_order(
        &self,
        user_id: Uuid,
        request: OrderRequest,
    ) -> BillingResult<Payment> {
        let now = OffsetDateTime::now_utc();

        let (prefix, amount, metadata) = match request {
            OrderRequest::PlanPass { plan_id, cycle } => {
                let plan = self
                    .catalog
                    .plan(&plan_id)
                    .filter(|p| !p.is_free())
                    .ok_or_else(|| BillingError::InvalidPlan(plan_id.clone()))?;
                if self.store.live_subscription(user_id).await?.is_some() {
                    return Err(BillingError::SubscriptionAlreadyActive);
                }
                (
                    OrderPrefix::Order,
                    plan.price(cycle),
                    PaymentMetadata::PlanPass { plan_id, cycle },
                )
            }
            OrderRequest::CreditPackage { package_id } => {
                let package = self
                    .catalog
                    .package(&package_id)
                    .ok_or_else(|| BillingError::InvalidPackage(package_id.clone()))?;
                (
                    OrderPrefix::Credit,
                    package.price,
                    PaymentMetadata::CreditPackage {
                        package_id,
                        credits: package.credits,
                        validity_days: package.validity_days,
                    },
                )
            }
        };

        let payment = Payment::new_pending(
            user_id,
            order_id::generate(prefix, now),
            amount,
            metadata,
            now,
        );
        self.store.insert_payment(&payment).await?;

        tracing::info!(
            user_id = %user_id,
            order_id = %payment.order_id,
            amount = amount,
            "Order created"
        );
        Ok(payment)
    }

    /// Catalog price of what a client-confirmable order buys
    fn catalog_price(&self, metadata: &PaymentMetadata) -> BillingResult<i64> {
        match metadata {
            PaymentMetadata::PlanPass { plan_id, cycle } => self
                .catalog
                .plan(plan_id)
                .map(|p| p.price(*cycle))
                .ok_or_else(|| BillingError::InvalidPlan(plan_id.clone())),
            PaymentMetadata::CreditPackage { package_id, .. } => self
                .catalog
                .package(package_id)
                .map(|p| p.price)
                .ok_or_else(|| BillingError::InvalidPackage(package_id.clone())),
            _ => Err(BillingError::InvalidInput(
                "Billing-key orders are not confirmed by the client".to_string(),
            )),
        }
    }

    /// Confirm a client-side checkout with the gateway and fulfil it
    pub async fn confirm_payment(
        &self,
        user_id: Uuid,
        order_id: &str,
        payment_key: &str,
        amount: i64,
    ) -> BillingResult<Payment> {
        let payment = self
            .store
            .get_payment_by_order_id(order_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| BillingError::PaymentNotFound(order_id.to_string()))?;

        if payment.status != PaymentStatus::Pending {
            if payment.status == PaymentStatus::Completed
                && payment.payment_key.as_deref() == Some(payment_key)
            {
                self.fulfill(&payment).await?;
                return Ok(payment);
            }
            return Err(BillingError::InvalidPaymentTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Completed.to_string(),
            });
        }

        let expected = self.catalog_price(&payment.metadata)?;
        if amount != payment.amount || expected != payment.amount {
            tracing::warn!(
                order_id = %order_id,
                user_id = %user_id,
                client_amount = amount,
                order_amount = payment.amount,
                catalog_amount = expected,
                "Rejected confirm with mismatched amount"
            );
            return Err(BillingError::AmountMismatch {
                expected: payment.amount,
                actual: amount,
            });
        }

        match self
            .gateway
            .confirm_payment(payment_key, order_id, payment.amount)
            .await
        {
            Ok(confirmed) if confirmed.status == GatewayPaymentStatus::WaitingForDeposit => {
                self.settler.await_deposit(&payment, &confirmed).await
            }
            Ok(confirmed) => self.complete_and_fulfill(&payment, &confirmed).await,
            Err(e) if e.kind == PaymentErrorKind::Unknown => {
                tracing::warn!(
                    order_id = %order_id,
                    code = %e.code,
                    "Confirm outcome unknown, leaving payment pending for reconciliation"
                );
                Err(e.into())
            }
            Err(e) => {
                self.settler.fail(&payment, &e.code, &e.message).await?;
                Err(e.into())
            }
        }
    }

    /// Settle a gateway-confirmed payment and make sure it is fulfilled
    pub async fn complete_and_fulfill(
        &self,
        payment: &Payment,
        confirmed: &GatewayPayment,
    ) -> BillingResult<Payment> {
        match self.settler.settle(payment, confirmed).await? {
            Settlement::Completed(completed) => {
                self.fulfill(&completed).await?;
                Ok(completed)
            }
            Settlement::AlreadyCompleted(current) => {
                self.ensure_fulfilled(&current).await?;
                Ok(current)
            }
            Settlement::Conflict(current) => {
                tracing::warn!(
                    order_id = %current.order_id,
                    status = %current.status,
                    "Gateway reports payment done but local state is terminal"
                );
                self.alerts
                    .send_alert(Alert::warning(
                        "Paid order in non-completed local state",
                        serde_json::json!({
                            "payment_id": current.id,
                            "order_id": current.order_id,
                            "status": current.status,
                            "payment_key": confirmed.payment_key,
                        }),
                    ))
                    .await;
                Ok(current)
            }
        }
    }

    /// Re-run fulfilment of a `completed` payment. Refunded payments are left alone.
    pub async fn ensure_fulfilled(&self, payment: &Payment) -> BillingResult<()> {
        if payment.status != PaymentStatus::Completed {
            tracing::debug!(
                order_id = %payment.order_id,
                status = %payment.status,
                "Payment no longer completed, not fulfilling"
            );
            return Ok(());
        }
        self.fulfill(payment).await
    }

    async fn fulfill(&self, payment: &Payment) -> BillingResult<()> {
        match &payment.metadata {
            PaymentMetadata::PlanPass { .. } | PaymentMetadata::Subscription { .. } => {
                self.subscriptions.activate_from_payment(payment).await?;
            }
            PaymentMetadata::Renewal { .. } => {
                self.subscriptions.apply_renewal_payment(payment).await?;
            }
            PaymentMetadata::PlanChange { .. } => {
                self.subscriptions.apply_plan_change_payment(payment).await?;
            }
            PaymentMetadata::CreditPackage {
                package_id,
                credits,
                validity_days,
            } => {
                let entry = NewCreditTransaction {
                    user_id: payment.user_id,
                    tx_type: CreditTransactionType::Purchase,
                    amount: *credits,
                    description: format!("Credit package {}", package_id),
                    payment_id: Some(payment.id),
                    expires_at: Some(OffsetDateTime::now_utc() + Duration::days(*validity_days)),
                    idempotency_key: Some(purchase_key(payment.id)),
                };
                let entry = &entry;
                let ledger = &self.ledger;
                with_persistence_retry(
                    &self.policy,
                    self.alerts.as_ref(),
                    "grant_purchased_credits",
                    serde_json::json!({
                        "payment_id": payment.id,
                        "user_id": payment.user_id,
                        "credits": credits,
                    }),
                    move || async move { ledger.apply_transaction(entry.clone()).await },
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn get_payment_for_user(
        &self,
        user_id: Uuid,
        order_id: &str,
    ) -> BillingResult<Payment> {
        self.store
            .get_payment_by_order_id(order_id)
            .await?
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| BillingError::PaymentNotFound(order_id.to_string()))
    }

    pub async fn list_payments(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<Payment>> {
        self.store
            .list_payments_for_user(user_id, limit.clamp(1, 100))
            .await
    }

    pub fn settler(&self) -> &PaymentSettler {
        &self.settler
    }
}

pub(crate) fn purchase_key(payment_id: Uuid) -> String {
    format!("purchase:{}", payment_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeGateway, RecordingAlertSink};
    use crate::BillingService;

    async fn service() -> (BillingService, Arc<FakeGateway>, Arc<RecordingAlertSink>, Uuid) {
        let (billing, gateway, alerts, _) = crate::edge_case_tests::harness().await;
        let user = Uuid::new_v4();
        billing.ensure_profile(user, "buyer@example.com").await.unwrap();
        (billing, gateway, alerts, user)
    }

    fn credit_order() -> OrderRequest {
        OrderRequest::CreditPackage {
            package_id: "credits_100".into(),
        }
    }

    #[tokio::test]
    async fn test_create_order_prices_from_catalog() {
        let (billing, _, _, user) = service().await;
        let payment = billing.payments.create_order(user, credit_order()).await.unwrap();
        assert_eq!(payment.amount, 9_900);
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.order_id.starts_with("CRD_"));

        let err = billing
            .payments
            .create_order(
                user,
                OrderRequest::CreditPackage {
                    package_id: "credits_9999".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidPackage(_)));
    }

    #[tokio::test]
    async fn test_confirm_grants_credits_once() {
        let (billing, _, _, user) = service().await;
        let order = billing.payments.create_order(user, credit_order()).await.unwrap();

        let paid = billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_abc", 9_900)
            .await
            .unwrap();
        assert_eq!(paid.status, PaymentStatus::Completed);
        assert!(paid.paid_at.is_some());
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 100);

        // client retry of the same confirm is a no-op
        let again = billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_abc", 9_900)
            .await
            .unwrap();
        assert_eq!(again.id, paid.id);
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn test_client_amount_is_never_trusted() {
        let (billing, gateway, _, user) = service().await;
        let order = billing.payments.create_order(user, credit_order()).await.unwrap();

        let err = billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_abc", 100)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::AmountMismatch { .. }));

        // validation failure has no side effects
        let stored = billing
            .payments
            .get_payment_for_user(user, &order.order_id)
            .await
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
        assert!(gateway.payment(&order.order_id).await.is_none());
    }

    #[tokio::test]
    async fn test_terminal_gateway_error_fails_payment() {
        let (billing, gateway, _, user) = service().await;
        let order = billing.payments.create_order(user, credit_order()).await.unwrap();
        gateway
            .fail_next_confirm(crate::error::PaymentError::terminal(
                "REJECT_CARD_COMPANY",
                "declined",
            ))
            .await;

        let err = billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_x", 9_900)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "REJECT_CARD_COMPANY");

        let stored = billing
            .payments
            .get_payment_for_user(user, &order.order_id)
            .await
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Failed);
        assert_eq!(stored.failure_code.as_deref(), Some("REJECT_CARD_COMPANY"));
        assert_eq!(billing.ledger.balance(user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_confirm_outcome_leaves_pending() {
        let (billing, gateway, _, user) = service().await;
        let order = billing.payments.create_order(user, credit_order()).await.unwrap();
        gateway
            .fail_next_confirm(crate::error::PaymentError::unknown("TIMEOUT", "slow"))
            .await;

        assert!(billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_x", 9_900)
            .await
            .is_err());
        let stored = billing
            .payments
            .get_payment_for_user(user, &order.order_id)
            .await
            .unwrap();
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn test_confirm_retry_finishes_interrupted_activation() {
        let (billing, _, _, user) = service().await;
        let order = billing
            .payments
            .create_order(
                user,
                OrderRequest::PlanPass {
                    plan_id: "pro".into(),
                    cycle: BillingCycle::Monthly,
                },
            )
            .await
            .unwrap();

        let done = FakeGateway::done("pk_cut".into(), &order.order_id, order.amount);
        let settled = billing.payments.settler().settle(&order, &done).await.unwrap();
        assert!(matches!(settled, Settlement::Completed(_)));
        assert!(billing.subscriptions.current(user).await.unwrap().is_none());

        let paid = billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_cut", order.amount)
            .await
            .unwrap();
        assert_eq!(paid.status, PaymentStatus::Completed);

        let sub = billing.subscriptions.current(user).await.unwrap().unwrap();
        assert_eq!(sub.plan_id, "pro");
        assert_eq!(billing.profile(user).await.unwrap().plan_id, "pro");

        // a second retry changes nothing
        let balance = billing.ledger.balance(user).await.unwrap();
        billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_cut", order.amount)
            .await
            .unwrap();
        assert_eq!(billing.ledger.balance(user).await.unwrap(), balance);
        assert_eq!(
            billing.subscriptions.current(user).await.unwrap().unwrap().id,
            sub.id
        );
    }

    #[tokio::test]
    async fn test_plan_pass_activates_non_renewing_subscription() {
        let (billing, _, _, user) = service().await;
        let order = billing
            .payments
            .create_order(
                user,
                OrderRequest::PlanPass {
                    plan_id: "pro".into(),
                    cycle: BillingCycle::Monthly,
                },
            )
            .await
            .unwrap();
        assert!(order.order_id.starts_with("ORD_"));
        assert_eq!(order.amount, 29_900);

        billing
            .payments
            .confirm_payment(user, &order.order_id, "pk_pass", 29_900)
            .await
            .unwrap();

        let sub = billing.subscriptions.current(user).await.unwrap().unwrap();
        assert_eq!(sub.plan_id, "pro");
        assert!(sub.cancel_at_period_end);
        assert!(!sub.is_recurring());

        // a second pass while one is live is refused up front
        let err = billing
            .payments
            .create_order(
                user,
                OrderRequest::PlanPass {
                    plan_id: "team".into(),
                    cycle: BillingCycle::Monthly,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionAlreadyActive));
    }
}
