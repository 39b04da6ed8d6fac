//! Refunds of completed payments
//!
//! A refund is a gateway cancel followed by the local bookkeeping: the payment
//! moves to `partial_refunded`/`refunded` and a `refund` ledger entry takes
//! back the share of credits the refunded money paid for, or whatever is left
//! of it. Both refund states are final. Gateway-initiated
//! cancels arriving by webhook go through [`RefundService::apply_gateway_refund`]
//! so both paths produce the same local state.
//!
//! Refunds do not touch the subscription; ending it is a separate cancel.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerting::{Alert, AlertSink};
use crate::config::BillingPolicy;
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::ledger::CreditLedger;
use crate::models::{
    CreditTransactionType, NewCreditTransaction, Payment, PaymentStatus, PaymentUpdate,
};
use crate::payments::purchase_key;
use crate::retry::with_persistence_retry;
use crate::store::BillingStore;
use crate::subscriptions::grant_key;

/// Result of a refund
#[derive(Debug, Clone, Serialize)]
pub struct RefundResult {
    pub payment: Payment,
    /// Amount refunded by this call
    pub refunded_now: i64,
    /// Credits removed from the balance by this call
    pub credits_removed: i64,
}

fn refund_key(payment_id: Uuid, refunded_total: i64) -> String {
    format!("refund:{}:{}", payment_id, refunded_total)
}

/// Credits bought by `refund` out of `amount`, rounded half up
fn proportional_credits(granted: i64, refund: i64, amount: i64) -> i64 {
    if amount <= 0 {
        return 0;
    }
    ((granted as i128 * refund as i128 + amount as i128 / 2) / amount as i128) as i64
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: CreditLedger,
    alerts: Arc<dyn AlertSink>,
    policy: BillingPolicy,
}

impl RefundService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: CreditLedger,
        alerts: Arc<dyn AlertSink>,
        policy: BillingPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            ledger,
            alerts,
            policy,
        }
    }

    /// Refund `amount` (or the whole refundable remainder) of a completed payment
    pub async fn refund_payment(
        &self,
        payment_id: Uuid,
        amount: Option<i64>,
        reason: &str,
    ) -> BillingResult<RefundResult> {
        let payment = self
            .store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(payment_id.to_string()))?;

        if payment.status != PaymentStatus::Completed {
            return Err(BillingError::InvalidPaymentTransition {
                from: payment.status.to_string(),
                to: PaymentStatus::Refunded.to_string(),
            });
        }
        let Some(payment_key) = payment.payment_key.clone() else {
            return Err(BillingError::RefundFailed(format!(
                "Payment {} has no gateway payment key",
                payment_id
            )));
        };

        let refundable = payment.refundable_amount();
        let requested = amount.unwrap_or(refundable);
        if requested <= 0 || requested > refundable {
            return Err(BillingError::InvalidAmount(format!(
                "Refund of {} outside refundable range 1..={}",
                requested, refundable
            )));
        }

        // full cancel when nothing would remain
        let cancel_amount = (requested < refundable).then_some(requested);
        let canceled = self
            .gateway
            .cancel_payment(&payment_key, reason, cancel_amount)
            .await?;

        let refunded_total = canceled
            .canceled_amount()
            .max(payment.refunded_amount + requested);

        tracing::info!(
            payment_id = %payment_id,
            order_id = %payment.order_id,
            amount = requested,
            refunded_total = refunded_total,
            reason = %reason,
            "Refund issued at gateway"
        );

        self.apply_gateway_refund(&payment, refunded_total).await
    }

    /// Record that the gateway has refunded `refunded_total` of the payment in total.
    /// A total at or below what is already recorded is a no-op.
    pub async fn apply_gateway_refund(
        &self,
        payment: &Payment,
        refunded_total: i64,
    ) -> BillingResult<RefundResult> {
        let current = self
            .store
            .get_payment(payment.id)
            .await?
            .ok_or_else(|| BillingError::PaymentNotFound(payment.id.to_string()))?;

        let refunded_total = refunded_total.min(current.amount);
        if refunded_total <= current.refunded_amount {
            return Ok(RefundResult {
                payment: current,
                refunded_now: 0,
                credits_removed: 0,
            });
        }

        let target = if refunded_total >= current.amount {
            PaymentStatus::Refunded
        } else {
            PaymentStatus::PartialRefunded
        };
        if current.status == PaymentStatus::PartialRefunded {
            // a partial refund is final locally; further gateway refunds need an operator
            tracing::warn!(
                payment_id = %current.id,
                order_id = %current.order_id,
                recorded = current.refunded_amount,
                gateway_total = refunded_total,
                "Gateway refunded more of a partially refunded payment"
            );
            self.alerts
                .send_alert(Alert::warning(
                    "Further refund on partially refunded payment",
                    serde_json::json!({
                        "payment_id": current.id,
                        "user_id": current.user_id,
                        "order_id": current.order_id,
                        "recorded_refund": current.refunded_amount,
                        "gateway_refund_total": refunded_total,
                    }),
                ))
                .await;
            return Ok(RefundResult {
                payment: current,
                refunded_now: 0,
                credits_removed: 0,
            });
        }
        if !current.status.can_transition_to(target) {
            return Err(BillingError::InvalidPaymentTransition {
                from: current.status.to_string(),
                to: target.to_string(),
            });
        }

        let refunded_now = refunded_total - current.refunded_amount;
        let updated = self
            .store
            .transition_payment(
                current.id,
                current.status,
                target,
                PaymentUpdate {
                    refunded_amount: Some(refunded_total),
                    ..PaymentUpdate::default()
                },
                OffsetDateTime::now_utc(),
            )
            .await?
            .ok_or_else(|| {
                BillingError::ConcurrentModification(format!(
                    "payment {} changed during refund",
                    current.id
                ))
            })?;

        let credits_removed = self.remove_credits(&updated, refunded_now, refunded_total).await?;

        tracing::info!(
            payment_id = %updated.id,
            user_id = %updated.user_id,
            status = %updated.status,
            refunded_now = refunded_now,
            credits_removed = credits_removed,
            "Refund recorded"
        );

        Ok(RefundResult {
            payment: updated,
            refunded_now,
            credits_removed,
        })
    }

    async fn remove_credits(
        &self,
        payment: &Payment,
        refunded_now: i64,
        refunded_total: i64,
    ) -> BillingResult<i64> {
        let grant = match self
            .store
            .find_credit_transaction(&purchase_key(payment.id))
            .await?
        {
            Some(grant) => Some(grant),
            None => self.store.find_credit_transaction(&grant_key(payment.id)).await?,
        };
        let Some(grant) = grant else {
            return Ok(0);
        };

        let credits = proportional_credits(grant.amount, refunded_now, payment.amount);
        if credits <= 0 {
            return Ok(0);
        }

        let entry = NewCreditTransaction {
            user_id: payment.user_id,
            tx_type: CreditTransactionType::Refund,
            amount: -credits,
            description: format!("Refund of order {}", payment.order_id),
            payment_id: Some(payment.id),
            expires_at: None,
            idempotency_key: Some(refund_key(payment.id, refunded_total)),
        };
        let entry = &entry;
        let ledger = &self.ledger;
        let receipt = with_persistence_retry(
            &self.policy,
            self.alerts.as_ref(),
            "refund_credits",
            serde_json::json!({
                "payment_id": payment.id,
                "user_id": payment.user_id,
                "credits": credits,
                "refunded_total": refunded_total,
            }),
            move || async move { ledger.apply_truncated(entry.clone()).await },
        )
        .await?;

        // credits already spent cannot be taken back
        Ok(if receipt.duplicate {
            0
        } else {
            -receipt.transaction.amount
        })
    }
}
