//! Gateway webhook handling
//!
//! Deliveries are verified (HMAC-SHA256 over the raw body), logged, and
//! reconciled against the local payment found by the gateway's own
//! identifiers. Reconciliation reuses the synchronous paths
//! (`complete_and_fulfill`, the settler, `apply_gateway_refund`), so a
//! delivery that arrives after the confirm call, or twice, is a no-op.
//!
//! Failed reconciliations stay in the log as `failed` and are replayed by
//! an operator or the webhook retry job while `retry_count` is below the limit.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::alerting::{Alert, AlertSink};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{GatewayPaymentStatus, PaymentGateway};
use crate::models::{Payment, PaymentStatus, WebhookLog, WebhookStatus};
use crate::payments::{PaymentService, PaymentSettler};
use crate::refund::RefundService;
use crate::store::BillingStore;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex HMAC of the body
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Hex HMAC-SHA256 of `body`
pub fn compute_signature(secret: &str, body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a signature header (`<hex>` or `sha256=<hex>`)
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let header = header.trim();
    let provided = header.strip_prefix("sha256=").unwrap_or(header);
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// Map the gateway's status onto the local payment status it implies.
/// `None` for statuses that do not settle anything.
pub fn map_gateway_status(
    status: GatewayPaymentStatus,
    current: PaymentStatus,
) -> Option<PaymentStatus> {
    use GatewayPaymentStatus as G;
    match status {
        G::Done => Some(PaymentStatus::Completed),
        G::Canceled => Some(match current {
            PaymentStatus::Completed | PaymentStatus::PartialRefunded | PaymentStatus::Refunded => {
                PaymentStatus::Refunded
            }
            _ => PaymentStatus::Canceled,
        }),
        G::PartialCanceled => Some(PaymentStatus::PartialRefunded),
        G::Aborted | G::Expired => Some(PaymentStatus::Failed),
        G::Ready | G::InProgress | G::WaitingForDeposit | G::Unrecognized => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_type: String,
    #[serde(default)]
    pub created_at: Option<String>,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookData {
    #[serde(default)]
    pub payment_key: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub status: Option<GatewayPaymentStatus>,
    #[serde(default)]
    pub customer_key: Option<String>,
    #[serde(default)]
    pub transaction_key: Option<String>,
    /// Present on virtual-account deposit callbacks
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        status: PaymentStatus,
    },
    /// Local state already reflects the event
    AlreadyApplied,
    Ignored {
        reason: &'static str,
    },
    /// Event contradicts a terminal local state; left for an operator
    Conflict {
        local: PaymentStatus,
        gateway: PaymentStatus,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookAck {
    pub accepted: bool,
    pub log_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ReconcileOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Webhook reconciler for gateway events
#[derive(Clone)]
pub struct WebhookReconciler {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    payments: PaymentService,
    settler: PaymentSettler,
    refunds: RefundService,
    alerts: Arc<dyn AlertSink>,
    secret: String,
    max_retries: i32,
}

impl WebhookReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        payments: PaymentService,
        refunds: RefundService,
        alerts: Arc<dyn AlertSink>,
        secret: String,
        max_retries: i32,
    ) -> Self {
        let settler = payments.settler().clone();
        Self {
            store,
            gateway,
            payments,
            settler,
            refunds,
            alerts,
            secret,
            max_retries,
        }
    }

    /// Verify, log and reconcile one delivery.
    ///
    /// Unverifiable or malformed payloads are rejected before anything is
    /// written. A verified delivery whose reconciliation fails is logged as
    /// `failed` and acknowledged with `accepted = false`.
    pub async fn handle(&self, raw: &[u8], signature: Option<&str>) -> BillingResult<WebhookAck> {
        let verified = signature.is_some_and(|sig| verify_signature(&self.secret, raw, sig));
        if !verified {
            tracing::warn!(
                payload_len = raw.len(),
                has_signature = signature.is_some(),
                "Rejected webhook with invalid signature"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let payload: serde_json::Value = serde_json::from_slice(raw)
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;
        let event: WebhookEvent = serde_json::from_value(payload.clone())
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        if let Some(secret) = event.data.secret.as_deref() {
            self.verify_deposit_secret(&event.data, secret).await?;
        }

        let log = WebhookLog {
            id: Uuid::new_v4(),
            event_type: event.event_type.clone(),
            payload,
            status: WebhookStatus::Pending,
            retry_count: 0,
            last_error: None,
            processed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        self.store.insert_webhook_log(&log).await?;

        tracing::info!(
            log_id = %log.id,
            event_type = %event.event_type,
            order_id = ?event.data.order_id,
            status = ?event.data.status,
            "Webhook received"
        );

        self.process(log.id, &event).await
    }

    /// Deposit callbacks carry the secret the gateway returned at confirm time
    async fn verify_deposit_secret(&self, data: &WebhookData, secret: &str) -> BillingResult<()> {
        let Some(payment) = self.find_payment(data).await? else {
            return Ok(());
        };
        let matches = payment
            .gateway_secret
            .as_deref()
            .is_some_and(|expected| bool::from(expected.as_bytes().ct_eq(secret.as_bytes())));
        if !matches {
            tracing::warn!(
                order_id = %payment.order_id,
                "Rejected deposit callback with mismatched secret"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }
        Ok(())
    }

    async fn process(&self, log_id: Uuid, event: &WebhookEvent) -> BillingResult<WebhookAck> {
        let now = OffsetDateTime::now_utc();
        match self.reconcile(event).await {
            Ok(outcome) => {
                self.store
                    .finish_webhook_log(log_id, WebhookStatus::Processed, None, now)
                    .await?;
                tracing::info!(log_id = %log_id, outcome = ?outcome, "Webhook processed");
                Ok(WebhookAck {
                    accepted: true,
                    log_id,
                    outcome: Some(outcome),
                    error: None,
                })
            }
            Err(e) => {
                let log = self
                    .store
                    .finish_webhook_log(log_id, WebhookStatus::Failed, Some(e.to_string()), now)
                    .await?;
                tracing::error!(
                    log_id = %log_id,
                    event_type = %event.event_type,
                    retry_count = log.retry_count,
                    error = %e,
                    "Webhook reconciliation failed"
                );
                Ok(WebhookAck {
                    accepted: false,
                    log_id,
                    outcome: None,
                    error: Some(e.to_string()),
                })
            }
        }
    }

    async fn find_payment(&self, data: &WebhookData) -> BillingResult<Option<Payment>> {
        if let Some(key) = data.payment_key.as_deref() {
            if let Some(payment) = self.store.get_payment_by_key(key).await? {
                return Ok(Some(payment));
            }
        }
        match data.order_id.as_deref() {
            Some(order_id) => self.store.get_payment_by_order_id(order_id).await,
            None => Ok(None),
        }
    }

    async fn reconcile(&self, event: &WebhookEvent) -> BillingResult<ReconcileOutcome> {
        let data = &event.data;
        let Some(payment) = self.find_payment(data).await? else {
            tracing::debug!(
                order_id = ?data.order_id,
                customer_key = ?data.customer_key,
                "Webhook for unknown payment"
            );
            return Ok(ReconcileOutcome::Ignored {
                reason: "unknown_payment",
            });
        };
        let Some(gateway_status) = data.status else {
            return Ok(ReconcileOutcome::Ignored { reason: "no_status" });
        };
        let Some(target) = map_gateway_status(gateway_status, payment.status) else {
            return Ok(ReconcileOutcome::Ignored {
                reason: "non_terminal_status",
            });
        };

        match target {
            PaymentStatus::Completed => self.reconcile_completed(&payment, data).await,
            PaymentStatus::Failed | PaymentStatus::Canceled => {
                self.reconcile_closed(&payment, gateway_status, target).await
            }
            PaymentStatus::Refunded | PaymentStatus::PartialRefunded => {
                self.reconcile_refund(&payment, data, target).await
            }
            PaymentStatus::Pending => Ok(ReconcileOutcome::Ignored {
                reason: "non_terminal_status",
            }),
        }
    }

    async fn reconcile_completed(
        &self,
        payment: &Payment,
        data: &WebhookData,
    ) -> BillingResult<ReconcileOutcome> {
        match payment.status {
            PaymentStatus::Completed => {
                self.payments.ensure_fulfilled(payment).await?;
                return Ok(ReconcileOutcome::AlreadyApplied);
            }
            PaymentStatus::PartialRefunded | PaymentStatus::Refunded => {
                return Ok(ReconcileOutcome::AlreadyApplied)
            }
            PaymentStatus::Pending => {}
            _ => return Ok(self.conflict(payment, PaymentStatus::Completed).await),
        }

        let payment_key = data
            .payment_key
            .clone()
            .or_else(|| payment.payment_key.clone())
            .ok_or_else(|| BillingError::WebhookPayloadInvalid("missing paymentKey".into()))?;

        // never trust the delivery body for amounts
        let confirmed = self.gateway.get_payment(&payment_key).await?;
        if confirmed.order_id != payment.order_id {
            return Err(BillingError::WebhookPayloadInvalid(format!(
                "payment key belongs to order {}",
                confirmed.order_id
            )));
        }
        if confirmed.status != GatewayPaymentStatus::Done {
            return Ok(ReconcileOutcome::Ignored {
                reason: "gateway_not_done",
            });
        }

        let settled = self.payments.complete_and_fulfill(payment, &confirmed).await?;
        Ok(match settled.status {
            PaymentStatus::Completed => ReconcileOutcome::Applied {
                status: PaymentStatus::Completed,
            },
            _ => ReconcileOutcome::Conflict {
                local: settled.status,
                gateway: PaymentStatus::Completed,
            },
        })
    }

    async fn reconcile_closed(
        &self,
        payment: &Payment,
        gateway_status: GatewayPaymentStatus,
        target: PaymentStatus,
    ) -> BillingResult<ReconcileOutcome> {
        match payment.status {
            PaymentStatus::Failed | PaymentStatus::Canceled => {
                return Ok(ReconcileOutcome::AlreadyApplied)
            }
            PaymentStatus::Pending => {}
            _ => return Ok(self.conflict(payment, target).await),
        }

        let reason = format!("Gateway reported {:?}", gateway_status);
        let closed = if target == PaymentStatus::Failed {
            self.settler.fail(payment, "GATEWAY_ABORTED", &reason).await?
        } else {
            self.settler.cancel_pending(payment, &reason).await?
        };
        Ok(match closed {
            Some(closed) => ReconcileOutcome::Applied {
                status: closed.status,
            },
            None => ReconcileOutcome::AlreadyApplied,
        })
    }

    async fn reconcile_refund(
        &self,
        payment: &Payment,
        data: &WebhookData,
        target: PaymentStatus,
    ) -> BillingResult<ReconcileOutcome> {
        if !matches!(
            payment.status,
            PaymentStatus::Completed | PaymentStatus::PartialRefunded | PaymentStatus::Refunded
        ) {
            return Ok(self.conflict(payment, target).await);
        }

        let payment_key = payment
            .payment_key
            .clone()
            .or_else(|| data.payment_key.clone())
            .ok_or_else(|| BillingError::WebhookPayloadInvalid("missing paymentKey".into()))?;
        let gateway_payment = self.gateway.get_payment(&payment_key).await?;
        let refunded_total = match gateway_payment.canceled_amount() {
            0 if target == PaymentStatus::Refunded => payment.amount,
            total => total,
        };

        let result = self
            .refunds
            .apply_gateway_refund(payment, refunded_total)
            .await?;
        Ok(if result.refunded_now == 0 {
            ReconcileOutcome::AlreadyApplied
        } else {
            ReconcileOutcome::Applied {
                status: result.payment.status,
            }
        })
    }

    async fn conflict(&self, payment: &Payment, gateway: PaymentStatus) -> ReconcileOutcome {
        tracing::warn!(
            payment_id = %payment.id,
            order_id = %payment.order_id,
            local = %payment.status,
            gateway = %gateway,
            "Webhook conflicts with local payment state"
        );
        self.alerts
            .send_alert(Alert::warning(
                "Webhook conflicts with local payment state",
                serde_json::json!({
                    "payment_id": payment.id,
                    "order_id": payment.order_id,
                    "local_status": payment.status,
                    "gateway_status": gateway,
                }),
            ))
            .await;
        ReconcileOutcome::Conflict {
            local: payment.status,
            gateway,
        }
    }

    // =========================================================================
    // Log operations
    // =========================================================================

    /// Re-run reconciliation for a logged delivery
    pub async fn replay(&self, log_id: Uuid) -> BillingResult<WebhookAck> {
        let log = self
            .store
            .get_webhook_log(log_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("webhook log {}", log_id)))?;

        if log.status == WebhookStatus::Processed {
            return Ok(WebhookAck {
                accepted: true,
                log_id,
                outcome: Some(ReconcileOutcome::AlreadyApplied),
                error: None,
            });
        }
        if log.retry_count >= self.max_retries {
            return Err(BillingError::WebhookRetryExhausted(log.retry_count));
        }

        let event: WebhookEvent = serde_json::from_value(log.payload.clone())
            .map_err(|e| BillingError::WebhookPayloadInvalid(e.to_string()))?;

        tracing::info!(
            log_id = %log_id,
            event_type = %log.event_type,
            retry_count = log.retry_count,
            "Replaying webhook"
        );
        self.process(log_id, &event).await
    }

    /// Replay failed deliveries that still have attempts left, oldest first
    pub async fn replay_failed(&self, limit: i64) -> BillingResult<Vec<WebhookAck>> {
        let logs = self
            .store
            .list_retryable_webhook_logs(self.max_retries, limit)
            .await?;

        let mut acks = Vec::with_capacity(logs.len());
        for log in logs {
            match self.replay(log.id).await {
                Ok(ack) => acks.push(ack),
                Err(e) => {
                    tracing::error!(log_id = %log.id, error = %e, "Failed to replay webhook");
                    acks.push(WebhookAck {
                        accepted: false,
                        log_id: log.id,
                        outcome: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        Ok(acks)
    }

    pub async fn list_logs(
        &self,
        status: Option<WebhookStatus>,
        limit: i64,
    ) -> BillingResult<Vec<WebhookLog>> {
        self.store
            .list_webhook_logs(status, limit.clamp(1, 200))
            .await
    }
}
