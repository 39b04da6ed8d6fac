//! Test doubles for the gateway, alert sink and mailer
//!
//! Compiled for this crate's tests and for downstream crates that enable the
//! `testing` feature.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::alerting::{Alert, AlertSink};
use crate::email::Mailer;
use crate::error::{BillingResult, PaymentError};
use crate::gateway::{
    ChargeRequest, GatewayCard, GatewayPayment, GatewayPaymentStatus, IssuedBillingKey,
    PaymentGateway,
};

#[derive(Default)]
struct FakeGatewayState {
    /// Keyed by order id
    payments: HashMap<String, GatewayPayment>,
    confirm_failures: VecDeque<PaymentError>,
    charge_failures: VecDeque<PaymentError>,
    /// Charge goes through at the gateway but the response is lost
    lose_next_charge_response: bool,
    /// Total reported back on confirm/charge instead of the requested amount
    reported_amount: Option<i64>,
    /// Next confirm opens a virtual account with this deposit secret
    deposit_secret: Option<String>,
    charges: usize,
    cancels: Vec<(String, Option<i64>)>,
}

/// In-process gateway with scriptable failures
#[derive(Default)]
pub struct FakeGateway {
    state: Mutex<FakeGatewayState>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_next_confirm(&self, error: PaymentError) {
        self.state.lock().await.confirm_failures.push_back(error);
    }

    pub async fn fail_next_charge(&self, error: PaymentError) {
        self.state.lock().await.charge_failures.push_back(error);
    }

    pub async fn lose_next_charge_response(&self) {
        self.state.lock().await.lose_next_charge_response = true;
    }

    pub async fn report_amount(&self, amount: Option<i64>) {
        self.state.lock().await.reported_amount = amount;
    }

    pub async fn wait_for_deposit_next_confirm(&self, secret: &str) {
        self.state.lock().await.deposit_secret = Some(secret.to_string());
    }

    /// Mark a virtual-account payment as deposited
    pub async fn complete_deposit(&self, order_id: &str) {
        if let Some(payment) = self.state.lock().await.payments.get_mut(order_id) {
            payment.status = GatewayPaymentStatus::Done;
        }
    }

    /// Make the gateway know a payment the engine has not confirmed yet
    pub async fn seed_payment(&self, payment: GatewayPayment) {
        self.state
            .lock()
            .await
            .payments
            .insert(payment.order_id.clone(), payment);
    }

    /// Successful billing-key charges that reached the gateway
    pub async fn charge_count(&self) -> usize {
        self.state.lock().await.charges
    }

    /// `(payment_key, amount)` of every cancel request
    pub async fn cancels(&self) -> Vec<(String, Option<i64>)> {
        self.state.lock().await.cancels.clone()
    }

    pub async fn payment(&self, order_id: &str) -> Option<GatewayPayment> {
        self.state.lock().await.payments.get(order_id).cloned()
    }

    pub fn done(payment_key: String, order_id: &str, total: i64) -> GatewayPayment {
        GatewayPayment {
            payment_key,
            order_id: order_id.to_string(),
            status: GatewayPaymentStatus::Done,
            total_amount: total,
            balance_amount: Some(total),
            method: Some("CARD".to_string()),
            approved_at: None,
            secret: None,
        }
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn confirm_payment(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<GatewayPayment, PaymentError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.confirm_failures.pop_front() {
            return Err(err);
        }
        let total = state.reported_amount.unwrap_or(amount);
        let mut payment = Self::done(payment_key.to_string(), order_id, total);
        if let Some(secret) = state.deposit_secret.take() {
            payment.status = GatewayPaymentStatus::WaitingForDeposit;
            payment.method = Some("VIRTUAL_ACCOUNT".to_string());
            payment.secret = Some(secret);
        }
        state.payments.insert(order_id.to_string(), payment.clone());
        Ok(payment)
    }

    async fn cancel_payment(
        &self,
        payment_key: &str,
        _reason: &str,
        amount: Option<i64>,
    ) -> Result<GatewayPayment, PaymentError> {
        let mut state = self.state.lock().await;
        state.cancels.push((payment_key.to_string(), amount));

        let Some(payment) = state
            .payments
            .values_mut()
            .find(|p| p.payment_key == payment_key)
        else {
            return Err(PaymentError::terminal(
                "NOT_FOUND_PAYMENT",
                "No payment with this key",
            ));
        };

        let balance = payment.balance_amount.unwrap_or(payment.total_amount);
        let cancel = amount.unwrap_or(balance);
        if cancel > balance {
            return Err(PaymentError::terminal(
                "NOT_CANCELABLE_AMOUNT",
                "Cancel amount exceeds the remaining balance",
            ));
        }
        let remaining = balance - cancel;
        payment.balance_amount = Some(remaining);
        payment.status = if remaining == 0 {
            GatewayPaymentStatus::Canceled
        } else {
            GatewayPaymentStatus::PartialCanceled
        };
        Ok(payment.clone())
    }

    async fn issue_billing_key(
        &self,
        auth_key: &str,
        customer_key: &str,
    ) -> Result<IssuedBillingKey, PaymentError> {
        if auth_key.starts_with("invalid") {
            return Err(PaymentError::terminal(
                "INVALID_AUTH_KEY",
                "Authorization key is not valid",
            ));
        }
        Ok(IssuedBillingKey {
            billing_key: format!("bk_{}", customer_key),
            customer_key: customer_key.to_string(),
            card_company: Some("Hyundai".to_string()),
            card: Some(GatewayCard {
                number: Some("4330****1234".to_string()),
                card_type: Some("CREDIT".to_string()),
            }),
        })
    }

    async fn charge_billing_key(
        &self,
        _billing_key: &str,
        request: &ChargeRequest,
    ) -> Result<GatewayPayment, PaymentError> {
        let mut state = self.state.lock().await;
        if let Some(err) = state.charge_failures.pop_front() {
            return Err(err);
        }
        state.charges += 1;
        let total = state.reported_amount.unwrap_or(request.amount);
        let payment = Self::done(format!("pk_{}", request.order_id), &request.order_id, total);
        state
            .payments
            .insert(request.order_id.clone(), payment.clone());

        if std::mem::take(&mut state.lose_next_charge_response) {
            return Err(PaymentError::unknown("TIMEOUT", "Response lost"));
        }
        Ok(payment)
    }

    async fn get_payment(&self, payment_key: &str) -> Result<GatewayPayment, PaymentError> {
        let state = self.state.lock().await;
        state
            .payments
            .values()
            .find(|p| p.payment_key == payment_key)
            .cloned()
            .ok_or_else(|| PaymentError::terminal("NOT_FOUND_PAYMENT", "No payment with this key"))
    }

    async fn find_payment_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<GatewayPayment>, PaymentError> {
        Ok(self.state.lock().await.payments.get(order_id).cloned())
    }
}

/// Keeps every alert for assertions
#[derive(Default)]
pub struct RecordingAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertSink {
    pub async fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send_alert(&self, alert: Alert) {
        self.alerts.lock().await.push(alert);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<SentEmail>>,
}

impl RecordingMailer {
    pub async fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        self.sent.lock().await.push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}
