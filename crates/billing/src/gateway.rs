//! Payment gateway client
//!
//! Thin wrapper over the gateway's REST API (Toss Payments v1 shape).
//! Every call is time-boxed and returns a typed [`PaymentError`]:
//!
//! - 4xx → `Terminal` (card rejected, validation, auth, rate limit)
//! - 5xx / connection refused → `Transient`, retried with jittered backoff
//! - timeout / unreadable response → `Unknown`
//!
//! For money-moving calls (confirm, charge) an `Unknown` outcome is resolved
//! by looking the order up before anything is retried, so a charge that
//! actually went through is never sent twice. Mutating requests also carry
//! an `Idempotency-Key` derived from the order id.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::config::GatewayConfig;
use crate::error::{BillingError, BillingResult, PaymentError, PaymentErrorKind};

/// Payment status vocabulary used by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayPaymentStatus {
    Ready,
    InProgress,
    WaitingForDeposit,
    Done,
    Canceled,
    PartialCanceled,
    Aborted,
    Expired,
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayPayment {
    pub payment_key: String,
    pub order_id: String,
    pub status: GatewayPaymentStatus,
    pub total_amount: i64,
    /// Amount still refundable after partial cancels
    #[serde(default)]
    pub balance_amount: Option<i64>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub approved_at: Option<String>,
    /// Deposit-callback secret for virtual-account payments
    #[serde(default)]
    pub secret: Option<String>,
}

impl GatewayPayment {
    /// Total refunded so far according to the gateway
    pub fn canceled_amount(&self) -> i64 {
        self.balance_amount
            .map(|b| (self.total_amount - b).max(0))
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayCard {
    #[serde(default)]
    pub number: Option<String>,
    #[serde(default)]
    pub card_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedBillingKey {
    pub billing_key: String,
    pub customer_key: String,
    #[serde(default)]
    pub card_company: Option<String>,
    #[serde(default)]
    pub card: Option<GatewayCard>,
}

/// Recurring charge against a stored billing key
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub customer_key: String,
    pub amount: i64,
    pub order_id: String,
    pub order_name: String,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    code: String,
    message: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn confirm_payment(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<GatewayPayment, PaymentError>;

    /// Full cancel when `amount` is `None`, partial otherwise
    async fn cancel_payment(
        &self,
        payment_key: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<GatewayPayment, PaymentError>;

    async fn issue_billing_key(
        &self,
        auth_key: &str,
        customer_key: &str,
    ) -> Result<IssuedBillingKey, PaymentError>;

    async fn charge_billing_key(
        &self,
        billing_key: &str,
        request: &ChargeRequest,
    ) -> Result<GatewayPayment, PaymentError>;

    async fn get_payment(&self, payment_key: &str) -> Result<GatewayPayment, PaymentError>;

    async fn find_payment_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<GatewayPayment>, PaymentError>;
}

/// reqwest-based gateway client
#[derive(Clone)]
pub struct HttpGatewayClient {
    client: reqwest::Client,
    config: GatewayConfig,
    auth_header: String,
}

impl std::fmt::Debug for HttpGatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpGatewayClient")
            .field("base_url", &self.config.base_url)
            .finish()
    }
}

impl HttpGatewayClient {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| BillingError::Config(format!("Failed to build HTTP client: {}", e)))?;

        let auth_header = format!("Basic {}", BASE64.encode(format!("{}:", config.secret_key)));

        Ok(Self {
            client,
            config,
            auth_header,
        })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn classify_transport(e: &reqwest::Error) -> PaymentError {
        if e.is_timeout() {
            PaymentError::unknown("TIMEOUT", format!("Gateway call timed out: {}", e))
        } else if e.is_connect() {
            PaymentError::transient("NETWORK_ERROR", format!("Cannot reach gateway: {}", e))
        } else {
            PaymentError::unknown("NETWORK_ERROR", format!("Gateway call interrupted: {}", e))
        }
    }

    fn classify_status(status: StatusCode, body: &str) -> PaymentError {
        let parsed: Option<GatewayErrorBody> = serde_json::from_str(body).ok();
        let (code, message) = match parsed {
            Some(b) => (b.code, b.message),
            None => (
                format!("HTTP_{}", status.as_u16()),
                body.chars().take(200).collect(),
            ),
        };
        if status.is_server_error() {
            PaymentError::transient(code, message)
        } else {
            PaymentError::terminal(code, message)
        }
    }

    /// One HTTP round trip. `Ok(None)` only for 404 when `allow_not_found`.
    async fn send_once<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&serde_json::Value>,
        idempotency_key: Option<&str>,
        allow_not_found: bool,
    ) -> Result<Option<T>, PaymentError> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header("Authorization", &self.auth_header);
        if let Some(key) = idempotency_key {
            req = req.header("Idempotency-Key", key);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| Self::classify_transport(&e))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| Self::classify_transport(&e))?;

        if status == StatusCode::NOT_FOUND && allow_not_found {
            return Ok(None);
        }
        if !status.is_success() {
            let err = Self::classify_status(status, &text);
            tracing::warn!(
                method = %method,
                path = %path,
                status = %status,
                code = %err.code,
                kind = ?err.kind,
                "Gateway call failed"
            );
            return Err(err);
        }

        serde_json::from_str(&text).map(Some).map_err(|e| {
            PaymentError::unknown(
                "INVALID_RESPONSE",
                format!("Unreadable gateway response: {}", e),
            )
        })
    }

    fn retry_strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(3))
            .map(jitter)
            .take(self.config.max_retries)
    }

    /// Retry transient failures of a read or of an already-resolved mutation
    async fn with_retries<T, F, Fut>(&self, op: &str, action: F) -> Result<T, PaymentError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, PaymentError>>,
    {
        RetryIf::spawn(self.retry_strategy(), action, |e: &PaymentError| {
            let retry = e.kind == PaymentErrorKind::Transient;
            if retry {
                tracing::warn!(op = %op, code = %e.code, "Retrying gateway call");
            }
            retry
        })
        .await
    }

    /// Resolve an `Unknown` outcome of a money-moving call by order id.
    /// A missing order becomes `Transient` (safe to resend).
    async fn resolve_unknown(
        &self,
        order_id: &str,
        original: PaymentError,
    ) -> Result<GatewayPayment, PaymentError> {
        tracing::warn!(
            order_id = %order_id,
            code = %original.code,
            "Gateway outcome unknown, re-querying order before retry"
        );
        match self.lookup_order(order_id).await {
            Ok(Some(payment)) if payment.status == GatewayPaymentStatus::Done => {
                tracing::info!(order_id = %order_id, "Order found completed after unknown outcome");
                Ok(payment)
            }
            Ok(Some(payment)) => Err(PaymentError::terminal(
                "NOT_COMPLETED",
                format!("Order {} is in status {:?}", order_id, payment.status),
            )),
            Ok(None) => Err(PaymentError::transient(
                "NOT_FOUND_AFTER_TIMEOUT",
                format!("Order {} not found at gateway, resending", order_id),
            )),
            Err(_) => Err(original),
        }
    }

    async fn lookup_order(&self, order_id: &str) -> Result<Option<GatewayPayment>, PaymentError> {
        self.send_once(
            Method::GET,
            &format!("/payments/orders/{}", order_id),
            None,
            None,
            true,
        )
        .await
    }

    async fn money_call(
        &self,
        op: &str,
        path: &str,
        body: serde_json::Value,
        order_id: &str,
    ) -> Result<GatewayPayment, PaymentError> {
        let body = &body;
        self.with_retries(op, move || async move {
            match self
                .send_once::<GatewayPayment>(Method::POST, path, Some(body), Some(order_id), false)
                .await
            {
                Ok(Some(payment)) => Ok(payment),
                Ok(None) => Err(PaymentError::unknown("EMPTY_RESPONSE", "No payment returned")),
                Err(e) if e.kind == PaymentErrorKind::Unknown => {
                    self.resolve_unknown(order_id, e).await
                }
                Err(e) => Err(e),
            }
        })
        .await
    }
}

#[async_trait]
impl PaymentGateway for HttpGatewayClient {
    async fn confirm_payment(
        &self,
        payment_key: &str,
        order_id: &str,
        amount: i64,
    ) -> Result<GatewayPayment, PaymentError> {
        let body = serde_json::json!({
            "paymentKey": payment_key,
            "orderId": order_id,
            "amount": amount,
        });
        let payment = self
            .money_call("confirm", "/payments/confirm", body, order_id)
            .await?;
        tracing::info!(
            order_id = %order_id,
            status = ?payment.status,
            total_amount = payment.total_amount,
            "Gateway confirmed payment"
        );
        Ok(payment)
    }

    async fn cancel_payment(
        &self,
        payment_key: &str,
        reason: &str,
        amount: Option<i64>,
    ) -> Result<GatewayPayment, PaymentError> {
        let mut body = serde_json::json!({ "cancelReason": reason });
        if let Some(amount) = amount {
            body["cancelAmount"] = amount.into();
        }
        let path = format!("/payments/{}/cancel", payment_key);
        let idempotency = format!("cancel:{}:{}", payment_key, amount.unwrap_or(0));
        let (body, path, idempotency) = (&body, path.as_str(), idempotency.as_str());

        self.with_retries("cancel", move || async move {
            self.send_once::<GatewayPayment>(Method::POST, path, Some(body), Some(idempotency), false)
                .await?
                .ok_or_else(|| PaymentError::unknown("EMPTY_RESPONSE", "No payment returned"))
        })
        .await
    }

    async fn issue_billing_key(
        &self,
        auth_key: &str,
        customer_key: &str,
    ) -> Result<IssuedBillingKey, PaymentError> {
        let body = serde_json::json!({ "authKey": auth_key, "customerKey": customer_key });
        let body = &body;
        self.with_retries("issue_billing_key", move || async move {
            self.send_once::<IssuedBillingKey>(
                Method::POST,
                "/billing/authorizations/issue",
                Some(body),
                None,
                false,
            )
            .await?
            .ok_or_else(|| PaymentError::unknown("EMPTY_RESPONSE", "No billing key returned"))
        })
        .await
    }

    async fn charge_billing_key(
        &self,
        billing_key: &str,
        request: &ChargeRequest,
    ) -> Result<GatewayPayment, PaymentError> {
        let body = serde_json::to_value(request)
            .map_err(|e| PaymentError::terminal("INVALID_REQUEST", e.to_string()))?;
        let payment = self
            .money_call(
                "charge_billing_key",
                &format!("/billing/{}", billing_key),
                body,
                &request.order_id,
            )
            .await?;
        tracing::info!(
            order_id = %request.order_id,
            amount = request.amount,
            status = ?payment.status,
            "Gateway charged billing key"
        );
        Ok(payment)
    }

    async fn get_payment(&self, payment_key: &str) -> Result<GatewayPayment, PaymentError> {
        let path = format!("/payments/{}", payment_key);
        let path = path.as_str();
        self.with_retries("get_payment", move || async move {
            self.send_once::<GatewayPayment>(Method::GET, path, None, None, false)
                .await?
                .ok_or_else(|| PaymentError::unknown("EMPTY_RESPONSE", "No payment returned"))
        })
        .await
    }

    async fn find_payment_by_order_id(
        &self,
        order_id: &str,
    ) -> Result<Option<GatewayPayment>, PaymentError> {
        self.with_retries("find_payment_by_order_id", move || async move {
            self.lookup_order(order_id).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn config(base_url: String) -> GatewayConfig {
        GatewayConfig {
            base_url,
            secret_key: "test_sk".into(),
            webhook_secret: "whsec".into(),
            timeout: Duration::from_millis(300),
            max_retries: 2,
        }
    }

    fn payment_json(order_id: &str, status: &str, amount: i64) -> String {
        serde_json::json!({
            "paymentKey": "pk_1",
            "orderId": order_id,
            "status": status,
            "totalAmount": amount,
            "balanceAmount": amount,
            "method": "CARD",
            "approvedAt": "2026-03-01T09:00:00+09:00"
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_confirm_sends_basic_auth_and_parses() {
        let mut server = mockito::Server::new_async().await;
        let expected_auth = format!("Basic {}", BASE64.encode("test_sk:"));
        let mock = server
            .mock("POST", "/payments/confirm")
            .match_header("authorization", expected_auth.as_str())
            .match_header("idempotency-key", "CRD_20260301000000_0000000A")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "paymentKey": "pk_1",
                "amount": 9900,
            })))
            .with_status(200)
            .with_body(payment_json("CRD_20260301000000_0000000A", "DONE", 9900))
            .create_async()
            .await;

        let client = HttpGatewayClient::new(config(server.url())).unwrap();
        let payment = client
            .confirm_payment("pk_1", "CRD_20260301000000_0000000A", 9900)
            .await
            .unwrap();

        assert_eq!(payment.status, GatewayPaymentStatus::Done);
        assert_eq!(payment.total_amount, 9900);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_4xx_is_terminal_and_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/billing/bk_1")
            .with_status(400)
            .with_body(r#"{"code":"REJECT_CARD_PAYMENT","message":"Card declined"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = HttpGatewayClient::new(config(server.url())).unwrap();
        let err = client
            .charge_billing_key(
                "bk_1",
                &ChargeRequest {
                    customer_key: "cust".into(),
                    amount: 29_900,
                    order_id: "SUB_20260301000000_0000000B".into(),
                    order_name: "Inkwell pro".into(),
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind, PaymentErrorKind::Terminal);
        assert_eq!(err.code, "REJECT_CARD_PAYMENT");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_5xx_is_retried_then_surfaces_transient() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/payments/pk_1")
            .with_status(503)
            .with_body(r#"{"code":"PROVIDER_ERROR","message":"try later"}"#)
            .expect(3)
            .create_async()
            .await;

        let client = HttpGatewayClient::new(config(server.url())).unwrap();
        let err = client.get_payment("pk_1").await.unwrap_err();
        assert_eq!(err.kind, PaymentErrorKind::Transient);
        assert_eq!(err.code, "PROVIDER_ERROR");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_find_by_order_id_maps_404_to_none() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/payments/orders/ORD_20260301000000_0000000C")
            .with_status(404)
            .with_body(r#"{"code":"NOT_FOUND_PAYMENT","message":"none"}"#)
            .create_async()
            .await;

        let client = HttpGatewayClient::new(config(server.url())).unwrap();
        let found = client
            .find_payment_by_order_id("ORD_20260301000000_0000000C")
            .await
            .unwrap();
        assert!(found.is_none());
    }

    /// Charge hangs past the timeout; the order lookup reports it DONE.
    #[tokio::test]
    async fn test_timeout_resolves_by_order_lookup_without_recharging() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let order_id = "SUB_20260301000000_0000000D";
        let done = payment_json(order_id, "DONE", 29_900);

        let charges = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let charges_seen = charges.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let done = done.clone();
                let charges = charges_seen.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let n = socket.read(&mut buf).await.unwrap_or(0);
                    let head = String::from_utf8_lossy(&buf[..n]).to_string();
                    if head.starts_with("POST /billing/") {
                        charges.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        return;
                    }
                    let resp = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        done.len(),
                        done
                    );
                    let _ = socket.write_all(resp.as_bytes()).await;
                });
            }
        });

        let client = HttpGatewayClient::new(config(format!("http://{}", addr))).unwrap();
        let payment = client
            .charge_billing_key(
                "bk_1",
                &ChargeRequest {
                    customer_key: "cust".into(),
                    amount: 29_900,
                    order_id: order_id.into(),
                    order_name: "Inkwell pro".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(payment.status, GatewayPaymentStatus::Done);
        assert_eq!(charges.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unrecognized_status_deserializes() {
        let p: GatewayPayment =
            serde_json::from_str(&payment_json("ORD_x", "SOMETHING_NEW", 1)).unwrap();
        assert_eq!(p.status, GatewayPaymentStatus::Unrecognized);
    }
}
