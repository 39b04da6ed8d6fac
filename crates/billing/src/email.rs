//! Billing notification e-mails
//!
//! Delivery goes through the Resend HTTP API when `RESEND_API_KEY` is set,
//! otherwise messages are only logged.

use std::time::Duration;

use async_trait::async_trait;
use inkwell_shared::Plan;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

const RESEND_API_URL: &str = "https://api.resend.com/emails";

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> BillingResult<()>;
}

/// Logs messages instead of sending them
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_email(&self, to: &str, subject: &str, _body: &str) -> BillingResult<()> {
        tracing::info!(to = %to, subject = %subject, "Email delivery disabled, not sent");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ResendMailer {
    client: reqwest::Client,
    api_key: String,
    from: String,
    endpoint: String,
}

impl ResendMailer {
    pub fn new(api_key: String, from: String) -> Self {
        Self::with_endpoint(api_key, from, RESEND_API_URL.to_string())
    }

    pub fn with_endpoint(api_key: String, from: String, endpoint: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            from,
            endpoint,
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> BillingResult<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": self.from,
                "to": [to],
                "subject": subject,
                "html": body,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("Email send failed: {}", e)))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(BillingError::Internal(format!(
                "Email provider returned {}: {}",
                status, text
            )));
        }

        tracing::info!(to = %to, subject = %subject, "Billing email sent");
        Ok(())
    }
}

/// Templates for the messages the engine sends
pub struct BillingEmails;

impl BillingEmails {
    pub fn renewal_failed(
        plan: &Plan,
        reason: &str,
        next_retry_at: Option<OffsetDateTime>,
    ) -> (String, String) {
        let retry_line = match next_retry_at {
            Some(at) => format!("<p>We will try again on {}.</p>", at.date()),
            None => "<p>No further attempts will be made.</p>".to_string(),
        };
        (
            format!("Payment for your Inkwell {} plan failed", plan.name),
            format!(
                "<p>We could not renew your <strong>{}</strong> subscription.</p>\
                 <p>Reason: {}</p>{}\
                 <p>Please check your card details in billing settings.</p>",
                plan.name, reason, retry_line
            ),
        )
    }

    pub fn subscription_canceled(plan: &Plan) -> (String, String) {
        (
            format!("Your Inkwell {} subscription has ended", plan.name),
            format!(
                "<p>Your <strong>{}</strong> subscription has been canceled and your \
                 account is now on the Free plan.</p>\
                 <p>You can subscribe again at any time.</p>",
                plan.name
            ),
        )
    }

    pub fn plan_changed(from: &Plan, to: &Plan, effective: OffsetDateTime) -> (String, String) {
        (
            format!("Your plan changes to {}", to.name),
            format!(
                "<p>Your plan changes from <strong>{}</strong> to <strong>{}</strong> \
                 effective {}.</p>",
                from.name,
                to.name,
                effective.date()
            ),
        )
    }
}
