//! Operator alerts for failures that need a human
//!
//! Sending an alert never fails from the caller's point of view: delivery
//! problems are logged and swallowed so that alerting cannot mask the
//! original error.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "INFO"),
            AlertSeverity::Warning => write!(f, "WARNING"),
            AlertSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub title: String,
    pub severity: AlertSeverity,
    pub details: serde_json::Value,
}

impl Alert {
    pub fn critical(title: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            severity: AlertSeverity::Critical,
            details,
        }
    }

    pub fn warning(title: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            title: title.into(),
            severity: AlertSeverity::Warning,
            details,
        }
    }
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send_alert(&self, alert: Alert);
}

/// Writes alerts to the log only
#[derive(Debug, Clone, Default)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send_alert(&self, alert: Alert) {
        match alert.severity {
            AlertSeverity::Critical => tracing::error!(
                title = %alert.title,
                details = %alert.details,
                "CRITICAL: billing alert"
            ),
            AlertSeverity::Warning => tracing::warn!(
                title = %alert.title,
                details = %alert.details,
                "Billing alert"
            ),
            AlertSeverity::Info => tracing::info!(
                title = %alert.title,
                details = %alert.details,
                "Billing alert"
            ),
        }
    }
}

/// Posts alerts to a Slack incoming webhook (and always logs them)
#[derive(Debug, Clone)]
pub struct SlackAlertSink {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackAlertSink {
    pub fn new(webhook_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url,
        }
    }

    fn render(alert: &Alert) -> serde_json::Value {
        let emoji = match alert.severity {
            AlertSeverity::Critical => ":rotating_light:",
            AlertSeverity::Warning => ":warning:",
            AlertSeverity::Info => ":information_source:",
        };
        let details = serde_json::to_string_pretty(&alert.details)
            .unwrap_or_else(|_| alert.details.to_string());
        serde_json::json!({
            "text": format!("{} [{}] {}", emoji, alert.severity, alert.title),
            "blocks": [
                {
                    "type": "section",
                    "text": {
                        "type": "mrkdwn",
                        "text": format!("{} *[{}] {}*", emoji, alert.severity, alert.title),
                    }
                },
                {
                    "type": "section",
                    "text": { "type": "mrkdwn", "text": format!("```{}```", details) }
                }
            ]
        })
    }
}

#[async_trait]
impl AlertSink for SlackAlertSink {
    async fn send_alert(&self, alert: Alert) {
        LogAlertSink.send_alert(alert.clone()).await;

        let result = self
            .client
            .post(&self.webhook_url)
            .json(&Self::render(&alert))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => tracing::warn!(
                status = %resp.status(),
                title = %alert.title,
                "Slack rejected billing alert"
            ),
            Err(e) => tracing::warn!(
                error = %e,
                title = %alert.title,
                "Failed to deliver billing alert to Slack"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_slack_sink_posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::Regex("CRITICAL".to_string()))
            .with_status(200)
            .create_async()
            .await;

        let sink = SlackAlertSink::new(format!("{}/hook", server.url()));
        sink.send_alert(Alert::critical(
            "Ledger write failed",
            serde_json::json!({"user_id": "u1", "amount": 300}),
        ))
        .await;

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_slack_failure_is_swallowed() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/hook")
            .with_status(500)
            .create_async()
            .await;

        let sink = SlackAlertSink::new(format!("{}/hook", server.url()));
        // must not panic or propagate
        sink.send_alert(Alert::warning("test", serde_json::json!({})))
            .await;
    }
}
