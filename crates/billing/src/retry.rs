//! Bounded retry for money-relevant persistence steps
//!
//! Used when a side effect has already happened (the gateway took the
//! money, content was generated) and the matching ledger or subscription
//! write must not be lost. Retryable errors are retried with jittered
//! exponential backoff; when attempts run out, a critical alert with the
//! supplied context is raised and the error is returned to the caller.

use std::future::Future;

use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::alerting::{Alert, AlertSink};
use crate::config::BillingPolicy;
use crate::error::{BillingError, BillingResult};

pub async fn with_persistence_retry<T, F, Fut>(
    policy: &BillingPolicy,
    alerts: &dyn AlertSink,
    operation: &str,
    context: serde_json::Value,
    action: F,
) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    // 2^n * factor: base_delay, 2x, 4x, ...
    let factor = (policy.persistence_base_delay.as_millis() as u64 / 2).max(1);
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(factor)
        .max_delay(std::time::Duration::from_secs(5))
        .map(jitter)
        .take(policy.persistence_max_attempts.saturating_sub(1));

    let result = RetryIf::spawn(strategy, action, |e: &BillingError| {
        let retry = e.is_retryable();
        if retry {
            tracing::warn!(operation = %operation, error = %e, "Retrying billing persistence step");
        }
        retry
    })
    .await;

    if let Err(e) = &result {
        tracing::error!(
            operation = %operation,
            error = %e,
            context = %context,
            "CRITICAL: billing persistence step failed after retries, manual reconciliation required"
        );
        let mut details = context;
        if let Some(obj) = details.as_object_mut() {
            obj.insert("operation".into(), operation.into());
            obj.insert("error".into(), e.to_string().into());
            obj.insert("error_code".into(), e.code().into());
        }
        alerts
            .send_alert(Alert::critical(
                format!("Billing persistence failed: {}", operation),
                details,
            ))
            .await;
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingAlertSink;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_policy() -> BillingPolicy {
        BillingPolicy {
            persistence_base_delay: Duration::from_millis(2),
            ..BillingPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failures() {
        let alerts = RecordingAlertSink::default();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = with_persistence_retry(
            &fast_policy(),
            &alerts,
            "grant_credits",
            serde_json::json!({}),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BillingError::Database("connection reset".into()))
                } else {
                    Ok(42)
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(alerts.alerts().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhaustion_raises_critical_alert() {
        let alerts = RecordingAlertSink::default();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: BillingResult<()> = with_persistence_retry(
            &fast_policy(),
            &alerts,
            "grant_credits",
            serde_json::json!({"user_id": "u1", "amount": 300}),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BillingError::Database("down".into()))
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let sent = alerts.alerts().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].details["amount"], 300);
        assert_eq!(sent[0].details["operation"], "grant_credits");
    }

    #[tokio::test]
    async fn test_non_retryable_fails_fast() {
        let alerts = RecordingAlertSink::default();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: BillingResult<()> = with_persistence_retry(
            &fast_policy(),
            &alerts,
            "activate",
            serde_json::json!({}),
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(BillingError::ProfileNotFound("u1".into()))
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(alerts.alerts().await.len(), 1);
    }
}
