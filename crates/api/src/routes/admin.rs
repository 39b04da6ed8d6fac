//! Operator routes, guarded by `ADMIN_API_SECRET`

use axum::{
    extract::{Path, Query, State},
    Json,
};
use inkwell_billing::{
    InvariantChecker, InvariantCheckSummary, LedgerReceipt, RefundResult, Subscription,
    WebhookAck, WebhookLog, WebhookStatus,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::{ok, ApiError, ApiResponse, ApiResult},
    state::AppState,
};

type Reply<T> = ApiResult<Json<ApiResponse<T>>>;

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Omitted for a full refund of the remainder
    pub amount: Option<i64>,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct AdjustCreditsRequest {
    pub user_id: Uuid,
    pub amount: i64,
    pub reason: String,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookLogQuery {
    pub status: Option<WebhookStatus>,
    pub limit: Option<i64>,
}

pub async fn refund_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<RefundRequest>,
) -> Reply<RefundResult> {
    if request.reason.trim().is_empty() {
        return Err(ApiError::BadRequest("A refund reason is required".to_string()));
    }
    let result = state
        .billing
        .refunds
        .refund_payment(payment_id, request.amount, &request.reason)
        .await?;
    Ok(ok(result))
}

pub async fn adjust_credits(
    State(state): State<AppState>,
    Json(request): Json<AdjustCreditsRequest>,
) -> Reply<LedgerReceipt> {
    let receipt = state
        .billing
        .ledger
        .admin_adjust(
            request.user_id,
            request.amount,
            &request.reason,
            request.idempotency_key,
        )
        .await?;
    Ok(ok(receipt))
}

pub async fn list_webhook_logs(
    State(state): State<AppState>,
    Query(query): Query<WebhookLogQuery>,
) -> Reply<Vec<WebhookLog>> {
    let logs = state
        .billing
        .webhooks
        .list_logs(query.status, query.limit.unwrap_or(50))
        .await?;
    Ok(ok(logs))
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Path(log_id): Path<Uuid>,
) -> Reply<WebhookAck> {
    let ack = state.billing.webhooks.replay(log_id).await?;
    Ok(ok(ack))
}

pub async fn cancel_subscription(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
) -> Reply<Subscription> {
    let sub = state
        .billing
        .store
        .get_subscription(subscription_id)
        .await?
        .ok_or(ApiError::NotFound("Subscription".to_string()))?;
    let canceled = state
        .billing
        .subscriptions
        .cancel_immediately(sub.user_id, subscription_id)
        .await?;
    tracing::info!(
        subscription_id = %subscription_id,
        user_id = %sub.user_id,
        "Subscription canceled by operator"
    );
    Ok(ok(canceled))
}

pub async fn run_invariant_checks(State(state): State<AppState>) -> Reply<InvariantCheckSummary> {
    let pool = state.pool.clone().ok_or_else(|| {
        ApiError::ServiceUnavailable("Invariant checks need a database".to_string())
    })?;
    let summary = InvariantChecker::new(pool).run_all_checks().await?;
    if !summary.violations.is_empty() {
        tracing::warn!(
            violations = summary.violations.len(),
            "Invariant checks found violations"
        );
    }
    Ok(ok(summary))
}
