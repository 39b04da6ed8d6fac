//! Gateway webhook endpoint
//!
//! The body is taken raw: the signature covers the exact bytes delivered.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use inkwell_billing::webhooks::SIGNATURE_HEADER;

use crate::{
    error::{ok, ApiResult},
    state::AppState,
};

/// Receive a gateway event
///
/// Verified deliveries are always acknowledged with 200 so the gateway stops
/// redelivering; a failed reconciliation is logged and replayed by the retry job.
pub async fn gateway_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok());

    let ack = state.billing.webhooks.handle(&body, signature).await?;
    if !ack.accepted {
        tracing::warn!(
            log_id = %ack.log_id,
            error = ?ack.error,
            "Webhook recorded as failed, left for retry"
        );
    }
    Ok((StatusCode::OK, ok(ack)))
}
