//! Cron trigger endpoints
//!
//! Thin HTTP wrappers over the scheduled jobs. Each job takes its own
//! cross-process lock, so any trigger (this endpoint or the worker) is safe
//! to fire concurrently.

use axum::{extract::State, http::StatusCode, Json};
use inkwell_billing::{BillingResult, JobReport};
use time::OffsetDateTime;

use crate::{error::ApiResult, state::AppState};

fn respond(result: BillingResult<JobReport>) -> ApiResult<(StatusCode, Json<JobReport>)> {
    let report = result?;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    tracing::info!(
        job = %report.job,
        success = report.success,
        skipped = report.skipped,
        processed = report.processed,
        failed = report.failed,
        duration_ms = report.duration_ms,
        "Cron job finished"
    );
    Ok((status, Json(report)))
}

pub async fn renewals(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<JobReport>)> {
    respond(
        state
            .billing
            .jobs
            .run_renewal_sweep(OffsetDateTime::now_utc())
            .await,
    )
}

pub async fn quota_reset(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<JobReport>)> {
    respond(
        state
            .billing
            .jobs
            .run_daily_quota_reset(OffsetDateTime::now_utc())
            .await,
    )
}

pub async fn credit_expiry(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<JobReport>)> {
    respond(
        state
            .billing
            .jobs
            .run_credit_expiry_sweep(OffsetDateTime::now_utc())
            .await,
    )
}

pub async fn webhook_retry(
    State(state): State<AppState>,
) -> ApiResult<(StatusCode, Json<JobReport>)> {
    respond(
        state
            .billing
            .jobs
            .run_webhook_retry(OffsetDateTime::now_utc())
            .await,
    )
}
