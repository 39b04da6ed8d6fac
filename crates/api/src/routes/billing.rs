//! User billing routes
//!
//! All handlers run behind `require_auth`, so the caller's billing profile exists.

use axum::{
    extract::{Path, Query, State},
    Extension, Json,
};
use inkwell_billing::{
    CreditTransaction, OrderRequest, Payment, PlanChangeOutcome, Profile, ProrationResult,
    SubscribeRequest, Subscription,
};
use inkwell_shared::{BillingCycle, CreditPackage, Plan};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ok, ApiError, ApiResponse, ApiResult},
    state::AppState,
};

type Reply<T> = ApiResult<Json<ApiResponse<T>>>;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub profile: Profile,
    pub subscription: Option<Subscription>,
}

#[derive(Debug, Serialize)]
pub struct CatalogResponse {
    pub plans: Vec<Plan>,
    pub packages: Vec<CreditPackage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    pub payment_key: String,
    pub order_id: String,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct PlanChangeRequest {
    pub plan_id: String,
    pub cycle: BillingCycle,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub immediately: bool,
}

// =============================================================================
// Profile and catalog
// =============================================================================

pub async fn me(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Reply<MeResponse> {
    let profile = state.billing.profile(auth_user.user_id).await?;
    let subscription = state.billing.subscriptions.current(auth_user.user_id).await?;
    Ok(ok(MeResponse {
        profile,
        subscription,
    }))
}

pub async fn plans(State(state): State<AppState>) -> Reply<CatalogResponse> {
    let catalog = &state.billing.catalog;
    Ok(ok(CatalogResponse {
        plans: catalog.plans().into_iter().cloned().collect(),
        packages: catalog.packages().into_iter().cloned().collect(),
    }))
}

pub async fn credit_history(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Reply<Vec<CreditTransaction>> {
    let history = state
        .billing
        .ledger
        .history(auth_user.user_id, query.limit.unwrap_or(50))
        .await?;
    Ok(ok(history))
}

// =============================================================================
// Orders and payments
// =============================================================================

pub async fn create_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<OrderRequest>,
) -> Reply<Payment> {
    let payment = state
        .billing
        .payments
        .create_order(auth_user.user_id, request)
        .await?;
    Ok(ok(payment))
}

pub async fn confirm_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<ConfirmPaymentRequest>,
) -> Reply<Payment> {
    if request.payment_key.trim().is_empty() {
        return Err(ApiError::BadRequest("paymentKey is required".to_string()));
    }
    let payment = state
        .billing
        .payments
        .confirm_payment(
            auth_user.user_id,
            &request.order_id,
            &request.payment_key,
            request.amount,
        )
        .await?;
    Ok(ok(payment))
}

pub async fn list_payments(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<ListQuery>,
) -> Reply<Vec<Payment>> {
    let payments = state
        .billing
        .payments
        .list_payments(auth_user.user_id, query.limit.unwrap_or(20))
        .await?;
    Ok(ok(payments))
}

pub async fn get_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Path(order_id): Path<String>,
) -> Reply<Payment> {
    let payment = state
        .billing
        .payments
        .get_payment_for_user(auth_user.user_id, &order_id)
        .await?;
    Ok(ok(payment))
}

// =============================================================================
// Subscription
// =============================================================================

pub async fn current_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Reply<Option<Subscription>> {
    let sub = state.billing.subscriptions.current(auth_user.user_id).await?;
    Ok(ok(sub))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<SubscribeRequest>,
) -> Reply<Subscription> {
    let sub = state
        .billing
        .subscriptions
        .subscribe(auth_user.user_id, request)
        .await?;
    Ok(ok(sub))
}

pub async fn preview_change(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Query(query): Query<PlanChangeRequest>,
) -> Reply<ProrationResult> {
    let preview = state
        .billing
        .subscriptions
        .preview_change(auth_user.user_id, &query.plan_id, query.cycle)
        .await?;
    Ok(ok(preview))
}

pub async fn change_plan(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    Json(request): Json<PlanChangeRequest>,
) -> Reply<PlanChangeOutcome> {
    let outcome = state
        .billing
        .subscriptions
        .change_plan(auth_user.user_id, &request.plan_id, request.cycle)
        .await?;
    Ok(ok(outcome))
}

/// Cancel at period end, or right away with `{"immediately": true}`
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    request: Option<Json<CancelRequest>>,
) -> Reply<Subscription> {
    let Json(request) = request.unwrap_or_default();
    let subscriptions = &state.billing.subscriptions;

    let sub = if request.immediately {
        let current = subscriptions
            .current(auth_user.user_id)
            .await?
            .ok_or(ApiError::NotFound("Subscription".to_string()))?;
        subscriptions
            .cancel_immediately(auth_user.user_id, current.id)
            .await?
    } else {
        subscriptions.cancel_at_period_end(auth_user.user_id).await?
    };
    Ok(ok(sub))
}

pub async fn resume_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Reply<Subscription> {
    Ok(ok(state.billing.subscriptions.resume(auth_user.user_id).await?))
}

pub async fn pause_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Reply<Subscription> {
    Ok(ok(state.billing.subscriptions.pause(auth_user.user_id).await?))
}

pub async fn unpause_subscription(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> Reply<Subscription> {
    Ok(ok(state.billing.subscriptions.unpause(auth_user.user_id).await?))
}
