//! Router tests over the in-memory billing engine
//!
//! Tests cover:
//! - Bearer-token authentication of user routes
//! - Order, confirm and credit balance through HTTP
//! - Cron and admin secret separation
//! - Webhook signature rejection
//! - Error envelope shape

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Method, Request, StatusCode},
    Router,
};
use inkwell_billing::{
    testing::{FakeGateway, RecordingAlertSink, RecordingMailer},
    webhooks::{compute_signature, SIGNATURE_HEADER},
    BillingDeps, BillingKeyCipher, BillingPolicy, BillingService, MemoryBillingStore,
    MemoryJobLock,
};
use inkwell_shared::PlanCatalog;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use super::create_router;
use crate::{auth::Claims, config::Config, state::AppState};

const JWT_SECRET: &str = "router-test-jwt-secret";
const CRON_SECRET: &str = "router-test-cron";
const ADMIN_SECRET: &str = "router-test-admin";
const WEBHOOK_SECRET: &str = "whsec_router_test";

fn test_config() -> Config {
    Config {
        bind_address: "127.0.0.1:0".to_string(),
        database_url: None,
        jwt_secret: JWT_SECRET.to_string(),
        cron_secret: CRON_SECRET.to_string(),
        admin_secret: ADMIN_SECRET.to_string(),
        allowed_origins: vec![],
    }
}

fn test_app() -> Router {
    let billing = BillingService::with_components(BillingDeps {
        store: Arc::new(MemoryBillingStore::new()),
        gateway: Arc::new(FakeGateway::new()),
        alerts: Arc::new(RecordingAlertSink::default()),
        mailer: Arc::new(RecordingMailer::default()),
        lock: Arc::new(MemoryJobLock::new()),
        catalog: Arc::new(PlanCatalog::builtin()),
        cipher: BillingKeyCipher::from_bytes(&[9u8; 32]).unwrap(),
        policy: BillingPolicy {
            persistence_base_delay: Duration::from_millis(1),
            ..BillingPolicy::default()
        },
        webhook_secret: WEBHOOK_SECRET.to_string(),
    });
    create_router(AppState::new(billing, test_config(), None))
}

fn user_token(user_id: Uuid) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        email: Some(format!("{}@example.com", user_id)),
        exp: 9_999_999_999,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

fn request(method: Method, uri: &str, bearer: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
    }
    match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

#[tokio::test]
async fn test_health_is_public() {
    let app = test_app();
    let (status, body) = send(&app, request(Method::GET, "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_user_routes_require_valid_token() {
    let app = test_app();

    let (status, body) = send(&app, request(Method::GET, "/api/billing/me", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");

    let (status, _) = send(
        &app,
        request(Method::GET, "/api/billing/me", Some("garbage"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_first_request_creates_free_profile() {
    let app = test_app();
    let user = Uuid::new_v4();
    let token = user_token(user);

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/billing/me", Some(&token), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["profile"]["plan_id"], "free");
    assert_eq!(body["data"]["profile"]["credits_balance"], 0);
    assert!(body["data"]["subscription"].is_null());
}

#[tokio::test]
async fn test_credit_purchase_through_http() {
    let app = test_app();
    let user = Uuid::new_v4();
    let token = user_token(user);

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/billing/orders",
            Some(&token),
            Some(json!({"type": "credit_package", "package_id": "credits_100"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let order_id = body["data"]["order_id"].as_str().unwrap().to_string();
    assert!(order_id.starts_with("CRD"));
    assert_eq!(body["data"]["amount"], 9_900);

    // Client-side tampering with the amount is rejected without side effects
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/billing/payments/confirm",
            Some(&token),
            Some(json!({"paymentKey": "pk_http", "orderId": order_id, "amount": 100})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "AMOUNT_MISMATCH");

    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/billing/payments/confirm",
            Some(&token),
            Some(json!({"paymentKey": "pk_http", "orderId": order_id, "amount": 9_900})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");

    let (_, body) = send(
        &app,
        request(Method::GET, "/api/billing/me", Some(&token), None),
    )
    .await;
    assert_eq!(body["data"]["profile"]["credits_balance"], 100);

    let (status, body) = send(
        &app,
        request(
            Method::GET,
            "/api/billing/credits/history?limit=10",
            Some(&token),
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_package_is_bad_request() {
    let app = test_app();
    let token = user_token(Uuid::new_v4());
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/billing/orders",
            Some(&token),
            Some(json!({"type": "credit_package", "package_id": "credits_free_lunch"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "INVALID_PACKAGE");
}

#[tokio::test]
async fn test_cancel_without_subscription_is_not_found() {
    let app = test_app();
    let token = user_token(Uuid::new_v4());
    let (status, body) = send(
        &app,
        request(
            Method::POST,
            "/api/billing/subscription/cancel",
            Some(&token),
            Some(json!({"immediately": true})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_cron_routes_accept_only_cron_secret() {
    let app = test_app();

    let (status, _) = send(&app, request(Method::GET, "/api/cron/renewals", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        request(Method::GET, "/api/cron/renewals", Some(ADMIN_SECRET), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/cron/renewals", Some(CRON_SECRET), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"], "subscription_renewal");
    assert_eq!(body["success"], true);
    assert_eq!(body["processed"], 0);
    assert!(body["timestamp"].is_string());
}

#[tokio::test]
async fn test_admin_routes_reject_cron_secret() {
    let app = test_app();
    let (status, _) = send(
        &app,
        request(Method::GET, "/api/admin/webhooks", Some(CRON_SECRET), None),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(
        &app,
        request(Method::GET, "/api/admin/webhooks", Some(ADMIN_SECRET), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn test_admin_adjustment_moves_balance() {
    let app = test_app();
    let user = Uuid::new_v4();
    let token = user_token(user);
    // creates the profile
    send(
        &app,
        request(Method::GET, "/api/billing/me", Some(&token), None),
    )
    .await;

    let (status, _) = send(
        &app,
        request(
            Method::POST,
            "/api/admin/credits/adjust",
            Some(ADMIN_SECRET),
            Some(json!({"user_id": user, "amount": 250, "reason": "support goodwill"})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(
        &app,
        request(Method::GET, "/api/billing/me", Some(&token), None),
    )
    .await;
    assert_eq!(body["data"]["profile"]["credits_balance"], 250);
}

#[tokio::test]
async fn test_invariants_need_database() {
    let app = test_app();
    let (status, body) = send(
        &app,
        request(Method::GET, "/api/admin/invariants", Some(ADMIN_SECRET), None),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn test_webhook_signature_checked_on_raw_body() {
    let app = test_app();
    let payload = json!({
        "eventType": "PAYMENT_STATUS_CHANGED",
        "createdAt": "2026-03-01T10:00:00+09:00",
        "data": {"orderId": "CRD_unknown", "status": "DONE"}
    })
    .to_string();

    let unsigned = Request::builder()
        .method(Method::POST)
        .uri("/api/webhooks/gateway")
        .header("content-type", "application/json")
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, body) = send(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");

    let forged = Request::builder()
        .method(Method::POST)
        .uri("/api/webhooks/gateway")
        .header(SIGNATURE_HEADER, compute_signature("not-the-secret", payload.as_bytes()))
        .body(Body::from(payload.clone()))
        .unwrap();
    let (status, _) = send(&app, forged).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let signed = Request::builder()
        .method(Method::POST)
        .uri("/api/webhooks/gateway")
        .header(SIGNATURE_HEADER, compute_signature(WEBHOOK_SECRET, payload.as_bytes()))
        .body(Body::from(payload))
        .unwrap();
    let (status, body) = send(&app, signed).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert!(body["data"]["log_id"].is_string());
}
