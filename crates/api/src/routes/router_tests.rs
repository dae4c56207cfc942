//! Router tests
//!
//! Tests cover:
//! - Cron secret enforcement
//! - User token enforcement and merchant resolution
//! - Signed webhook delivery end to end
//! - Error body shape and status mapping

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header::AUTHORIZATION, Request, StatusCode},
    Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use stacker_billing::{
    testing::MockPaymentProvider,
    webhooks::{HEADER_ID, HEADER_SIGNATURE, HEADER_TIMESTAMP},
    BillingPolicy, BillingService, MemoryLedgerStore, WhopConfig,
};
use time::OffsetDateTime;
use tower::ServiceExt;

use crate::{
    auth::USER_TOKEN_HEADER,
    config::{Config, UserTokenKey},
    routes::create_router,
    state::AppState,
};

const CRON_SECRET: &str = "test-cron-secret";
const TOKEN_SECRET: &str = "test-token-secret";
const WEBHOOK_SECRET: &str = "whsec_MfKQ9r8GKYqrTwjUPD8ILPZIo2LaLaSw";

struct TestApp {
    router: Router,
    store: Arc<MemoryLedgerStore>,
    billing: Arc<BillingService>,
}

fn test_app() -> TestApp {
    let store = Arc::new(MemoryLedgerStore::new());
    let whop = WhopConfig {
        api_key: "test".to_string(),
        api_base_url: "http://localhost".to_string(),
        webhook_secret: WEBHOOK_SECRET.to_string(),
        billing_company_id: "biz_platform".to_string(),
        pay_now_redirect_url: None,
    };
    let billing = Arc::new(
        BillingService::new(
            store.clone(),
            Arc::new(MockPaymentProvider::new()),
            BillingPolicy::default(),
            &whop,
        )
        .unwrap(),
    );
    let config = Config {
        bind_address: "127.0.0.1:0".to_string(),
        database_url: "postgres://localhost/unused".to_string(),
        cron_secret: CRON_SECRET.to_string(),
        user_token_key: UserTokenKey::Hs256Secret(TOKEN_SECRET.to_string()),
        app_id: None,
        allowed_origins: vec![],
    };
    let state = AppState::new(billing.clone(), config).unwrap();
    TestApp {
        router: create_router(state),
        store,
        billing,
    }
}

fn user_token(user_id: &str) -> String {
    let exp = OffsetDateTime::now_utc().unix_timestamp() + 3600;
    encode(
        &Header::default(),
        &json!({ "sub": user_id, "exp": exp }),
        &EncodingKey::from_secret(TOKEN_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn send(app: &TestApp, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.router.clone().oneshot(request).await.unwrap();
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

fn as_user(method: &str, uri: &str, user_id: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(USER_TOKEN_HEADER, user_token(user_id));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn signed_webhook(app: &TestApp, message_id: &str, payload: &Value) -> Request<Body> {
    let body = payload.to_string();
    let timestamp = OffsetDateTime::now_utc().unix_timestamp().to_string();
    let signature = app
        .billing
        .webhooks
        .verifier()
        .sign(message_id, &timestamp, body.as_bytes())
        .unwrap();
    Request::builder()
        .method("POST")
        .uri("/api/webhooks/whop")
        .header("content-type", "application/json")
        .header(HEADER_ID, message_id)
        .header(HEADER_TIMESTAMP, timestamp)
        .header(HEADER_SIGNATURE, signature)
        .body(Body::from(body))
        .unwrap()
}

async fn register(app: &TestApp, user_id: &str, company_id: &str) -> Value {
    let (status, body) = send(
        app,
        as_user(
            "POST",
            "/api/merchants",
            user_id,
            Some(json!({ "company_id": company_id })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn test_health() {
    let app = test_app();
    let (status, body) = send(
        &app,
        Request::builder().uri("/health").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_cron_requires_secret() {
    let app = test_app();

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/cron/billing")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let (status, _) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/cron/billing")
            .header(AUTHORIZATION, "Bearer test-cron-secreT")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/cron/billing")
            .header(AUTHORIZATION, format!("Bearer {}", CRON_SECRET))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["processed"], 0);
    assert_eq!(body["failed"], 0);
}

#[tokio::test]
async fn test_cron_invariants() {
    let app = test_app();
    let cron = |uri: &str| {
        Request::builder()
            .uri(uri)
            .header(AUTHORIZATION, format!("Bearer {}", CRON_SECRET))
            .body(Body::empty())
            .unwrap()
    };

    let (status, body) = send(&app, cron("/api/cron/invariants")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["healthy"], true);
    assert_eq!(body["checks_run"], 5);

    let (status, body) = send(
        &app,
        cron("/api/cron/invariants?check=single_in_flight_invoice"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks_run"], 1);

    let (status, body) = send(&app, cron("/api/cron/invariants?check=nonsense")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_billing_routes_require_user_token() {
    let app = test_app();

    let (status, _) = send(
        &app,
        Request::builder()
            .uri("/api/billing/status")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        Request::builder()
            .uri("/api/billing/status")
            .header(USER_TOKEN_HEADER, "not-a-jwt")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unregistered_user_is_not_found() {
    let app = test_app();
    let (status, body) = send(&app, as_user("GET", "/api/billing/status", "user_ghost", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_register_and_read_status() {
    let app = test_app();
    let merchant = register(&app, "user_1", "biz_seller").await;
    assert_eq!(merchant["external_company_id"], "biz_seller");
    assert_eq!(merchant["billing_status"], "active");

    // Registration is idempotent
    let again = register(&app, "user_1", "biz_seller").await;
    assert_eq!(again["id"], merchant["id"]);

    let (status, body) = send(&app, as_user("GET", "/api/billing/status", "user_1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["pending_fee_cents"], 0);
    assert_eq!(body["payment_method_connected"], false);

    let (status, body) =
        send(&app, as_user("GET", "/api/billing/flow-access", "user_1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["allowed"], true);
    assert_eq!(body["status"], "active");

    let (status, body) =
        send(&app, as_user("GET", "/api/billing/payment-methods", "user_1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], "pm_test");
}

#[tokio::test]
async fn test_retry_while_active_is_bad_request() {
    let app = test_app();
    register(&app, "user_1", "biz_seller").await;

    let (status, body) = send(&app, as_user("POST", "/api/billing/retry", "user_1", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_webhook_rejects_unsigned_delivery() {
    let app = test_app();
    let (status, body) = send(
        &app,
        Request::builder()
            .method("POST")
            .uri("/api/webhooks/whop")
            .body(Body::from("{}"))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "invalid_signature");
}

#[tokio::test]
async fn test_signed_sale_then_pay_now_below_minimum() {
    let app = test_app();
    register(&app, "user_1", "biz_seller").await;

    // $6.00 sale accrues a $0.30 fee
    let sale = json!({
        "id": "evt_1",
        "type": "payment.succeeded",
        "data": {
            "id": "pay_1",
            "company": { "id": "biz_seller" },
            "product": { "id": "prod_1", "title": "Course" },
            "total": 6.0,
            "currency": "usd"
        }
    });
    let (status, body) = send(&app, signed_webhook(&app, "msg_1", &sale)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "processed");
    assert_eq!(body["outcome"]["result"], "sale_recorded");
    assert_eq!(body["outcome"]["fee_amount_cents"], 30);

    // Redelivery is acknowledged without a second transaction
    let (status, body) = send(&app, signed_webhook(&app, "msg_1", &sale)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_handled");
    assert_eq!(app.store.transaction_count().await, 1);

    let (status, body) = send(&app, as_user("POST", "/api/billing/pay-now", "user_1", None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "below_minimum");
}

#[tokio::test]
async fn test_unsupported_event_is_bad_request() {
    let app = test_app();
    let event = json!({
        "id": "evt_x",
        "type": "membership.went_valid",
        "data": {}
    });
    let (status, body) = send(&app, signed_webhook(&app, "msg_x", &event)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "unsupported_event");
}
