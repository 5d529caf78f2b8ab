//! Webhook reconciliation tests: signed provider events against local
//! transaction and order state, replay idempotency, and the ack policy.

mod common;

use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
};
use chrono::Utc;
use common::{response_json, TestApp, WEBHOOK_SECRET};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use checkout_trust_api::entities::{order, payment_transaction};
use checkout_trust_api::handlers::payment_webhooks::sign_payload;

async fn seed_order(app: &TestApp) -> Uuid {
    let id = Uuid::new_v4();
    order::ActiveModel {
        id: Set(id),
        status: Set("pending".to_string()),
        payment_status: Set("awaiting_payment".to_string()),
        total_amount: Set(dec!(120)),
        currency: Set("USD".to_string()),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&*app.state.db)
    .await
    .unwrap();
    id
}

async fn seed_transaction(app: &TestApp, intent_id: &str, order_id: Option<Uuid>, status: &str) {
    payment_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        amount: Set(dec!(120)),
        currency: Set("USD".to_string()),
        status: Set(status.to_string()),
        provider_intent_id: Set(intent_id.to_string()),
        gateway_response: Set(None),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&*app.state.db)
    .await
    .unwrap();
}

fn intent_event(event_type: &str, intent_id: &str, order_id: Option<Uuid>) -> Value {
    let mut object = json!({"id": intent_id});
    if let Some(order_id) = order_id {
        object["metadata"] = json!({"order_id": order_id.to_string()});
    }
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "data": {"object": object}
    })
}

async fn transaction_status(app: &TestApp, intent_id: &str) -> String {
    use sea_orm::{ColumnTrait, QueryFilter};
    payment_transaction::Entity::find()
        .filter(payment_transaction::Column::ProviderIntentId.eq(intent_id))
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
        .status
}

#[tokio::test]
async fn succeeded_event_completes_transaction_and_order() {
    let app = TestApp::new().await;
    let order_id = seed_order(&app).await;
    seed_transaction(&app, "pi_1", Some(order_id), "pending").await;

    let response = app
        .post_webhook(intent_event("payment_intent.succeeded", "pi_1", Some(order_id)))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    assert_eq!(transaction_status(&app, "pi_1").await, "completed");
    let order = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, "confirmed");
    assert_eq!(order.payment_status, "paid");
}

#[tokio::test]
async fn exact_replay_is_absorbed() {
    let app = TestApp::new().await;
    let order_id = seed_order(&app).await;
    seed_transaction(&app, "pi_1", Some(order_id), "pending").await;

    let event = intent_event("payment_intent.succeeded", "pi_1", Some(order_id));
    assert_eq!(app.post_webhook(event.clone()).await.status(), StatusCode::OK);

    let updated_at = payment_transaction::Entity::find()
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap()
        .updated_at;

    // Replay: still 200, same end state, no second transition write.
    assert_eq!(app.post_webhook(event).await.status(), StatusCode::OK);
    let after = payment_transaction::Entity::find()
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.status, "completed");
    assert_eq!(after.updated_at, updated_at);
}

#[tokio::test]
async fn conflicting_event_after_terminal_status_is_ignored() {
    let app = TestApp::new().await;
    let order_id = seed_order(&app).await;
    seed_transaction(&app, "pi_1", Some(order_id), "pending").await;

    app.post_webhook(intent_event("payment_intent.succeeded", "pi_1", Some(order_id)))
        .await;
    let response = app
        .post_webhook(intent_event("payment_intent.failed", "pi_1", Some(order_id)))
        .await;

    // Still acknowledged, but the completed outcome stands on both records.
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(transaction_status(&app, "pi_1").await, "completed");
    let order = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, "confirmed");
    assert_eq!(order.payment_status, "paid");
}

#[tokio::test]
async fn processing_event_is_a_non_terminal_transition() {
    let app = TestApp::new().await;
    seed_transaction(&app, "pi_1", None, "pending").await;

    app.post_webhook(intent_event("payment_intent.processing", "pi_1", None))
        .await;
    assert_eq!(transaction_status(&app, "pi_1").await, "processing");

    // A later terminal event still lands.
    app.post_webhook(intent_event("payment_intent.succeeded", "pi_1", None))
        .await;
    assert_eq!(transaction_status(&app, "pi_1").await, "completed");
}

#[tokio::test]
async fn failed_event_keeps_order_status_but_marks_payment_failed() {
    let app = TestApp::new().await;
    let order_id = seed_order(&app).await;
    seed_transaction(&app, "pi_1", Some(order_id), "processing").await;

    app.post_webhook(intent_event("payment_intent.failed", "pi_1", Some(order_id)))
        .await;

    assert_eq!(transaction_status(&app, "pi_1").await, "failed");
    let order = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, "pending");
    assert_eq!(order.payment_status, "failed");
}

#[tokio::test]
async fn event_for_unknown_intent_is_acknowledged_without_writes() {
    let app = TestApp::new().await;

    let response = app
        .post_webhook(intent_event("payment_intent.succeeded", "pi_missing", None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    use sea_orm::PaginatorTrait;
    assert_eq!(
        payment_transaction::Entity::find()
            .count(&*app.state.db)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn informational_event_is_acknowledged_and_skipped() {
    let app = TestApp::new().await;
    let response = app
        .post_webhook(json!({
            "id": "evt_info",
            "type": "customer.created",
            "data": {"object": {"id": "cus_1"}}
        }))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn unknown_event_type_is_acknowledged() {
    let app = TestApp::new().await;
    let response = app
        .post_webhook(json!({"id": "evt_x", "type": "charge.disputed", "data": {"object": {}}}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn bad_signature_is_rejected_without_state_change() {
    let app = TestApp::new().await;
    seed_transaction(&app, "pi_1", None, "pending").await;

    let body = intent_event("payment_intent.succeeded", "pi_1", None).to_string();
    let ts = Utc::now().timestamp();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook")
        .header(CONTENT_TYPE, "application/json")
        .header("x-timestamp", ts.to_string())
        .header("x-signature", sign_payload("wrong_secret", ts, body.as_bytes()))
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(transaction_status(&app, "pi_1").await, "pending");
}

#[tokio::test]
async fn unsigned_webhook_is_rejected_without_state_change() {
    let app = TestApp::new().await;
    seed_transaction(&app, "pi_1", None, "pending").await;

    // No x-timestamp / x-signature headers at all.
    let body = intent_event("payment_intent.succeeded", "pi_1", None).to_string();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(transaction_status(&app, "pi_1").await, "pending");
}

#[tokio::test]
async fn stale_timestamp_is_rejected() {
    let app = TestApp::new().await;

    let body = intent_event("payment_intent.succeeded", "pi_1", None).to_string();
    let ts = Utc::now().timestamp() - 3600;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook")
        .header(CONTENT_TYPE, "application/json")
        .header("x-timestamp", ts.to_string())
        .header("x-signature", sign_payload(WEBHOOK_SECRET, ts, body.as_bytes()))
        .body(Body::from(body))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn malformed_payload_is_a_bad_request() {
    let app = TestApp::new().await;

    let raw = "not json at all";
    let ts = Utc::now().timestamp();
    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/webhook")
        .header(CONTENT_TYPE, "application/json")
        .header("x-timestamp", ts.to_string())
        .header("x-signature", sign_payload(WEBHOOK_SECRET, ts, raw.as_bytes()))
        .body(Body::from(raw))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let missing_type = json!({"id": "evt_1", "data": {"object": {}}});
    let response = app.post_webhook(missing_type).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json_body = response_json(response).await;
    assert!(json_body["error"].as_str().is_some());
}

#[tokio::test]
async fn event_without_order_metadata_only_touches_the_transaction() {
    let app = TestApp::new().await;
    let order_id = seed_order(&app).await;
    seed_transaction(&app, "pi_1", None, "pending").await;

    app.post_webhook(intent_event("payment_intent.succeeded", "pi_1", None))
        .await;

    assert_eq!(transaction_status(&app, "pi_1").await, "completed");
    let order = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, "pending");
    assert_eq!(order.payment_status, "awaiting_payment");
}
