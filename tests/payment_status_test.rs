//! Payment status query tests: the bounded retry against row-creation races
//! and the exactly-one-key query contract.

mod common;

use axum::http::StatusCode;
use chrono::Utc;
use common::{response_json, TestApp};
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, Set};
use std::time::Duration;
use uuid::Uuid;

use checkout_trust_api::entities::{order, payment_transaction};

// The foreign key on payment_transactions.order_id means the order row must
// exist before any transaction that references it.
async fn seed_order(app: &TestApp) -> Uuid {
    let id = Uuid::new_v4();
    order::ActiveModel {
        id: Set(id),
        status: Set("pending".to_string()),
        payment_status: Set("awaiting_payment".to_string()),
        total_amount: Set(dec!(75)),
        currency: Set("USD".to_string()),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&*app.state.db)
    .await
    .unwrap();
    id
}

async fn seed_transaction(app: &TestApp, intent_id: &str, order_id: Option<Uuid>) {
    payment_transaction::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        amount: Set(dec!(75)),
        currency: Set("USD".to_string()),
        status: Set("processing".to_string()),
        provider_intent_id: Set(intent_id.to_string()),
        gateway_response: Set(None),
        created_at: Set(Utc::now()),
        updated_at: Set(Utc::now()),
    }
    .insert(&*app.state.db)
    .await
    .unwrap();
}

#[tokio::test]
async fn status_by_intent_returns_the_snapshot() {
    let app = TestApp::new().await;
    seed_transaction(&app, "pi_1", None).await;

    let response = app.get("/api/v1/payments/status?intent_id=pi_1").await;
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = response_json(response).await;
    assert_eq!(snapshot["provider_intent_id"], "pi_1");
    assert_eq!(snapshot["status"], "processing");
    assert_eq!(snapshot["currency"], "USD");
}

#[tokio::test]
async fn status_by_order_returns_the_snapshot() {
    let app = TestApp::new().await;
    let order_id = seed_order(&app).await;
    seed_transaction(&app, "pi_1", Some(order_id)).await;

    let response = app
        .get(&format!("/api/v1/payments/status?order_id={}", order_id))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = response_json(response).await;
    assert_eq!(snapshot["order_id"], order_id.to_string());
}

#[tokio::test]
async fn unknown_intent_is_not_found_after_bounded_retries() {
    let app = TestApp::new().await;
    let response = app.get("/api/v1/payments/status?intent_id=pi_nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn intent_lookup_waits_out_the_row_creation_race() {
    let app = TestApp::new().await;

    // Insert the row only after the first poll attempt has missed.
    let db = app.state.db.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        payment_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(None),
            amount: Set(dec!(75)),
            currency: Set("USD".to_string()),
            status: Set("pending".to_string()),
            provider_intent_id: Set("pi_late".to_string()),
            gateway_response: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        }
        .insert(&*db)
        .await
        .unwrap();
    });

    let response = app.get("/api/v1/payments/status?intent_id=pi_late").await;
    assert_eq!(response.status(), StatusCode::OK);
    let snapshot = response_json(response).await;
    assert_eq!(snapshot["provider_intent_id"], "pi_late");
}

#[tokio::test]
async fn query_requires_exactly_one_key() {
    let app = TestApp::new().await;

    let neither = app.get("/api/v1/payments/status").await;
    assert_eq!(neither.status(), StatusCode::BAD_REQUEST);

    let both = app
        .get(&format!(
            "/api/v1/payments/status?intent_id=pi_1&order_id={}",
            Uuid::new_v4()
        ))
        .await;
    assert_eq!(both.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let app = TestApp::new().await;
    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::OK);
}
