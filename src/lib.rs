//! Checkout Trust API
//!
//! The trust pipeline behind marketplace checkout: risk scoring, step-up
//! verification, payment intent orchestration, and idempotent webhook
//! reconciliation. Catalog, cart, and the rest of the storefront live
//! elsewhere and talk to this service over HTTP.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod notifications;
pub mod openapi;
pub mod retry;
pub mod services;

use axum::{
    routing::{get, post},
    Router,
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use services::{
    payments::PaymentService, reconciliation::ReconciliationService, risk::RiskService,
    verification::VerificationService,
};

/// Shared per-request state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<config::AppConfig>,
    pub events: events::EventSender,
    pub risk: RiskService,
    pub verification: VerificationService,
    pub payments: PaymentService,
    pub reconciliation: ReconciliationService,
}

/// Assembles the full application router.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/api/v1/checkout", post(handlers::checkout::submit_checkout))
        .route(
            "/api/v1/checkout/verify",
            post(handlers::checkout::submit_verification_code),
        )
        .route(
            "/api/v1/checkout/resend",
            post(handlers::checkout::resend_verification_code),
        )
        .route(
            "/api/v1/payments/status",
            get(handlers::payments::payment_status),
        )
        .route(
            "/api/v1/payments/webhook",
            post(handlers::payment_webhooks::payment_webhook),
        )
        .merge(
            SwaggerUi::new("/docs").url("/api-docs/openapi.json", openapi::ApiDoc::openapi()),
        )
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
