//! Shared test harness: in-memory SQLite, recording doubles for the email
//! dispatcher and the payment provider, and the full application router.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header::CONTENT_TYPE, Method, Request},
    response::Response,
    Router,
};
use checkout_trust_api::{
    config::{
        AppConfig, EmailConfig, ProviderConfig, RiskConfig, StatusPollConfig, VerificationConfig,
    },
    db,
    errors::ServiceError,
    events::EventSender,
    handlers::payment_webhooks::sign_payload,
    notifications::{CodeEmailContext, NotificationDispatcher},
    retry::RetryPolicy,
    services::{
        payments::{
            CreateIntentRequest, PaymentProvider, PaymentService, ProviderConfirmation,
            ProviderIntent,
        },
        reconciliation::ReconciliationService,
        risk::RiskService,
        verification::VerificationService,
    },
    app_router, AppState,
};
use sea_orm::{ConnectOptions, Database};
use serde_json::Value;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tower::ServiceExt;

pub const WEBHOOK_SECRET: &str = "whsec_test";

/// Records every code email instead of sending one.
#[derive(Default)]
pub struct StubDispatcher {
    pub sent: Mutex<Vec<(String, String)>>,
    pub fail_next: AtomicBool,
}

impl StubDispatcher {
    pub fn sent_codes(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn last_code(&self) -> String {
        self.sent
            .lock()
            .unwrap()
            .last()
            .expect("at least one email sent")
            .1
            .clone()
    }
}

#[async_trait]
impl NotificationDispatcher for StubDispatcher {
    async fn send_verification_code(
        &self,
        to: &str,
        code: &str,
        _context: &CodeEmailContext,
    ) -> Result<(), ServiceError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::UpstreamProviderError(
                "email service unavailable".to_string(),
            ));
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), code.to_string()));
        Ok(())
    }
}

/// Hands out sequential intent ids and records every request.
#[derive(Default)]
pub struct StubProvider {
    counter: AtomicU32,
    pub created: Mutex<Vec<CreateIntentRequest>>,
    pub confirm_succeeds: AtomicBool,
    pub create_fails: AtomicBool,
}

impl StubProvider {
    pub fn new() -> Self {
        let provider = Self::default();
        provider.confirm_succeeds.store(true, Ordering::SeqCst);
        provider
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn last_intent_id(&self) -> String {
        format!("pi_{}", self.counter.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl PaymentProvider for StubProvider {
    async fn create_intent(&self, req: &CreateIntentRequest) -> Result<ProviderIntent, ServiceError> {
        if self.create_fails.swap(false, Ordering::SeqCst) {
            return Err(ServiceError::UpstreamProviderError(
                "payment provider unavailable".to_string(),
            ));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.lock().unwrap().push(req.clone());
        Ok(ProviderIntent {
            intent_id: format!("pi_{}", n),
            client_secret: format!("pi_{}_secret", n),
            status: "requires_confirmation".to_string(),
        })
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        _payment_method_id: Option<&str>,
    ) -> Result<ProviderConfirmation, ServiceError> {
        let succeeded = self.confirm_succeeds.load(Ordering::SeqCst);
        Ok(ProviderConfirmation {
            intent_id: intent_id.to_string(),
            succeeded,
            failure_message: (!succeeded).then(|| "card_declined".to_string()),
            raw: serde_json::json!({"intent_id": intent_id}),
        })
    }
}

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
    pub dispatcher: Arc<StubDispatcher>,
    pub provider: Arc<StubProvider>,
}

fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
        log_level: "warn".to_string(),
        log_json: false,
        environment: "test".to_string(),
        auto_migrate: true,
        support_contact: "support@example.com".to_string(),
        risk: RiskConfig::default(),
        verification: VerificationConfig::default(),
        provider: ProviderConfig {
            webhook_secret: Some(WEBHOOK_SECRET.to_string()),
            ..ProviderConfig::default()
        },
        email: EmailConfig::default(),
        status_poll: StatusPollConfig {
            max_attempts: 3,
            base_delay_ms: 20,
        },
    }
}

impl TestApp {
    pub async fn new() -> Self {
        let mut opts = ConnectOptions::new("sqlite::memory:".to_string());
        opts.max_connections(1).sqlx_logging(false);
        let conn = Database::connect(opts).await.expect("sqlite connection");
        db::create_schema(&conn).await.expect("schema bootstrap");
        let conn = Arc::new(conn);

        let cfg = Arc::new(test_config());
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(256);
        let events = EventSender::new(event_tx);
        // Drain events so the channel never fills up.
        tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

        let dispatcher = Arc::new(StubDispatcher::default());
        let provider = Arc::new(StubProvider::new());

        let state = AppState {
            db: conn.clone(),
            config: cfg.clone(),
            events: events.clone(),
            risk: RiskService::new(conn.clone(), events.clone(), cfg.risk.clone()),
            verification: VerificationService::new(
                conn.clone(),
                dispatcher.clone(),
                events.clone(),
                cfg.verification.clone(),
            ),
            payments: PaymentService::new(
                conn.clone(),
                provider.clone(),
                events.clone(),
                RetryPolicy::new(
                    cfg.status_poll.max_attempts,
                    Duration::from_millis(cfg.status_poll.base_delay_ms),
                ),
            ),
            reconciliation: ReconciliationService::new(conn, events),
        };

        let router = app_router(state.clone());
        Self {
            state,
            router,
            dispatcher,
            provider,
        }
    }

    pub async fn post_json(&self, path: &str, body: Value) -> Response {
        let request = Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> Response {
        let request = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Body::empty())
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// POSTs a provider event with a valid signature.
    pub async fn post_webhook(&self, body: Value) -> Response {
        let raw = body.to_string();
        let ts = chrono::Utc::now().timestamp();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/payments/webhook")
            .header(CONTENT_TYPE, "application/json")
            .header("x-timestamp", ts.to_string())
            .header("x-signature", sign_payload(WEBHOOK_SECRET, ts, raw.as_bytes()))
            .body(Body::from(raw))
            .unwrap();
        self.router.clone().oneshot(request).await.unwrap()
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}
