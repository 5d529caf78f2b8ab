use std::{sync::Arc, time::Duration};

use checkout_trust_api as api;

use api::{
    notifications::HttpEmailDispatcher,
    retry::RetryPolicy,
    services::{
        payments::{HttpPaymentProvider, PaymentService},
        reconciliation::ReconciliationService,
        risk::RiskService,
        verification::VerificationService,
    },
    AppState,
};
use tokio::{signal, sync::mpsc};
use tracing::{error, info};

const EVENT_CHANNEL_CAPACITY: usize = 1024;
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(&cfg.log_level, cfg.log_json);

    let db = api::db::establish_connection(&cfg).await?;
    if cfg.auto_migrate {
        api::db::create_schema(&db).await.map_err(|e| {
            error!("schema bootstrap failed: {}", e);
            e
        })?;
    }
    let db = Arc::new(db);
    let cfg = Arc::new(cfg);

    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let event_sender = api::events::EventSender::new(event_tx);
    tokio::spawn(api::events::process_events(event_rx));

    // Outbound clients are built once here and injected; nothing holds them
    // as global state.
    let http_client = reqwest::Client::new();
    let dispatcher = Arc::new(HttpEmailDispatcher::new(
        http_client.clone(),
        cfg.email.base_url.clone(),
        cfg.email.api_key.clone(),
        cfg.email.from_address.clone(),
    ));
    let provider = Arc::new(HttpPaymentProvider::new(
        http_client,
        cfg.provider.base_url.clone(),
        cfg.provider.api_key.clone(),
    ));

    let risk = RiskService::new(db.clone(), event_sender.clone(), cfg.risk.clone());
    let verification = VerificationService::new(
        db.clone(),
        dispatcher,
        event_sender.clone(),
        cfg.verification.clone(),
    );
    let payments = PaymentService::new(
        db.clone(),
        provider,
        event_sender.clone(),
        RetryPolicy::new(
            cfg.status_poll.max_attempts,
            Duration::from_millis(cfg.status_poll.base_delay_ms),
        ),
    );
    let reconciliation = ReconciliationService::new(db.clone(), event_sender.clone());

    // Expiry is enforced lazily on verify; this sweep only tidies stale rows.
    let sweeper = verification.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.sweep_expired().await {
                error!("expiry sweep failed: {}", e);
            }
        }
    });

    let state = AppState {
        db,
        config: cfg.clone(),
        events: event_sender,
        risk,
        verification,
        payments,
        reconciliation,
    };

    let app = api::app_router(state);
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("failed to install shutdown handler: {}", e);
        return;
    }
    info!("shutdown signal received");
}
