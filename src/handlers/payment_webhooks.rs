//! Inbound payment provider webhook receiver.
//!
//! Response policy: 401 on a bad signature, 400 on an unparsable payload,
//! 200 for everything else — including events whose sub-steps failed
//! internally — so the provider never builds a retry storm around
//! conditions retries cannot fix.

use crate::{errors::ServiceError, services::reconciliation::WebhookEvent, AppState};
use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

// POST /api/v1/payments/webhook
#[utoipa::path(
    post,
    path = "/api/v1/payments/webhook",
    request_body = String,
    responses(
        (status = 200, description = "Event acknowledged"),
        (status = 401, description = "Invalid signature", body = crate::errors::ErrorResponse),
        (status = 400, description = "Unparsable payload", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(secret) = state.config.provider.webhook_secret.as_deref() {
        let tolerance = state.config.provider.webhook_tolerance_secs;
        if !verify_signature(&headers, &body, secret, tolerance) {
            warn!("webhook signature verification failed");
            return Err(ServiceError::SignatureInvalid);
        }
    }

    let payload: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("invalid json: {}", e)))?;

    let event = match WebhookEvent::parse(payload) {
        Ok(Some(event)) => event,
        Ok(None) => {
            // Unknown event type from a newer provider API version; nothing
            // to do locally and nothing a retry would fix.
            info!("unhandled webhook event type acknowledged");
            return Ok((StatusCode::OK, "ok"));
        }
        Err(e) => return Err(e),
    };

    // Sub-step failures are carried inside the outcome; the event is
    // acknowledged regardless.
    let _outcome = state.reconciliation.apply(&event).await;

    Ok((StatusCode::OK, "ok"))
}

/// HMAC-SHA256 over `"{timestamp}.{raw_body}"` with `x-timestamp` and
/// `x-signature` headers, rejecting stale timestamps.
fn verify_signature(headers: &HeaderMap, payload: &[u8], secret: &str, tolerance_secs: u64) -> bool {
    let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) else {
        return false;
    };
    let (Ok(ts), Ok(sig)) = (ts.to_str(), sig.to_str()) else {
        return false;
    };

    match ts.parse::<i64>() {
        Ok(ts_i) => {
            let now = chrono::Utc::now().timestamp();
            if (now - ts_i).unsigned_abs() > tolerance_secs {
                return false;
            }
        }
        Err(_) => return false,
    }

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(ts.as_bytes());
    mac.update(b".");
    mac.update(payload);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(expected.as_bytes(), sig.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.iter().zip(b) {
        res |= x ^ y;
    }
    res == 0
}

/// Computes the signature a caller must attach; shared with tests and any
/// outbound delivery tooling.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}
