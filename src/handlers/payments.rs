//! Payment status queries for client polling.

use crate::{errors::ServiceError, services::payments::TransactionSnapshot, AppState};
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use tracing::instrument;
use utoipa::IntoParams;
use uuid::Uuid;

/// Exactly one of `intent_id` or `order_id` must be supplied.
#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusQuery {
    pub intent_id: Option<String>,
    pub order_id: Option<Uuid>,
}

// GET /api/v1/payments/status
//
// A 404 here means "not found yet": intent creation and webhook delivery
// race this query, so the lookup retries briefly with backoff before the
// caller falls back to a generic processing state. Read-only; abandoning
// the request cancels the wait with no state touched.
#[utoipa::path(
    get,
    path = "/api/v1/payments/status",
    params(StatusQuery),
    responses(
        (status = 200, description = "Transaction snapshot", body = TransactionSnapshot),
        (status = 404, description = "No transaction visible yet", body = crate::errors::ErrorResponse),
        (status = 400, description = "Malformed query", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
#[instrument(skip(state))]
pub async fn payment_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<TransactionSnapshot>, ServiceError> {
    match (query.intent_id, query.order_id) {
        (Some(intent_id), None) => {
            let snapshot = state.payments.wait_for_status_by_intent(&intent_id).await?;
            Ok(Json(snapshot))
        }
        (None, Some(order_id)) => {
            let snapshot = state.payments.get_status_by_order(order_id).await?;
            Ok(Json(snapshot))
        }
        _ => Err(ServiceError::BadRequest(
            "provide exactly one of intent_id or order_id".to_string(),
        )),
    }
}
