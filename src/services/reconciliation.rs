//! Applies asynchronous provider events to local transaction and order
//! state. Runs independently of the synchronous confirm path and races it;
//! every transition is idempotent-safe and no sub-step failure escapes the
//! handler boundary.

use crate::{
    entities::{order, payment_transaction, payment_transaction::TransactionStatus},
    errors::ServiceError,
    events::EventSender,
    services::payments::order_outcome,
};
use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::Serialize;
use std::sync::Arc;
use strum::Display;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Provider event types this handler understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventKind {
    IntentSucceeded,
    IntentFailed,
    IntentProcessing,
    IntentCanceled,
    PaymentMethodAttached,
    CustomerCreated,
    AccountStatusChanged,
}

impl WebhookEventKind {
    pub fn parse(event_type: &str) -> Option<Self> {
        match event_type {
            "payment_intent.succeeded" => Some(Self::IntentSucceeded),
            "payment_intent.failed" => Some(Self::IntentFailed),
            "payment_intent.processing" => Some(Self::IntentProcessing),
            "payment_intent.canceled" => Some(Self::IntentCanceled),
            "payment_method.attached" => Some(Self::PaymentMethodAttached),
            "customer.created" => Some(Self::CustomerCreated),
            "account.status_changed" => Some(Self::AccountStatusChanged),
            _ => None,
        }
    }

    /// The transaction status this event maps onto, when it touches one.
    pub fn target_status(self) -> Option<TransactionStatus> {
        match self {
            Self::IntentSucceeded => Some(TransactionStatus::Completed),
            Self::IntentFailed => Some(TransactionStatus::Failed),
            Self::IntentProcessing => Some(TransactionStatus::Processing),
            Self::IntentCanceled => Some(TransactionStatus::Cancelled),
            Self::PaymentMethodAttached | Self::CustomerCreated | Self::AccountStatusChanged => {
                None
            }
        }
    }
}

/// A parsed, signature-verified provider event.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: Option<String>,
    pub kind: WebhookEventKind,
    pub intent_id: Option<String>,
    pub order_id: Option<Uuid>,
    pub payload: serde_json::Value,
}

impl WebhookEvent {
    /// Extracts the event envelope. A structurally invalid payload is an
    /// error; an unknown event type is `Ok(None)` so the receiver can
    /// acknowledge types added by newer provider API versions.
    pub fn parse(payload: serde_json::Value) -> Result<Option<Self>, ServiceError> {
        let event_type = payload
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ServiceError::ValidationError("missing event type".into()))?;
        let Some(kind) = WebhookEventKind::parse(event_type) else {
            return Ok(None);
        };

        let object = payload.pointer("/data/object");
        let intent_id = object
            .and_then(|o| o.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string);
        if kind.target_status().is_some() && intent_id.is_none() {
            return Err(ServiceError::ValidationError(
                "payment event without an intent id".into(),
            ));
        }

        let order_id = object
            .and_then(|o| o.pointer("/metadata/order_id"))
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok());

        Ok(Some(Self {
            event_id: payload.get("id").and_then(|v| v.as_str()).map(str::to_string),
            kind,
            intent_id,
            order_id,
            payload,
        }))
    }
}

/// Result of one independent sub-step of event application.
#[derive(Debug, Clone, PartialEq, Eq, Display, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StepResult {
    /// Transition applied
    Applied,
    /// Already in the status the event maps to; replay absorbed
    Duplicate,
    /// Terminal status holds a different outcome; event ignored
    Superseded,
    /// Referenced local record does not exist (yet, or anymore)
    Missing,
    /// Event does not touch this record type
    Skipped,
    /// Persistence failed; logged, never raised past the handler
    Failed(String),
}

/// One structured record of what an event did, aggregated from the typed
/// sub-step results instead of side-effecting log calls.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationOutcome {
    pub event_id: Option<String>,
    pub kind: WebhookEventKind,
    pub intent_id: Option<String>,
    pub transaction: StepResult,
    pub order: StepResult,
}

#[derive(Clone)]
pub struct ReconciliationService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
}

impl ReconciliationService {
    pub fn new(db: Arc<DatabaseConnection>, event_sender: EventSender) -> Self {
        Self { db, event_sender }
    }

    /// Applies one event. Infallible by contract: each sub-step's failure is
    /// captured in the outcome, and a failed transaction step never stops
    /// the order step from being attempted.
    #[instrument(skip(self, event), fields(kind = %event.kind, intent_id = ?event.intent_id))]
    pub async fn apply(&self, event: &WebhookEvent) -> ReconciliationOutcome {
        let Some(target) = event.kind.target_status() else {
            info!(kind = %event.kind, "acknowledged non-transaction event");
            return ReconciliationOutcome {
                event_id: event.event_id.clone(),
                kind: event.kind,
                intent_id: event.intent_id.clone(),
                transaction: StepResult::Skipped,
                order: StepResult::Skipped,
            };
        };

        let (transaction, order_id) = self.apply_to_transaction(event, target).await;

        // The order mirrors the transaction's terminal outcome. When the
        // transaction already holds a different terminal status the event is
        // stale, so the order must not be moved to the conflicting target.
        // Every other sub-step result still gets the order step attempted.
        let order = if transaction == StepResult::Superseded {
            StepResult::Superseded
        } else {
            self.apply_to_order(event.order_id.or(order_id), target).await
        };

        let outcome = ReconciliationOutcome {
            event_id: event.event_id.clone(),
            kind: event.kind,
            intent_id: event.intent_id.clone(),
            transaction,
            order,
        };
        info!(outcome = ?outcome, "webhook event reconciled");
        outcome
    }

    async fn apply_to_transaction(
        &self,
        event: &WebhookEvent,
        target: TransactionStatus,
    ) -> (StepResult, Option<Uuid>) {
        let Some(intent_id) = event.intent_id.as_deref() else {
            return (StepResult::Missing, None);
        };

        let found = payment_transaction::Entity::find()
            .filter(payment_transaction::Column::ProviderIntentId.eq(intent_id))
            .one(&*self.db)
            .await;

        let transaction = match found {
            Ok(Some(t)) => t,
            Ok(None) => {
                // Event raced ahead of intent persistence, or references a
                // record we no longer have. Not fatal; the provider will not
                // be asked to retry.
                warn!(%intent_id, "no local transaction for event, skipping");
                return (StepResult::Missing, None);
            }
            Err(e) => return (StepResult::Failed(e.to_string()), None),
        };

        let order_id = transaction.order_id;
        let current: TransactionStatus = match transaction.status.parse() {
            Ok(s) => s,
            Err(_) => {
                return (
                    StepResult::Failed(format!("unparseable status {:?}", transaction.status)),
                    order_id,
                )
            }
        };

        if current == target {
            return (StepResult::Duplicate, order_id);
        }
        if current.is_terminal() {
            warn!(%intent_id, %current, %target, "terminal transaction ignores event");
            return (StepResult::Superseded, order_id);
        }

        let from = transaction.status.clone();
        let mut update: payment_transaction::ActiveModel = transaction.into();
        update.status = Set(target.to_string());
        update.updated_at = Set(Utc::now());
        update.gateway_response = Set(Some(event.payload.clone()));
        match update.update(&*self.db).await {
            Ok(_) => {
                self.event_sender.send(crate::events::Event::TransactionTransitioned {
                    intent_id: intent_id.to_string(),
                    from,
                    to: target.to_string(),
                });
                (StepResult::Applied, order_id)
            }
            Err(e) => (StepResult::Failed(e.to_string()), order_id),
        }
    }

    async fn apply_to_order(&self, order_id: Option<Uuid>, target: TransactionStatus) -> StepResult {
        let Some(order_id) = order_id else {
            return StepResult::Skipped;
        };

        let order = match order::Entity::find_by_id(order_id).one(&*self.db).await {
            Ok(Some(o)) => o,
            Ok(None) => {
                warn!(%order_id, "event references unknown order, skipping");
                return StepResult::Missing;
            }
            Err(e) => return StepResult::Failed(e.to_string()),
        };

        let (status, payment_status) = order_outcome(&order.status, target);
        if order.status == status && order.payment_status == payment_status {
            return StepResult::Duplicate;
        }

        let mut update: order::ActiveModel = order.into();
        update.status = Set(status);
        update.payment_status = Set(payment_status);
        update.updated_at = Set(Utc::now());
        match update.update(&*self.db).await {
            Ok(_) => StepResult::Applied,
            Err(e) => StepResult::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn known_event_types_parse() {
        assert_eq!(
            WebhookEventKind::parse("payment_intent.succeeded"),
            Some(WebhookEventKind::IntentSucceeded)
        );
        assert_eq!(
            WebhookEventKind::parse("account.status_changed"),
            Some(WebhookEventKind::AccountStatusChanged)
        );
        assert_eq!(WebhookEventKind::parse("invoice.created"), None);
    }

    #[test]
    fn status_mapping_per_event_kind() {
        assert_eq!(
            WebhookEventKind::IntentSucceeded.target_status(),
            Some(TransactionStatus::Completed)
        );
        assert_eq!(
            WebhookEventKind::IntentCanceled.target_status(),
            Some(TransactionStatus::Cancelled)
        );
        assert_eq!(WebhookEventKind::CustomerCreated.target_status(), None);
    }

    #[test]
    fn parses_full_envelope() {
        let order_id = Uuid::new_v4();
        let event = WebhookEvent::parse(json!({
            "id": "evt_123",
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": "pi_456",
                "metadata": {"order_id": order_id.to_string()}
            }}
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.event_id.as_deref(), Some("evt_123"));
        assert_eq!(event.kind, WebhookEventKind::IntentSucceeded);
        assert_eq!(event.intent_id.as_deref(), Some("pi_456"));
        assert_eq!(event.order_id, Some(order_id));
    }

    #[test]
    fn payment_event_without_intent_id_is_invalid() {
        let err = WebhookEvent::parse(json!({
            "id": "evt_1",
            "type": "payment_intent.failed",
            "data": {"object": {}}
        }))
        .unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }

    #[test]
    fn informational_event_needs_no_intent_id() {
        let event = WebhookEvent::parse(json!({
            "type": "customer.created",
            "data": {"object": {"id": "cus_9"}}
        }))
        .unwrap()
        .unwrap();
        assert_eq!(event.kind, WebhookEventKind::CustomerCreated);
    }

    #[test]
    fn unknown_type_parses_to_none() {
        assert!(WebhookEvent::parse(json!({"type": "charge.disputed"}))
            .unwrap()
            .is_none());
    }

    #[test]
    fn missing_type_is_invalid() {
        let err = WebhookEvent::parse(json!({"id": "evt_1"})).unwrap_err();
        assert!(matches!(err, ServiceError::ValidationError(_)));
    }
}
