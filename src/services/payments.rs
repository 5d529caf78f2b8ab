//! Payment intent orchestration: provider intent creation, confirmation, and
//! status queries. The transaction row is persisted with status `pending`
//! before confirmation is attempted so webhook reconciliation always has a
//! row to match on.

use crate::{
    entities::{order, payment_transaction, payment_transaction::TransactionStatus},
    errors::ServiceError,
    events::{Event, EventSender},
    retry::{retry_with_backoff, RetryPolicy},
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Request to open an intent with the provider.
#[derive(Debug, Clone, Serialize)]
pub struct CreateIntentRequest {
    pub amount: Decimal,
    pub currency: String,
    pub customer_email: String,
    /// Order-linking metadata echoed back on webhook events
    pub order_id: Option<Uuid>,
    pub payment_method_id: Option<String>,
}

/// Provider-side handle for an in-progress charge attempt.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderIntent {
    pub intent_id: String,
    pub client_secret: String,
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfirmation {
    pub intent_id: String,
    pub succeeded: bool,
    pub failure_message: Option<String>,
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// The payment provider behind the orchestrator. Implemented over HTTP in
/// production and by recording stubs in tests.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_intent(&self, req: &CreateIntentRequest) -> Result<ProviderIntent, ServiceError>;
    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method_id: Option<&str>,
    ) -> Result<ProviderConfirmation, ServiceError>;
}

/// HTTP client for the provider API.
pub struct HttpPaymentProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpPaymentProvider {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ServiceError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await
            .map_err(|e| ServiceError::UpstreamProviderError(format!("payment provider: {}", e)))?;

        if !response.status().is_success() {
            return Err(ServiceError::UpstreamProviderError(format!(
                "payment provider returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ServiceError::UpstreamProviderError(format!("payment provider: {}", e)))
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_intent(&self, req: &CreateIntentRequest) -> Result<ProviderIntent, ServiceError> {
        self.post_json("/v1/payment_intents", req).await
    }

    async fn confirm_intent(
        &self,
        intent_id: &str,
        payment_method_id: Option<&str>,
    ) -> Result<ProviderConfirmation, ServiceError> {
        #[derive(Serialize)]
        struct ConfirmBody<'a> {
            payment_method_id: Option<&'a str>,
        }
        self.post_json(
            &format!("/v1/payment_intents/{}/confirm", intent_id),
            &ConfirmBody { payment_method_id },
        )
        .await
    }
}

/// Read model returned by status queries.
#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct TransactionSnapshot {
    pub id: Uuid,
    pub order_id: Option<Uuid>,
    pub amount: Decimal,
    pub currency: String,
    pub status: String,
    pub provider_intent_id: String,
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<payment_transaction::Model> for TransactionSnapshot {
    fn from(model: payment_transaction::Model) -> Self {
        Self {
            id: model.id,
            order_id: model.order_id,
            amount: model.amount,
            currency: model.currency,
            status: model.status,
            provider_intent_id: model.provider_intent_id,
            updated_at: model.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PaymentCreated {
    pub transaction_id: Uuid,
    pub intent_id: String,
    pub client_secret: String,
}

#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    provider: Arc<dyn PaymentProvider>,
    event_sender: EventSender,
    poll_policy: RetryPolicy,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        provider: Arc<dyn PaymentProvider>,
        event_sender: EventSender,
        poll_policy: RetryPolicy,
    ) -> Self {
        Self {
            db,
            provider,
            event_sender,
            poll_policy,
        }
    }

    /// Opens a provider intent and persists the transaction row before any
    /// confirmation is attempted, so the id exists for webhook matching.
    #[instrument(skip(self, req), fields(amount = %req.amount, order_id = ?req.order_id))]
    pub async fn create_payment(
        &self,
        req: CreateIntentRequest,
    ) -> Result<PaymentCreated, ServiceError> {
        let intent = self.provider.create_intent(&req).await?;
        let now = Utc::now();
        let transaction_id = Uuid::new_v4();

        payment_transaction::ActiveModel {
            id: Set(transaction_id),
            order_id: Set(req.order_id),
            amount: Set(req.amount),
            currency: Set(req.currency.clone()),
            status: Set(TransactionStatus::Pending.to_string()),
            provider_intent_id: Set(intent.intent_id.clone()),
            gateway_response: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await?;

        self.event_sender.send(Event::PaymentIntentCreated {
            intent_id: intent.intent_id.clone(),
            order_id: req.order_id,
        });

        Ok(PaymentCreated {
            transaction_id,
            intent_id: intent.intent_id,
            client_secret: intent.client_secret,
        })
    }

    /// Delegates confirmation to the provider, then moves the transaction
    /// and its order to the outcome. The webhook handler may observe the
    /// same outcome first; terminal states absorb the repeat.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        intent_id: &str,
        payment_method_id: Option<&str>,
    ) -> Result<TransactionSnapshot, ServiceError> {
        let confirmation = self.provider.confirm_intent(intent_id, payment_method_id).await?;

        let target = if confirmation.succeeded {
            TransactionStatus::Completed
        } else {
            TransactionStatus::Failed
        };

        let transaction = self
            .find_by_intent(intent_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("transaction for intent {}", intent_id)))?;

        let updated = self
            .transition_transaction(transaction, target, Some(confirmation.raw.clone()))
            .await?;

        if let Some(order_id) = updated.order_id {
            self.transition_order(order_id, target).await?;
        }

        info!(%intent_id, status = %updated.status, "payment confirmation applied");
        Ok(updated.into())
    }

    pub async fn find_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<Option<payment_transaction::Model>, ServiceError> {
        Ok(payment_transaction::Entity::find()
            .filter(payment_transaction::Column::ProviderIntentId.eq(intent_id))
            .one(&*self.db)
            .await?)
    }

    pub async fn get_status_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<TransactionSnapshot, ServiceError> {
        self.find_by_intent(intent_id)
            .await?
            .map(TransactionSnapshot::from)
            .ok_or_else(|| ServiceError::NotFound(format!("transaction for intent {}", intent_id)))
    }

    pub async fn get_status_by_order(
        &self,
        order_id: Uuid,
    ) -> Result<TransactionSnapshot, ServiceError> {
        payment_transaction::Entity::find()
            .filter(payment_transaction::Column::OrderId.eq(order_id))
            .one(&*self.db)
            .await?
            .map(TransactionSnapshot::from)
            .ok_or_else(|| ServiceError::NotFound(format!("transaction for order {}", order_id)))
    }

    /// Status query tolerant of the race against asynchronous row creation:
    /// retries `NotFound` with backoff before giving up. Purely read-only,
    /// safe to abandon by dropping the future.
    pub async fn wait_for_status_by_intent(
        &self,
        intent_id: &str,
    ) -> Result<TransactionSnapshot, ServiceError> {
        retry_with_backoff(
            self.poll_policy,
            |e| matches!(e, ServiceError::NotFound(_)),
            |_| self.get_status_by_intent(intent_id),
        )
        .await
    }

    /// Idempotent-safe transition: terminal states absorb any further
    /// transition attempt.
    pub(crate) async fn transition_transaction(
        &self,
        transaction: payment_transaction::Model,
        target: TransactionStatus,
        gateway_response: Option<serde_json::Value>,
    ) -> Result<payment_transaction::Model, ServiceError> {
        let current: TransactionStatus = transaction
            .status
            .parse()
            .map_err(|_| ServiceError::InternalError(format!("bad status {:?}", transaction.status)))?;

        if current.is_terminal() {
            return Ok(transaction);
        }

        let intent_id = transaction.provider_intent_id.clone();
        let from = transaction.status.clone();

        let mut update: payment_transaction::ActiveModel = transaction.into();
        update.status = Set(target.to_string());
        update.updated_at = Set(Utc::now());
        if let Some(response) = gateway_response {
            update.gateway_response = Set(Some(response));
        }
        let updated = update.update(&*self.db).await?;

        self.event_sender.send(Event::TransactionTransitioned {
            intent_id,
            from,
            to: target.to_string(),
        });
        Ok(updated)
    }

    /// Mirrors a terminal transaction outcome onto the order.
    pub(crate) async fn transition_order(
        &self,
        order_id: Uuid,
        outcome: TransactionStatus,
    ) -> Result<(), ServiceError> {
        let Some(order) = order::Entity::find_by_id(order_id).one(&*self.db).await? else {
            return Err(ServiceError::NotFound(format!("order {}", order_id)));
        };

        let (status, payment_status) = order_outcome(&order.status, outcome);
        if order.status == status && order.payment_status == payment_status {
            return Ok(());
        }

        let mut update: order::ActiveModel = order.into();
        update.status = Set(status);
        update.payment_status = Set(payment_status);
        update.updated_at = Set(Utc::now());
        update.update(&*self.db).await?;
        Ok(())
    }
}

/// Maps a transaction outcome to the order's `(status, payment_status)`.
pub(crate) fn order_outcome(current_status: &str, outcome: TransactionStatus) -> (String, String) {
    match outcome {
        TransactionStatus::Completed => ("confirmed".to_string(), "paid".to_string()),
        TransactionStatus::Failed => (current_status.to_string(), "failed".to_string()),
        TransactionStatus::Cancelled => ("cancelled".to_string(), "cancelled".to_string()),
        TransactionStatus::Processing => (current_status.to_string(), "processing".to_string()),
        TransactionStatus::Pending => (current_status.to_string(), "pending".to_string()),
    }
}
