//! Checkout submission and the step-up verification endpoints.

use crate::{
    errors::ServiceError,
    events::Event,
    services::{
        payments::CreateIntentRequest,
        risk::{FactorHit, RiskContext, RiskDecision},
        verification::CreateChallengeRequest,
    },
    AppState,
};
use axum::{extract::State, http::StatusCode, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::instrument;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::{Validate, ValidationError};

fn validate_positive_amount(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount must be greater than 0".into());
        Err(err)
    }
}

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("currency");
        err.message = Some("Currency must be a 3-letter ISO code".into());
        Err(err)
    }
}

/// Transaction context submitted by the storefront at checkout.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
pub struct CheckoutRequest {
    /// Account or guest-session identity
    pub user_id: Uuid,
    #[validate(email)]
    pub customer_email: String,
    pub user_name: Option<String>,
    #[validate(custom = "validate_positive_amount")]
    #[schema(value_type = f64)]
    pub amount: Decimal,
    #[validate(length(equal = 3), custom = "validate_currency")]
    pub currency: String,
    #[validate(range(min = 1))]
    pub item_count: i32,
    #[validate(range(min = 1))]
    pub max_item_quantity: i32,
    #[serde(default)]
    pub store_ids: Vec<Uuid>,
    pub order_id: Option<Uuid>,
    pub payment_method_id: Option<String>,
    #[serde(default)]
    pub new_payment_method: bool,
    #[serde(default)]
    pub authenticated: bool,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub ip_country: Option<String>,
    pub billing_country: Option<String>,
}

/// Snapshot of the checkout embedded in a challenge and replayed on a
/// successful verification.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResumePaymentContext {
    #[schema(value_type = f64)]
    pub amount: Decimal,
    pub currency: String,
    pub customer_email: String,
    pub order_id: Option<Uuid>,
    pub payment_method_id: Option<String>,
    pub item_count: i32,
    pub max_item_quantity: i32,
    pub store_ids: Vec<Uuid>,
}

impl From<&CheckoutRequest> for ResumePaymentContext {
    fn from(req: &CheckoutRequest) -> Self {
        Self {
            amount: req.amount,
            currency: req.currency.clone(),
            customer_email: req.customer_email.clone(),
            order_id: req.order_id,
            payment_method_id: req.payment_method_id.clone(),
            item_count: req.item_count,
            max_item_quantity: req.max_item_quantity,
            store_ids: req.store_ids.clone(),
        }
    }
}

impl From<&ResumePaymentContext> for CreateIntentRequest {
    fn from(ctx: &ResumePaymentContext) -> Self {
        Self {
            amount: ctx.amount,
            currency: ctx.currency.clone(),
            customer_email: ctx.customer_email.clone(),
            order_id: ctx.order_id,
            payment_method_id: ctx.payment_method_id.clone(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CheckoutResponse {
    /// Risk allowed; intent created, client completes payment directly
    Proceed {
        intent_id: String,
        client_secret: String,
    },
    /// Risk warned; a one-time code was emailed (or an in-flight challenge
    /// reused) and checkout is gated on it
    VerificationRequired {
        token: String,
        expires_at: DateTime<Utc>,
        masked_email: String,
    },
    /// Risk denied; nothing was created
    Blocked {
        risk_score: i32,
        factors: Vec<FactorHit>,
        support_contact: String,
    },
}

// POST /api/v1/checkout
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Proceed or verification required", body = CheckoutResponse),
        (status = 403, description = "Checkout blocked by risk decision", body = CheckoutResponse),
        (status = 400, description = "Malformed request", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
#[instrument(skip(state, request), fields(user_id = %request.user_id))]
pub async fn submit_checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ServiceError> {
    request.validate()?;

    let ctx = RiskContext {
        amount: request.amount,
        currency: request.currency.clone(),
        item_count: request.item_count,
        max_item_quantity: request.max_item_quantity,
        store_ids: request.store_ids.clone(),
        authenticated: request.authenticated,
        user_agent: request.user_agent.clone(),
        new_payment_method: request.new_payment_method,
        ip_address: request.ip_address.clone(),
        ip_country: request.ip_country.clone(),
        billing_country: request.billing_country.clone(),
    };
    let recorded = state.risk.assess_and_record(&ctx).await;
    let outcome = recorded.outcome;

    match outcome.decision {
        RiskDecision::Allow => {
            let created = state
                .payments
                .create_payment(CreateIntentRequest {
                    amount: request.amount,
                    currency: request.currency.clone(),
                    customer_email: request.customer_email.clone(),
                    order_id: request.order_id,
                    payment_method_id: request.payment_method_id.clone(),
                })
                .await?;
            Ok((
                StatusCode::OK,
                Json(CheckoutResponse::Proceed {
                    intent_id: created.intent_id,
                    client_secret: created.client_secret,
                }),
            ))
        }
        RiskDecision::Warn => {
            let snapshot = serde_json::to_value(ResumePaymentContext::from(&request))
                .map_err(|e| ServiceError::InternalError(e.to_string()))?;
            let issued = state
                .verification
                .create(CreateChallengeRequest {
                    user_id: request.user_id,
                    email: request.customer_email.clone(),
                    user_name: request.user_name.clone(),
                    amount: request.amount,
                    payment_context: snapshot,
                    risk_score: outcome.score,
                    risk_factors: outcome.factors,
                })
                .await?;
            Ok((
                StatusCode::OK,
                Json(CheckoutResponse::VerificationRequired {
                    token: issued.token,
                    expires_at: issued.expires_at,
                    masked_email: issued.masked_email,
                }),
            ))
        }
        RiskDecision::Deny => {
            state.events.send(Event::CheckoutBlocked {
                score: outcome.score,
            });
            Ok((
                StatusCode::FORBIDDEN,
                Json(CheckoutResponse::Blocked {
                    risk_score: outcome.score,
                    factors: outcome.factors,
                    support_contact: state.config.support_contact.clone(),
                }),
            ))
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct VerifyCodeRequest {
    #[validate(length(min = 1))]
    pub token: String,
    #[validate(length(equal = 6))]
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VerifyCodeResponse {
    pub success: bool,
    /// The originally submitted checkout, so the client resumes with the
    /// amount and items the risk decision was made on
    pub payment_context: ResumePaymentContext,
    pub intent_id: String,
    pub client_secret: String,
}

// POST /api/v1/checkout/verify
#[utoipa::path(
    post,
    path = "/api/v1/checkout/verify",
    request_body = VerifyCodeRequest,
    responses(
        (status = 200, description = "Code accepted, checkout resumed", body = VerifyCodeResponse),
        (status = 404, description = "Unknown or consumed token", body = crate::errors::ErrorResponse),
        (status = 410, description = "Challenge expired", body = crate::errors::ErrorResponse),
        (status = 422, description = "Wrong code, retry allowed", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
#[instrument(skip(state, request))]
pub async fn submit_verification_code(
    State(state): State<AppState>,
    Json(request): Json<VerifyCodeRequest>,
) -> Result<Json<VerifyCodeResponse>, ServiceError> {
    request.validate()?;

    let context_value = state.verification.check(&request.token, &request.code).await?;
    let context: ResumePaymentContext = serde_json::from_value(context_value)
        .map_err(|e| ServiceError::InternalError(format!("stored payment context: {}", e)))?;

    // Resume the gated checkout with the snapshot taken at submit time. The
    // challenge is consumed only once the intent exists, so a provider
    // failure leaves the token redeemable for a retry.
    let created = state
        .payments
        .create_payment(CreateIntentRequest::from(&context))
        .await?;
    state.verification.consume(&request.token).await?;

    Ok(Json(VerifyCodeResponse {
        success: true,
        payment_context: context,
        intent_id: created.intent_id,
        client_secret: created.client_secret,
    }))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ResendCodeRequest {
    #[validate(length(min = 1))]
    pub token: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResendCodeResponse {
    pub success: bool,
    pub expires_at: DateTime<Utc>,
    pub masked_email: String,
}

// POST /api/v1/checkout/resend
#[utoipa::path(
    post,
    path = "/api/v1/checkout/resend",
    request_body = ResendCodeRequest,
    responses(
        (status = 200, description = "New code sent", body = ResendCodeResponse),
        (status = 404, description = "Unknown or consumed token", body = crate::errors::ErrorResponse),
        (status = 410, description = "Challenge expired", body = crate::errors::ErrorResponse)
    ),
    tag = "Checkout"
)]
#[instrument(skip(state, request))]
pub async fn resend_verification_code(
    State(state): State<AppState>,
    Json(request): Json<ResendCodeRequest>,
) -> Result<Json<ResendCodeResponse>, ServiceError> {
    request.validate()?;

    let issued = state.verification.resend(&request.token).await?;
    Ok(Json(ResendCodeResponse {
        success: true,
        expires_at: issued.expires_at,
        masked_email: issued.masked_email,
    }))
}
