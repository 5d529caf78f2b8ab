use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Checkout Trust API",
        description = "Risk scoring, step-up verification, payment intent orchestration, and webhook reconciliation for marketplace checkout",
        version = env!("CARGO_PKG_VERSION")
    ),
    paths(
        crate::handlers::checkout::submit_checkout,
        crate::handlers::checkout::submit_verification_code,
        crate::handlers::checkout::resend_verification_code,
        crate::handlers::payments::payment_status,
        crate::handlers::payment_webhooks::payment_webhook,
        crate::handlers::health::health,
    ),
    components(schemas(
        crate::handlers::checkout::CheckoutRequest,
        crate::handlers::checkout::CheckoutResponse,
        crate::handlers::checkout::ResumePaymentContext,
        crate::handlers::checkout::VerifyCodeRequest,
        crate::handlers::checkout::VerifyCodeResponse,
        crate::handlers::checkout::ResendCodeRequest,
        crate::handlers::checkout::ResendCodeResponse,
        crate::handlers::health::HealthResponse,
        crate::services::payments::TransactionSnapshot,
        crate::services::risk::FactorHit,
        crate::errors::ErrorResponse,
    )),
    tags(
        (name = "Checkout", description = "Checkout trust pipeline"),
        (name = "Payments", description = "Payment status and provider webhooks"),
        (name = "Health", description = "Liveness")
    )
)]
pub struct ApiDoc;
