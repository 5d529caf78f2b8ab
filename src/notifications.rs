//! Outbound one-time-code email delivery. The email service itself is an
//! external collaborator; this module only defines the contract and an HTTP
//! client for it. The client is constructed once at startup and injected,
//! never held as module-level state.

use crate::errors::ServiceError;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument};

/// Extra context rendered into the code email.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CodeEmailContext {
    pub user_name: Option<String>,
    pub amount: Option<Decimal>,
}

/// Contract for sending a one-time verification code to a recipient.
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn send_verification_code(
        &self,
        to: &str,
        code: &str,
        context: &CodeEmailContext,
    ) -> Result<(), ServiceError>;
}

/// HTTP-backed dispatcher posting to the configured email service.
pub struct HttpEmailDispatcher {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    from_address: String,
}

#[derive(Serialize)]
struct SendCodeRequest<'a> {
    from: &'a str,
    to: &'a str,
    code: &'a str,
    user_name: Option<&'a str>,
    amount: Option<Decimal>,
}

impl HttpEmailDispatcher {
    pub fn new(client: reqwest::Client, base_url: String, api_key: String, from_address: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
            from_address,
        }
    }
}

#[async_trait]
impl NotificationDispatcher for HttpEmailDispatcher {
    #[instrument(skip(self, code))]
    async fn send_verification_code(
        &self,
        to: &str,
        code: &str,
        context: &CodeEmailContext,
    ) -> Result<(), ServiceError> {
        let body = SendCodeRequest {
            from: &self.from_address,
            to,
            code,
            user_name: context.user_name.as_deref(),
            amount: context.amount,
        };

        let response = self
            .client
            .post(format!("{}/v1/emails/verification-code", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::UpstreamProviderError(format!("email service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::UpstreamProviderError(format!(
                "email service returned {}",
                status
            )));
        }

        info!(to = %mask_email(to), "verification code email dispatched");
        Ok(())
    }
}

/// Masks the local part of an address for responses and logs:
/// `jane@example.com` -> `j***e@example.com`.
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() => {
            let mut chars = local.chars();
            let first = chars.next().unwrap_or('*');
            match chars.next_back() {
                Some(last) if local.chars().count() > 2 => {
                    format!("{}***{}@{}", first, last, domain)
                }
                _ => format!("{}***@{}", first, domain),
            }
        }
        _ => "***".to_string(),
    }
}
