pub mod checkout;
pub mod health;
pub mod payment_webhooks;
pub mod payments;
