use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_WARN_THRESHOLD: u8 = 40;
const DEFAULT_DENY_THRESHOLD: u8 = 75;
const DEFAULT_CHALLENGE_TTL_SECS: u64 = 600;
const DEFAULT_DEDUP_WINDOW_SECS: u64 = 120;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_STATUS_POLL_ATTEMPTS: u32 = 10;
const DEFAULT_STATUS_POLL_DELAY_MS: u64 = 1000;
const DEFAULT_SUPPORT_CONTACT: &str = "support@example.com";

#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ConfigError),
    #[error("Invalid configuration: {0}")]
    Invalid(#[from] validator::ValidationErrors),
    #[error("Webhook secret is required in production; set APP__PROVIDER__WEBHOOK_SECRET")]
    MissingWebhookSecret,
}

/// Risk scoring thresholds. `warn` and `deny` bound the three decision bands.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct RiskConfig {
    #[serde(default = "default_warn_threshold")]
    #[validate(range(min = 1, max = 100))]
    pub warn_threshold: u8,
    #[serde(default = "default_deny_threshold")]
    #[validate(range(min = 1, max = 100))]
    pub deny_threshold: u8,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            warn_threshold: DEFAULT_WARN_THRESHOLD,
            deny_threshold: DEFAULT_DENY_THRESHOLD,
        }
    }
}

/// Step-up verification challenge settings.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct VerificationConfig {
    /// Lifetime of an issued challenge before it expires
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,
    /// Window in which repeated checkout attempts for the same user and
    /// amount reuse the existing challenge instead of sending another email
    #[serde(default = "default_dedup_window")]
    pub dedup_window_secs: u64,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS,
            dedup_window_secs: DEFAULT_DEDUP_WINDOW_SECS,
        }
    }
}

/// Payment provider endpoint and webhook settings.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct ProviderConfig {
    #[serde(default = "default_provider_url")]
    #[validate(url)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// Shared secret for inbound webhook signatures. When unset, signature
    /// verification is skipped (development only).
    #[serde(default)]
    pub webhook_secret: Option<String>,
    #[serde(default = "default_webhook_tolerance")]
    pub webhook_tolerance_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_provider_url(),
            api_key: String::new(),
            webhook_secret: None,
            webhook_tolerance_secs: DEFAULT_WEBHOOK_TOLERANCE_SECS,
        }
    }
}

/// Outbound email service settings for one-time-code delivery.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct EmailConfig {
    #[serde(default = "default_email_url")]
    #[validate(url)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_from_address")]
    #[validate(email)]
    pub from_address: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            base_url: default_email_url(),
            api_key: String::new(),
            from_address: default_from_address(),
        }
    }
}

/// Bounded retry for the payment status query racing webhook arrival.
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct StatusPollConfig {
    #[serde(default = "default_poll_attempts")]
    #[validate(range(min = 1, max = 60))]
    pub max_attempts: u32,
    #[serde(default = "default_poll_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for StatusPollConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_STATUS_POLL_ATTEMPTS,
            base_delay_ms: DEFAULT_STATUS_POLL_DELAY_MS,
        }
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON (production) instead of human-readable lines
    #[serde(default)]
    pub log_json: bool,

    #[serde(default = "default_environment")]
    pub environment: String,

    /// Create missing tables at startup (sqlite/dev convenience)
    #[serde(default)]
    pub auto_migrate: bool,

    /// Contact surfaced to the shopper when a checkout is blocked
    #[serde(default = "default_support_contact")]
    #[validate(email)]
    pub support_contact: String,

    #[serde(default)]
    #[validate]
    pub risk: RiskConfig,

    #[serde(default)]
    #[validate]
    pub verification: VerificationConfig,

    #[serde(default)]
    #[validate]
    pub provider: ProviderConfig,

    #[serde(default)]
    #[validate]
    pub email: EmailConfig,

    #[serde(default)]
    #[validate]
    pub status_poll: StatusPollConfig,
}

impl AppConfig {
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn default_warn_threshold() -> u8 {
    DEFAULT_WARN_THRESHOLD
}
fn default_deny_threshold() -> u8 {
    DEFAULT_DENY_THRESHOLD
}
fn default_challenge_ttl() -> u64 {
    DEFAULT_CHALLENGE_TTL_SECS
}
fn default_dedup_window() -> u64 {
    DEFAULT_DEDUP_WINDOW_SECS
}
fn default_webhook_tolerance() -> u64 {
    DEFAULT_WEBHOOK_TOLERANCE_SECS
}
fn default_poll_attempts() -> u32 {
    DEFAULT_STATUS_POLL_ATTEMPTS
}
fn default_poll_delay_ms() -> u64 {
    DEFAULT_STATUS_POLL_DELAY_MS
}
fn default_host() -> String {
    DEFAULT_HOST.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}
fn default_environment() -> String {
    DEFAULT_ENV.to_string()
}
fn default_support_contact() -> String {
    DEFAULT_SUPPORT_CONTACT.to_string()
}
fn default_provider_url() -> String {
    "https://payments.example.com".to_string()
}
fn default_email_url() -> String {
    "https://mail.example.com".to_string()
}
fn default_from_address() -> String {
    "no-reply@example.com".to_string()
}

/// Loads configuration from `config/default`, an environment-specific file,
/// and `APP__`-prefixed environment variables, later sources winning.
pub fn load_config() -> Result<AppConfig, ConfigurationError> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());

    let mut builder = Config::builder()
        .set_default("environment", run_env.clone())?
        .add_source(File::from(Path::new(CONFIG_DIR).join("default")).required(false))
        .add_source(File::from(Path::new(CONFIG_DIR).join(&run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"));

    // DATABASE_URL is the conventional override outside the APP__ prefix
    if let Ok(url) = env::var("DATABASE_URL") {
        builder = builder.set_override("database_url", url)?;
    }

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    ensure_production_secrets(&config)?;

    info!(environment = %config.environment, "configuration loaded");
    Ok(config)
}

/// Skipping webhook signature verification is a development-only
/// convenience; a production deployment must carry the shared secret.
fn ensure_production_secrets(config: &AppConfig) -> Result<(), ConfigurationError> {
    if config.is_production() && config.provider.webhook_secret.is_none() {
        return Err(ConfigurationError::MissingWebhookSecret);
    }
    Ok(())
}

/// Initializes the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(log_level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig {
            database_url: "sqlite::memory:".to_string(),
            host: default_host(),
            port: default_port(),
            log_level: default_log_level(),
            log_json: false,
            environment: "test".to_string(),
            auto_migrate: true,
            support_contact: default_support_contact(),
            risk: RiskConfig::default(),
            verification: VerificationConfig::default(),
            provider: ProviderConfig::default(),
            email: EmailConfig::default(),
            status_poll: StatusPollConfig::default(),
        }
    }

    #[test]
    fn defaults_pass_validation() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn threshold_out_of_range_is_rejected() {
        let mut cfg = base_config();
        cfg.risk.deny_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_bands_are_ordered() {
        let cfg = base_config();
        assert!(cfg.risk.warn_threshold < cfg.risk.deny_threshold);
    }

    #[test]
    fn production_requires_a_webhook_secret() {
        let mut cfg = base_config();
        cfg.environment = "production".to_string();
        assert!(matches!(
            ensure_production_secrets(&cfg),
            Err(ConfigurationError::MissingWebhookSecret)
        ));

        cfg.provider.webhook_secret = Some("whsec_live".to_string());
        assert!(ensure_production_secrets(&cfg).is_ok());
    }

    #[test]
    fn development_may_omit_the_webhook_secret() {
        let cfg = base_config();
        assert!(cfg.provider.webhook_secret.is_none());
        assert!(ensure_production_secrets(&cfg).is_ok());
    }
}
