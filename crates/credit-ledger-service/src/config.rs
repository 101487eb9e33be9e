//! Service configuration.
//!
//! Everything is read once at start-up by [`ServiceConfig::from_env`] and
//! passed into the engine explicitly. Every section has a `Default` that is
//! suitable for tests.

use std::path::Path;
use std::str::FromStr;

use chrono::Duration;
use serde::Deserialize;

use credit_ledger_core::{
    AutoTopupConfig, GlobalLimits, PricingConfig, RefundPolicy, UsageCosts,
};

/// Webhook verification and retry settings.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared gateway webhook secret. Without it every webhook is rejected.
    pub secret: Option<String>,
    /// Accepted clock skew between signing and receipt; `0` disables the check.
    pub signature_tolerance_seconds: i64,
    /// Failed attempts after which an event is dead-lettered.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub retry_base_seconds: u32,
    /// Upper bound on the retry delay.
    pub retry_max_seconds: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            signature_tolerance_seconds: 300,
            max_attempts: 5,
            retry_base_seconds: 30,
            retry_max_seconds: 3_600,
        }
    }
}

impl WebhookConfig {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`, capped.
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let seconds = u64::from(self.retry_base_seconds)
            .saturating_mul(factor)
            .min(u64::from(self.retry_max_seconds));
        Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
    }
}

/// Service configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Path to the `RocksDB` data directory (default: "/data/credit-ledger").
    pub data_dir: String,

    /// Webhook verification and retry.
    pub webhook: WebhookConfig,

    /// Auto-topup cooldown and backoff.
    pub auto_topup: AutoTopupConfig,

    /// Refund eligibility.
    pub refund_policy: RefundPolicy,

    /// Pricing configuration.
    pub pricing: PricingConfig,

    /// Credit cost of each usage type.
    pub usage_costs: UsageCosts,

    /// Platform-wide purchase bounds.
    pub global_limits: GlobalLimits,

    /// Age after which a pending purchase or refund is reported as stuck.
    pub stuck_pending_minutes: u32,

    /// Interval of the out-of-band retry sweep.
    pub sweep_interval_seconds: u64,

    /// Maximum webhook events retried per sweep.
    pub sweep_batch_size: usize,

    /// Compare-and-swap attempts per ledger write before giving up.
    pub max_commit_attempts: u32,
}

/// Gateway secrets file structure.
#[derive(Debug, Deserialize)]
struct GatewaySecrets {
    #[serde(default)]
    webhook_secret: Option<String>,
}

impl ServiceConfig {
    /// Load configuration from environment variables and the secrets file.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            webhook: WebhookConfig {
                secret: load_webhook_secret(),
                signature_tolerance_seconds: env_or(
                    "WEBHOOK_TOLERANCE_SECONDS",
                    defaults.webhook.signature_tolerance_seconds,
                ),
                max_attempts: env_or("WEBHOOK_MAX_ATTEMPTS", defaults.webhook.max_attempts),
                retry_base_seconds: env_or(
                    "WEBHOOK_RETRY_BASE_SECONDS",
                    defaults.webhook.retry_base_seconds,
                ),
                retry_max_seconds: env_or(
                    "WEBHOOK_RETRY_MAX_SECONDS",
                    defaults.webhook.retry_max_seconds,
                ),
            },
            auto_topup: AutoTopupConfig {
                cooldown_hours: env_or("AUTO_TOPUP_COOLDOWN_HOURS", defaults.auto_topup.cooldown_hours),
                max_failures: env_or("AUTO_TOPUP_MAX_FAILURES", defaults.auto_topup.max_failures),
                backoff_base: env_or("AUTO_TOPUP_BACKOFF_BASE", defaults.auto_topup.backoff_base),
                backoff_cap_minutes: env_or(
                    "AUTO_TOPUP_BACKOFF_CAP_MINUTES",
                    defaults.auto_topup.backoff_cap_minutes,
                ),
            },
            refund_policy: RefundPolicy {
                window_days: env_or("REFUND_WINDOW_DAYS", defaults.refund_policy.window_days),
                max_used_percent: env_or(
                    "REFUND_MAX_USED_PERCENT",
                    defaults.refund_policy.max_used_percent,
                ),
            },
            pricing: PricingConfig {
                tax_rate: env_or("TAX_RATE", defaults.pricing.tax_rate),
                processing_fee_rate: env_or(
                    "PROCESSING_FEE_RATE",
                    defaults.pricing.processing_fee_rate,
                ),
                ..defaults.pricing
            },
            usage_costs: defaults.usage_costs,
            global_limits: GlobalLimits {
                min_purchase_credits: env_or(
                    "MIN_PURCHASE_CREDITS",
                    defaults.global_limits.min_purchase_credits,
                ),
                max_purchase_credits: env_or(
                    "MAX_PURCHASE_CREDITS",
                    defaults.global_limits.max_purchase_credits,
                ),
            },
            stuck_pending_minutes: env_or("STUCK_PENDING_MINUTES", defaults.stuck_pending_minutes),
            sweep_interval_seconds: env_or(
                "SWEEP_INTERVAL_SECONDS",
                defaults.sweep_interval_seconds,
            ),
            sweep_batch_size: env_or("SWEEP_BATCH_SIZE", defaults.sweep_batch_size),
            max_commit_attempts: env_or("MAX_COMMIT_ATTEMPTS", defaults.max_commit_attempts),
        }
    }

    /// Configuration for tests: defaults plus a webhook secret.
    #[must_use]
    pub fn with_webhook_secret(secret: impl Into<String>) -> Self {
        let mut config = Self::default();
        config.webhook.secret = Some(secret.into());
        config
    }
}

/// Parse an environment variable, falling back to `default` when it is
/// absent or malformed.
fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(name, value = %raw, "Ignoring malformed configuration value");
            default
        }),
        Err(_) => default,
    }
}

/// Load the webhook secret from file or environment.
fn load_webhook_secret() -> Option<String> {
    let secret_paths = [
        ".secrets/stripe.json",
        "credit-ledger/.secrets/stripe.json",
        "../.secrets/stripe.json",
    ];

    for path in &secret_paths {
        if let Ok(secrets) = load_secrets_file::<GatewaySecrets>(path) {
            tracing::info!(path = %path, "Loaded gateway secrets from file");
            if secrets.webhook_secret.is_some() {
                return secrets.webhook_secret;
            }
        }
    }

    // Fall back to environment variables
    tracing::debug!("Gateway secrets file not found, using environment variables");
    std::env::var("STRIPE_WEBHOOK_SECRET").ok()
}

/// Load secrets from a JSON file.
fn load_secrets_file<T: serde::de::DeserializeOwned>(path: &str) -> Result<T, std::io::Error> {
    let path = Path::new(path);
    if !path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "Secrets file not found",
        ));
    }
    let contents = std::fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: "/data/credit-ledger".into(),
            webhook: WebhookConfig::default(),
            auto_topup: AutoTopupConfig::default(),
            refund_policy: RefundPolicy::default(),
            pricing: PricingConfig::default(),
            usage_costs: UsageCosts::default(),
            global_limits: GlobalLimits::default(),
            stuck_pending_minutes: 60,
            sweep_interval_seconds: 30,
            sweep_batch_size: 100,
            max_commit_attempts: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_caps() {
        let config = WebhookConfig::default();
        assert_eq!(config.retry_delay(1), Duration::seconds(30));
        assert_eq!(config.retry_delay(2), Duration::seconds(60));
        assert_eq!(config.retry_delay(4), Duration::seconds(240));
        assert_eq!(config.retry_delay(8), Duration::seconds(3_600));
        assert_eq!(config.retry_delay(200), Duration::seconds(3_600));
    }

    #[test]
    fn defaults_reject_unsigned_webhooks() {
        assert!(ServiceConfig::default().webhook.secret.is_none());
        let config = ServiceConfig::with_webhook_secret("whsec_test");
        assert_eq!(config.webhook.secret.as_deref(), Some("whsec_test"));
    }

    #[test]
    fn env_or_falls_back_on_garbage() {
        assert_eq!(env_or("CREDIT_LEDGER_TEST_UNSET_VARIABLE", 7u32), 7);
    }
}
