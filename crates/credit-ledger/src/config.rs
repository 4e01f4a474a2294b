//! Ledger configuration.

use crate::error::LedgerError;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main ledger configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Whether to snapshot the ledger to disk after every transaction.
    #[serde(default)]
    pub persist: bool,

    /// Path of the JSON snapshot.
    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    /// Service tag written into usage records.
    #[serde(default = "default_service_tag")]
    pub service_tag: String,

    /// Pricing configuration.
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Reservation policy.
    #[serde(default)]
    pub policy: SessionPolicy,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from("/data/ledger.json")
}

fn default_service_tag() -> String {
    "llm-chat".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            persist: false,
            storage_path: default_storage_path(),
            service_tag: default_service_tag(),
            pricing: PricingConfig::default(),
            policy: SessionPolicy::default(),
        }
    }
}

impl LedgerConfig {
    /// Reject settings that would break ledger invariants.
    pub fn validate(&self) -> Result<(), LedgerError> {
        self.policy.validate()?;
        self.pricing.validate()
    }
}

/// Model pricing in credits per 1,000 tokens.
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// Price used when neither an explicit rule nor the built-in table
    /// knows the model.
    /// Default: 1.0
    #[serde(default = "default_credits_per_1k")]
    pub default_credits_per_1k: f64,

    /// Explicit per-model prices. Keys are matched case-insensitively with
    /// `-`, `.`, `/` and `:` treated as `_`, so `GPT_4O` matches `gpt-4o`.
    #[serde(default)]
    pub models: HashMap<String, f64>,
}

fn default_credits_per_1k() -> f64 {
    1.0
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_credits_per_1k: default_credits_per_1k(),
            models: HashMap::new(),
        }
    }
}

impl PricingConfig {
    fn validate(&self) -> Result<(), LedgerError> {
        let prices = std::iter::once(("default", self.default_credits_per_1k))
            .chain(self.models.iter().map(|(k, v)| (k.as_str(), *v)));

        for (model, price) in prices {
            if !price.is_finite() || price < 0.0 {
                return Err(LedgerError::Config(format!(
                    "price for {} must be a non-negative number, got {}",
                    model, price
                )));
            }
        }
        Ok(())
    }
}

/// Reservation and refund policy knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionPolicy {
    /// Multiplier applied to the estimate when reserving.
    /// Default: 1.2 (20% headroom)
    #[serde(default = "default_safety_buffer")]
    pub safety_buffer: f64,

    /// Lifetime of allocations created by refunds.
    #[serde(default = "default_expiry", with = "humantime_serde")]
    pub refund_expiry: Duration,

    /// Lifetime of allocations created by admin grants.
    #[serde(default = "default_expiry", with = "humantime_serde")]
    pub grant_expiry: Duration,
}

fn default_safety_buffer() -> f64 {
    1.2
}

fn default_expiry() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60) // 30 days
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            safety_buffer: default_safety_buffer(),
            refund_expiry: default_expiry(),
            grant_expiry: default_expiry(),
        }
    }
}

impl SessionPolicy {
    fn validate(&self) -> Result<(), LedgerError> {
        if !self.safety_buffer.is_finite() || self.safety_buffer < 1.0 {
            return Err(LedgerError::Config(format!(
                "safety_buffer must be >= 1.0, got {}",
                self.safety_buffer
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LedgerConfig::default();
        assert!(!config.persist);
        assert_eq!(config.service_tag, "llm-chat");
        assert_eq!(config.policy.safety_buffer, 1.2);
        assert_eq!(config.policy.refund_expiry, Duration::from_secs(2_592_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_buffer_below_one() {
        let mut config = LedgerConfig::default();
        config.policy.safety_buffer = 0.9;
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_rejects_negative_price() {
        let mut config = LedgerConfig::default();
        config.pricing.models.insert("gpt_4o".into(), -1.0);
        assert!(matches!(config.validate(), Err(LedgerError::Config(_))));
    }

    #[test]
    fn test_deserialize_humantime() {
        let json = serde_json::json!({
            "safety_buffer": 1.5,
            "refund_expiry": "7days",
        });
        let policy: SessionPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(policy.safety_buffer, 1.5);
        assert_eq!(policy.refund_expiry, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(policy.grant_expiry, default_expiry());
    }
}
