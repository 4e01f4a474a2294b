//! Pricing calculation for token-to-credit conversion.
//!
//! Prices are configured as credits per 1,000 tokens but all arithmetic is
//! done in integer micro-credits, so `ceil` never rounds up a float artifact
//! such as `3.0000000000000004`.

use crate::config::PricingConfig;

/// Fixed-point scale for prices.
const MICRO: u128 = 1_000_000;

/// Tokens per pricing unit.
const TOKENS_PER_UNIT: u128 = 1_000;

/// Fixed-point scale for the safety buffer multiplier.
const BASIS_POINTS: u128 = 10_000;

/// Built-in prices used when no explicit rule is configured, keyed by model
/// id prefix. The longest matching prefix wins.
const FALLBACK_PRICES: &[(&str, f64)] = &[
    ("gpt-4o-mini", 0.3),
    ("gpt-4o", 5.0),
    ("gpt-4-turbo", 10.0),
    ("gpt-4", 30.0),
    ("gpt-3.5-turbo", 1.0),
    ("o1-mini", 3.0),
    ("o1", 15.0),
    ("claude-3-opus", 15.0),
    ("claude-3-5-sonnet", 3.0),
    ("claude-3-sonnet", 3.0),
    ("claude-3-5-haiku", 1.0),
    ("claude-3-haiku", 0.25),
    ("gemini-1.5-pro", 3.5),
    ("gemini-1.5-flash", 0.35),
    ("gemini-2.0-flash", 0.4),
];

/// Rough token count for English text (~4 characters per token).
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

/// Normalise a model id or config key for case- and separator-insensitive
/// matching.
pub fn normalize_model_key(model_id: &str) -> String {
    model_id
        .trim()
        .to_lowercase()
        .replace(['-', '.', '/', ':'], "_")
}

fn to_micro(price: f64) -> u128 {
    (price.max(0.0) * MICRO as f64).round() as u128
}

/// Pricing calculator with cached config.
#[derive(Debug, Clone)]
pub struct PricingCalculator {
    config: PricingConfig,
}

impl PricingCalculator {
    pub fn new(config: PricingConfig) -> Self {
        // Store keys pre-normalised so lookups are a single hash probe.
        let models = config
            .models
            .into_iter()
            .map(|(k, v)| (normalize_model_key(&k), v))
            .collect();
        Self {
            config: PricingConfig {
                default_credits_per_1k: config.default_credits_per_1k,
                models,
            },
        }
    }

    /// Credits per 1,000 tokens for a model.
    ///
    /// Lookup order: explicit configured rule, built-in fallback table
    /// (longest prefix), configured default.
    pub fn price_for_model(&self, model_id: &str) -> f64 {
        let key = normalize_model_key(model_id);
        if let Some(price) = self.config.models.get(&key) {
            return *price;
        }

        FALLBACK_PRICES
            .iter()
            .filter(|(prefix, _)| key.starts_with(&normalize_model_key(prefix)))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, price)| *price)
            .unwrap_or(self.config.default_credits_per_1k)
    }

    /// `ceil(tokens / 1000 * price)`.
    pub fn estimate_credits(&self, model_id: &str, tokens: u64) -> u64 {
        let micro = to_micro(self.price_for_model(model_id));
        let scaled = (tokens as u128) * micro;
        scaled.div_ceil(TOKENS_PER_UNIT * MICRO) as u64
    }

    /// `ceil(credits * safety_buffer)`, never less than `credits`.
    pub fn apply_buffer(credits: u64, safety_buffer: f64) -> u64 {
        let bp = (safety_buffer.max(1.0) * BASIS_POINTS as f64).round() as u128;
        let buffered = ((credits as u128) * bp).div_ceil(BASIS_POINTS) as u64;
        buffered.max(credits)
    }
}
