//! Gateway configuration loaded from environment variables.

use anyhow::{Context, Result};
use credit_ledger::LedgerConfig;
use provider_bridge::{ProviderClient, ProviderError, ProviderFamily, ProviderRouter};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use stream_relay::RelayConfig;
use tracing::{info, warn};

/// Gateway configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Credit ledger, pricing and reservation policy
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Model provider credentials
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Fan-out buffer and queue sizes
    #[serde(default)]
    pub relay: RelayConfig,

    /// Streaming session limits
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Server listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub openai: ProviderSettings,

    #[serde(default)]
    pub anthropic: ProviderSettings,

    #[serde(default)]
    pub gemini: ProviderSettings,
}

/// Credentials and endpoint for one provider family. A family without an
/// API key is disabled.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSettings {
    /// API key
    #[serde(default)]
    pub api_key: Option<SecretString>,

    /// Override for the provider's public endpoint
    #[serde(default)]
    pub base_url: Option<String>,

    /// Connection timeout
    #[serde(default = "default_provider_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries when opening a stream fails transiently
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Wall-clock limit per streaming session
    #[serde(default = "default_max_duration", with = "humantime_serde")]
    pub max_duration: Duration,

    /// Completion budget assumed when a request has no `max_tokens`
    #[serde(default = "default_completion_tokens")]
    pub default_completion_tokens: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

// Default implementations
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_port(),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout: default_provider_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration: default_max_duration(),
            default_completion_tokens: default_completion_tokens(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

// Default value functions
fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8090
}

fn default_provider_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> u32 {
    3
}

fn default_max_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_completion_tokens() -> u32 {
    1024
}

fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(false),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints the types cannot express.
    pub fn validate(&self) -> Result<()> {
        self.ledger
            .validate()
            .context("Invalid ledger configuration")?;
        self.relay.validate().context("Invalid relay configuration")?;
        if self.session.max_duration.is_zero() {
            anyhow::bail!("SESSION__MAX_DURATION must be greater than zero");
        }
        Ok(())
    }
}

impl ProvidersConfig {
    pub fn settings(&self, family: ProviderFamily) -> &ProviderSettings {
        match family {
            ProviderFamily::OpenAi => &self.openai,
            ProviderFamily::Anthropic => &self.anthropic,
            ProviderFamily::Gemini => &self.gemini,
        }
    }

    /// Build a router holding a client for every family with an API key.
    pub fn build_router(&self) -> Result<ProviderRouter, ProviderError> {
        let mut router = ProviderRouter::new();

        for family in ProviderFamily::ALL {
            let settings = self.settings(family);
            let Some(api_key) = settings.api_key.as_ref() else {
                continue;
            };

            let base_url = settings
                .base_url
                .clone()
                .unwrap_or_else(|| family.default_base_url().to_string());

            let client = ProviderClient::new(
                family,
                api_key.expose_secret().as_str(),
                base_url.as_str(),
                settings.timeout,
            )?
            .with_max_retries(settings.max_retries);

            info!("Provider {} enabled at {}", family, base_url);
            router.insert(client);
        }

        if router.is_empty() {
            warn!("No provider API keys configured; every chat request will fail");
        }
        Ok(router)
    }
}
