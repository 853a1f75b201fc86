//! TOML Configuration File Support
//!
//! Centralized configuration for the dispatch core, built once at startup and
//! shared as an immutable [`RelayConfig`]. Nothing downstream re-reads the
//! environment.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # XDG Base Directory Compliance
//!
//! The configuration file lives at `$XDG_CONFIG_HOME/relay/relay.toml`
//! (typically `~/.config/relay/relay.toml`).
//!
//! # Example Configuration
//!
//! ```toml
//! [health]
//! enabled = true
//! log_only = false
//! circuit_breaker = true
//! failure_threshold = 3
//! probe_delay_ms = 30000
//! retry_attempts = 2
//! backoff_base_ms = 250
//! backoff_max_ms = 5000
//!
//! [routing]
//! allowed_providers = ["google", "openai", "openrouter"]
//! prefer_free_tier = true
//! free_models = ["deepseek/deepseek-r1:free"]
//! cost_aware = true
//! max_cost_per_request = 20.0
//! metadata_selection = false
//! long_context_bias = false
//!
//! [pricing.input]
//! "gpt-4.1" = 2.0
//!
//! [pricing.output]
//! "gpt-4.1" = 8.0
//!
//! [fallback_chains]
//! chat = ["gemini-2.5-flash", "gpt-4.1-mini"]
//!
//! [restrictions]
//! openai = ["gpt-4.1", "gpt-4.1-mini", "o3"]
//!
//! [providers.custom]
//! base_url = "http://localhost:11434/v1"
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::health::CircuitConfig;
use crate::provider::{ProviderCredentials, ProviderIdentity, RetryPolicy};
use crate::telemetry::Pricing;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Health section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Wrap providers with health tracking
    pub enabled: Option<bool>,

    /// Record outcomes without gating selection
    pub log_only: Option<bool>,

    /// Skip providers whose circuit is open
    pub circuit_breaker: Option<bool>,

    /// Consecutive failures that open a circuit
    pub failure_threshold: Option<u32>,

    /// Delay before an open circuit is probed, in milliseconds
    pub probe_delay_ms: Option<u64>,

    /// Attempts per model, including the first
    pub retry_attempts: Option<u32>,

    /// First retry delay in milliseconds
    pub backoff_base_ms: Option<u64>,

    /// Retry delay cap in milliseconds
    pub backoff_max_ms: Option<u64>,
}

/// Routing section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingToml {
    /// Provider names allowed to be constructed
    pub allowed_providers: Option<Vec<String>>,

    /// Prefer free models when picking a default
    pub prefer_free_tier: Option<bool>,

    /// Models considered free
    pub free_models: Option<Vec<String>>,

    /// Rank models by price
    pub cost_aware: Option<bool>,

    /// Drop models whose blended price per million tokens exceeds this
    pub max_cost_per_request: Option<f64>,

    /// Rank models by reported capabilities
    pub metadata_selection: Option<bool>,

    /// Prefer larger context windows
    pub long_context_bias: Option<bool>,
}

/// Credentials for one provider in the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToml {
    /// API key
    pub api_key: Option<String>,

    /// Base URL override
    pub base_url: Option<String>,
}

/// Root TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Health and retry settings
    pub health: HealthToml,

    /// Model selection settings
    pub routing: RoutingToml,

    /// Price tables
    pub pricing: Pricing,

    /// Explicit fallback chains by category key
    pub fallback_chains: HashMap<String, Vec<String>>,

    /// Allowed models per provider name
    pub restrictions: HashMap<String, Vec<String>>,

    /// Credentials per provider name
    pub providers: HashMap<String, ProviderToml>,
}

// =============================================================================
// Resolved Configuration
// =============================================================================

/// Health tracking and circuit breaker settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSettings {
    /// Wrap providers with health tracking
    pub enabled: bool,

    /// Record outcomes but never gate selection on circuit state
    pub log_only: bool,

    /// Skip providers whose circuit is open
    pub circuit_breaker: bool,

    /// Consecutive failures that open a circuit
    pub failure_threshold: u32,

    /// Delay before an open circuit is probed
    pub probe_delay: Duration,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_only: false,
            circuit_breaker: true,
            failure_threshold: 3,
            probe_delay: Duration::from_secs(30),
        }
    }
}

impl HealthSettings {
    /// Whether selection should skip identities with an open circuit
    #[must_use]
    pub fn gates_selection(&self) -> bool {
        self.enabled && self.circuit_breaker && !self.log_only
    }

    /// Breaker tuning derived from these settings
    #[must_use]
    pub fn circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            half_open_probe_delay: self.probe_delay,
        }
    }
}

/// Model selection policies
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingSettings {
    /// Allowed provider identities; `None` allows all
    pub allowed_providers: Option<Vec<ProviderIdentity>>,

    /// Prefer free models when picking a default
    pub prefer_free_tier: bool,

    /// Models considered free
    pub free_models: Vec<String>,

    /// Rank models by price
    pub cost_aware: bool,

    /// Drop models whose blended price per million tokens exceeds this
    pub max_cost_per_request: Option<f64>,

    /// Rank models by reported capabilities
    pub metadata_selection: bool,

    /// Prefer larger context windows
    pub long_context_bias: bool,
}

/// Credentials for one provider
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// API key
    #[serde(serialize_with = "redact_secret")]
    pub api_key: Option<String>,

    /// Base URL override
    pub base_url: Option<String>,
}

impl ProviderSettings {
    /// Settings with an API key
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            base_url: None,
        }
    }

    /// Set base URL
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }
}

fn redact_secret<S: Serializer>(value: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(key) if !key.is_empty() => serializer.serialize_some("********"),
        Some(_) => serializer.serialize_some(""),
        None => serializer.serialize_none(),
    }
}

/// Complete resolved configuration
///
/// Built once by [`load_config`] and shared behind an `Arc`.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RelayConfig {
    /// Health tracking and circuit breaker
    pub health: HealthSettings,

    /// Per-model retry schedule used by health-wrapped providers
    pub retry: RetryPolicy,

    /// Model selection policies
    pub routing: RoutingSettings,

    /// Price tables
    pub pricing: Pricing,

    /// Explicit fallback chains by category key
    pub fallback_chains: BTreeMap<String, Vec<String>>,

    /// Allowed models per provider
    pub restrictions: BTreeMap<ProviderIdentity, Vec<String>>,

    /// Credentials per provider
    pub providers: BTreeMap<ProviderIdentity, ProviderSettings>,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl RelayConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Whether the allow-list permits constructing `identity`
    #[must_use]
    pub fn is_provider_allowed(&self, identity: ProviderIdentity) -> bool {
        self.routing
            .allowed_providers
            .as_ref()
            .is_none_or(|allowed| allowed.contains(&identity))
    }

    /// Credentials for `identity`, if enough are configured to build it
    ///
    /// The `Custom` identity needs a base URL and accepts an empty key;
    /// every other identity needs a non-empty key.
    #[must_use]
    pub fn credentials_for(&self, identity: ProviderIdentity) -> Option<ProviderCredentials> {
        let settings = self.providers.get(&identity)?;
        let api_key = settings.api_key.clone().unwrap_or_default();

        if identity.requires_api_key() {
            if api_key.trim().is_empty() {
                return None;
            }
        } else if settings.base_url.as_deref().is_none_or(|u| u.trim().is_empty()) {
            return None;
        }

        Some(ProviderCredentials {
            api_key,
            base_url: settings.base_url.clone(),
        })
    }

    /// Set credentials for a provider
    #[must_use]
    pub fn with_provider(mut self, identity: ProviderIdentity, settings: ProviderSettings) -> Self {
        self.providers.insert(identity, settings);
        self
    }

    /// Set an explicit fallback chain
    #[must_use]
    pub fn with_fallback_chain(mut self, key: impl Into<String>, chain: Vec<String>) -> Self {
        self.fallback_chains.insert(key.into(), chain);
        self
    }

    /// Check value constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for a zero failure threshold,
    /// a backoff base above the backoff cap, or a negative cost ceiling.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.retry.backoff_base > self.retry.backoff_max {
            return Err(ConfigError::ValidationError(format!(
                "backoff base ({}ms) exceeds backoff max ({}ms)",
                self.retry.backoff_base.as_millis(),
                self.retry.backoff_max.as_millis()
            )));
        }
        if let Some(max) = self.routing.max_cost_per_request {
            if !max.is_finite() || max < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "max_cost_per_request must be a non-negative number, got {max}"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Environment variable names read by [`load_config`]
pub mod env_keys {
    /// Enable health tracking
    pub const HEALTH_CHECKS: &str = "RELAY_HEALTH_CHECKS";
    /// Record outcomes without gating selection
    pub const HEALTH_LOG_ONLY: &str = "RELAY_HEALTH_LOG_ONLY";
    /// Enable circuit breaking at selection time
    pub const CIRCUIT_BREAKER: &str = "RELAY_CIRCUIT_BREAKER";
    /// Consecutive failures that open a circuit
    pub const CIRCUIT_FAILURE_THRESHOLD: &str = "RELAY_CIRCUIT_FAILURE_THRESHOLD";
    /// Half-open probe delay in milliseconds
    pub const CIRCUIT_PROBE_DELAY_MS: &str = "RELAY_CIRCUIT_PROBE_DELAY_MS";
    /// Attempts per model
    pub const RETRY_ATTEMPTS: &str = "RELAY_RETRY_ATTEMPTS";
    /// First retry delay in milliseconds
    pub const RETRY_BACKOFF_BASE_MS: &str = "RELAY_RETRY_BACKOFF_BASE_MS";
    /// Retry delay cap in milliseconds
    pub const RETRY_BACKOFF_MAX_MS: &str = "RELAY_RETRY_BACKOFF_MAX_MS";
    /// Comma-separated provider allow-list
    pub const ALLOWED_PROVIDERS: &str = "RELAY_ALLOWED_PROVIDERS";
    /// Prefer free models
    pub const PREFER_FREE_TIER: &str = "RELAY_PREFER_FREE_TIER";
    /// Comma-separated free model list
    pub const FREE_MODELS: &str = "RELAY_FREE_MODELS";
    /// Rank models by price
    pub const COST_AWARE_ROUTING: &str = "RELAY_COST_AWARE_ROUTING";
    /// Blended price ceiling
    pub const MAX_COST_PER_REQUEST: &str = "RELAY_MAX_COST_PER_REQUEST";
    /// JSON object of input prices
    pub const MODEL_INPUT_PRICES: &str = "RELAY_MODEL_INPUT_PRICES";
    /// JSON object of output prices
    pub const MODEL_OUTPUT_PRICES: &str = "RELAY_MODEL_OUTPUT_PRICES";
    /// JSON object of legacy single prices
    pub const MODEL_PRICES: &str = "RELAY_MODEL_PRICES";
    /// Rank models by capabilities
    pub const METADATA_SELECTION: &str = "RELAY_METADATA_SELECTION";
    /// Prefer larger context windows
    pub const LONG_CONTEXT_BIAS: &str = "RELAY_LONG_CONTEXT_BIAS";
}

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/relay/relay.toml` or
/// `~/.config/relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration with an explicit environment lookup
///
/// # Errors
///
/// Same as [`load_config_from_path`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<RelayConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, &env);
    config.validate()?;

    Ok(config)
}

fn parse_identity_key(name: &str, section: &str) -> Result<ProviderIdentity, ConfigError> {
    name.parse().map_err(|_| {
        ConfigError::ValidationError(format!("unknown provider '{name}' in [{section}]"))
    })
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) -> Result<(), ConfigError> {
    // Health settings
    if let Some(enabled) = toml.health.enabled {
        config.health.enabled = enabled;
    }
    if let Some(log_only) = toml.health.log_only {
        config.health.log_only = log_only;
    }
    if let Some(enabled) = toml.health.circuit_breaker {
        config.health.circuit_breaker = enabled;
    }
    if let Some(threshold) = toml.health.failure_threshold {
        config.health.failure_threshold = threshold;
    }
    if let Some(ms) = toml.health.probe_delay_ms {
        config.health.probe_delay = Duration::from_millis(ms);
    }
    if let Some(attempts) = toml.health.retry_attempts {
        config.retry.attempts = attempts;
    }
    if let Some(ms) = toml.health.backoff_base_ms {
        config.retry.backoff_base = Duration::from_millis(ms);
    }
    if let Some(ms) = toml.health.backoff_max_ms {
        config.retry.backoff_max = Duration::from_millis(ms);
    }

    // Routing settings
    if let Some(ref names) = toml.routing.allowed_providers {
        let allowed = names
            .iter()
            .map(|n| parse_identity_key(n, "routing"))
            .collect::<Result<Vec<_>, _>>()?;
        config.routing.allowed_providers = Some(allowed);
    }
    if let Some(prefer) = toml.routing.prefer_free_tier {
        config.routing.prefer_free_tier = prefer;
    }
    if let Some(ref models) = toml.routing.free_models {
        config.routing.free_models = models.clone();
    }
    if let Some(enabled) = toml.routing.cost_aware {
        config.routing.cost_aware = enabled;
    }
    if toml.routing.max_cost_per_request.is_some() {
        config.routing.max_cost_per_request = toml.routing.max_cost_per_request;
    }
    if let Some(enabled) = toml.routing.metadata_selection {
        config.routing.metadata_selection = enabled;
    }
    if let Some(enabled) = toml.routing.long_context_bias {
        config.routing.long_context_bias = enabled;
    }

    // Pricing, chains, restrictions, credentials
    if !toml.pricing.is_empty() {
        config.pricing = toml.pricing.clone();
    }
    for (key, chain) in &toml.fallback_chains {
        config.fallback_chains.insert(key.clone(), chain.clone());
    }
    for (name, models) in &toml.restrictions {
        let identity = parse_identity_key(name, "restrictions")?;
        config.restrictions.insert(identity, models.clone());
    }
    for (name, provider) in &toml.providers {
        let identity = parse_identity_key(name, "providers")?;
        config.providers.insert(
            identity,
            ProviderSettings {
                api_key: provider.api_key.clone(),
                base_url: provider.base_url.clone(),
            },
        );
    }

    Ok(())
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_price_table(key: &str, value: &str) -> Option<HashMap<String, f64>> {
    match serde_json::from_str::<HashMap<String, f64>>(value) {
        Ok(table) => Some(table),
        Err(e) => {
            tracing::warn!(var = key, error = %e, "Ignoring malformed price table");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config<F>(config: &mut RelayConfig, env: &F)
where
    F: Fn(&str) -> Option<String>,
{
    use env_keys as k;

    let mut touched = false;
    let mut flag = |key: &str, target: &mut bool| {
        if let Some(value) = env(key) {
            *target = parse_flag(&value);
            touched = true;
        }
    };

    // Health settings from environment
    flag(k::HEALTH_CHECKS, &mut config.health.enabled);
    flag(k::HEALTH_LOG_ONLY, &mut config.health.log_only);
    flag(k::CIRCUIT_BREAKER, &mut config.health.circuit_breaker);
    flag(k::PREFER_FREE_TIER, &mut config.routing.prefer_free_tier);
    flag(k::COST_AWARE_ROUTING, &mut config.routing.cost_aware);
    flag(k::METADATA_SELECTION, &mut config.routing.metadata_selection);
    flag(k::LONG_CONTEXT_BIAS, &mut config.routing.long_context_bias);

    if let Some(n) = env(k::CIRCUIT_FAILURE_THRESHOLD).and_then(|v| v.trim().parse::<u32>().ok()) {
        config.health.failure_threshold = n;
        touched = true;
    }
    if let Some(ms) = env(k::CIRCUIT_PROBE_DELAY_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
        config.health.probe_delay = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(n) = env(k::RETRY_ATTEMPTS).and_then(|v| v.trim().parse::<u32>().ok()) {
        config.retry.attempts = n;
        touched = true;
    }
    if let Some(ms) = env(k::RETRY_BACKOFF_BASE_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
        config.retry.backoff_base = Duration::from_millis(ms);
        touched = true;
    }
    if let Some(ms) = env(k::RETRY_BACKOFF_MAX_MS).and_then(|v| v.trim().parse::<u64>().ok()) {
        config.retry.backoff_max = Duration::from_millis(ms);
        touched = true;
    }

    // Routing settings from environment
    if let Some(value) = env(k::ALLOWED_PROVIDERS) {
        let mut allowed = Vec::new();
        for name in parse_list(&value) {
            match name.parse::<ProviderIdentity>() {
                Ok(identity) => allowed.push(identity),
                Err(_) => {
                    tracing::warn!(provider = %name, "Ignoring unknown provider in allow-list");
                }
            }
        }
        config.routing.allowed_providers = Some(allowed);
        touched = true;
    }
    if let Some(value) = env(k::FREE_MODELS) {
        config.routing.free_models = parse_list(&value);
        touched = true;
    }
    if let Some(max) = env(k::MAX_COST_PER_REQUEST).and_then(|v| v.trim().parse::<f64>().ok()) {
        config.routing.max_cost_per_request = Some(max);
        touched = true;
    }

    // Price tables from environment
    if let Some(table) =
        env(k::MODEL_INPUT_PRICES).and_then(|v| parse_price_table(k::MODEL_INPUT_PRICES, &v))
    {
        config.pricing.input = table;
        touched = true;
    }
    if let Some(table) =
        env(k::MODEL_OUTPUT_PRICES).and_then(|v| parse_price_table(k::MODEL_OUTPUT_PRICES, &v))
    {
        config.pricing.output = table;
        touched = true;
    }
    if let Some(table) =
        env(k::MODEL_PRICES).and_then(|v| parse_price_table(k::MODEL_PRICES, &v))
    {
        config.pricing.legacy = table;
        touched = true;
    }

    // Credentials and per-provider restrictions
    for identity in ProviderIdentity::ALL {
        let key = env(identity.api_key_env()).filter(|v| !v.trim().is_empty());
        let url = env(identity.base_url_env()).filter(|v| !v.trim().is_empty());
        if key.is_some() || url.is_some() {
            let settings = config.providers.entry(identity).or_default();
            if key.is_some() {
                settings.api_key = key;
            }
            if url.is_some() {
                settings.base_url = url;
            }
            touched = true;
        }

        if let Some(value) = env(identity.allowed_models_env()) {
            let models = parse_list(&value);
            if !models.is_empty() {
                config.restrictions.insert(identity, models);
                touched = true;
            }
        }
    }

    if touched {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Health tracking override
    pub health_enabled: Option<bool>,

    /// Log-only mode override
    pub log_only: Option<bool>,

    /// Retry attempts override
    pub retry_attempts: Option<u32>,

    /// Provider allow-list override
    pub allowed_providers: Option<Vec<ProviderIdentity>>,

    /// Free-tier preference override
    pub prefer_free_tier: Option<bool>,

    /// Cost-aware routing override
    pub cost_aware: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set health tracking override
    #[must_use]
    pub fn with_health_enabled(mut self, enabled: bool) -> Self {
        self.health_enabled = Some(enabled);
        self
    }

    /// Set log-only override
    #[must_use]
    pub fn with_log_only(mut self, log_only: bool) -> Self {
        self.log_only = Some(log_only);
        self
    }

    /// Set retry attempts override
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = Some(attempts);
        self
    }

    /// Set provider allow-list override
    #[must_use]
    pub fn with_allowed_providers(mut self, providers: Vec<ProviderIdentity>) -> Self {
        self.allowed_providers = Some(providers);
        self
    }

    /// Set free-tier preference override
    #[must_use]
    pub fn with_prefer_free_tier(mut self, prefer: bool) -> Self {
        self.prefer_free_tier = Some(prefer);
        self
    }

    /// Set cost-aware routing override
    #[must_use]
    pub fn with_cost_aware(mut self, enabled: bool) -> Self {
        self.cost_aware = Some(enabled);
        self
    }

    /// Whether any override is set
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.health_enabled.is_none()
            && self.log_only.is_none()
            && self.retry_attempts.is_none()
            && self.allowed_providers.is_none()
            && self.prefer_free_tier.is_none()
            && self.cost_aware.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfig) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }

        if let Some(enabled) = self.health_enabled {
            config.health.enabled = enabled;
        }
        if let Some(log_only) = self.log_only {
            config.health.log_only = log_only;
        }
        if let Some(attempts) = self.retry_attempts {
            config.retry.attempts = attempts;
        }
        if let Some(ref providers) = self.allowed_providers {
            let unique: HashSet<_> = providers.iter().copied().collect();
            let mut ordered: Vec<_> = unique.into_iter().collect();
            ordered.sort();
            config.routing.allowed_providers = Some(ordered);
        }
        if let Some(prefer) = self.prefer_free_tier {
            config.routing.prefer_free_tier = prefer;
        }
        if let Some(enabled) = self.cost_aware {
            config.routing.cost_aware = enabled;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();

        assert!(config.health.enabled);
        assert!(!config.health.log_only);
        assert!(config.health.circuit_breaker);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.retry.attempts, 1);
        assert!(config.routing.allowed_providers.is_none());
        assert!(config.pricing.is_empty());
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(p) = default_config_path() {
            assert!(p.ends_with("relay/relay.toml"));
        }
    }

    // =========================================================================
    // TOML Parsing Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_toml(
            r#"
[health]
log_only = true
failure_threshold = 5
probe_delay_ms = 1500
retry_attempts = 3
backoff_base_ms = 100
backoff_max_ms = 400

[routing]
allowed_providers = ["google", "OpenRouter"]
prefer_free_tier = true
free_models = ["deepseek/deepseek-r1:free"]
cost_aware = true
max_cost_per_request = 12.5

[pricing.input]
"gpt-4.1" = 2.0

[pricing.output]
"gpt-4.1" = 8.0

[fallback_chains]
chat = ["m1", "m2"]

[restrictions]
openai = ["o3"]

[providers.custom]
base_url = "http://localhost:11434/v1"
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert!(config.health.log_only);
        assert!(!config.health.gates_selection());
        assert_eq!(config.health.failure_threshold, 5);
        assert_eq!(config.health.probe_delay, Duration::from_millis(1500));
        assert_eq!(config.retry.attempts, 3);
        assert_eq!(config.retry.backoff_max, Duration::from_millis(400));
        assert_eq!(
            config.routing.allowed_providers,
            Some(vec![ProviderIdentity::Google, ProviderIdentity::OpenRouter])
        );
        assert!(config.routing.prefer_free_tier);
        assert_eq!(config.routing.max_cost_per_request, Some(12.5));
        assert_eq!(config.pricing.output_price("gpt-4.1"), Some(8.0));
        assert_eq!(config.fallback_chains["chat"], vec!["m1", "m2"]);
        assert_eq!(config.restrictions[&ProviderIdentity::OpenAi], vec!["o3"]);
        assert_eq!(config.source(), ConfigSource::File);

        let creds = config.credentials_for(ProviderIdentity::Custom).unwrap();
        assert_eq!(creds.api_key, "");
        assert_eq!(creds.base_url.as_deref(), Some("http://localhost:11434/v1"));
    }

    #[test]
    fn test_parse_partial_toml_keeps_defaults() {
        let file = write_toml("[routing]\nlong_context_bias = true\n");

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert!(config.routing.long_context_bias);
        assert!(config.health.enabled);
        assert_eq!(config.health.failure_threshold, 3);
    }

    #[test]
    fn test_unknown_provider_section_rejected() {
        let file = write_toml("[providers.bedrock]\napi_key = \"x\"\n");

        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_toml("[health\nfailure_threshold = \"three\"\n");

        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_missing_file_graceful() {
        let path = PathBuf::from("/nonexistent/path/relay.toml");
        let config = load_config_with_env(Some(path), no_env).unwrap();

        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    // =========================================================================
    // Priority Ordering Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_toml(
            r#"
[health]
retry_attempts = 2

[routing]
free_models = ["from-file"]
"#,
        );
        let env = env_from(&[
            ("RELAY_RETRY_ATTEMPTS", "4"),
            ("RELAY_FREE_MODELS", "a:free, b:free ,"),
            ("RELAY_PREFER_FREE_TIER", "yes"),
        ]);

        let config = load_config_with_env(Some(file.path().to_path_buf()), env).unwrap();

        assert_eq!(config.retry.attempts, 4);
        assert_eq!(config.routing.free_models, vec!["a:free", "b:free"]);
        assert!(config.routing.prefer_free_tier);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_env_credentials_and_restrictions() {
        let env = env_from(&[
            ("GEMINI_API_KEY", "g-key"),
            ("OPENAI_API_KEY", "  "),
            ("CUSTOM_API_URL", "http://127.0.0.1:8000"),
            ("OPENAI_ALLOWED_MODELS", "o3,gpt-4.1"),
            ("RELAY_ALLOWED_PROVIDERS", "google,custom,nope"),
        ]);

        let config = load_config_with_env(None, env).unwrap();

        assert_eq!(
            config.credentials_for(ProviderIdentity::Google),
            Some(ProviderCredentials::new("g-key"))
        );
        assert!(config.credentials_for(ProviderIdentity::OpenAi).is_none());
        assert!(config.credentials_for(ProviderIdentity::Custom).is_some());
        assert_eq!(
            config.restrictions[&ProviderIdentity::OpenAi],
            vec!["o3", "gpt-4.1"]
        );
        assert!(config.is_provider_allowed(ProviderIdentity::Custom));
        assert!(!config.is_provider_allowed(ProviderIdentity::OpenAi));
    }

    #[test]
    fn test_env_price_tables() {
        let env = env_from(&[
            ("RELAY_MODEL_INPUT_PRICES", r#"{"m": 0.1}"#),
            ("RELAY_MODEL_PRICES", r#"{"m": 0.2}"#),
            ("RELAY_MODEL_OUTPUT_PRICES", "not json"),
        ]);

        let config = load_config_with_env(None, env).unwrap();

        assert_eq!(config.pricing.input_price("m"), Some(0.1));
        assert_eq!(config.pricing.output_price("m"), Some(0.2));
        let cost = config.pricing.estimate_cost("m", 1_000_000, 500_000);
        assert!((cost - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_cli_overrides_env() {
        let env = env_from(&[("RELAY_RETRY_ATTEMPTS", "4")]);
        let mut config = load_config_with_env(None, env).unwrap();

        ConfigOverrides::new()
            .with_retry_attempts(1)
            .with_allowed_providers(vec![ProviderIdentity::XAi, ProviderIdentity::Google])
            .apply(&mut config);

        assert_eq!(config.retry.attempts, 1);
        assert_eq!(
            config.routing.allowed_providers,
            Some(vec![ProviderIdentity::Google, ProviderIdentity::XAi])
        );
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = RelayConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    // =========================================================================
    // Validation Tests
    // =========================================================================

    #[test]
    fn test_zero_threshold_rejected() {
        let env = env_from(&[("RELAY_CIRCUIT_FAILURE_THRESHOLD", "0")]);
        let result = load_config_with_env(None, env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_backoff_base_above_max_rejected() {
        let env = env_from(&[
            ("RELAY_RETRY_BACKOFF_BASE_MS", "900"),
            ("RELAY_RETRY_BACKOFF_MAX_MS", "100"),
        ]);
        let result = load_config_with_env(None, env);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_effective_config_redacts_keys() {
        let config = RelayConfig::default().with_provider(
            ProviderIdentity::OpenAi,
            ProviderSettings {
                api_key: Some("sk-secret".into()),
                base_url: None,
            },
        );
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
        assert!(json.contains("********"));
    }

    #[test]
    fn test_flag_parsing() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" on "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag(""));
    }
}
