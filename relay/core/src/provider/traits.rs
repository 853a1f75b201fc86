//! Provider Traits
//!
//! Trait definitions for model providers. This abstraction lets the registry
//! and dispatcher work with any backend family (Gemini, OpenAI, OpenRouter,
//! a self-hosted endpoint, ...) without changing core logic.
//!
//! # Design Philosophy
//!
//! The [`Provider`] trait provides a common interface for:
//! - Validating model names and listing the models a backend serves
//! - Reporting per-model capabilities (context window, thinking support)
//! - Generating content and counting tokens
//!
//! Implementations handle provider-specific details (API formats, auth, etc.)

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Provider Identity
// ============================================================================

/// Stable tag identifying a backend family
///
/// Used as the key for registrations, cached instances, circuit state and
/// priority ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderIdentity {
    /// Google Gemini models
    Google,
    /// OpenAI models
    #[serde(rename = "openai")]
    OpenAi,
    /// X.AI Grok models
    #[serde(rename = "xai")]
    XAi,
    /// DIAL aggregation endpoint
    Dial,
    /// Self-hosted OpenAI-compatible endpoint (Ollama, vLLM, ...)
    Custom,
    /// Catch-all aggregator, lowest priority
    #[serde(rename = "openrouter")]
    OpenRouter,
}

impl ProviderIdentity {
    /// All identities, in declaration order
    pub const ALL: [ProviderIdentity; 6] = [
        Self::Google,
        Self::OpenAi,
        Self::XAi,
        Self::Dial,
        Self::Custom,
        Self::OpenRouter,
    ];

    /// Lowercase name used in config files and allow-lists
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::OpenAi => "openai",
            Self::XAi => "xai",
            Self::Dial => "dial",
            Self::Custom => "custom",
            Self::OpenRouter => "openrouter",
        }
    }

    /// Environment variable holding this provider's API key
    #[must_use]
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Self::Google => "GEMINI_API_KEY",
            Self::OpenAi => "OPENAI_API_KEY",
            Self::XAi => "XAI_API_KEY",
            Self::Dial => "DIAL_API_KEY",
            Self::Custom => "CUSTOM_API_KEY",
            Self::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    /// Environment variable holding this provider's base URL override
    #[must_use]
    pub fn base_url_env(&self) -> &'static str {
        match self {
            Self::Google => "GEMINI_BASE_URL",
            Self::OpenAi => "OPENAI_BASE_URL",
            Self::XAi => "XAI_BASE_URL",
            Self::Dial => "DIAL_BASE_URL",
            Self::Custom => "CUSTOM_API_URL",
            Self::OpenRouter => "OPENROUTER_BASE_URL",
        }
    }

    /// Environment variable holding this provider's allowed-model list
    #[must_use]
    pub fn allowed_models_env(&self) -> &'static str {
        match self {
            Self::Google => "GOOGLE_ALLOWED_MODELS",
            Self::OpenAi => "OPENAI_ALLOWED_MODELS",
            Self::XAi => "XAI_ALLOWED_MODELS",
            Self::Dial => "DIAL_ALLOWED_MODELS",
            Self::Custom => "CUSTOM_ALLOWED_MODELS",
            Self::OpenRouter => "OPENROUTER_ALLOWED_MODELS",
        }
    }

    /// Whether a provider of this family can run without an API key
    ///
    /// Self-hosted endpoints are commonly unauthenticated; they need a URL instead.
    #[must_use]
    pub fn requires_api_key(&self) -> bool {
        !matches!(self, Self::Custom)
    }
}

impl fmt::Display for ProviderIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderIdentity {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| ProviderError::UnknownIdentity(s.to_string()))
    }
}

/// Default tie-break precedence between providers
///
/// Native APIs first, then self-hosted, with the catch-all aggregator last.
pub const DEFAULT_PRIORITY_ORDER: [ProviderIdentity; 6] = [
    ProviderIdentity::Google,
    ProviderIdentity::OpenAi,
    ProviderIdentity::XAi,
    ProviderIdentity::Dial,
    ProviderIdentity::Custom,
    ProviderIdentity::OpenRouter,
];

// ============================================================================
// Tool Category
// ============================================================================

/// Classification of a request used to bias fallback ordering
///
/// Never changes correctness, only the order in which models are tried.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Quick answers, chat turns
    FastResponse,
    /// Deep analysis, multi-step reasoning
    ExtendedReasoning,
    /// Everything else
    #[default]
    Balanced,
}

impl ToolCategory {
    /// All categories
    pub const ALL: [ToolCategory; 3] = [
        Self::FastResponse,
        Self::ExtendedReasoning,
        Self::Balanced,
    ];

    /// Short key used by fallback chain configuration
    #[must_use]
    pub fn config_key(&self) -> &'static str {
        match self {
            Self::FastResponse => "chat",
            Self::ExtendedReasoning => "reasoning",
            Self::Balanced => "balanced",
        }
    }
}

impl fmt::Display for ToolCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FastResponse => write!(f, "fast_response"),
            Self::ExtendedReasoning => write!(f, "extended_reasoning"),
            Self::Balanced => write!(f, "balanced"),
        }
    }
}

// ============================================================================
// Requests and Responses
// ============================================================================

/// Token usage reported by a provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens consumed
    pub input_tokens: u64,
    /// Completion tokens produced
    pub output_tokens: u64,
}

impl Usage {
    /// Create a usage record
    #[must_use]
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Total tokens
    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// A content generation request
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// The prompt to send
    pub prompt: String,
    /// Model to use (provider-specific name)
    pub model_name: String,
    /// System prompt (optional)
    pub system_prompt: Option<String>,
    /// Sampling temperature
    pub temperature: f32,
    /// Maximum tokens in the response
    pub max_output_tokens: Option<u32>,
    /// Provider-specific extras (thinking mode, images, ...)
    pub extra: HashMap<String, serde_json::Value>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            model_name: String::new(),
            system_prompt: None,
            temperature: 0.3,
            max_output_tokens: None,
            extra: HashMap::new(),
        }
    }
}

impl GenerationRequest {
    /// Create a new request with prompt and model
    pub fn new(prompt: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    /// Set system prompt
    #[must_use]
    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature.clamp(0.0, 2.0);
        self
    }

    /// Set max output tokens
    #[must_use]
    pub fn with_max_output_tokens(mut self, max_tokens: u32) -> Self {
        self.max_output_tokens = Some(max_tokens);
        self
    }

    /// Attach a provider-specific extra parameter
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// Same request, different model
    #[must_use]
    pub fn for_model(&self, model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..self.clone()
        }
    }
}

/// Response from a content generation request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// The generated text
    pub content: String,
    /// Token usage, if the provider reported it
    pub usage: Option<Usage>,
    /// Model that produced the response
    pub model_name: String,
    /// Provider-specific metadata (finish reason, ids, ...)
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ModelResponse {
    /// Create a response
    pub fn new(content: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            model_name: model_name.into(),
            ..Default::default()
        }
    }

    /// Attach usage
    #[must_use]
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Static capabilities of a model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// Model name
    pub model_name: String,
    /// Maximum context window (tokens)
    pub context_window: u64,
    /// Maximum output tokens
    pub max_output_tokens: u64,
    /// Whether the model has an extended thinking mode
    pub supports_extended_thinking: bool,
    /// Whether the model accepts images
    pub supports_images: bool,
    /// Relative capability score, 0-100
    pub intelligence_score: u8,
    /// Whether calls to this model are free of charge
    pub is_free: bool,
}

impl ModelCapabilities {
    /// Capabilities with conservative defaults
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            context_window: 32_768,
            max_output_tokens: 8_192,
            supports_extended_thinking: false,
            supports_images: false,
            intelligence_score: 50,
            is_free: false,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised by providers and by provider construction
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ProviderError {
    /// The backend rejected or failed the request
    #[error("Request to {model} failed: {message}")]
    RequestFailed {
        /// Model the request was sent to
        model: String,
        /// Backend error message
        message: String,
    },

    /// The request did not complete in time
    #[error("Request to {0} timed out")]
    Timeout(String),

    /// The backend is throttling us
    #[error("Rate limited by {0}")]
    RateLimited(ProviderIdentity),

    /// The provider does not serve this model
    #[error("Model not supported: {0}")]
    InvalidModel(String),

    /// The call returned nothing usable
    #[error("Empty response from {model}")]
    EmptyResponse {
        /// Model that returned nothing
        model: String,
    },

    /// No registered provider can serve the model
    #[error("No provider available for model {0}")]
    NoProvider(String),

    /// Provider could not be built (bad credentials, misconfiguration)
    #[error("Failed to construct {identity} provider: {message}")]
    Construction {
        /// Identity being constructed
        identity: ProviderIdentity,
        /// What went wrong
        message: String,
    },

    /// Unrecognised provider name
    #[error("Unknown provider: {0}")]
    UnknownIdentity(String),
}

impl ProviderError {
    /// Convenience constructor for request failures
    pub fn request(model: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            model: model.into(),
            message: message.into(),
        }
    }
}

// ============================================================================
// Provider Trait
// ============================================================================

/// Credentials handed to a provider factory
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderCredentials {
    /// API key (may be empty for self-hosted endpoints)
    pub api_key: String,
    /// Base URL override
    pub base_url: Option<String>,
}

impl ProviderCredentials {
    /// Credentials with an API key only
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
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

/// Model provider trait
///
/// Implement this trait to add support for a backend family.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Which backend family this is
    fn identity(&self) -> ProviderIdentity;

    /// Whether this provider serves `model_name` (aliases included)
    fn validate_model_name(&self, model_name: &str) -> bool;

    /// Models this provider serves
    ///
    /// When `respect_restrictions` is true and [`Provider::applies_restrictions`]
    /// returns true, the list is already filtered by the provider itself.
    fn list_models(&self, respect_restrictions: bool) -> Vec<String>;

    /// Whether [`Provider::list_models`] already applies model restrictions
    fn applies_restrictions(&self) -> bool {
        false
    }

    /// Capabilities of a model, if known
    fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities>;

    /// Explicit preference among `allowed_models` for a category
    fn preferred_model(
        &self,
        category: ToolCategory,
        allowed_models: &[String],
    ) -> Option<String> {
        let _ = (category, allowed_models);
        None
    }

    /// Generate content
    async fn generate_content(
        &self,
        request: &GenerationRequest,
    ) -> Result<ModelResponse, ProviderError>;

    /// Count tokens for `text` under `model_name`'s tokenizer
    fn count_tokens(&self, text: &str, model_name: &str) -> Result<u64, ProviderError>;
}

/// Factory building a provider from credentials
pub type ProviderFactory =
    Arc<dyn Fn(ProviderCredentials) -> Result<Arc<dyn Provider>, ProviderError> + Send + Sync>;
