//! Relay Core - Resilient Multi-Provider Model Dispatch
//!
//! This crate decides which model backend serves a request and keeps
//! serving when backends fail. It owns no HTTP clients of its own: concrete
//! providers plug in through the [`Provider`] trait and a factory.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Dispatcher                           │
//! │   resolve chain ──> try model 1 ──> try model 2 ──> ...      │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │
//! ┌──────────────┴───────────────────────────────────────────────┐
//! │                      ProviderRegistry                        │
//! │  ┌────────────┐  ┌──────────────┐  ┌───────────────────────┐ │
//! │  │ Factories  │  │  Instance    │  │ Fallback resolution   │ │
//! │  │ + allow-   │  │  cache       │  │ (chains, free tier,   │ │
//! │  │   list     │  │ (per id)     │  │  cost, metadata)      │ │
//! │  └────────────┘  └──────┬───────┘  └───────────────────────┘ │
//! └─────────────────────────┼────────────────────────────────────┘
//!                           │
//!               HealthWrappedProvider
//!                  │               │
//!          HealthManager       Telemetry
//!        (circuit breakers)  (latency, tokens, cost)
//! ```
//!
//! # Key Types
//!
//! - [`ProviderRegistry`]: Factories, cached instances and model lookup
//! - [`Dispatcher`]: Ordered fallback execution across a chain
//! - [`HealthManager`]: Per-provider circuit breakers
//! - [`Telemetry`]: Per-model outcome, latency and cost aggregation
//! - [`RelayConfig`]: Resolved configuration (file, environment, overrides)
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relay_core::{load_config, Dispatcher, ProviderIdentity, ProviderRegistry, ToolCategory};
//!
//! let registry = Arc::new(ProviderRegistry::from_config(load_config()?));
//! registry.register(ProviderIdentity::Google, my_gemini_factory());
//!
//! let dispatcher = Dispatcher::new(Arc::clone(&registry));
//! let response = dispatcher
//!     .dispatch_generation(ToolCategory::Balanced, &GenerationRequest::new("Hi", ""), None)
//!     .await?;
//! ```
//!
//! # Module Overview
//!
//! - [`config`]: TOML/environment configuration loading and validation
//! - [`health`]: Circuit breakers and the health manager
//! - [`provider`]: Provider trait, request/response types, health wrapper
//! - [`routing`]: Registry, fallback chains, restrictions, dispatch
//! - [`telemetry`]: Pricing and per-model statistics
//! - [`test_utils`]: Scripted providers for tests

#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod health;
pub mod provider;
pub mod routing;
pub mod telemetry;
pub mod test_utils;

// Provider exports
pub use provider::{
    GenerationRequest, HealthWrappedProvider, ModelCapabilities, ModelResponse, Provider,
    ProviderCredentials, ProviderError, ProviderFactory, ProviderIdentity, RetryPolicy,
    ToolCategory, Usage, DEFAULT_PRIORITY_ORDER,
};

// Health exports
pub use health::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState, HealthManager};

// Routing exports
pub use routing::{
    AllowAll, ChainConfig, DispatchError, Dispatcher, ModelRestrictions, ProviderRegistry,
    RestrictionService, LAST_RESORT_MODEL,
};

// Telemetry exports
pub use telemetry::{ModelStats, Pricing, Telemetry};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, load_config_with_env, ConfigError,
    ConfigOverrides, ConfigSource, RelayConfig,
};
