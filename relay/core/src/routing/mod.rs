//! Model Routing
//!
//! Provider registry, fallback chain resolution, restriction policy and the
//! dispatch engine that ties them together.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher::dispatch(category, invoke, hints)
//!         |
//!         v
//! ProviderRegistry::resolve_fallback_chain  <-- ChainConfig, RestrictionService
//!         |
//!         v
//! for each model: get_provider_for_model -> HealthWrappedProvider
//!         |
//!         v
//! HealthManager + Telemetry updated per attempt
//! ```

pub mod dispatch;
pub mod fallback;
pub mod registry;
pub mod restrictions;

pub use dispatch::{DispatchError, Dispatcher};
pub use fallback::{ChainConfig, LAST_RESORT_MODEL};
pub use registry::ProviderRegistry;
pub use restrictions::{AllowAll, ModelRestrictions, RestrictionService};
