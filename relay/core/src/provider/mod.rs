//! Provider abstraction
//!
//! The capability interface every backend implements, plus the health
//! decorator the registry wraps providers in.

pub mod traits;
pub mod wrapped;

pub use traits::{
    GenerationRequest, ModelCapabilities, ModelResponse, Provider, ProviderCredentials,
    ProviderError, ProviderFactory, ProviderIdentity, ToolCategory, Usage,
    DEFAULT_PRIORITY_ORDER,
};
pub use wrapped::{HealthWrappedProvider, RetryPolicy};
