//! Provider health
//!
//! Circuit breakers per provider identity and the manager that owns them.

pub mod circuit;
pub mod manager;

pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use manager::{HealthManager, HealthOutcome, DEFAULT_RECORDER_CAPACITY};
