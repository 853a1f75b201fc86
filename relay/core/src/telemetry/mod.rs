//! Telemetry and cost aggregation
//!
//! Running per-model outcome, latency and token statistics, plus cost
//! estimates derived from configured price tables.

pub mod pricing;
pub mod store;

pub use pricing::{round_usd, Pricing};
pub use store::{ModelStats, Telemetry};
