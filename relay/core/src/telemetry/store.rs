//! Telemetry Store
//!
//! Per-model running statistics shared by every concurrent dispatch:
//! - Success/failure counts
//! - Ordered latency samples
//! - Cumulative input/output token usage
//!
//! The whole table sits behind one mutex. Every mutation and every snapshot
//! takes that lock, so a snapshot never observes a half-applied outcome.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::pricing::{round_usd, Pricing};
use crate::provider::Usage;

// ============================================================================
// Telemetry Bucket
// ============================================================================

/// Raw accumulated statistics for one model
#[derive(Clone, Debug, Default)]
struct TelemetryBucket {
    successes: u64,
    failures: u64,
    latencies_ms: Vec<f64>,
    input_tokens: u64,
    output_tokens: u64,
    last_updated: Option<DateTime<Utc>>,
}

// ============================================================================
// Model Stats
// ============================================================================

/// Snapshot of one model's statistics, with derived values
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelStats {
    /// Successful calls
    pub successes: u64,
    /// Failed calls
    pub failures: u64,
    /// Latency samples in milliseconds, oldest first
    pub latencies_ms: Vec<f64>,
    /// Cumulative input tokens
    pub input_tokens: u64,
    /// Cumulative output tokens
    pub output_tokens: u64,
    /// Estimated spend so far
    pub estimated_cost_usd: f64,
    /// Mean latency, if any samples exist
    pub avg_latency_ms: Option<f64>,
    /// Median latency
    pub p50_latency_ms: Option<f64>,
    /// 95th percentile latency
    pub p95_latency_ms: Option<f64>,
    /// When this model last recorded an outcome
    pub last_updated: Option<DateTime<Utc>>,
}

impl ModelStats {
    /// Total calls recorded
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.successes + self.failures
    }

    /// Fraction of calls that succeeded (1.0 with no data)
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let total = self.total_calls();
        if total == 0 {
            1.0
        } else {
            self.successes as f64 / total as f64
        }
    }
}

/// Nearest-rank percentile over an ascending slice
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    let idx = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[idx])
}

// ============================================================================
// Telemetry
// ============================================================================

/// Concurrently-safe telemetry table keyed by model name
pub struct Telemetry {
    buckets: Mutex<HashMap<String, TelemetryBucket>>,
    pricing: Pricing,
}

impl Telemetry {
    /// Create a telemetry store with the given price tables
    #[must_use]
    pub fn new(pricing: Pricing) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            pricing,
        }
    }

    /// Price tables used for cost estimates
    #[must_use]
    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Record one call outcome
    ///
    /// `latency_ms` is `None` when the attempt failed before a meaningful
    /// latency could be measured; no sample is appended in that case.
    pub fn record_outcome(
        &self,
        model: &str,
        success: bool,
        latency_ms: Option<f64>,
        usage: Option<&Usage>,
    ) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(model.to_string()).or_default();

        if success {
            bucket.successes += 1;
        } else {
            bucket.failures += 1;
        }
        if let Some(latency) = latency_ms {
            bucket.latencies_ms.push(latency);
        }
        if let Some(usage) = usage {
            bucket.input_tokens += usage.input_tokens;
            bucket.output_tokens += usage.output_tokens;
        }
        bucket.last_updated = Some(Utc::now());
    }

    /// Copy of every model's statistics with derived cost and latency figures
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ModelStats> {
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .map(|(model, bucket)| (model.clone(), self.stats_for(model, bucket)))
            .collect()
    }

    /// Statistics for one model
    #[must_use]
    pub fn model_stats(&self, model: &str) -> Option<ModelStats> {
        let buckets = self.buckets.lock();
        buckets.get(model).map(|b| self.stats_for(model, b))
    }

    /// Estimated total spend across all models
    #[must_use]
    pub fn total_cost_usd(&self) -> f64 {
        round_usd(self.snapshot().values().map(|s| s.estimated_cost_usd).sum())
    }

    /// Estimated cost of a hypothetical call
    #[must_use]
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        self.pricing.estimate_cost(model, input_tokens, output_tokens)
    }

    /// Number of models with recorded outcomes
    #[must_use]
    pub fn model_count(&self) -> usize {
        self.buckets.lock().len()
    }

    /// Drop all recorded data (test support)
    pub fn reset(&self) {
        self.buckets.lock().clear();
    }

    #[allow(clippy::cast_precision_loss)]
    fn stats_for(&self, model: &str, bucket: &TelemetryBucket) -> ModelStats {
        let mut sorted = bucket.latencies_ms.clone();
        sorted.sort_by(f64::total_cmp);

        let avg_latency_ms = if sorted.is_empty() {
            None
        } else {
            Some(sorted.iter().sum::<f64>() / sorted.len() as f64)
        };

        ModelStats {
            successes: bucket.successes,
            failures: bucket.failures,
            latencies_ms: bucket.latencies_ms.clone(),
            input_tokens: bucket.input_tokens,
            output_tokens: bucket.output_tokens,
            estimated_cost_usd: self.pricing.estimate_cost(
                model,
                bucket.input_tokens,
                bucket.output_tokens,
            ),
            avg_latency_ms,
            p50_latency_ms: percentile(&sorted, 0.5),
            p95_latency_ms: percentile(&sorted, 0.95),
            last_updated: bucket.last_updated,
        }
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Pricing::default())
    }
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("models", &self.model_count())
            .field("pricing", &self.pricing)
            .finish()
    }
}
