//! Cost Estimation
//!
//! Per-model price tables in dollars per million tokens. Input and output
//! tokens are priced separately; a legacy single-price table stands in for
//! output prices when no output table is configured.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Round a dollar amount to 6 decimal places
#[must_use]
pub fn round_usd(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Price tables, dollars per million tokens
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Pricing {
    /// Input (prompt) prices by model
    pub input: HashMap<String, f64>,
    /// Output (completion) prices by model
    pub output: HashMap<String, f64>,
    /// Legacy single-price table, used for output when `output` is empty
    pub legacy: HashMap<String, f64>,
}

impl Pricing {
    /// Create empty price tables
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the input price for a model
    #[must_use]
    pub fn with_input_price(mut self, model: impl Into<String>, per_million: f64) -> Self {
        self.input.insert(model.into(), per_million);
        self
    }

    /// Set the output price for a model
    #[must_use]
    pub fn with_output_price(mut self, model: impl Into<String>, per_million: f64) -> Self {
        self.output.insert(model.into(), per_million);
        self
    }

    /// Set a legacy single price for a model
    #[must_use]
    pub fn with_legacy_price(mut self, model: impl Into<String>, per_million: f64) -> Self {
        self.legacy.insert(model.into(), per_million);
        self
    }

    /// Whether no prices are configured at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.input.is_empty() && self.output.is_empty() && self.legacy.is_empty()
    }

    /// Input price for a model, if configured
    #[must_use]
    pub fn input_price(&self, model: &str) -> Option<f64> {
        self.input.get(model).copied()
    }

    /// Output price for a model, falling back to the legacy table
    #[must_use]
    pub fn output_price(&self, model: &str) -> Option<f64> {
        if self.output.is_empty() {
            self.legacy.get(model).copied()
        } else {
            self.output.get(model).copied()
        }
    }

    /// Input plus output price, if the model is priced at all
    ///
    /// Used to rank models by cost when cost-aware routing is enabled.
    #[must_use]
    pub fn blended_price(&self, model: &str) -> Option<f64> {
        match (self.input_price(model), self.output_price(model)) {
            (None, None) => None,
            (input, output) => Some(input.unwrap_or(0.0) + output.unwrap_or(0.0)),
        }
    }

    /// Estimated cost of a call in dollars
    ///
    /// Unpriced models cost `0.0`.
    #[must_use]
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_rate = self.input_price(model).unwrap_or(0.0);
        let output_rate = self.output_price(model).unwrap_or(0.0);

        #[allow(clippy::cast_precision_loss)]
        let cost = input_rate * (input_tokens as f64 / 1_000_000.0)
            + output_rate * (output_tokens as f64 / 1_000_000.0);

        round_usd(cost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_cost_separate_tables() {
        let pricing = Pricing::new()
            .with_input_price("m", 0.1)
            .with_output_price("m", 0.2);

        let cost = pricing.estimate_cost("m", 1_000_000, 500_000);
        assert!((cost - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_is_free() {
        let pricing = Pricing::new().with_input_price("m", 0.1);
        assert!(pricing.estimate_cost("unknown", 5_000_000, 5_000_000).abs() < f64::EPSILON);
    }

    #[test]
    fn test_legacy_table_is_output_fallback() {
        let pricing = Pricing::new()
            .with_input_price("m", 1.0)
            .with_legacy_price("m", 4.0);

        assert_eq!(pricing.output_price("m"), Some(4.0));
        let cost = pricing.estimate_cost("m", 1_000_000, 1_000_000);
        assert!((cost - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_explicit_output_table_shadows_legacy() {
        let pricing = Pricing::new()
            .with_output_price("a", 2.0)
            .with_legacy_price("b", 4.0);

        assert_eq!(pricing.output_price("a"), Some(2.0));
        assert_eq!(pricing.output_price("b"), None);
    }

    #[test]
    fn test_rounds_to_six_decimals() {
        let pricing = Pricing::new().with_input_price("m", 0.15);
        // 7 tokens at $0.15/M = 0.00000105
        assert!((pricing.estimate_cost("m", 7, 0) - 0.000_001).abs() < 1e-12);
        assert!((round_usd(0.123_456_789) - 0.123_457).abs() < 1e-12);
    }

    #[test]
    fn test_blended_price() {
        let pricing = Pricing::new()
            .with_input_price("a", 1.0)
            .with_output_price("a", 3.0)
            .with_output_price("b", 0.5);

        assert_eq!(pricing.blended_price("a"), Some(4.0));
        assert_eq!(pricing.blended_price("b"), Some(0.5));
        assert_eq!(pricing.blended_price("c"), None);
    }
}
