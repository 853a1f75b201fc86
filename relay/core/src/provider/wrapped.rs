//! Health-Wrapped Provider
//!
//! Decorates any [`Provider`] with retry/backoff, circuit-breaker reporting
//! and per-attempt telemetry. Everything except content generation and token
//! counting is delegated unchanged. A response with empty content is a
//! failed attempt, retried and reported like an error.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::traits::{
    GenerationRequest, ModelCapabilities, ModelResponse, Provider, ProviderError,
    ProviderIdentity, ToolCategory,
};
use crate::health::{HealthManager, HealthOutcome};
use crate::telemetry::Telemetry;

// ============================================================================
// Retry Policy
// ============================================================================

/// Retry schedule for a single model
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first (values below 1 mean 1)
    pub attempts: u32,

    /// Delay before the first retry
    pub backoff_base: Duration,

    /// Upper bound on any single delay
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Effective number of attempts
    #[must_use]
    pub fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay before retry `retry` (0-indexed): base doubled per retry, capped
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

// ============================================================================
// Health-Wrapped Provider
// ============================================================================

/// Provider decorator adding retries, health reporting and telemetry
pub struct HealthWrappedProvider {
    inner: Arc<dyn Provider>,
    health: Arc<HealthManager>,
    telemetry: Arc<Telemetry>,
    retry: RetryPolicy,
    log_only: bool,
}

impl HealthWrappedProvider {
    /// Wrap `inner`
    ///
    /// In `log_only` mode successes are not reported to the health manager;
    /// failures still are, so circuit state remains observable.
    pub fn new(
        inner: Arc<dyn Provider>,
        health: Arc<HealthManager>,
        telemetry: Arc<Telemetry>,
        retry: RetryPolicy,
        log_only: bool,
    ) -> Self {
        Self {
            inner,
            health,
            telemetry,
            retry,
            log_only,
        }
    }

    /// The wrapped provider
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn Provider> {
        &self.inner
    }

    /// Retry schedule in effect
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    fn report_success(&self) {
        if !self.log_only {
            self.health
                .report(self.inner.identity(), HealthOutcome::Success);
        }
    }

    fn report_failure(&self) {
        self.health
            .report(self.inner.identity(), HealthOutcome::Failure);
    }
}

#[async_trait]
impl Provider for HealthWrappedProvider {
    fn identity(&self) -> ProviderIdentity {
        self.inner.identity()
    }

    fn validate_model_name(&self, model_name: &str) -> bool {
        self.inner.validate_model_name(model_name)
    }

    fn list_models(&self, respect_restrictions: bool) -> Vec<String> {
        self.inner.list_models(respect_restrictions)
    }

    fn applies_restrictions(&self) -> bool {
        self.inner.applies_restrictions()
    }

    fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities> {
        self.inner.capabilities(model_name)
    }

    fn preferred_model(
        &self,
        category: ToolCategory,
        allowed_models: &[String],
    ) -> Option<String> {
        self.inner.preferred_model(category, allowed_models)
    }

    async fn generate_content(
        &self,
        request: &GenerationRequest,
    ) -> Result<ModelResponse, ProviderError> {
        let attempts = self.retry.effective_attempts();
        let model = request.model_name.as_str();
        let mut last_error = None;

        for attempt in 0..attempts {
            let started = Instant::now();
            let outcome = match self.inner.generate_content(request).await {
                Ok(response) if response.content.is_empty() => Err(ProviderError::EmptyResponse {
                    model: model.to_string(),
                }),
                other => other,
            };
            match outcome {
                Ok(response) => {
                    self.report_success();
                    self.telemetry.record_outcome(
                        model,
                        true,
                        Some(elapsed_ms(started)),
                        response.usage.as_ref(),
                    );
                    return Ok(response);
                }
                Err(e) => {
                    tracing::warn!(
                        provider = %self.inner.identity(),
                        model = %model,
                        attempt = attempt + 1,
                        attempts,
                        error = %e,
                        "Generation attempt failed"
                    );
                    self.report_failure();
                    self.telemetry.record_outcome(model, false, None, None);
                    last_error = Some(e);

                    if attempt + 1 < attempts {
                        tokio::time::sleep(self.retry.delay_for_retry(attempt)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProviderError::EmptyResponse {
            model: model.to_string(),
        }))
    }

    fn count_tokens(&self, text: &str, model_name: &str) -> Result<u64, ProviderError> {
        let result = self.inner.count_tokens(text, model_name);
        match &result {
            Ok(_) => self.report_success(),
            Err(_) => self.report_failure(),
        }
        result
    }
}

impl std::fmt::Debug for HealthWrappedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthWrappedProvider")
            .field("identity", &self.inner.identity())
            .field("retry", &self.retry)
            .field("log_only", &self.log_only)
            .finish_non_exhaustive()
    }
}
