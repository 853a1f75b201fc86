//! Dispatch Engine
//!
//! Tries each model of the resolved fallback chain strictly in order until
//! one produces a non-empty response. Every attempt is timed and recorded;
//! failures are swallowed per attempt and only the last one is surfaced if
//! the whole chain is exhausted.
//!
//! # Flow
//!
//! ```text
//! resolve_fallback_chain(category, hints)
//!         |
//!         v
//! for model in chain:
//!     invoke(model) --Ok(Some(non-empty))--> record success, return
//!         |
//!         +--Err / Ok(None) / empty--> record failure, next model
//!         v
//! DispatchError::Exhausted { last_error } | NoModelsAvailable
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use super::registry::ProviderRegistry;
use crate::provider::{GenerationRequest, ModelResponse, ProviderError, ToolCategory};

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by a dispatch
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every model in the chain failed
    #[error("All {attempts} candidate models failed; last error: {last_error}")]
    Exhausted {
        /// Models attempted
        attempts: usize,
        /// Failure of the final attempt
        #[source]
        last_error: ProviderError,
    },

    /// The chain was empty
    #[error("No models available for this request")]
    NoModelsAvailable,
}

impl DispatchError {
    /// The last provider error, if any attempt was made
    #[must_use]
    pub fn last_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Exhausted { last_error, .. } => Some(last_error),
            Self::NoModelsAvailable => None,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Runs requests across the fallback chain
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<ProviderRegistry>,
}

impl Dispatcher {
    /// Create a dispatcher over a shared registry
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher resolves against
    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Try `invoke` on each model of the chain for `category`
    ///
    /// `invoke` receives the model name and yields `Ok(Some(response))` on
    /// success. `Ok(None)` and responses with empty content count as
    /// failures.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Exhausted`] with the last failure when every model
    /// failed, [`DispatchError::NoModelsAvailable`] when the chain was empty.
    pub async fn dispatch<F, Fut>(
        &self,
        category: ToolCategory,
        invoke: F,
        hints: Option<&str>,
    ) -> Result<ModelResponse, DispatchError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Option<ModelResponse>, ProviderError>>,
    {
        let span = tracing::info_span!(
            "dispatch",
            request_id = %Uuid::new_v4(),
            category = %category
        );
        async {
            let chain = self.registry.resolve_fallback_chain(category, hints);
            self.run_chain(chain, true, invoke).await
        }
        .instrument(span)
        .await
    }

    /// Generate content through the registry for each model of the chain
    ///
    /// A model no available provider serves counts as a failed attempt.
    /// When providers are health-wrapped the wrapper records per-attempt
    /// telemetry and this method records none.
    ///
    /// # Errors
    ///
    /// Same as [`Dispatcher::dispatch`].
    pub async fn dispatch_generation(
        &self,
        category: ToolCategory,
        request: &GenerationRequest,
        hints: Option<&str>,
    ) -> Result<ModelResponse, DispatchError> {
        let span = tracing::info_span!(
            "dispatch_generation",
            request_id = %Uuid::new_v4(),
            category = %category
        );
        async {
            let chain = self.registry.resolve_fallback_chain(category, hints);
            let record = !self.registry.config().health.enabled;
            let registry = Arc::clone(&self.registry);

            let invoke = |model: String| {
                let registry = Arc::clone(&registry);
                let request = request.for_model(model.as_str());
                async move {
                    let provider = registry
                        .get_provider_for_model(&model)
                        .ok_or_else(|| ProviderError::NoProvider(model.clone()))?;
                    provider.generate_content(&request).await.map(Some)
                }
            };

            self.run_chain(chain, record, invoke).await
        }
        .instrument(span)
        .await
    }

    async fn run_chain<F, Fut>(
        &self,
        chain: Vec<String>,
        record: bool,
        mut invoke: F,
    ) -> Result<ModelResponse, DispatchError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<Option<ModelResponse>, ProviderError>>,
    {
        let telemetry = self.registry.telemetry();
        let mut attempts = 0;
        let mut last_error = None;

        tracing::debug!(chain = ?chain, "Resolved fallback chain");

        for model in chain {
            attempts += 1;
            let started = Instant::now();
            let outcome = invoke(model.clone()).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            match outcome {
                Ok(Some(response)) if !response.content.is_empty() => {
                    if record {
                        telemetry.record_outcome(
                            &model,
                            true,
                            Some(latency_ms),
                            response.usage.as_ref(),
                        );
                    }
                    tracing::info!(model = %model, attempts, latency_ms, "Dispatch succeeded");
                    return Ok(response);
                }
                Ok(_) => {
                    tracing::warn!(model = %model, "Model returned an empty response");
                    if record {
                        telemetry.record_outcome(&model, false, Some(latency_ms), None);
                    }
                    last_error = Some(ProviderError::EmptyResponse { model });
                }
                Err(e) => {
                    tracing::warn!(
                        model = %model,
                        error = %e,
                        "Model attempt failed, falling back"
                    );
                    if record {
                        telemetry.record_outcome(&model, false, Some(latency_ms), None);
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(last_error) => {
                tracing::warn!(attempts, error = %last_error, "All fallback models failed");
                Err(DispatchError::Exhausted {
                    attempts,
                    last_error,
                })
            }
            None => Err(DispatchError::NoModelsAvailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderSettings, RelayConfig};
    use crate::provider::{ProviderIdentity, Usage};
    use crate::test_utils::{Script, ScriptedProvider};
    use std::collections::HashMap;

    fn dispatcher_with_chain(chain: &[&str]) -> Dispatcher {
        let config = RelayConfig::default()
            .with_fallback_chain("chat", chain.iter().map(|m| (*m).to_string()).collect());
        Dispatcher::new(Arc::new(ProviderRegistry::from_config(config)))
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let dispatcher = dispatcher_with_chain(&["a", "b"]);

        let response = dispatcher
            .dispatch(
                ToolCategory::FastResponse,
                |model| async move { Ok(Some(ModelResponse::new("hi", model))) },
                None,
            )
            .await
            .unwrap();

        assert_eq!(response.model_name, "a");
        assert!(dispatcher.registry().telemetry().model_stats("b").is_none());
    }

    #[tokio::test]
    async fn test_failure_falls_through_and_records() {
        let dispatcher = dispatcher_with_chain(&["a", "b"]);

        let response = dispatcher
            .dispatch(
                ToolCategory::FastResponse,
                |model| async move {
                    if model == "a" {
                        Err(ProviderError::request(model, "boom"))
                    } else {
                        Ok(Some(
                            ModelResponse::new("ok", model).with_usage(Usage::new(3, 4)),
                        ))
                    }
                },
                None,
            )
            .await
            .unwrap();

        assert_eq!(response.content, "ok");
        let snapshot = dispatcher.registry().telemetry().snapshot();
        assert_eq!((snapshot["a"].successes, snapshot["a"].failures), (0, 1));
        assert_eq!((snapshot["b"].successes, snapshot["b"].failures), (1, 0));
        assert_eq!(snapshot["b"].output_tokens, 4);
    }

    #[tokio::test]
    async fn test_none_and_empty_are_failures() {
        let dispatcher = dispatcher_with_chain(&["none", "empty"]);

        let err = dispatcher
            .dispatch(
                ToolCategory::FastResponse,
                |model| async move {
                    if model == "none" {
                        Ok(None)
                    } else {
                        Ok(Some(ModelResponse::new("", model)))
                    }
                },
                None,
            )
            .await
            .unwrap_err();

        match err {
            DispatchError::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 2);
                assert_eq!(
                    last_error,
                    ProviderError::EmptyResponse {
                        model: "empty".into()
                    }
                );
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let snapshot = dispatcher.registry().telemetry().snapshot();
        assert_eq!(snapshot["none"].failures, 1);
        assert_eq!(snapshot["empty"].failures, 1);
    }

    #[tokio::test]
    async fn test_empty_chain_is_no_models_available() {
        let dispatcher = dispatcher_with_chain(&[]);

        let err = dispatcher
            .dispatch(
                ToolCategory::FastResponse,
                |model| async move { Ok(Some(ModelResponse::new("x", model))) },
                None,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::NoModelsAvailable));
        assert!(err.last_error().is_none());
    }

    #[tokio::test]
    async fn test_dispatch_generation_counts_missing_provider_as_failure() {
        let config = RelayConfig::default()
            .with_provider(ProviderIdentity::OpenAi, ProviderSettings::new("k"))
            .with_fallback_chain("reasoning", vec!["unknown-model".into(), "o3".into()]);
        let registry = Arc::new(ProviderRegistry::from_config(config));
        let provider = ScriptedProvider::new(ProviderIdentity::OpenAi, &["o3"])
            .with_script("o3", Script::Respond(ModelResponse::new("deep", "o3")));
        registry.register(ProviderIdentity::OpenAi, provider.factory().0);

        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        let response = dispatcher
            .dispatch_generation(
                ToolCategory::ExtendedReasoning,
                &GenerationRequest::new("think", "ignored"),
                None,
            )
            .await
            .unwrap();

        assert_eq!(response.content, "deep");
        assert_eq!(provider.requests()[0].model_name, "o3");
        // Wrapped providers record their own telemetry exactly once
        let stats = registry.telemetry().model_stats("o3").unwrap();
        assert_eq!(stats.successes, 1);
        assert!(registry.telemetry().model_stats("unknown-model").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_generation_unwrapped_records_itself() {
        let mut config = RelayConfig::default()
            .with_provider(ProviderIdentity::Google, ProviderSettings::new("k"));
        config.health.enabled = false;
        let mut chains = HashMap::new();
        chains.insert("balanced".to_string(), vec!["gemini-2.5-flash".to_string()]);
        let registry = Arc::new(
            ProviderRegistry::from_config(config).with_chain_config(Arc::new(chains)),
        );
        let provider = ScriptedProvider::new(ProviderIdentity::Google, &["gemini-2.5-flash"]);
        registry.register(ProviderIdentity::Google, provider.factory().0);

        Dispatcher::new(Arc::clone(&registry))
            .dispatch_generation(
                ToolCategory::Balanced,
                &GenerationRequest::new("hello", ""),
                None,
            )
            .await
            .unwrap();

        let stats = registry.telemetry().model_stats("gemini-2.5-flash").unwrap();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.input_tokens, 10);
    }
}
