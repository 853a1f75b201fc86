//! Provider Test Utilities
//!
//! Mock infrastructure for exercising the registry and dispatcher without
//! talking to a real backend. [`ScriptedProvider`] serves a fixed model list
//! and answers each model according to a script, recording every call.
//!
//! # Usage
//!
//! ```ignore
//! use relay_core::test_utils::{Script, ScriptedProvider};
//!
//! let provider = ScriptedProvider::new(ProviderIdentity::Google, &["gemini-2.5-pro"])
//!     .with_script("gemini-2.5-pro", Script::Fail("quota".into()));
//!
//! // After the test, check which models were called
//! assert_eq!(provider.calls("gemini-2.5-pro"), 1);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::provider::{
    GenerationRequest, ModelCapabilities, ModelResponse, Provider, ProviderCredentials,
    ProviderError, ProviderFactory, ProviderIdentity, ToolCategory, Usage,
};

/// Scripted behaviour for one call
#[derive(Clone, Debug)]
pub enum Script {
    /// Return this response
    Respond(ModelResponse),
    /// Fail with a request error carrying this message
    Fail(String),
    /// Return a response with empty content
    Empty,
}

#[derive(Default)]
struct ScriptState {
    fixed: HashMap<String, Script>,
    sequences: HashMap<String, VecDeque<Script>>,
    calls: HashMap<String, usize>,
    requests: Vec<GenerationRequest>,
}

/// Mock provider with per-model scripted outcomes
///
/// Clones share state, so a test can keep a handle after giving the
/// provider to a registry.
#[derive(Clone)]
pub struct ScriptedProvider {
    identity: ProviderIdentity,
    models: Vec<String>,
    capabilities: HashMap<String, ModelCapabilities>,
    preferred: HashMap<ToolCategory, String>,
    restricted_to: Option<Vec<String>>,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedProvider {
    /// Provider serving `models`; unscripted models answer successfully
    pub fn new(identity: ProviderIdentity, models: &[&str]) -> Self {
        Self {
            identity,
            models: models.iter().map(|m| (*m).to_string()).collect(),
            capabilities: HashMap::new(),
            preferred: HashMap::new(),
            restricted_to: None,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Answer every call to `model` with `script`
    #[must_use]
    pub fn with_script(self, model: &str, script: Script) -> Self {
        self.state.lock().fixed.insert(model.to_string(), script);
        self
    }

    /// Answer successive calls to `model` from `scripts`, then fall back
    /// to the fixed script (or the default answer)
    #[must_use]
    pub fn with_sequence(self, model: &str, scripts: Vec<Script>) -> Self {
        self.state
            .lock()
            .sequences
            .insert(model.to_string(), scripts.into());
        self
    }

    /// Report capabilities for a model
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ModelCapabilities) -> Self {
        self.capabilities
            .insert(capabilities.model_name.clone(), capabilities);
        self
    }

    /// Explicitly prefer `model` for `category`
    #[must_use]
    pub fn with_preferred(mut self, category: ToolCategory, model: &str) -> Self {
        self.preferred.insert(category, model.to_string());
        self
    }

    /// Apply restrictions inside [`Provider::list_models`], keeping only `allowed`
    #[must_use]
    pub fn with_own_restrictions(mut self, allowed: &[&str]) -> Self {
        self.restricted_to = Some(allowed.iter().map(|m| (*m).to_string()).collect());
        self
    }

    /// Number of generation calls made for `model`
    pub fn calls(&self, model: &str) -> usize {
        self.state.lock().calls.get(model).copied().unwrap_or(0)
    }

    /// Total generation calls across all models
    pub fn total_calls(&self) -> usize {
        self.state.lock().calls.values().sum()
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.state.lock().requests.clone()
    }

    /// Factory that hands out clones of this provider and counts constructions
    pub fn factory(&self) -> (ProviderFactory, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let template = self.clone();
        let factory: ProviderFactory = Arc::new(move |_creds: ProviderCredentials| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(template.clone()) as Arc<dyn Provider>)
        });
        (factory, built)
    }

    fn next_script(&self, model: &str) -> Option<Script> {
        let mut state = self.state.lock();
        *state.calls.entry(model.to_string()).or_insert(0) += 1;
        if let Some(script) = state.sequences.get_mut(model).and_then(VecDeque::pop_front) {
            return Some(script);
        }
        state.fixed.get(model).cloned()
    }
}

/// Factory that always fails construction
pub fn failing_factory(identity: ProviderIdentity) -> ProviderFactory {
    Arc::new(move |_creds: ProviderCredentials| {
        Err(ProviderError::Construction {
            identity,
            message: "scripted construction failure".to_string(),
        })
    })
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn identity(&self) -> ProviderIdentity {
        self.identity
    }

    fn validate_model_name(&self, model_name: &str) -> bool {
        self.models.iter().any(|m| m == model_name)
    }

    fn list_models(&self, respect_restrictions: bool) -> Vec<String> {
        match (&self.restricted_to, respect_restrictions) {
            (Some(allowed), true) => self
                .models
                .iter()
                .filter(|m| allowed.contains(m))
                .cloned()
                .collect(),
            _ => self.models.clone(),
        }
    }

    fn applies_restrictions(&self) -> bool {
        self.restricted_to.is_some()
    }

    fn capabilities(&self, model_name: &str) -> Option<ModelCapabilities> {
        self.capabilities.get(model_name).cloned()
    }

    fn preferred_model(
        &self,
        category: ToolCategory,
        allowed_models: &[String],
    ) -> Option<String> {
        self.preferred
            .get(&category)
            .filter(|m| allowed_models.contains(m))
            .cloned()
    }

    async fn generate_content(
        &self,
        request: &GenerationRequest,
    ) -> Result<ModelResponse, ProviderError> {
        let model = request.model_name.as_str();
        self.state.lock().requests.push(request.clone());

        match self.next_script(model) {
            Some(Script::Respond(response)) => Ok(response),
            Some(Script::Fail(message)) => Err(ProviderError::request(model, message)),
            Some(Script::Empty) => Ok(ModelResponse::new("", model)),
            None => Ok(ModelResponse::new(format!("response from {model}"), model)
                .with_usage(Usage::new(10, 5))),
        }
    }

    fn count_tokens(&self, text: &str, _model_name: &str) -> Result<u64, ProviderError> {
        Ok(text.split_whitespace().count() as u64)
    }
}

impl std::fmt::Debug for ScriptedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProvider")
            .field("identity", &self.identity)
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}
