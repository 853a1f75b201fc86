//! Provider Registry
//!
//! Maps provider identities to factories, lazily builds and caches one
//! instance per identity, and answers "which provider serves this model".
//!
//! # Architecture
//!
//! ```text
//! register(identity, factory)
//!         |
//!         v
//! get_provider(identity) --allow-list--> credentials --> factory
//!         |                                                 |
//!         |                                   HealthWrappedProvider (optional)
//!         v                                                 |
//! instance cache (single-flight per identity) <-------------+
//! ```
//!
//! The registry is an explicit value shared as `Arc<ProviderRegistry>`; there
//! is no global instance. Construction failures are logged and reported as
//! an absent provider, never as an error.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::fallback::{self, ChainConfig};
use super::restrictions::{ModelRestrictions, RestrictionService};
use crate::config::RelayConfig;
use crate::health::HealthManager;
use crate::provider::{
    HealthWrappedProvider, Provider, ProviderFactory, ProviderIdentity, ToolCategory,
    DEFAULT_PRIORITY_ORDER,
};
use crate::telemetry::Telemetry;

type InstanceSlot = Arc<Mutex<Option<Arc<dyn Provider>>>>;

/// Registry of provider factories and cached instances
pub struct ProviderRegistry {
    config: Arc<RelayConfig>,
    health: Arc<HealthManager>,
    telemetry: Arc<Telemetry>,
    restrictions: Arc<dyn RestrictionService>,
    chain_config: Arc<dyn ChainConfig>,
    priority_order: Vec<ProviderIdentity>,
    registrations: RwLock<HashMap<ProviderIdentity, ProviderFactory>>,
    instances: DashMap<ProviderIdentity, InstanceSlot>,
}

impl ProviderRegistry {
    /// Create a registry
    ///
    /// Restrictions and explicit chains default to the ones in `config`.
    #[must_use]
    pub fn new(
        config: Arc<RelayConfig>,
        health: Arc<HealthManager>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        let restrictions = Arc::new(ModelRestrictions::from_config(&config));
        let chain_config = Arc::new(config.fallback_chains.clone());
        Self {
            config,
            health,
            telemetry,
            restrictions,
            chain_config,
            priority_order: DEFAULT_PRIORITY_ORDER.to_vec(),
            registrations: RwLock::new(HashMap::new()),
            instances: DashMap::new(),
        }
    }

    /// Create a registry with health and telemetry built from `config`
    ///
    /// Health reports are applied inline until
    /// [`ProviderRegistry::with_health_recorder`] starts a background worker.
    #[must_use]
    pub fn from_config(config: RelayConfig) -> Self {
        let health = Arc::new(HealthManager::new(config.health.circuit_config()));
        let telemetry = Arc::new(Telemetry::new(config.pricing.clone()));
        Self::new(Arc::new(config), health, telemetry)
    }

    /// Hand health reports to a background recorder with a queue of `capacity`
    ///
    /// Request paths then never wait on breaker bookkeeping; reports that do
    /// not fit the queue are dropped and counted. Outside a tokio runtime
    /// reports stay inline.
    #[must_use]
    pub fn with_health_recorder(self, capacity: usize) -> Self {
        if self.health.spawn_recorder(capacity).is_some() {
            tracing::debug!(capacity, "Health recorder started");
        }
        self
    }

    /// Use a different restriction policy
    #[must_use]
    pub fn with_restrictions(mut self, restrictions: Arc<dyn RestrictionService>) -> Self {
        self.restrictions = restrictions;
        self
    }

    /// Use a different source of explicit chains
    #[must_use]
    pub fn with_chain_config(mut self, chain_config: Arc<dyn ChainConfig>) -> Self {
        self.chain_config = chain_config;
        self
    }

    /// Use a different provider precedence
    #[must_use]
    pub fn with_priority_order(mut self, order: Vec<ProviderIdentity>) -> Self {
        self.priority_order = order;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Configuration in effect
    #[must_use]
    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Shared health manager
    #[must_use]
    pub fn health(&self) -> &Arc<HealthManager> {
        &self.health
    }

    /// Shared telemetry store
    #[must_use]
    pub fn telemetry(&self) -> &Arc<Telemetry> {
        &self.telemetry
    }

    /// Explicit chain source
    #[must_use]
    pub fn chain_config(&self) -> &dyn ChainConfig {
        self.chain_config.as_ref()
    }

    /// Provider precedence
    #[must_use]
    pub fn priority_order(&self) -> &[ProviderIdentity] {
        &self.priority_order
    }

    /// Registered identities, in priority order
    pub fn registered_identities(&self) -> Vec<ProviderIdentity> {
        let registrations = self.registrations.read();
        self.priority_order
            .iter()
            .copied()
            .filter(|id| registrations.contains_key(id))
            .collect()
    }

    /// Whether a factory is registered for `identity`
    pub fn is_registered(&self, identity: ProviderIdentity) -> bool {
        self.registrations.read().contains_key(&identity)
    }

    fn is_current(&self, identity: ProviderIdentity, factory: &ProviderFactory) -> bool {
        self.registrations
            .read()
            .get(&identity)
            .is_some_and(|current| Arc::ptr_eq(current, factory))
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register (or replace) the factory for `identity`
    ///
    /// Any cached instance for the identity is evicted.
    pub fn register(&self, identity: ProviderIdentity, factory: ProviderFactory) {
        let replaced = self
            .registrations
            .write()
            .insert(identity, factory)
            .is_some();
        self.instances.remove(&identity);
        tracing::info!(provider = %identity, replaced, "Registered provider");
    }

    /// Remove the registration and cached instance for `identity`
    ///
    /// Idempotent.
    pub fn unregister(&self, identity: ProviderIdentity) {
        let removed = self.registrations.write().remove(&identity).is_some();
        self.instances.remove(&identity);
        if removed {
            tracing::info!(provider = %identity, "Unregistered provider");
        }
    }

    /// Drop every cached instance
    pub fn clear_instance_cache(&self) {
        self.instances.clear();
    }

    /// Drop registrations, cached instances, health state and telemetry
    pub fn reset_all(&self) {
        self.registrations.write().clear();
        self.instances.clear();
        self.health.reset();
        self.telemetry.reset();
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    /// Get (building if needed) the provider for `identity`
    ///
    /// Absent when the identity is not allowed, not registered, lacks
    /// credentials or fails to construct. Concurrent first calls for one
    /// identity build it once.
    pub fn get_provider(
        &self,
        identity: ProviderIdentity,
        force_new: bool,
    ) -> Option<Arc<dyn Provider>> {
        if !self.config.is_provider_allowed(identity) {
            tracing::debug!(provider = %identity, "Provider not in allow-list");
            return None;
        }

        loop {
            let factory = self.registrations.read().get(&identity).cloned()?;

            let slot: InstanceSlot = self.instances.entry(identity).or_default().clone();
            let mut cached = slot.lock();

            // Re-registered or unregistered while waiting for the slot
            if !self.is_current(identity, &factory) {
                continue;
            }

            if !force_new {
                if let Some(provider) = cached.as_ref() {
                    return Some(Arc::clone(provider));
                }
            }

            let Some(credentials) = self.config.credentials_for(identity) else {
                tracing::debug!(provider = %identity, "No credentials configured");
                return None;
            };

            let provider = match (*factory)(credentials) {
                Ok(provider) => provider,
                Err(e) => {
                    tracing::warn!(
                        provider = %identity,
                        error = %e,
                        "Failed to construct provider"
                    );
                    return None;
                }
            };

            if !self.is_current(identity, &factory) {
                tracing::debug!(provider = %identity, "Registration changed during construction");
                continue;
            }

            let provider: Arc<dyn Provider> = if self.config.health.enabled {
                Arc::new(HealthWrappedProvider::new(
                    provider,
                    Arc::clone(&self.health),
                    Arc::clone(&self.telemetry),
                    self.config.retry.clone(),
                    self.config.health.log_only,
                ))
            } else {
                provider
            };

            tracing::debug!(provider = %identity, force_new, "Constructed provider");
            *cached = Some(Arc::clone(&provider));
            return Some(provider);
        }
    }

    /// First provider in priority order that serves `model`
    ///
    /// Identities with an open circuit are skipped when circuit breaking
    /// gates selection.
    pub fn get_provider_for_model(&self, model: &str) -> Option<Arc<dyn Provider>> {
        let gate = self.config.health.gates_selection();

        for identity in self.registered_identities() {
            if gate && !self.health.is_available(identity) {
                tracing::debug!(
                    provider = %identity,
                    model = %model,
                    "Skipping provider with open circuit"
                );
                continue;
            }
            if let Some(provider) = self.get_provider(identity, false) {
                if provider.validate_model_name(model) {
                    return Some(provider);
                }
            }
        }

        None
    }

    /// Models a provider lists, filtered by restrictions unless it filters itself
    pub(crate) fn filtered_models(
        &self,
        provider: &dyn Provider,
        respect_restrictions: bool,
    ) -> Vec<String> {
        let models = provider.list_models(respect_restrictions);
        if respect_restrictions && !provider.applies_restrictions() {
            self.restrictions.filter(provider.identity(), models)
        } else {
            models
        }
    }

    /// Every model served by an available provider, mapped to the first
    /// identity (in priority order) that lists it
    pub fn get_available_models(
        &self,
        respect_restrictions: bool,
    ) -> HashMap<String, ProviderIdentity> {
        let mut models = HashMap::new();
        for identity in self.registered_identities() {
            let Some(provider) = self.get_provider(identity, false) else {
                continue;
            };
            for model in self.filtered_models(provider.as_ref(), respect_restrictions) {
                models.entry(model).or_insert(identity);
            }
        }
        models
    }

    /// Restriction-filtered models for one provider
    pub fn allowed_models(&self, identity: ProviderIdentity) -> Vec<String> {
        self.get_provider(identity, false)
            .map(|p| self.filtered_models(p.as_ref(), true))
            .unwrap_or_default()
    }

    // ========================================================================
    // Fallback
    // ========================================================================

    /// Best default model for a category
    pub fn get_preferred_fallback_model(&self, category: ToolCategory) -> String {
        fallback::preferred_fallback_model(self, category)
    }

    /// Ordered, duplicate-free models to try for a request
    pub fn resolve_fallback_chain(
        &self,
        category: ToolCategory,
        hints: Option<&str>,
    ) -> Vec<String> {
        fallback::resolve_fallback_chain(self, category, hints)
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("registered", &self.registered_identities())
            .field("cached", &self.instances.len())
            .field("priority_order", &self.priority_order)
            .finish_non_exhaustive()
    }
}
