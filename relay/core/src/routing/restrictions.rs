//! Model Restrictions
//!
//! Policy deciding which models may be used in the current environment.
//! Providers without a configured list are unrestricted.

use std::collections::{HashMap, HashSet};

use crate::config::RelayConfig;
use crate::provider::ProviderIdentity;

/// Decides whether a provider may serve a model
pub trait RestrictionService: Send + Sync {
    /// Whether `model` is permitted for `identity`
    fn is_allowed(&self, identity: ProviderIdentity, model: &str) -> bool;

    /// Keep only permitted models, preserving order
    fn filter(&self, identity: ProviderIdentity, models: Vec<String>) -> Vec<String> {
        models
            .into_iter()
            .filter(|m| self.is_allowed(identity, m))
            .collect()
    }
}

/// Permits everything
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl RestrictionService for AllowAll {
    fn is_allowed(&self, _identity: ProviderIdentity, _model: &str) -> bool {
        true
    }
}

/// Per-provider allow-lists, compared case-insensitively
#[derive(Clone, Debug, Default)]
pub struct ModelRestrictions {
    allowed: HashMap<ProviderIdentity, HashSet<String>>,
}

impl ModelRestrictions {
    /// Empty restrictions (everything allowed)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the `[restrictions]` section and `<NAME>_ALLOWED_MODELS`
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        config
            .restrictions
            .iter()
            .fold(Self::new(), |acc, (identity, models)| {
                acc.with_allowed(*identity, models.iter().map(String::as_str))
            })
    }

    /// Restrict `identity` to `models`
    #[must_use]
    pub fn with_allowed<'a>(
        mut self,
        identity: ProviderIdentity,
        models: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        let set = self.allowed.entry(identity).or_default();
        set.extend(models.into_iter().map(|m| m.trim().to_ascii_lowercase()));
        self
    }

    /// Whether `identity` has an allow-list at all
    #[must_use]
    pub fn is_restricted(&self, identity: ProviderIdentity) -> bool {
        self.allowed.contains_key(&identity)
    }
}

impl RestrictionService for ModelRestrictions {
    fn is_allowed(&self, identity: ProviderIdentity, model: &str) -> bool {
        self.allowed
            .get(&identity)
            .is_none_or(|set| set.contains(&model.to_ascii_lowercase()))
    }
}
