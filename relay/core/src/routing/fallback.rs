//! Fallback Chain Resolution
//!
//! Computes, per request, the ordered list of model names the dispatcher
//! tries. Chains are never cached; every call reflects the current
//! registrations, credentials and policies.
//!
//! # Precedence
//!
//! ```text
//! explicit chain for category key ("chat", "reasoning", "balanced")
//!         | (absent)
//!         v
//! heuristic: preferred fallback model, then every allowed model of
//!            every available provider in priority order
//!         |
//!         v
//! hint reordering (vision / reasoning keywords), applied to both
//! ```
//!
//! # Preferred Fallback Model
//!
//! Layers, first match wins:
//! - Free tier: configured free models that some provider currently offers
//! - Per provider in priority order: allowed models, reordered by cost,
//!   capability metadata and context window when enabled, then the
//!   provider's own preference or the static family table
//! - The first model seen during the scan, else [`LAST_RESORT_MODEL`]

use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap, HashSet};

use super::registry::ProviderRegistry;
use crate::config::RoutingSettings;
use crate::provider::{ModelCapabilities, Provider, ProviderIdentity, ToolCategory};
use crate::telemetry::Pricing;

/// Model returned when nothing at all is available
pub const LAST_RESORT_MODEL: &str = "gemini-2.5-flash";

// ============================================================================
// Chain Configuration
// ============================================================================

/// Source of explicit per-category chains
pub trait ChainConfig: Send + Sync {
    /// Chain configured for a category key, if any
    fn chain_for(&self, key: &str) -> Option<Vec<String>>;
}

impl ChainConfig for HashMap<String, Vec<String>> {
    fn chain_for(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).cloned()
    }
}

impl ChainConfig for BTreeMap<String, Vec<String>> {
    fn chain_for(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).cloned()
    }
}

// ============================================================================
// Keyword Tables
// ============================================================================

const VISUAL_HINTS: &[&str] = &[
    "image",
    "screenshot",
    "diagram",
    "photo",
    "picture",
    "chart",
    "visual",
    "ui mockup",
];

const VISION_FAMILY: &[&str] = &["vision", "gpt-4o", "gpt-4.1", "gemini", "claude"];

const REASONING_HINTS: &[&str] = &[
    "reason",
    "analy",
    "prove",
    "proof",
    "deep",
    "step by step",
    "complex",
    "architecture",
    "debug",
];

const THINKING_FAMILY: &[&str] = &["thinking", "pro", "o3", "r1", "opus", "grok-4"];

/// Substrings preferred among free models, per category
fn free_tier_preferences(category: ToolCategory) -> &'static [&'static str] {
    match category {
        ToolCategory::FastResponse => &["flash", "mini", "fast", "lite"],
        ToolCategory::ExtendedReasoning => &["thinking", "r1", "pro", "large"],
        ToolCategory::Balanced => &[],
    }
}

/// Static category -> model family table, per provider
///
/// Keywords are listed in preference order.
#[must_use]
pub fn family_keywords(
    identity: ProviderIdentity,
    category: ToolCategory,
) -> &'static [&'static str] {
    use ProviderIdentity as P;
    use ToolCategory as C;

    match (identity, category) {
        (P::Google, C::FastResponse) => &["flash-lite", "flash"],
        (P::Google, C::ExtendedReasoning) => &["pro"],
        (P::Google, C::Balanced) => &["flash"],

        (P::OpenAi, C::FastResponse) => &["mini", "nano"],
        (P::OpenAi, C::ExtendedReasoning) => &["o3", "o4", "gpt-5"],
        (P::OpenAi, C::Balanced) => &["gpt-4.1", "mini"],

        (P::XAi, C::FastResponse) => &["fast", "mini"],
        (P::XAi, C::ExtendedReasoning) => &["grok-4", "grok-3"],
        (P::XAi, C::Balanced) => &["grok-3"],

        (P::Dial, C::FastResponse) => &["flash", "mini", "haiku"],
        (P::Dial, C::ExtendedReasoning) => &["o3", "opus", "pro"],
        (P::Dial, C::Balanced) => &["sonnet", "flash"],

        (P::Custom, C::FastResponse) => &["llama", "qwen", "mistral"],
        (P::Custom, C::ExtendedReasoning) => &["r1", "qwq", "deepseek"],
        (P::Custom, C::Balanced) => &["llama", "qwen"],

        (P::OpenRouter, C::FastResponse) => &["flash", "mini", "haiku"],
        (P::OpenRouter, C::ExtendedReasoning) => &["pro", "opus", "o3", "r1"],
        (P::OpenRouter, C::Balanced) => &["sonnet", "flash"],
    }
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

// ============================================================================
// Ordering Helpers
// ============================================================================

/// Remove duplicates, keeping the first occurrence
#[must_use]
pub fn dedup_preserving_order(models: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    models
        .into_iter()
        .filter(|m| seen.insert(m.clone()))
        .collect()
}

/// Move hint-matched entries to the front
///
/// Visual hints pull the vision family forward, reasoning hints the
/// thinking tier; vision entries lead when both apply. Relative order within
/// each group is preserved and no entries are added.
#[must_use]
pub fn reorder_by_hints(chain: Vec<String>, hints: Option<&str>) -> Vec<String> {
    let Some(hints) = hints.map(str::to_lowercase) else {
        return chain;
    };
    let visual = contains_any(&hints, VISUAL_HINTS);
    let reasoning = contains_any(&hints, REASONING_HINTS);
    if !visual && !reasoning {
        return chain;
    }

    let mut vision_group = Vec::new();
    let mut thinking_group = Vec::new();
    let mut rest = Vec::new();
    for model in chain {
        let lower = model.to_lowercase();
        if visual && contains_any(&lower, VISION_FAMILY) {
            vision_group.push(model);
        } else if reasoning && contains_any(&lower, THINKING_FAMILY) {
            thinking_group.push(model);
        } else {
            rest.push(model);
        }
    }

    vision_group.extend(thinking_group);
    vision_group.extend(rest);
    vision_group
}

/// Drop models above `max_price` and sort by blended price, unpriced last
#[must_use]
pub fn order_by_cost(
    models: Vec<String>,
    pricing: &Pricing,
    max_price: Option<f64>,
) -> Vec<String> {
    let mut priced: Vec<(String, Option<f64>)> = models
        .into_iter()
        .map(|m| {
            let price = pricing.blended_price(&m);
            (m, price)
        })
        .filter(|(_, price)| match (price, max_price) {
            (Some(price), Some(max)) => *price <= max,
            _ => true,
        })
        .collect();

    priced.sort_by(|a, b| match (a.1, b.1) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    });

    priced.into_iter().map(|(m, _)| m).collect()
}

fn capabilities_of(provider: &dyn Provider, model: &str) -> ModelCapabilities {
    provider
        .capabilities(model)
        .unwrap_or_else(|| ModelCapabilities::new(model))
}

/// Stable sort by reported capabilities for a category
#[must_use]
pub fn order_by_metadata(
    models: Vec<String>,
    provider: &dyn Provider,
    category: ToolCategory,
) -> Vec<String> {
    let mut keyed: Vec<(String, ModelCapabilities)> = models
        .into_iter()
        .map(|m| {
            let caps = capabilities_of(provider, &m);
            (m, caps)
        })
        .collect();

    match category {
        ToolCategory::ExtendedReasoning => keyed.sort_by_key(|(_, c)| {
            (Reverse(c.supports_extended_thinking), Reverse(c.intelligence_score))
        }),
        ToolCategory::FastResponse => {
            keyed.sort_by_key(|(_, c)| (c.supports_extended_thinking, c.intelligence_score));
        }
        ToolCategory::Balanced => keyed.sort_by_key(|(_, c)| Reverse(c.intelligence_score)),
    }

    keyed.into_iter().map(|(m, _)| m).collect()
}

/// Stable sort by context window, largest first
#[must_use]
pub fn order_by_context(models: Vec<String>, provider: &dyn Provider) -> Vec<String> {
    let mut keyed: Vec<(String, u64)> = models
        .into_iter()
        .map(|m| {
            let window = capabilities_of(provider, &m).context_window;
            (m, window)
        })
        .collect();
    keyed.sort_by_key(|(_, window)| Reverse(*window));
    keyed.into_iter().map(|(m, _)| m).collect()
}

/// Pick a model from the family table
///
/// Keyword-first scanning honours the table's preference order. When
/// `model_first` is set the list order wins instead, so that cost, metadata
/// or context ordering is respected.
#[must_use]
pub fn pick_by_family(models: &[String], keywords: &[&str], model_first: bool) -> Option<String> {
    if model_first {
        return models
            .iter()
            .find(|m| contains_any(&m.to_lowercase(), keywords))
            .cloned();
    }
    keywords.iter().find_map(|k| {
        models
            .iter()
            .find(|m| m.to_lowercase().contains(k))
            .cloned()
    })
}

fn apply_policies(
    routing: &RoutingSettings,
    pricing: &Pricing,
    provider: &dyn Provider,
    category: ToolCategory,
    mut models: Vec<String>,
) -> Vec<String> {
    if routing.cost_aware {
        models = order_by_cost(models, pricing, routing.max_cost_per_request);
    }
    if routing.metadata_selection {
        models = order_by_metadata(models, provider, category);
    }
    if routing.long_context_bias {
        models = order_by_context(models, provider);
    }
    models
}

// ============================================================================
// Resolution
// ============================================================================

fn free_tier_choice(registry: &ProviderRegistry, category: ToolCategory) -> Option<String> {
    let routing = &registry.config().routing;
    if !routing.prefer_free_tier || routing.free_models.is_empty() {
        return None;
    }

    let available = registry.get_available_models(true);
    let candidates: Vec<&String> = routing
        .free_models
        .iter()
        .filter(|m| available.contains_key(m.as_str()))
        .collect();
    if candidates.is_empty() {
        tracing::debug!(category = %category, "No configured free model is currently available");
        return None;
    }

    free_tier_preferences(category)
        .iter()
        .find_map(|k| candidates.iter().find(|m| m.to_lowercase().contains(k)))
        .or_else(|| candidates.first())
        .map(|m| (*m).clone())
}

/// Best default model for a category
///
/// Never fails: with nothing registered this is [`LAST_RESORT_MODEL`].
pub fn preferred_fallback_model(registry: &ProviderRegistry, category: ToolCategory) -> String {
    if let Some(model) = free_tier_choice(registry, category) {
        tracing::debug!(category = %category, model = %model, "Preferred model from free tier");
        return model;
    }

    let config = registry.config();
    let routing = &config.routing;
    let model_first = routing.cost_aware || routing.metadata_selection || routing.long_context_bias;
    let mut first_seen: Option<String> = None;

    for identity in registry.registered_identities() {
        let Some(provider) = registry.get_provider(identity, false) else {
            continue;
        };
        let allowed = registry.filtered_models(provider.as_ref(), true);
        if allowed.is_empty() {
            continue;
        }
        if first_seen.is_none() {
            first_seen = allowed.first().cloned();
        }

        let ordered =
            apply_policies(routing, &config.pricing, provider.as_ref(), category, allowed);
        if ordered.is_empty() {
            continue;
        }

        if let Some(model) = provider.preferred_model(category, &ordered) {
            return model;
        }
        if let Some(model) =
            pick_by_family(&ordered, family_keywords(identity, category), model_first)
        {
            return model;
        }
    }

    first_seen.unwrap_or_else(|| {
        tracing::debug!(category = %category, "No models available, using last-resort default");
        LAST_RESORT_MODEL.to_string()
    })
}

/// Ordered, duplicate-free list of models to try for a request
pub fn resolve_fallback_chain(
    registry: &ProviderRegistry,
    category: ToolCategory,
    hints: Option<&str>,
) -> Vec<String> {
    let key = category.config_key();
    let chain = if let Some(explicit) = registry.chain_config().chain_for(key) {
        tracing::debug!(key, len = explicit.len(), "Using configured fallback chain");
        dedup_preserving_order(explicit)
    } else {
        let mut chain = vec![preferred_fallback_model(registry, category)];
        for identity in registry.registered_identities() {
            let Some(provider) = registry.get_provider(identity, false) else {
                continue;
            };
            for model in registry.filtered_models(provider.as_ref(), true) {
                if !chain.contains(&model) {
                    chain.push(model);
                }
            }
        }
        chain
    };

    reorder_by_hints(chain, hints)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ScriptedProvider;
    use pretty_assertions::assert_eq;

    fn names(models: &[&str]) -> Vec<String> {
        models.iter().map(|m| (*m).to_string()).collect()
    }

    #[test]
    fn test_dedup_preserves_first_occurrence() {
        let chain = dedup_preserving_order(names(&["a", "b", "a", "c", "b"]));
        assert_eq!(chain, names(&["a", "b", "c"]));
    }

    #[test]
    fn test_chain_config_for_maps() {
        let mut map = HashMap::new();
        map.insert("chat".to_string(), names(&["m1", "m2"]));
        assert_eq!(map.chain_for("chat"), Some(names(&["m1", "m2"])));
        assert_eq!(map.chain_for("reasoning"), None);
    }

    #[test]
    fn test_hints_without_keywords_keep_order() {
        let chain = names(&["gpt-4.1-mini", "gemini-2.5-pro"]);
        assert_eq!(reorder_by_hints(chain.clone(), None), chain);
        assert_eq!(reorder_by_hints(chain.clone(), Some("say hello")), chain);
    }

    #[test]
    fn test_visual_hints_move_vision_family_forward() {
        let chain = names(&["grok-3", "llama3.2", "gpt-4o", "gemini-2.5-flash"]);
        let reordered = reorder_by_hints(chain, Some("Describe this Screenshot"));
        assert_eq!(
            reordered,
            names(&["gpt-4o", "gemini-2.5-flash", "grok-3", "llama3.2"])
        );
    }

    #[test]
    fn test_reasoning_hints_move_thinking_tier_forward() {
        let chain = names(&["gpt-4.1-mini", "llama3.2", "o3", "deepseek-r1"]);
        let reordered = reorder_by_hints(chain, Some("debug this step by step"));
        assert_eq!(
            reordered,
            names(&["o3", "deepseek-r1", "gpt-4.1-mini", "llama3.2"])
        );
    }

    #[test]
    fn test_vision_group_leads_reasoning_group() {
        let chain = names(&["o3", "llama3.2", "gemini-2.5-pro"]);
        let reordered = reorder_by_hints(chain, Some("analyze this diagram"));
        assert_eq!(reordered, names(&["gemini-2.5-pro", "o3", "llama3.2"]));
    }

    #[test]
    fn test_order_by_cost_filters_and_sorts() {
        let pricing = Pricing::new()
            .with_input_price("cheap", 0.1)
            .with_output_price("cheap", 0.4)
            .with_input_price("mid", 1.0)
            .with_output_price("mid", 4.0)
            .with_input_price("pricey", 15.0)
            .with_output_price("pricey", 60.0);

        let ordered = order_by_cost(
            names(&["unpriced", "pricey", "mid", "cheap"]),
            &pricing,
            Some(10.0),
        );
        assert_eq!(ordered, names(&["cheap", "mid", "unpriced"]));
    }

    #[test]
    fn test_order_by_metadata_per_category() {
        let mut thinker = ModelCapabilities::new("thinker");
        thinker.supports_extended_thinking = true;
        thinker.intelligence_score = 90;
        let mut smart = ModelCapabilities::new("smart");
        smart.intelligence_score = 80;
        let mut quick = ModelCapabilities::new("quick");
        quick.intelligence_score = 30;

        let provider =
            ScriptedProvider::new(ProviderIdentity::OpenAi, &["quick", "smart", "thinker"])
                .with_capabilities(thinker)
                .with_capabilities(smart)
                .with_capabilities(quick);
        let models = names(&["smart", "quick", "thinker"]);

        assert_eq!(
            order_by_metadata(models.clone(), &provider, ToolCategory::ExtendedReasoning),
            names(&["thinker", "smart", "quick"])
        );
        assert_eq!(
            order_by_metadata(models.clone(), &provider, ToolCategory::FastResponse),
            names(&["quick", "smart", "thinker"])
        );
        assert_eq!(
            order_by_metadata(models, &provider, ToolCategory::Balanced),
            names(&["thinker", "smart", "quick"])
        );
    }

    #[test]
    fn test_order_by_context() {
        let mut long = ModelCapabilities::new("long");
        long.context_window = 1_000_000;
        let provider = ScriptedProvider::new(ProviderIdentity::Google, &["short", "long"])
            .with_capabilities(long);

        assert_eq!(
            order_by_context(names(&["short", "long"]), &provider),
            names(&["long", "short"])
        );
    }

    #[test]
    fn test_pick_by_family_keyword_first() {
        let models = names(&["gpt-4.1-mini", "o3", "gpt-5"]);
        let picked = pick_by_family(
            &models,
            family_keywords(ProviderIdentity::OpenAi, ToolCategory::ExtendedReasoning),
            false,
        );
        assert_eq!(picked.as_deref(), Some("o3"));
    }

    #[test]
    fn test_pick_by_family_model_first() {
        let models = names(&["gpt-5", "o3"]);
        let picked = pick_by_family(
            &models,
            family_keywords(ProviderIdentity::OpenAi, ToolCategory::ExtendedReasoning),
            true,
        );
        assert_eq!(picked.as_deref(), Some("gpt-5"));
    }

    #[test]
    fn test_every_identity_has_family_keywords() {
        for identity in ProviderIdentity::ALL {
            for category in [ToolCategory::FastResponse, ToolCategory::ExtendedReasoning] {
                assert!(!family_keywords(identity, category).is_empty());
            }
        }
    }
}
