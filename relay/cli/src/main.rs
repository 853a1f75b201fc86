//! Relay Inspect - Dispatch Configuration Inspector
//!
//! Loads relay configuration the same way an embedding application would
//! and prints what the dispatcher would do with it.
//!
//! # Usage
//!
//! ```bash
//! # Fallback chain per category
//! relay-inspect chains
//!
//! # Chain reordered for a request hint
//! relay-inspect chains --hints "review this screenshot"
//!
//! # Preferred fallback model per category, as JSON
//! relay-inspect --json preferred
//!
//! # Effective configuration (secrets redacted)
//! relay-inspect --config ./relay.toml config
//!
//! # Verbose logging
//! RUST_LOG=debug relay-inspect chains
//! ```
//!
//! No providers are registered by this tool, so heuristic chains reflect
//! configured chains and the last-resort default only.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use relay_core::{
    load_config_from_path, ConfigOverrides, ProviderIdentity, ProviderRegistry, RelayConfig,
    ToolCategory,
};

/// Relay Inspect - show resolved fallback chains and configuration
#[derive(Parser, Debug)]
#[command(name = "relay-inspect")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long)]
    json: bool,

    /// Disable health tracking
    #[arg(long)]
    no_health: bool,

    /// Record health outcomes without gating selection
    #[arg(long)]
    log_only: bool,

    /// Attempts per provider call
    #[arg(long, value_name = "N")]
    retry_attempts: Option<u32>,

    /// Restrict to these providers (repeatable)
    #[arg(long = "allow-provider", value_name = "NAME")]
    allowed_providers: Vec<ProviderIdentity>,

    /// Prefer configured free models
    #[arg(long)]
    prefer_free_tier: bool,

    /// Rank models by configured price
    #[arg(long)]
    cost_aware: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Resolved fallback chain per category
    Chains {
        /// Free-form request text used to reorder the chain
        #[arg(long)]
        hints: Option<String>,
    },
    /// Preferred fallback model per category
    Preferred,
    /// Effective configuration as JSON, credentials redacted
    Config,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if self.no_health {
            overrides = overrides.with_health_enabled(false);
        }
        if self.log_only {
            overrides = overrides.with_log_only(true);
        }
        if let Some(attempts) = self.retry_attempts {
            overrides = overrides.with_retry_attempts(attempts);
        }
        if !self.allowed_providers.is_empty() {
            overrides = overrides.with_allowed_providers(self.allowed_providers.clone());
        }
        if self.prefer_free_tier {
            overrides = overrides.with_prefer_free_tier(true);
        }
        if self.cost_aware {
            overrides = overrides.with_cost_aware(true);
        }
        overrides
    }
}

#[derive(Debug, Serialize, PartialEq)]
struct CategoryReport {
    category: ToolCategory,
    key: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    preferred: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain: Option<Vec<String>>,
}

fn chain_reports(registry: &ProviderRegistry, hints: Option<&str>) -> Vec<CategoryReport> {
    ToolCategory::ALL
        .into_iter()
        .map(|category| CategoryReport {
            category,
            key: category.config_key(),
            preferred: None,
            chain: Some(registry.resolve_fallback_chain(category, hints)),
        })
        .collect()
}

fn preferred_reports(registry: &ProviderRegistry) -> Vec<CategoryReport> {
    ToolCategory::ALL
        .into_iter()
        .map(|category| CategoryReport {
            category,
            key: category.config_key(),
            preferred: Some(registry.get_preferred_fallback_model(category)),
            chain: None,
        })
        .collect()
}

fn render_text(reports: &[CategoryReport]) -> String {
    reports
        .iter()
        .map(|r| {
            let value = match (&r.preferred, &r.chain) {
                (Some(model), _) => model.clone(),
                (None, Some(chain)) => chain.join(" -> "),
                (None, None) => String::new(),
            };
            format!("{:<20} {:<10} {value}", r.category.to_string(), r.key)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn load(args: &Args) -> Result<RelayConfig> {
    let mut config = load_config_from_path(args.config.clone()).with_context(|| match &args.config {
        Some(path) => format!("Failed to load configuration from {path:?}"),
        None => "Failed to load configuration".to_string(),
    })?;
    args.overrides().apply(&mut config);
    config
        .validate()
        .context("Configuration is invalid after applying overrides")?;
    Ok(config)
}

fn run(args: &Args) -> Result<String> {
    let config = load(args)?;
    info!(source = %config.source(), "Configuration loaded");

    // Always JSON so credentials go through the redacting serializer
    if args.command == Command::Config {
        return Ok(serde_json::to_string_pretty(&config)?);
    }

    let registry = Arc::new(ProviderRegistry::from_config(config));
    let reports = match &args.command {
        Command::Chains { hints } => chain_reports(&registry, hints.as_deref()),
        Command::Preferred | Command::Config => preferred_reports(&registry),
    };

    if args.json {
        Ok(serde_json::to_string_pretty(&reports)?)
    } else {
        Ok(render_text(&reports))
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("relay_cli=info".parse()?)
                .add_directive("relay_core=info".parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let output = run(&args)?;
    println!("{output}");
    Ok(())
}
