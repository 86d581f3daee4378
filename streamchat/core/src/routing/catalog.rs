//! Router Catalog
//!
//! Builds a [`ModelRouter`] from configuration. Each configured provider
//! family contributes its models; `[routing.fallbacks]` adds the default
//! model of each fallback family behind every model of the primary family.

use std::collections::HashSet;
use std::sync::Arc;

use super::fallback::RouterBuildError;
use super::router::ModelRouter;
use crate::backend::{
    GeminiAdapter, OllamaAdapter, OpenAiAdapter, ProviderAdapter, PumpSettings, ScriptedAdapter,
};
use crate::config::StreamChatConfig;

/// Models routed to OpenAI when no list is configured
pub const OPENAI_MODELS: &[&str] = &["gpt-4o", "gpt-4o-mini", "gpt-4-turbo", "gpt-3.5-turbo"];

/// Models routed to Gemini when no list is configured
pub const GEMINI_MODELS: &[&str] = &["gemini-1.5-flash", "gemini-1.5-pro", "gemini-2.0-flash"];

/// One configured provider family
struct Family {
    adapter: Arc<dyn ProviderAdapter>,
    models: Vec<String>,
    default_model: String,
}

impl Family {
    fn name(&self) -> &str {
        self.adapter.name()
    }
}

fn init_error(name: &str, err: impl std::fmt::Display) -> RouterBuildError {
    RouterBuildError::AdapterInit {
        name: name.to_string(),
        message: err.to_string(),
    }
}

/// Construct adapters for every configured family, in a fixed order
fn configured_families(config: &StreamChatConfig) -> Result<Vec<Family>, RouterBuildError> {
    let providers = &config.providers;
    let mut families = Vec::new();

    if providers.openai.is_configured() {
        let openai = &providers.openai;
        let adapter = OpenAiAdapter::with_base_url(
            "openai",
            openai.base_url.as_str(),
            openai.api_key.clone().unwrap_or_default(),
        )
        .map_err(|e| init_error("openai", e))?
        .with_settings(PumpSettings {
            read_timeout: openai.read_timeout,
            ..PumpSettings::default()
        });
        families.push(Family {
            adapter: Arc::new(adapter),
            models: openai.models.clone(),
            default_model: openai.default_model.clone(),
        });
    }

    if providers.gemini.is_configured() {
        let gemini = &providers.gemini;
        let adapter = GeminiAdapter::with_base_url(
            "gemini",
            gemini.base_url.as_str(),
            gemini.api_key.clone().unwrap_or_default(),
        )
        .map_err(|e| init_error("gemini", e))?
        .with_settings(PumpSettings {
            read_timeout: gemini.read_timeout,
            ..PumpSettings::default()
        });
        families.push(Family {
            adapter: Arc::new(adapter),
            models: gemini.models.clone(),
            default_model: gemini.default_model.clone(),
        });
    }

    if providers.ollama.enabled {
        let ollama = &providers.ollama;
        let default_model = ollama
            .default_model
            .clone()
            .or_else(|| ollama.models.first().cloned());
        match default_model {
            Some(default_model) => {
                let adapter = OllamaAdapter::new(ollama.host.as_str(), ollama.port)
                    .map_err(|e| init_error("ollama", e))?
                    .with_settings(PumpSettings {
                        read_timeout: ollama.read_timeout,
                        ..PumpSettings::default()
                    });
                families.push(Family {
                    adapter: Arc::new(adapter),
                    models: ollama.models.clone(),
                    default_model,
                });
            }
            None => tracing::warn!("Ollama enabled without any models, skipping"),
        }
    }

    if providers.echo {
        families.push(Family {
            adapter: Arc::new(ScriptedAdapter::echo("echo")),
            models: vec!["echo".to_string()],
            default_model: "echo".to_string(),
        });
    }

    Ok(families)
}

/// Build the router described by `config`
///
/// Fallback families that are not configured are skipped with a warning,
/// as are fallbacks beyond the maximum chain depth. If the configured
/// default model has no route, the first family's default model is used.
///
/// # Errors
///
/// Returns [`RouterBuildError::NoProviders`] when no family is configured,
/// [`RouterBuildError::AdapterInit`] when an adapter cannot be constructed,
/// or any validation error from the builder.
pub fn build_router(config: &StreamChatConfig) -> Result<ModelRouter, RouterBuildError> {
    let families = configured_families(config)?;
    if families.is_empty() {
        return Err(RouterBuildError::NoProviders);
    }

    let max_depth = config.routing.max_fallback_depth.max(1);
    let mut builder = ModelRouter::builder()
        .max_fallback_depth(max_depth)
        .stream_buffer(config.stream_buffer);
    for family in &families {
        builder = builder.adapter(Arc::clone(&family.adapter));
    }

    let mut claimed: HashSet<&str> = HashSet::new();
    let mut routed: Vec<&str> = Vec::new();
    for family in &families {
        let fallbacks = fallback_families(config, family, &families, max_depth - 1);

        for model in &family.models {
            if !claimed.insert(model.as_str()) {
                tracing::warn!(
                    model = %model,
                    family = %family.name(),
                    "Model already routed by another provider, skipping"
                );
                continue;
            }
            routed.push(model);
            builder = builder.route(model, family.name());
            for fallback in &fallbacks {
                builder = builder.target(model, fallback.name(), &fallback.default_model);
            }
        }
    }

    let default_model = if claimed.contains(config.routing.default_model.as_str()) {
        config.routing.default_model.clone()
    } else {
        let replacement = families
            .iter()
            .map(|f| f.default_model.as_str())
            .find(|m| claimed.contains(m))
            .or_else(|| routed.first().copied())
            .ok_or(RouterBuildError::NoProviders)?
            .to_string();
        tracing::warn!(
            configured = %config.routing.default_model,
            using = %replacement,
            "Default model has no route"
        );
        replacement
    };

    builder.default_model(default_model).build()
}

/// Resolve configured fallback family names for `family`
fn fallback_families<'a>(
    config: &StreamChatConfig,
    family: &Family,
    families: &'a [Family],
    limit: usize,
) -> Vec<&'a Family> {
    let Some(names) = config.routing.fallbacks.get(family.name()) else {
        return Vec::new();
    };

    let mut chosen: Vec<&Family> = Vec::new();
    for name in names {
        if name == family.name() || chosen.iter().any(|f| f.name() == name) {
            continue;
        }
        let Some(fallback) = families.iter().find(|f| f.name() == name) else {
            tracing::warn!(
                family = %family.name(),
                fallback = %name,
                "Fallback provider not configured, skipping"
            );
            continue;
        };
        if chosen.len() == limit {
            tracing::warn!(
                family = %family.name(),
                fallback = %name,
                max_depth = limit + 1,
                "Fallback beyond maximum chain depth, skipping"
            );
            continue;
        }
        chosen.push(fallback);
    }
    chosen
}
