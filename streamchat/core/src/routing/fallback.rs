//! Fallback Chains
//!
//! Each routable model maps to an ordered chain of targets. The first target
//! is the primary; the rest are tried in order, but only while no output has
//! been produced.
//!
//! ```text
//! gpt-4o requested
//!     |
//!     v
//! openai:gpt-4o          (primary, fails to connect)
//!     |
//!     v
//! gemini:gemini-1.5-flash (fallback, streams the reply)
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;

use crate::backend::ProviderAdapter;

// ============================================================================
// Targets and Chains
// ============================================================================

/// One adapter plus the upstream model name to request from it
#[derive(Clone)]
pub struct RouteTarget {
    /// Adapter serving this target
    pub adapter: Arc<dyn ProviderAdapter>,
    /// Model name as the adapter's provider knows it
    pub model: String,
}

impl RouteTarget {
    /// Create a target
    pub fn new(adapter: Arc<dyn ProviderAdapter>, model: impl Into<String>) -> Self {
        Self {
            adapter,
            model: model.into(),
        }
    }

    /// `adapter:model` label used in logs and error summaries
    #[must_use]
    pub fn label(&self) -> String {
        format!("{}:{}", self.adapter.name(), self.model)
    }
}

impl std::fmt::Debug for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.label())
    }
}

/// Ordered targets for one requested model
#[derive(Clone, Debug)]
pub struct FallbackChain {
    /// Model name as requested by clients
    pub model: String,
    /// Primary target first, then fallbacks in order
    pub targets: Vec<RouteTarget>,
}

impl FallbackChain {
    /// Create an empty chain
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            targets: Vec::new(),
        }
    }

    /// Append a target
    #[must_use]
    pub fn with_target(mut self, target: RouteTarget) -> Self {
        self.targets.push(target);
        self
    }

    /// The primary target, if any
    #[must_use]
    pub fn primary(&self) -> Option<&RouteTarget> {
        self.targets.first()
    }

    /// Total depth (primary plus fallbacks)
    #[must_use]
    pub fn depth(&self) -> usize {
        self.targets.len()
    }

    /// Validate for emptiness, repeated targets and excessive depth
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self, max_depth: usize) -> Result<(), RouterBuildError> {
        if self.targets.is_empty() {
            return Err(RouterBuildError::EmptyChain {
                model: self.model.clone(),
            });
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            let label = target.label();
            if !seen.insert(label.clone()) {
                return Err(RouterBuildError::DuplicateTarget {
                    model: self.model.clone(),
                    target: label,
                });
            }
        }

        if self.depth() > max_depth {
            return Err(RouterBuildError::ChainTooDeep {
                model: self.model.clone(),
                depth: self.depth(),
                max: max_depth,
            });
        }

        Ok(())
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while assembling a router
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RouterBuildError {
    /// A model has no targets
    #[error("Model {model} has no route targets")]
    EmptyChain {
        /// The model
        model: String,
    },

    /// The same target appears twice in one chain
    #[error("Model {model} lists target {target} more than once")]
    DuplicateTarget {
        /// The model
        model: String,
        /// The repeated target label
        target: String,
    },

    /// Chain exceeds the configured maximum depth
    #[error("Model {model} chain depth {depth} exceeds maximum {max}")]
    ChainTooDeep {
        /// The model
        model: String,
        /// Actual depth
        depth: usize,
        /// Allowed depth
        max: usize,
    },

    /// A route names an adapter that was never registered
    #[error("Unknown adapter: {name}")]
    UnknownAdapter {
        /// The adapter name
        name: String,
    },

    /// The default model has no route
    #[error("Default model {model} has no route")]
    UnknownDefaultModel {
        /// The model
        model: String,
    },

    /// A provider adapter could not be constructed
    #[error("Failed to initialize {name} adapter: {message}")]
    AdapterInit {
        /// Provider family
        name: String,
        /// Underlying error
        message: String,
    },

    /// No provider family is configured
    #[error("No providers configured")]
    NoProviders,
}

// ============================================================================
// Attempt Tracking
// ============================================================================

/// Record of the targets tried for one request
#[derive(Clone, Debug, Default)]
pub struct FallbackAttempts {
    failures: Vec<(String, String)>,
}

impl FallbackAttempts {
    /// Create an empty record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a target that failed before producing output
    pub fn record(&mut self, target: &RouteTarget, reason: impl Into<String>) {
        self.failures.push((target.label(), reason.into()));
    }

    /// Number of failed targets
    #[must_use]
    pub fn count(&self) -> usize {
        self.failures.len()
    }

    /// One-line summary, e.g. `openai:gpt-4o (refused); gemini:... (HTTP 503)`
    #[must_use]
    pub fn summary(&self) -> String {
        if self.failures.is_empty() {
            return "no targets attempted".to_string();
        }
        self.failures
            .iter()
            .map(|(label, reason)| format!("{label} ({reason})"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedAdapter;

    fn target(name: &str, model: &str) -> RouteTarget {
        RouteTarget::new(Arc::new(ScriptedAdapter::new(name)), model)
    }

    #[test]
    fn test_chain_primary_and_depth() {
        let chain = FallbackChain::new("gpt-4o")
            .with_target(target("openai", "gpt-4o"))
            .with_target(target("gemini", "gemini-1.5-flash"));

        assert_eq!(chain.depth(), 2);
        assert_eq!(chain.primary().map(RouteTarget::label).as_deref(), Some("openai:gpt-4o"));
        assert!(chain.validate(4).is_ok());
    }

    #[test]
    fn test_validate_empty() {
        let chain = FallbackChain::new("m");
        assert_eq!(
            chain.validate(4),
            Err(RouterBuildError::EmptyChain {
                model: "m".to_string()
            })
        );
    }

    #[test]
    fn test_validate_duplicate() {
        let chain = FallbackChain::new("m")
            .with_target(target("a", "m"))
            .with_target(target("b", "m"))
            .with_target(target("a", "m"));
        assert!(matches!(
            chain.validate(4),
            Err(RouterBuildError::DuplicateTarget { target, .. }) if target == "a:m"
        ));
    }

    #[test]
    fn test_validate_depth() {
        let chain = FallbackChain::new("m")
            .with_target(target("a", "m"))
            .with_target(target("b", "m"))
            .with_target(target("c", "m"));
        assert!(matches!(
            chain.validate(2),
            Err(RouterBuildError::ChainTooDeep { depth: 3, max: 2, .. })
        ));
    }

    #[test]
    fn test_attempts_summary() {
        let mut attempts = FallbackAttempts::new();
        assert_eq!(attempts.summary(), "no targets attempted");

        attempts.record(&target("openai", "gpt-4o"), "refused");
        attempts.record(&target("gemini", "gemini-1.5-flash"), "HTTP 503");
        assert_eq!(attempts.count(), 2);
        assert_eq!(
            attempts.summary(),
            "openai:gpt-4o (refused); gemini:gemini-1.5-flash (HTTP 503)"
        );
    }
}
