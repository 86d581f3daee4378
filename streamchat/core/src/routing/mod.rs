//! Model Routing
//!
//! Maps client-facing model names to ordered chains of provider targets and
//! applies pre-output fallback. See [`ModelRouter::stream`] for the rules.

mod catalog;
mod fallback;
mod router;

pub use catalog::{build_router, GEMINI_MODELS, OPENAI_MODELS};
pub use fallback::{FallbackAttempts, FallbackChain, RouteTarget, RouterBuildError};
pub use router::{
    ModelRouter, ModelRouterBuilder, ProviderHealth, RoutedStream, DEFAULT_MAX_FALLBACK_DEPTH,
};
