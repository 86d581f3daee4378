//! StreamChat Core - Streaming Chat Sessions over Multiple LLM Providers
//!
//! This crate holds everything between a transport and the providers: the
//! per-session state machine, model routing with pre-output fallback, the
//! per-caller rate limiter, and the history store. Transports (the daemon's
//! NDJSON socket, an SSE endpoint) only hand requests in and drain
//! [`TokenEvent`]s out through a [`TokenSink`].
//!
//! # Architecture
//!
//! ```text
//!   Transport (socket / SSE)
//!        │  ChatRequest                     ▲ TokenEvent
//!        ▼                                  │ (TokenSink)
//! ┌──────────────────────────────────────────┴─────────────────────┐
//! │                        SessionManager                          │
//! │  ┌─────────────┐  ┌───────────────┐  ┌──────────────────────┐  │
//! │  │ RateLimiter │  │ Session table │  │    HistoryStore      │  │
//! │  │ (per caller)│  │ (generations) │  │ (memory / JSONL)     │  │
//! │  └─────────────┘  └───────┬───────┘  └──────────────────────┘  │
//! └───────────────────────────┼────────────────────────────────────┘
//!                             │ ConversationContext + CancelToken
//!                             ▼
//!                    ┌─────────────────┐
//!                    │   ModelRouter   │  fallback before first token
//!                    └────────┬────────┘
//!           ┌─────────────────┼─────────────────┐
//!           ▼                 ▼                 ▼
//!     OpenAiAdapter     GeminiAdapter     OllamaAdapter
//! ```
//!
//! # Key Types
//!
//! - [`SessionManager`]: owns sessions and drives every send
//! - [`ModelRouter`]: maps model names to fallback chains
//! - [`ProviderAdapter`]: one streaming LLM provider
//! - [`RateLimiter`]: token bucket per [`CallerKey`]
//! - [`HistoryStore`]: append-only turn log per session
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use streamchat_core::{
//!     backend::ScriptedAdapter, history::InMemoryHistory, transport::ChannelSink,
//!     CallerKey, ChatRequest, ModelRouter, RateLimitConfig, RateLimiter,
//!     SessionManager, SessionManagerConfig,
//! };
//!
//! let router = ModelRouter::builder()
//!     .adapter(Arc::new(ScriptedAdapter::echo("echo")))
//!     .route("echo", "echo")
//!     .default_model("echo")
//!     .build()?;
//! let manager = SessionManager::new(
//!     router,
//!     Arc::new(RateLimiter::new(RateLimitConfig::default())),
//!     Arc::new(InMemoryHistory::new()),
//!     SessionManagerConfig::default(),
//! );
//!
//! let (sink, mut events) = ChannelSink::channel(64);
//! manager
//!     .send(&CallerKey::new("me"), ChatRequest::new("Hello!"), &sink)
//!     .await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: provider adapters and streaming plumbing
//! - [`cancel`]: generation-scoped cancellation tokens
//! - [`config`]: TOML and environment configuration
//! - [`error`]: client-visible error kinds
//! - [`history`]: turn storage
//! - [`messages`]: identifiers, requests and token events
//! - [`rate_limit`]: token bucket limiter
//! - [`routing`]: model router and fallback chains
//! - [`session`]: session state machine and manager
//! - [`transport`]: token sinks and wire frames

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod cancel;
pub mod config;
pub mod error;
pub mod history;
pub mod messages;
pub mod rate_limit;
pub mod routing;
pub mod session;
pub mod transport;

// Re-export commonly used types at crate root
pub use backend::{ConversationContext, ProviderAdapter, ProviderError};
pub use cancel::{CancelReason, CancelToken};
pub use config::{load_config, load_config_from_path, ConfigError, StreamChatConfig};
pub use error::{ChatError, ErrorKind};
pub use history::{HistoryError, HistoryStore, Turn, TurnStatus};
pub use messages::{
    CallerKey, ChatRequest, Generation, MessageRole, ModelInfo, SessionId, TokenEvent,
};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
pub use routing::{build_router, ModelRouter, RouterBuildError};
pub use session::{SessionManager, SessionManagerConfig, SessionSummary, StreamOutcome};
pub use transport::{SinkError, TokenSink};
