//! Provider Backends
//!
//! Every LLM provider sits behind the [`ProviderAdapter`] trait, which turns
//! the provider's streaming protocol into canonical [`TokenEvent`]s.
//! New providers are added by implementing the trait; nothing above this
//! module branches on provider names.
//!
//! # Available Adapters
//!
//! - [`OpenAiAdapter`]: OpenAI chat completions (SSE), or any compatible endpoint
//! - [`GeminiAdapter`]: Google Gemini `streamGenerateContent` (SSE)
//! - [`OllamaAdapter`]: local Ollama server (NDJSON)
//! - [`ScriptedAdapter`]: deterministic replay and echo, for tests and offline use
//!
//! # Usage
//!
//! ```ignore
//! use streamchat_core::backend::{ConversationContext, OpenAiAdapter, ProviderAdapter};
//! use streamchat_core::cancel::CancelToken;
//! use streamchat_core::messages::MessageRole;
//!
//! let adapter = OpenAiAdapter::new(api_key)?;
//! let ctx = ConversationContext::new("gpt-4o-mini").with_message(MessageRole::User, "Hello!");
//! let rx = adapter.open_stream(&ctx, CancelToken::detached()).await?;
//! ```
//!
//! [`TokenEvent`]: crate::messages::TokenEvent

mod gemini;
mod ollama;
mod openai;
mod scripted;
pub mod stream;
mod traits;

pub use gemini::{GeminiAdapter, GEMINI_BASE_URL};
pub use ollama::OllamaAdapter;
pub use openai::{OpenAiAdapter, OPENAI_BASE_URL};
pub use scripted::{ScriptStep, ScriptedAdapter};
pub use stream::PumpSettings;
pub use traits::{ChatMessage, ConversationContext, ProviderAdapter, ProviderError};
