//! Provider Adapter Traits
//!
//! Defines the uniform streaming contract every provider backend implements,
//! along with the conversation context handed to providers and the failure
//! classification adapters report.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::ErrorKind;
use crate::messages::{MessageRole, TokenEvent};

// =============================================================================
// Conversation Context
// =============================================================================

/// A single message in the context sent to a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author of the message
    pub role: MessageRole,
    /// Message text
    pub content: String,
}

impl ChatMessage {
    /// Create a new message
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Everything a provider needs to produce a reply
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    /// Upstream model name for the provider being called
    pub model: String,
    /// System prompt, if any
    pub system: Option<String>,
    /// Prior conversation followed by the new user message
    pub messages: Vec<ChatMessage>,
    /// Sampling temperature (provider default if `None`)
    pub temperature: Option<f32>,
    /// Maximum tokens to generate (provider default if `None`)
    pub max_tokens: Option<u32>,
}

impl ConversationContext {
    /// Create a context for `model` with no messages
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system: None,
            messages: Vec::new(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the system prompt
    #[must_use]
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Append a message
    #[must_use]
    pub fn with_message(mut self, role: MessageRole, content: impl Into<String>) -> Self {
        self.messages.push(ChatMessage::new(role, content));
        self
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Set the generation limit
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Same context addressed to a different upstream model
    #[must_use]
    pub fn for_model(&self, model: &str) -> Self {
        Self {
            model: model.to_string(),
            ..self.clone()
        }
    }
}

// =============================================================================
// Failure Classification
// =============================================================================

/// Provider-level failures, classified before they leave the adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Could not reach the provider
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Credentials rejected
    #[error("Authentication rejected (HTTP {status})")]
    Auth {
        /// HTTP status code
        status: u16,
    },

    /// Provider-side rate limiting
    #[error("Provider rate limited (HTTP {status})")]
    RateLimited {
        /// HTTP status code
        status: u16,
    },

    /// Any other non-success HTTP status
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// No data within the read timeout
    #[error("Timed out waiting for provider")]
    Timeout,

    /// Payload did not match the provider's wire format
    #[error("Malformed payload: {0}")]
    Malformed(String),

    /// Stream broke while reading
    #[error("Stream error: {0}")]
    Stream(String),
}

/// Longest error body kept from a failed HTTP response
const MAX_ERROR_BODY: usize = 512;

impl ProviderError {
    /// Classify a non-success HTTP response
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 | 403 => Self::Auth { status },
            429 => Self::RateLimited { status },
            _ => {
                let mut body = body.trim().to_string();
                if body.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                Self::Http { status, body }
            }
        }
    }

    /// Classify a transport error from the HTTP client
    #[must_use]
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Stream(err.to_string())
        }
    }

    /// Canonical kind, depending on whether output was already produced
    #[must_use]
    pub fn kind(&self, after_output: bool) -> ErrorKind {
        if after_output {
            ErrorKind::ProviderInterrupted
        } else {
            ErrorKind::ProviderUnavailable
        }
    }

    /// Terminal error event for this failure
    #[must_use]
    pub fn into_event(self, after_output: bool) -> TokenEvent {
        TokenEvent::error(self.kind(after_output), self.to_string())
    }
}

// =============================================================================
// Adapter Trait
// =============================================================================

/// Uniform streaming contract for LLM providers
///
/// An adapter turns one backend's streaming protocol into an ordered
/// sequence of [`TokenEvent`]s. Opening the stream either fails with a
/// classified [`ProviderError`] or yields a receiver that ends with exactly
/// one terminal event (or simply closes if the receiver side went away).
///
/// Adapters must:
/// - poll `cancel` between fragments and while waiting on network reads,
///   emitting a single cancellation marker and no further fragments
/// - never retry; fallback is the router's job
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Adapter name, used for routing tables and logs
    fn name(&self) -> &str;

    /// Check whether the provider is reachable
    async fn health_check(&self) -> bool;

    /// Start streaming a reply for `context`
    ///
    /// # Errors
    ///
    /// Returns a [`ProviderError`] if the provider could not be reached or
    /// rejected the request before any output.
    async fn open_stream(
        &self,
        context: &ConversationContext,
        cancel: CancelToken,
    ) -> Result<mpsc::Receiver<TokenEvent>, ProviderError>;
}
