//! Core message and identifier types
//!
//! These types flow between the transports, the session manager, the router
//! and the provider adapters.

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

// =============================================================================
// Identifiers
// =============================================================================

/// Session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new random session ID (UUID v4)
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the raw string form
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque caller identity used as the rate limiting key
///
/// The core never validates the key; authentication happens upstream.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerKey(pub String);

impl CallerKey {
    /// Create from a raw key
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Parse an `Authorization` style header value
    ///
    /// Accepts both `Bearer <key>` and a bare key. Returns `None` when the
    /// remaining key is empty.
    #[must_use]
    pub fn from_authorization(value: &str) -> Option<Self> {
        let value = value.trim();
        let key = value.strip_prefix("Bearer ").unwrap_or(value).trim();
        if key.is_empty() {
            None
        } else {
            Some(Self(key.to_string()))
        }
    }

    /// Borrow the raw key
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Streaming attempt counter for a session
///
/// Strictly increases with every `send`; an attempt whose generation is no
/// longer current is stale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Generation(pub u64);

impl Generation {
    /// The generation that follows this one
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Roles and Token Events
// =============================================================================

/// Who authored a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// User input
    User,
    /// Model output
    Assistant,
    /// System prompt
    System,
}

impl MessageRole {
    /// Lowercase role name as used by OpenAI-style APIs
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

/// Canonical streaming unit produced by provider adapters
///
/// A sequence of events for one attempt is ordered and contains at most one
/// terminal event ([`TokenEvent::End`] or [`TokenEvent::Error`]), always last.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TokenEvent {
    /// A text fragment
    Fragment {
        /// Fragment text
        text: String,
    },
    /// Successful end of stream
    End,
    /// Error or cancellation marker
    Error {
        /// Canonical error kind
        kind: ErrorKind,
        /// Human-readable detail
        message: String,
    },
}

impl TokenEvent {
    /// Create a fragment event
    pub fn fragment(text: impl Into<String>) -> Self {
        Self::Fragment { text: text.into() }
    }

    /// Create an error marker
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
        }
    }

    /// Create a cancellation marker
    #[must_use]
    pub fn cancelled() -> Self {
        Self::error(ErrorKind::Cancelled, "stream cancelled")
    }

    /// Whether this event ends the sequence
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Fragment { .. })
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Canonical chat request consumed by the session manager
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Target session; generated when absent
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// User message text
    pub message: String,
    /// Requested model; the router default is used when absent
    #[serde(default)]
    pub model: Option<String>,
    /// Sampling temperature in `0.0..=2.0`; provider default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Generation limit; provider default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Create a request for a new session with the default model
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            message: message.into(),
            model: None,
            temperature: None,
            max_tokens: None,
        }
    }

    /// Set the sampling temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Cap the reply length
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Target an existing session
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Request a specific model
    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }
}

/// A model known to the router
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model name as requested by clients
    pub model: String,
    /// Provider family serving the primary route
    pub provider: String,
}
