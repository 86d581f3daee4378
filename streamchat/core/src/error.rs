//! Error taxonomy for the chat core
//!
//! Every failure a caller of [`SessionManager::send`] can observe is
//! classified into an [`ErrorKind`]. The richer [`ChatError`] carries the
//! context needed for logging and for the wire protocol.
//!
//! [`SessionManager::send`]: crate::session::SessionManager::send

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::history::HistoryError;
use crate::messages::SessionId;

/// Canonical error kinds
///
/// This is the vocabulary shared by provider adapters, the router, the
/// session manager and the transports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Caller's token bucket is exhausted; back off and retry later
    RateLimited,
    /// The router has no mapping for the requested model
    UnknownModel,
    /// Every adapter in the fallback chain failed before producing output
    ProviderUnavailable,
    /// The serving adapter failed after partial output
    ProviderInterrupted,
    /// No session with the given id
    SessionNotFound,
    /// The attempt was cancelled (normal terminal state, not a fault)
    Cancelled,
}

impl ErrorKind {
    /// Stable string form used in logs and wire frames
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::UnknownModel => "unknown_model",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::ProviderInterrupted => "provider_interrupted",
            Self::SessionNotFound => "session_not_found",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this kind represents a real failure
    #[must_use]
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the chat core
#[derive(Debug, Error)]
pub enum ChatError {
    /// Caller exceeded its rate limit
    #[error("Rate limit exceeded, retry after {:.1}s", retry_after.as_secs_f64())]
    RateLimited {
        /// Time until the bucket holds enough tokens again
        retry_after: Duration,
    },

    /// Requested model is not known to the router
    #[error("Unknown model: {model}")]
    UnknownModel {
        /// The model name as requested
        model: String,
    },

    /// All adapters failed before the first fragment
    #[error("No provider available for {model}: {message}")]
    ProviderUnavailable {
        /// The model that was requested
        model: String,
        /// Summary of the attempted targets
        message: String,
    },

    /// Serving adapter failed mid-stream
    #[error("Provider interrupted while streaming {model}: {message}")]
    ProviderInterrupted {
        /// The model that was serving the stream
        model: String,
        /// Failure description from the adapter
        message: String,
    },

    /// Session does not exist (or was deleted)
    #[error("Session not found: {session_id}")]
    SessionNotFound {
        /// The session id that was looked up
        session_id: SessionId,
    },

    /// Request rejected before streaming (empty or oversized message)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// History store failure
    #[error("History store error: {0}")]
    History(#[from] HistoryError),
}

impl ChatError {
    /// Map onto the canonical taxonomy
    ///
    /// Returns `None` for errors outside the streaming taxonomy (validation
    /// and storage failures).
    #[must_use]
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::RateLimited { .. } => Some(ErrorKind::RateLimited),
            Self::UnknownModel { .. } => Some(ErrorKind::UnknownModel),
            Self::ProviderUnavailable { .. } => Some(ErrorKind::ProviderUnavailable),
            Self::ProviderInterrupted { .. } => Some(ErrorKind::ProviderInterrupted),
            Self::SessionNotFound { .. } => Some(ErrorKind::SessionNotFound),
            Self::InvalidRequest(_) | Self::History(_) => None,
        }
    }

    /// Whether the request was rejected before any streaming began
    #[must_use]
    pub fn is_pre_stream(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::UnknownModel { .. }
                | Self::SessionNotFound { .. }
                | Self::InvalidRequest(_)
        )
    }
}
