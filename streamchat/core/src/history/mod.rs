//! Conversation History
//!
//! History is an append-only, ordered log of [`Turn`]s per session. The
//! session manager guarantees turn-before-turn ordering within a session by
//! appending under the session's exclusive section; stores only need to
//! preserve append order.
//!
//! # Available Stores
//!
//! - [`InMemoryHistory`]: process-lifetime storage (default)
//! - [`JsonlHistoryStore`]: one JSON-lines file per session, survives restart

mod jsonl;
mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::messages::{Generation, MessageRole, SessionId};

pub use jsonl::JsonlHistoryStore;
pub use memory::InMemoryHistory;

// =============================================================================
// Turns
// =============================================================================

/// Terminal status of a turn
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnStatus {
    /// Stream finished normally (always the case for user turns)
    Completed,
    /// Stream was cancelled by the caller
    Cancelled,
    /// Stream failed after partial output
    Failed,
}

/// One committed message in a session's history
///
/// Turns are immutable once appended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    /// Who authored this turn
    pub role: MessageRole,
    /// Ordered text fragments; concatenate for the full text
    pub content: Vec<String>,
    /// Model that produced the turn (assistant turns only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// When the turn was committed
    pub timestamp: DateTime<Utc>,
    /// Terminal status
    pub status: TurnStatus,
    /// Streaming attempt that produced this turn
    pub generation: Generation,
}

impl Turn {
    /// A completed user turn
    pub fn user(text: impl Into<String>, generation: Generation) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![text.into()],
            model: None,
            timestamp: Utc::now(),
            status: TurnStatus::Completed,
            generation,
        }
    }

    /// An assistant turn assembled from streamed fragments
    pub fn assistant(
        fragments: Vec<String>,
        model: impl Into<String>,
        status: TurnStatus,
        generation: Generation,
    ) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: fragments,
            model: Some(model.into()),
            timestamp: Utc::now(),
            status,
            generation,
        }
    }

    /// Full text of the turn
    #[must_use]
    pub fn text(&self) -> String {
        self.content.concat()
    }

    /// Total length of the turn text in bytes
    #[must_use]
    pub fn text_len(&self) -> usize {
        self.content.iter().map(String::len).sum()
    }
}

// =============================================================================
// Store Contract
// =============================================================================

/// Errors raised by history stores
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Filesystem failure
    #[error("History I/O error at {path}: {source}")]
    Io {
        /// File or directory involved
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Turn could not be encoded
    #[error("Failed to encode turn: {0}")]
    Encode(#[from] serde_json::Error),

    /// Session id cannot be used as a storage key
    #[error("Invalid session id for storage: {0}")]
    InvalidSessionId(String),
}

/// Append-only per-session turn log
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Short name for logging
    fn name(&self) -> &'static str;

    /// Append a turn to the end of the session's log
    async fn append(&self, session_id: &SessionId, turn: Turn) -> Result<(), HistoryError>;

    /// Read the session's turns in append order (empty if none)
    async fn read(&self, session_id: &SessionId) -> Result<Vec<Turn>, HistoryError>;

    /// Whether any turns exist for the session
    async fn contains(&self, session_id: &SessionId) -> Result<bool, HistoryError>;

    /// Remove the session's log; returns whether anything was removed
    async fn remove(&self, session_id: &SessionId) -> Result<bool, HistoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turn_text_concatenates_fragments() {
        let turn = Turn::assistant(
            vec!["Hel".to_string(), "lo".to_string()],
            "gpt-4o",
            TurnStatus::Completed,
            Generation(1),
        );
        assert_eq!(turn.text(), "Hello");
        assert_eq!(turn.text_len(), 5);
        assert_eq!(turn.model.as_deref(), Some("gpt-4o"));
    }

    #[test]
    fn test_user_turn_is_completed() {
        let turn = Turn::user("hi", Generation(2));
        assert_eq!(turn.role, MessageRole::User);
        assert_eq!(turn.status, TurnStatus::Completed);
        assert!(turn.model.is_none());
    }

    #[test]
    fn test_turn_json_omits_missing_model() {
        let turn = Turn::user("hi", Generation(1));
        let json = serde_json::to_value(&turn).unwrap();
        assert!(json.get("model").is_none());
        assert_eq!(json["role"], "user");
        assert_eq!(json["status"], "completed");
    }
}
