//! Bidirectional frame protocol
//!
//! One JSON object per line in each direction. Clients send [`ClientFrame`]s
//! and receive [`ServerFrame`]s; token frames for an active attempt are
//! interleaved with replies to other requests on the same connection.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{SinkError, TokenSink};
use crate::error::ChatError;
use crate::history::Turn;
use crate::messages::{ModelInfo, SessionId, TokenEvent};
use crate::session::{HealthReport, SessionSummary};

// ============================================================================
// Client -> Server
// ============================================================================

/// Requests a client may send
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start streaming a reply
    Send {
        /// Target session; a new one is created when absent
        #[serde(default)]
        session_id: Option<SessionId>,
        /// User message
        message: String,
        /// Requested model; the default is used when absent
        #[serde(default)]
        model: Option<String>,
        /// Caller key; the connection's peer identity is used when absent
        #[serde(default)]
        api_key: Option<String>,
        /// Sampling temperature in `0.0..=2.0`
        #[serde(default)]
        temperature: Option<f32>,
        /// Generation limit
        #[serde(default)]
        max_tokens: Option<u32>,
    },
    /// Cancel the active attempt of a session
    Cancel {
        /// Target session
        session_id: SessionId,
    },
    /// Read a session's history
    History {
        /// Target session
        session_id: SessionId,
        /// Return only the newest `limit` turns
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Delete a session and its history
    Delete {
        /// Target session
        session_id: SessionId,
    },
    /// List active sessions
    Sessions,
    /// List routable models
    Models,
    /// Check provider reachability
    Health,
    /// Liveness check
    Ping,
}

impl ClientFrame {
    /// Parse one line
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the line is not a valid frame.
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

// ============================================================================
// Server -> Client
// ============================================================================

/// Frames the server sends
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// A send was dispatched; a rejection follows as an error frame
    Started {
        /// Session the attempt belongs to
        session_id: SessionId,
        /// Model requested (or the default)
        model: String,
    },
    /// A text fragment
    Token {
        /// Owning session
        session_id: SessionId,
        /// Fragment text
        token: String,
    },
    /// Successful completion
    Done {
        /// Owning session
        session_id: SessionId,
        /// Model the reply was requested from
        model: String,
        /// Length of the full reply in characters
        total_length: usize,
    },
    /// Failure, rejection or cancellation
    Error {
        /// Session concerned, when known
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        /// Error kind (`rate_limited`, `cancelled`, `invalid_request`, ...)
        kind: String,
        /// Detail
        message: String,
        /// Back-off hint for `rate_limited`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_seconds: Option<f64>,
    },
    /// Reply to a cancel request
    Cancelled {
        /// Target session
        session_id: SessionId,
        /// Whether an attempt was actually cancelled
        cancelled: bool,
    },
    /// Reply to a history request
    History {
        /// Target session
        session_id: SessionId,
        /// Turns in commit order
        turns: Vec<Turn>,
    },
    /// Reply to a delete request
    Deleted {
        /// Deleted session
        session_id: SessionId,
    },
    /// Reply to a sessions request
    Sessions {
        /// Active sessions, most recently active first
        sessions: Vec<SessionSummary>,
    },
    /// Reply to a models request
    Models {
        /// Routable models
        models: Vec<ModelInfo>,
    },
    /// Reply to a health request
    Health {
        /// Provider checks and service summary
        health: HealthReport,
    },
    /// Reply to ping
    Pong,
}

impl ServerFrame {
    /// Error frame for a rejected or failed request
    #[must_use]
    pub fn from_error(session_id: Option<SessionId>, err: &ChatError) -> Self {
        let kind = match err {
            ChatError::InvalidRequest(_) => "invalid_request",
            ChatError::History(_) => "history_error",
            other => other.kind().map_or("internal", |k| k.as_str()),
        };
        let retry_after_seconds = match err {
            ChatError::RateLimited { retry_after } => Some(retry_after.as_secs_f64()),
            _ => None,
        };
        Self::Error {
            session_id,
            kind: kind.to_string(),
            message: err.to_string(),
            retry_after_seconds,
        }
    }

    /// Error frame for a line that could not be parsed
    #[must_use]
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::Error {
            session_id: None,
            kind: "protocol_error".to_string(),
            message: message.into(),
            retry_after_seconds: None,
        }
    }

    /// Render as one NDJSON line, newline included
    ///
    /// # Errors
    ///
    /// Returns the JSON error if serialization fails.
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

// ============================================================================
// Sink
// ============================================================================

/// Sink that turns one attempt's events into [`ServerFrame`]s
#[derive(Debug)]
pub struct FrameSink {
    session_id: SessionId,
    model: String,
    total_length: AtomicUsize,
    tx: mpsc::Sender<ServerFrame>,
}

impl FrameSink {
    /// Create a sink for `session_id` replying with `model`
    pub fn new(
        session_id: SessionId,
        model: impl Into<String>,
        tx: mpsc::Sender<ServerFrame>,
    ) -> Self {
        Self {
            session_id,
            model: model.into(),
            total_length: AtomicUsize::new(0),
            tx,
        }
    }

    fn render(&self, event: TokenEvent) -> ServerFrame {
        match event {
            TokenEvent::Fragment { text } => {
                self.total_length
                    .fetch_add(text.chars().count(), Ordering::Relaxed);
                ServerFrame::Token {
                    session_id: self.session_id.clone(),
                    token: text,
                }
            }
            TokenEvent::End => ServerFrame::Done {
                session_id: self.session_id.clone(),
                model: self.model.clone(),
                total_length: self.total_length.load(Ordering::Relaxed),
            },
            TokenEvent::Error { kind, message } => ServerFrame::Error {
                session_id: Some(self.session_id.clone()),
                kind: kind.as_str().to_string(),
                message,
                retry_after_seconds: None,
            },
        }
    }
}

#[async_trait]
impl TokenSink for FrameSink {
    async fn emit(&self, event: TokenEvent) -> Result<(), SinkError> {
        let permit = self.tx.reserve().await.map_err(|_| SinkError::Closed)?;
        permit.send(self.render(event));
        Ok(())
    }
}
