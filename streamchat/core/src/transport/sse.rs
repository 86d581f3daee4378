//! Server-push sink
//!
//! Renders events as SSE `data:` frames:
//!
//! ```text
//! data: {"type":"token","token":"Hel","session_id":"..."}
//!
//! data: {"type":"done","model":"gpt-4o-mini","session_id":"...","total_length":5}
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::{SinkError, TokenSink};
use crate::error::ErrorKind;
use crate::messages::{SessionId, TokenEvent};

/// Payload of one SSE frame
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SseEvent {
    /// A text fragment
    Token {
        /// Fragment text
        token: String,
        /// Owning session
        session_id: SessionId,
    },
    /// Successful completion
    Done {
        /// Model the reply was requested from
        model: String,
        /// Owning session
        session_id: SessionId,
        /// Length of the full reply in characters
        total_length: usize,
    },
    /// Failure or cancellation
    Error {
        /// Canonical error kind
        kind: ErrorKind,
        /// Detail
        message: String,
    },
}

impl SseEvent {
    /// Render as an SSE frame, blank line included
    #[must_use]
    pub fn to_frame(&self) -> String {
        // Serializing plain strings and integers cannot fail
        let json = serde_json::to_string(self).unwrap_or_default();
        format!("data: {json}\n\n")
    }
}

/// Sink producing SSE frames for one session
#[derive(Debug)]
pub struct SseSink {
    session_id: SessionId,
    model: String,
    total_length: AtomicUsize,
    tx: mpsc::Sender<String>,
}

impl SseSink {
    /// Create a sink for `session_id` replying with `model`
    pub fn new(session_id: SessionId, model: impl Into<String>, tx: mpsc::Sender<String>) -> Self {
        Self {
            session_id,
            model: model.into(),
            total_length: AtomicUsize::new(0),
            tx,
        }
    }

    fn render(&self, event: TokenEvent) -> SseEvent {
        match event {
            TokenEvent::Fragment { text } => {
                self.total_length
                    .fetch_add(text.chars().count(), Ordering::Relaxed);
                SseEvent::Token {
                    token: text,
                    session_id: self.session_id.clone(),
                }
            }
            TokenEvent::End => SseEvent::Done {
                model: self.model.clone(),
                session_id: self.session_id.clone(),
                total_length: self.total_length.load(Ordering::Relaxed),
            },
            TokenEvent::Error { kind, message } => SseEvent::Error { kind, message },
        }
    }
}

#[async_trait]
impl TokenSink for SseSink {
    async fn emit(&self, event: TokenEvent) -> Result<(), SinkError> {
        // Reserve first so a dropped emit neither sends nor counts
        let permit = self.tx.reserve().await.map_err(|_| SinkError::Closed)?;
        permit.send(self.render(event).to_frame());
        Ok(())
    }
}
