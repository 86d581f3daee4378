//! Transport Sinks
//!
//! A [`TokenSink`] is where the session manager relays an attempt's events.
//! Each client-facing transport provides one:
//!
//! - [`ChannelSink`]: raw [`TokenEvent`]s over an mpsc channel
//! - [`SseSink`]: server-push `data: {...}\n\n` frames
//! - [`FrameSink`]: NDJSON [`ServerFrame`]s for the bidirectional socket
//!
//! # Cancel Safety
//!
//! The relay races every `emit` against the attempt's cancel token. A sink
//! must therefore be cancel-safe: if the `emit` future is dropped before it
//! completes, nothing was delivered. Sinks built on `mpsc::Sender::send`
//! have this property.

mod frame;
mod sse;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::messages::TokenEvent;

pub use frame::{ClientFrame, FrameSink, ServerFrame};
pub use sse::{SseEvent, SseSink};

/// Errors returned by a sink
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The client went away
    #[error("Sink closed")]
    Closed,
}

/// Destination for one attempt's events
#[async_trait]
pub trait TokenSink: Send + Sync {
    /// Deliver one event
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Closed`] when the client is gone; the session
    /// manager treats that as cancellation of the attempt.
    async fn emit(&self, event: TokenEvent) -> Result<(), SinkError>;
}

/// Sink that forwards events unchanged over a channel
#[derive(Clone, Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<TokenEvent>,
}

impl ChannelSink {
    /// Wrap a sender
    #[must_use]
    pub fn new(tx: mpsc::Sender<TokenEvent>) -> Self {
        Self { tx }
    }

    /// Create a sink and the receiver its events arrive on
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<TokenEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TokenSink for ChannelSink {
    async fn emit(&self, event: TokenEvent) -> Result<(), SinkError> {
        let permit = self.tx.reserve().await.map_err(|_| SinkError::Closed)?;
        permit.send(event);
        Ok(())
    }
}
