//! Cooperative cancellation for streaming attempts
//!
//! A [`CancelToken`] pairs a [`CancellationToken`] with the generation of
//! the attempt it guards and the reason it was cancelled. The canceller only
//! flips the token; adapters, the router and the session relay loop poll it
//! at every suspension point.

use std::sync::{Arc, OnceLock};

use tokio_util::sync::CancellationToken;

use crate::messages::Generation;

/// Why an attempt was cancelled
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit `cancel` from the caller
    Cancelled,
    /// A newer `send` replaced this attempt
    Superseded,
    /// The session was deleted
    Deleted,
    /// The sink stopped accepting events
    Disconnected,
}

impl CancelReason {
    /// Whether the attempt should still commit its partial turn
    ///
    /// Superseded and deleted attempts are stale; their output is discarded.
    #[must_use]
    pub fn commits_partial(self) -> bool {
        matches!(self, Self::Cancelled | Self::Disconnected)
    }
}

/// Cancellation handle for one streaming attempt
#[derive(Clone, Debug)]
pub struct CancelToken {
    generation: Generation,
    token: CancellationToken,
    reason: Arc<OnceLock<CancelReason>>,
}

impl CancelToken {
    /// Create a token for the given attempt generation
    #[must_use]
    pub fn new(generation: Generation) -> Self {
        Self {
            generation,
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    /// Token not tied to any session attempt
    #[must_use]
    pub fn detached() -> Self {
        Self::new(Generation::default())
    }

    /// Generation of the attempt this token guards
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Signal cancellation
    ///
    /// The first reason wins. Returns `true` if this call set the reason.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.token.cancel();
        first
    }

    /// Whether cancellation has been signaled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded by the first canceller
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.get().copied()
    }

    /// Resolves once cancellation is signaled
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
