//! Session state, metadata and attempt outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::history::Turn;
use crate::messages::{Generation, ModelInfo, SessionId};
use crate::routing::ProviderHealth;

/// Longest title kept before truncation
pub const TITLE_MAX_CHARS: usize = 50;

/// Lifecycle state of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No attempt in flight
    Idle,
    /// Attempt with this generation is streaming
    Streaming(Generation),
    /// Deleted; no further sends are accepted
    Closed,
}

impl SessionState {
    /// Whether an attempt is in flight
    #[must_use]
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

/// Descriptive data kept alongside a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// When the session was opened
    pub created_at: DateTime<Utc>,
    /// Last send or commit
    pub last_active: DateTime<Utc>,
    /// Derived from the first user message
    pub title: Option<String>,
    /// Turns committed through this session object
    pub turn_count: usize,
}

impl SessionMetadata {
    /// Fresh metadata stamped now
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_active: now,
            title: None,
            turn_count: 0,
        }
    }

    /// Mark the session active now
    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }

    /// Set the title from `message` unless one exists
    pub fn title_from(&mut self, message: &str) {
        if self.title.is_none() {
            self.title = Some(derive_title(message));
        }
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Trimmed message, cut to [`TITLE_MAX_CHARS`] with an ellipsis
#[must_use]
pub fn derive_title(message: &str) -> String {
    let message = message.trim();
    if message.chars().count() <= TITLE_MAX_CHARS {
        return message.to_string();
    }
    let mut title: String = message.chars().take(TITLE_MAX_CHARS).collect();
    title.push_str("...");
    title
}

/// Snapshot of one session for listings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id
    pub session_id: SessionId,
    /// Current state
    pub state: SessionState,
    /// Latest generation issued
    pub generation: Generation,
    /// Descriptive metadata
    #[serde(flatten)]
    pub metadata: SessionMetadata,
}

/// How a `send` ended when it did not fail
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Stream ended normally; the assistant turn was committed
    Completed {
        /// Committed assistant turn
        turn: Turn,
    },
    /// Caller cancelled; the partial assistant turn was committed
    Cancelled {
        /// Committed assistant turn (status `cancelled`)
        turn: Turn,
    },
    /// A newer attempt or a delete replaced this one; nothing was committed
    Superseded {
        /// Session generation at the time the attempt gave up
        by: Generation,
    },
}

impl StreamOutcome {
    /// The committed assistant turn, if any
    #[must_use]
    pub fn turn(&self) -> Option<&Turn> {
        match self {
            Self::Completed { turn } | Self::Cancelled { turn } => Some(turn),
            Self::Superseded { .. } => None,
        }
    }
}

/// Overall service condition derived from provider checks
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Every provider answered
    Ok,
    /// Some providers answered
    Degraded,
    /// No provider answered
    Down,
}

/// Provider reachability plus what the service currently offers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Overall condition
    pub status: HealthStatus,
    /// Per-adapter results, sorted by adapter name
    pub providers: Vec<ProviderHealth>,
    /// Routable models
    pub models: Vec<ModelInfo>,
    /// Sessions held in memory
    pub sessions: usize,
}

impl HealthReport {
    /// Build a report, deriving the overall status from `providers`
    #[must_use]
    pub fn new(providers: Vec<ProviderHealth>, models: Vec<ModelInfo>, sessions: usize) -> Self {
        let healthy = providers.iter().filter(|p| p.healthy).count();
        let status = if healthy == 0 {
            HealthStatus::Down
        } else if healthy == providers.len() {
            HealthStatus::Ok
        } else {
            HealthStatus::Degraded
        };
        Self {
            status,
            providers,
            models,
            sessions,
        }
    }
}
