//! Chat Sessions
//!
//! A session is a generation-counted state machine:
//!
//! ```text
//!            send (G+1)                 End / cancel / failure
//!   Idle ──────────────► Streaming(G) ─────────────────────────► Idle
//!    │                      │   ▲
//!    │                      └───┘ send supersedes G with G+1
//!    │ delete                   │ delete
//!    ▼                          ▼
//!  Closed ◄─────────────────────┘
//! ```
//!
//! Only the latest generation may commit turns. A superseded or deleted
//! attempt discards its output; a cancelled one commits what the sink
//! accepted.

mod manager;
mod state;

pub use manager::{
    Session, SessionHandle, SessionManager, SessionManagerConfig, DEFAULT_SYSTEM_PROMPT,
};
pub use state::{
    derive_title, HealthReport, HealthStatus, SessionMetadata, SessionState, SessionSummary,
    StreamOutcome, TITLE_MAX_CHARS,
};
