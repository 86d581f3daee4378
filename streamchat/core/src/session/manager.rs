//! Session Manager
//!
//! Owns one state machine per session and mediates every streaming attempt:
//! admission, supersede/cancel, relay to the sink and history commits.
//!
//! # Attempt Lifecycle
//!
//! ```text
//! send ──> rate limit ──> validate ──> resolve model ──> locate session
//!                                                              │
//!          ┌───────────────── begin (session lock) ◄───────────┘
//!          │  generation += 1, supersede active, Streaming(G)
//!          ▼
//!   wait for predecessor ──> build context ──> router.stream
//!                                                   │
//!          ┌────────────── relay loop (no lock) ◄───┘
//!          │  fragment -> sink, charge token_cost
//!          ▼
//!   commit (session lock) ──> Idle ──> release successor ──> terminal event
//! ```
//!
//! The session lock is only held for the short transitions (begin, commit,
//! cancel, delete). Each attempt waits for its predecessor to finish before
//! reading history, so commits land in generation order. Terminal events are
//! sent after the commit and are bounded by `terminal_emit_timeout`, so a
//! client that stopped reading never holds up the next attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::state::{HealthReport, SessionMetadata, SessionState, SessionSummary, StreamOutcome};
use crate::backend::{ChatMessage, ConversationContext};
use crate::cancel::{CancelReason, CancelToken};
use crate::error::{ChatError, ErrorKind};
use crate::history::{HistoryError, HistoryStore, Turn, TurnStatus};
use crate::messages::{
    CallerKey, ChatRequest, Generation, MessageRole, ModelInfo, SessionId, TokenEvent,
};
use crate::rate_limit::{RateLimitResult, RateLimiter};
use crate::routing::{ModelRouter, RoutedStream};
use crate::transport::TokenSink;

/// Default system prompt
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are StreamChat AI, a helpful and knowledgeable assistant. \
Provide clear, accurate, and concise responses. Be conversational and engaging.";

/// Rate limiter cost of admitting one send
const SEND_COST: f64 = 1.0;

/// Accepted sampling temperature range
const MIN_TEMPERATURE: f32 = 0.0;
const MAX_TEMPERATURE: f32 = 2.0;

// ============================================================================
// Configuration
// ============================================================================

/// Session manager settings
#[derive(Clone, Debug, PartialEq)]
pub struct SessionManagerConfig {
    /// System prompt prepended to every context
    pub system_prompt: Option<String>,
    /// Prior turns included in the context
    pub context_window: usize,
    /// Idle sessions older than this are evicted from memory
    pub idle_timeout: Duration,
    /// Longest accepted user message, in characters
    pub max_message_length: usize,
    /// Create unknown sessions on `send` instead of rejecting
    pub auto_create_sessions: bool,
    /// How often the janitor runs
    pub janitor_interval: Duration,
    /// Longest wait for the sink to take a terminal event
    pub terminal_emit_timeout: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            system_prompt: Some(DEFAULT_SYSTEM_PROMPT.to_string()),
            context_window: 20,
            idle_timeout: Duration::from_secs(3600),
            max_message_length: 32768,
            auto_create_sessions: true,
            janitor_interval: Duration::from_secs(60),
            terminal_emit_timeout: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Shared handle to a session
pub type SessionHandle = Arc<Session>;

/// One conversation
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    inner: Mutex<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    generation: Generation,
    active: Option<CancelToken>,
    metadata: SessionMetadata,
    last_activity: Instant,
    /// Resolves when the most recent attempt has finished
    last_attempt: Option<oneshot::Receiver<()>>,
    /// Generation and metadata were restored from stored history
    restored: bool,
}

impl Session {
    fn new(id: SessionId) -> Self {
        Self {
            id,
            inner: Mutex::new(SessionInner {
                state: SessionState::Idle,
                generation: Generation::default(),
                active: None,
                metadata: SessionMetadata::new(),
                last_activity: Instant::now(),
                last_attempt: None,
                restored: false,
            }),
        }
    }

    /// Session id
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Latest generation issued
    pub async fn generation(&self) -> Generation {
        self.inner.lock().await.generation
    }

    /// Snapshot for listings
    pub async fn summary(&self) -> SessionSummary {
        let inner = self.inner.lock().await;
        SessionSummary {
            session_id: self.id.clone(),
            state: inner.state,
            generation: inner.generation,
            metadata: inner.metadata.clone(),
        }
    }
}

/// State handed from `begin` to the rest of an attempt
struct Attempt {
    generation: Generation,
    cancel: CancelToken,
    predecessor: Option<oneshot::Receiver<()>>,
    /// Dropped once the attempt has committed, releasing the successor
    done: oneshot::Sender<()>,
}

/// How the relay loop stopped
enum Relay {
    Ended,
    Cancelled,
    Failed { kind: ErrorKind, message: String },
}

// ============================================================================
// Manager
// ============================================================================

/// Coordinates sessions, routing, rate limiting and history
pub struct SessionManager {
    sessions: DashMap<SessionId, SessionHandle>,
    router: ModelRouter,
    limiter: Arc<RateLimiter>,
    history: Arc<dyn HistoryStore>,
    config: SessionManagerConfig,
}

impl SessionManager {
    /// Create a manager
    pub fn new(
        router: ModelRouter,
        limiter: Arc<RateLimiter>,
        history: Arc<dyn HistoryStore>,
        config: SessionManagerConfig,
    ) -> Self {
        tracing::info!(
            history = history.name(),
            context_window = config.context_window,
            auto_create = config.auto_create_sessions,
            "Session manager ready"
        );
        Self {
            sessions: DashMap::new(),
            router,
            limiter,
            history,
            config,
        }
    }

    /// Settings in use
    #[must_use]
    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    /// The router
    #[must_use]
    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// The rate limiter
    #[must_use]
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Number of sessions held in memory
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Get or create a session
    ///
    /// Calling this twice with the same id returns the same session.
    pub fn open_session(&self, id: impl Into<SessionId>) -> SessionHandle {
        let id = id.into();
        let session = self.sessions.entry(id.clone()).or_insert_with(|| {
            tracing::debug!(session_id = %id, "Opening session");
            Arc::new(Session::new(id))
        });
        Arc::clone(session.value())
    }

    fn get(&self, id: &SessionId) -> Option<SessionHandle> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    fn locate(&self, id: Option<SessionId>) -> Result<SessionHandle, ChatError> {
        match id {
            None => Ok(self.open_session(SessionId::new())),
            Some(id) if self.config.auto_create_sessions => Ok(self.open_session(id)),
            Some(id) => self
                .get(&id)
                .ok_or(ChatError::SessionNotFound { session_id: id }),
        }
    }

    fn validate(&self, request: &ChatRequest) -> Result<(), ChatError> {
        let message = request.message.as_str();
        if message.trim().is_empty() {
            return Err(ChatError::InvalidRequest(
                "message must not be empty".to_string(),
            ));
        }
        if message.chars().count() > self.config.max_message_length {
            return Err(ChatError::InvalidRequest(format!(
                "message exceeds {} characters",
                self.config.max_message_length
            )));
        }
        if let Some(temperature) = request.temperature {
            if !(MIN_TEMPERATURE..=MAX_TEMPERATURE).contains(&temperature) {
                return Err(ChatError::InvalidRequest(format!(
                    "temperature must be between {MIN_TEMPERATURE} and {MAX_TEMPERATURE}"
                )));
            }
        }
        if request.max_tokens == Some(0) {
            return Err(ChatError::InvalidRequest(
                "max_tokens must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Continue numbering and metadata from stored history
    ///
    /// A session recreated after eviction (or a daemon restart with a
    /// persistent store) must not reuse generations its history already has.
    async fn restore(&self, session: &Session) -> Result<(), ChatError> {
        let mut inner = session.inner.lock().await;
        if inner.restored {
            return Ok(());
        }

        let stored = self.history.read(&session.id).await?;
        if let Some(last) = stored.iter().map(|t| t.generation).max() {
            if last > inner.generation {
                inner.generation = last;
            }
            if let Some(first) = stored.iter().find(|t| t.role == MessageRole::User) {
                inner.metadata.title_from(&first.text());
            }
            inner.metadata.turn_count = stored.len();
            tracing::debug!(
                session_id = %session.id,
                generation = last.0,
                turns = stored.len(),
                "Restored session from history"
            );
        }
        inner.restored = true;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Send
    // ------------------------------------------------------------------------

    /// Stream a reply to `request` into `sink`
    ///
    /// # Errors
    ///
    /// Rejections before streaming: `RateLimited`, `InvalidRequest`,
    /// `SessionNotFound`, `UnknownModel`. After streaming began:
    /// `ProviderUnavailable` (nothing committed), `ProviderInterrupted`
    /// (failed partial turn committed) or `History`.
    pub async fn send(
        &self,
        caller: &CallerKey,
        request: ChatRequest,
        sink: &dyn TokenSink,
    ) -> Result<StreamOutcome, ChatError> {
        if let RateLimitResult::Rejected { retry_after } =
            self.limiter.check(caller.as_str(), SEND_COST, Instant::now())
        {
            tracing::warn!(caller = %caller, "Send rejected by rate limiter");
            return Err(ChatError::RateLimited { retry_after });
        }

        self.validate(&request)?;
        let model = self.router.resolve(request.model.as_deref())?.model.clone();
        let session = self.locate(request.session_id.clone())?;
        self.restore(&session).await?;

        let attempt = Self::begin(&session).await?;
        let generation = attempt.generation;
        tracing::debug!(
            session_id = %session.id,
            generation = generation.0,
            model = %model,
            "Attempt started"
        );

        let result = self
            .run_attempt(caller, &session, attempt, &model, &request, sink)
            .await;
        if result.is_err() {
            Self::finish(&session, generation).await;
        }
        result
    }

    /// Enter `Streaming(G)` and supersede any active attempt
    async fn begin(session: &Session) -> Result<Attempt, ChatError> {
        let mut inner = session.inner.lock().await;
        if inner.state == SessionState::Closed {
            return Err(ChatError::SessionNotFound {
                session_id: session.id.clone(),
            });
        }

        let generation = inner.generation.next();
        inner.generation = generation;

        if let Some(previous) = inner.active.take() {
            if previous.cancel(CancelReason::Superseded) {
                tracing::debug!(
                    session_id = %session.id,
                    superseded = previous.generation().0,
                    by = generation.0,
                    "Superseding active attempt"
                );
            }
        }

        let cancel = CancelToken::new(generation);
        inner.active = Some(cancel.clone());
        inner.state = SessionState::Streaming(generation);
        inner.metadata.touch();
        inner.last_activity = Instant::now();

        let (done_tx, done_rx) = oneshot::channel();
        let predecessor = inner.last_attempt.replace(done_rx);

        Ok(Attempt {
            generation,
            cancel,
            predecessor,
            done: done_tx,
        })
    }

    /// Return to Idle if `generation` is still the streaming attempt
    async fn finish(session: &Session, generation: Generation) {
        let mut inner = session.inner.lock().await;
        if inner.state == SessionState::Streaming(generation) {
            inner.state = SessionState::Idle;
            inner.active = None;
        }
        inner.last_activity = Instant::now();
    }

    async fn run_attempt(
        &self,
        caller: &CallerKey,
        session: &Session,
        attempt: Attempt,
        model: &str,
        request: &ChatRequest,
        sink: &dyn TokenSink,
    ) -> Result<StreamOutcome, ChatError> {
        let Attempt {
            generation,
            cancel,
            predecessor,
            done,
        } = attempt;
        let message = request.message.as_str();

        // Resolves (as Err) once the predecessor drops its sender
        if let Some(predecessor) = predecessor {
            let _ = predecessor.await;
        }

        let prior = self.history.read(&session.id).await?;
        let context = self.build_context(model, &prior, request);
        let mut stream = self.router.stream(model, &context, cancel.clone())?;

        let mut fragments = Vec::new();
        let relay = self
            .relay(caller, &mut stream, &cancel, sink, &mut fragments)
            .await;
        let served = stream.served_model();
        drop(stream);

        match relay {
            Relay::Ended => {
                let turn = Turn::assistant(fragments, served, TurnStatus::Completed, generation);
                let committed = self.commit(session, &cancel, message, &turn).await;
                drop(done);
                match committed {
                    Ok(Commit::Written) => {
                        self.emit_terminal(sink, TokenEvent::End, generation).await;
                        tracing::info!(
                            session_id = %session.id,
                            generation = generation.0,
                            model = turn.model.as_deref().unwrap_or_default(),
                            length = turn.text_len(),
                            "Attempt completed"
                        );
                        Ok(StreamOutcome::Completed { turn })
                    }
                    Ok(Commit::Stale { by }) => Ok(StreamOutcome::Superseded { by }),
                    Err(e) => {
                        self.emit_terminal(sink, TokenEvent::End, generation).await;
                        Err(e)
                    }
                }
            }
            Relay::Cancelled => {
                let reason = cancel.reason().unwrap_or(CancelReason::Cancelled);
                if !reason.commits_partial() {
                    drop(done);
                    let by = session.generation().await;
                    tracing::debug!(
                        session_id = %session.id,
                        generation = generation.0,
                        by = by.0,
                        reason = ?reason,
                        "Attempt discarded"
                    );
                    return Ok(StreamOutcome::Superseded { by });
                }

                let turn = Turn::assistant(fragments, served, TurnStatus::Cancelled, generation);
                let committed = self.commit(session, &cancel, message, &turn).await;
                drop(done);
                let stale = matches!(committed, Ok(Commit::Stale { .. }));
                if reason != CancelReason::Disconnected && !stale {
                    self.emit_terminal(sink, TokenEvent::cancelled(), generation)
                        .await;
                }

                match committed? {
                    Commit::Written => {
                        tracing::info!(
                            session_id = %session.id,
                            generation = generation.0,
                            reason = ?reason,
                            fragments = turn.content.len(),
                            "Attempt cancelled"
                        );
                        Ok(StreamOutcome::Cancelled { turn })
                    }
                    Commit::Stale { by } => Ok(StreamOutcome::Superseded { by }),
                }
            }
            Relay::Failed { kind, message: detail } => {
                if kind != ErrorKind::ProviderInterrupted {
                    drop(done);
                    self.emit_terminal(sink, TokenEvent::error(kind, detail.clone()), generation)
                        .await;
                    tracing::warn!(
                        session_id = %session.id,
                        generation = generation.0,
                        model = %model,
                        error = %detail,
                        "No provider available"
                    );
                    return Err(ChatError::ProviderUnavailable {
                        model: model.to_string(),
                        message: detail,
                    });
                }

                tracing::warn!(
                    session_id = %session.id,
                    generation = generation.0,
                    model = %served,
                    error = %detail,
                    "Provider interrupted after partial output"
                );
                let turn = Turn::assistant(fragments, served.clone(), TurnStatus::Failed, generation);
                let committed = self.commit(session, &cancel, message, &turn).await;
                drop(done);
                self.emit_terminal(sink, TokenEvent::error(kind, detail.clone()), generation)
                    .await;
                committed?;
                Err(ChatError::ProviderInterrupted {
                    model: served,
                    message: detail,
                })
            }
        }
    }

    /// Deliver a terminal event, giving up on a client that stopped reading
    ///
    /// The attempt has already committed, so a lost terminal event only
    /// affects that client.
    async fn emit_terminal(&self, sink: &dyn TokenSink, event: TokenEvent, generation: Generation) {
        match tokio::time::timeout(self.config.terminal_emit_timeout, sink.emit(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                tracing::debug!(generation = generation.0, "Sink closed before terminal event");
            }
            Err(_) => {
                tracing::warn!(
                    generation = generation.0,
                    timeout_ms = u64::try_from(self.config.terminal_emit_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                    "Client not reading, terminal event dropped"
                );
            }
        }
    }

    /// Relay routed events to the sink until a terminal condition
    ///
    /// `fragments` receives exactly the fragments the sink accepted.
    async fn relay(
        &self,
        caller: &CallerKey,
        stream: &mut RoutedStream,
        cancel: &CancelToken,
        sink: &dyn TokenSink,
        fragments: &mut Vec<String>,
    ) -> Relay {
        let token_cost = self.limiter.config().token_cost;
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Relay::Cancelled,
                event = stream.recv() => event,
            };

            match event {
                Some(TokenEvent::Fragment { text }) => {
                    let delivered = tokio::select! {
                        biased;
                        () = cancel.cancelled() => return Relay::Cancelled,
                        delivered = sink.emit(TokenEvent::fragment(text.as_str())) => delivered,
                    };
                    if delivered.is_err() {
                        tracing::warn!(
                            generation = cancel.generation().0,
                            "Sink closed mid-stream, cancelling attempt"
                        );
                        cancel.cancel(CancelReason::Disconnected);
                        return Relay::Cancelled;
                    }
                    self.limiter.charge(caller.as_str(), token_cost);
                    fragments.push(text);
                }
                Some(TokenEvent::End) => return Relay::Ended,
                Some(TokenEvent::Error {
                    kind: ErrorKind::Cancelled,
                    ..
                }) => return Relay::Cancelled,
                Some(TokenEvent::Error { kind, message }) => {
                    return Relay::Failed { kind, message };
                }
                None => {
                    let kind = if fragments.is_empty() {
                        ErrorKind::ProviderUnavailable
                    } else {
                        ErrorKind::ProviderInterrupted
                    };
                    return Relay::Failed {
                        kind,
                        message: "stream closed unexpectedly".to_string(),
                    };
                }
            }
        }
    }

    /// Append the user turn and `assistant` unless the attempt went stale
    async fn commit(
        &self,
        session: &Session,
        cancel: &CancelToken,
        message: &str,
        assistant: &Turn,
    ) -> Result<Commit, ChatError> {
        let mut inner = session.inner.lock().await;
        let stale = inner.state == SessionState::Closed
            || cancel.reason().is_some_and(|r| !r.commits_partial());
        if stale {
            return Ok(Commit::Stale {
                by: inner.generation,
            });
        }

        let generation = cancel.generation();
        let written = self
            .append_pair(&session.id, Turn::user(message, generation), assistant.clone())
            .await;

        if inner.state == SessionState::Streaming(generation) {
            inner.state = SessionState::Idle;
            inner.active = None;
        }
        inner.last_activity = Instant::now();
        inner.metadata.touch();

        match written {
            Ok(()) => {
                inner.metadata.turn_count += 2;
                inner.metadata.title_from(message);
                Ok(Commit::Written)
            }
            Err(e) => {
                tracing::error!(
                    session_id = %session.id,
                    generation = generation.0,
                    error = %e,
                    "Failed to commit turns"
                );
                Err(e.into())
            }
        }
    }

    async fn append_pair(
        &self,
        session_id: &SessionId,
        user: Turn,
        assistant: Turn,
    ) -> Result<(), HistoryError> {
        self.history.append(session_id, user).await?;
        self.history.append(session_id, assistant).await
    }

    /// System prompt, recent completed history, then the new message
    fn build_context(
        &self,
        model: &str,
        prior: &[Turn],
        request: &ChatRequest,
    ) -> ConversationContext {
        let mut context = ConversationContext::new(model);
        context.temperature = request.temperature;
        context.max_tokens = request.max_tokens;
        if let Some(ref prompt) = self.config.system_prompt {
            context = context.with_system(prompt.as_str());
        }

        let eligible: Vec<&Turn> = prior
            .iter()
            .filter(|t| t.role == MessageRole::User || t.status == TurnStatus::Completed)
            .collect();
        let start = eligible.len().saturating_sub(self.config.context_window);
        context.messages.extend(
            eligible[start..]
                .iter()
                .map(|t| ChatMessage::new(t.role, t.text())),
        );

        context.with_message(MessageRole::User, request.message.as_str())
    }

    // ------------------------------------------------------------------------
    // Cancel / Delete / Queries
    // ------------------------------------------------------------------------

    /// Cancel the streaming attempt of a session
    ///
    /// The session is Idle when this returns. The attempt itself winds down
    /// asynchronously and commits its partial turn.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for an unknown id.
    pub async fn cancel(&self, id: &SessionId) -> Result<bool, ChatError> {
        let session = self.get(id).ok_or_else(|| ChatError::SessionNotFound {
            session_id: id.clone(),
        })?;

        let mut inner = session.inner.lock().await;
        let SessionState::Streaming(generation) = inner.state else {
            return Ok(false);
        };
        if let Some(active) = inner.active.take() {
            active.cancel(CancelReason::Cancelled);
        }
        inner.state = SessionState::Idle;
        inner.last_activity = Instant::now();

        tracing::info!(session_id = %id, generation = generation.0, "Cancelled attempt");
        Ok(true)
    }

    /// Delete a session and its history
    ///
    /// Any active attempt is discarded.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is neither open nor stored, or a
    /// history error if removal fails.
    pub async fn delete_session(&self, id: &SessionId) -> Result<(), ChatError> {
        if let Some(session) = self.get(id) {
            let mut inner = session.inner.lock().await;
            if let Some(active) = inner.active.take() {
                active.cancel(CancelReason::Deleted);
            }
            inner.state = SessionState::Closed;
            self.history.remove(id).await?;
            self.sessions.remove(id);
        } else if !self.history.remove(id).await? {
            return Err(ChatError::SessionNotFound {
                session_id: id.clone(),
            });
        }

        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Committed turns in order; `limit` keeps only the newest turns
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the id is neither open nor stored.
    pub async fn get_history(
        &self,
        id: &SessionId,
        limit: Option<usize>,
    ) -> Result<Vec<Turn>, ChatError> {
        if !self.sessions.contains_key(id) && !self.history.contains(id).await? {
            return Err(ChatError::SessionNotFound {
                session_id: id.clone(),
            });
        }

        let mut turns = self.history.read(id).await?;
        if let Some(limit) = limit {
            let skip = turns.len().saturating_sub(limit);
            turns.drain(..skip);
        }
        Ok(turns)
    }

    /// Sessions held in memory, most recently active first
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut summaries = Vec::with_capacity(sessions.len());
        for session in sessions {
            summaries.push(session.summary().await);
        }
        summaries.sort_by(|a, b| b.metadata.last_active.cmp(&a.metadata.last_active));
        summaries
    }

    /// Routable models
    #[must_use]
    pub fn list_models(&self) -> Vec<ModelInfo> {
        self.router.list_models()
    }

    /// Check every provider and report them with the model list
    pub async fn health(&self) -> HealthReport {
        let providers = self.router.health().await;
        HealthReport::new(providers, self.list_models(), self.session_count())
    }

    // ------------------------------------------------------------------------
    // Eviction
    // ------------------------------------------------------------------------

    /// Drop Idle sessions inactive for longer than the idle timeout
    ///
    /// History is kept. Sessions whose lock is held are skipped.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let timeout = self.config.idle_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|id, session| {
            let Ok(inner) = session.inner.try_lock() else {
                return true;
            };
            let idle = inner.state == SessionState::Idle
                && now.saturating_duration_since(inner.last_activity) > timeout;
            if idle {
                tracing::debug!(session_id = %id, "Evicting idle session");
            }
            !idle
        });
        before.saturating_sub(self.sessions.len())
    }

    /// Periodically evict idle sessions and rate buckets
    pub fn spawn_janitor(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.janitor_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let sessions = manager.evict_idle(now);
                let buckets = manager.limiter.evict_idle(now);
                if sessions > 0 || buckets > 0 {
                    tracing::info!(sessions, buckets, "Janitor evicted idle state");
                }
            }
        })
    }
}

/// Result of a commit
enum Commit {
    Written,
    Stale { by: Generation },
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("history", &self.history.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ScriptedAdapter;
    use crate::history::InMemoryHistory;
    use crate::rate_limit::RateLimitConfig;
    use crate::transport::ChannelSink;
    use pretty_assertions::assert_eq;

    fn manager(adapter: Arc<ScriptedAdapter>, config: SessionManagerConfig) -> SessionManager {
        let router = ModelRouter::builder()
            .adapter(adapter)
            .route("test-model", "scripted")
            .default_model("test-model")
            .build()
            .unwrap();
        SessionManager::new(
            router,
            Arc::new(RateLimiter::new(RateLimitConfig::default())),
            Arc::new(InMemoryHistory::new()),
            config,
        )
    }

    fn caller() -> CallerKey {
        CallerKey::new("tester")
    }

    #[test]
    fn test_open_session_idempotent() {
        let mgr = manager(
            Arc::new(ScriptedAdapter::echo("scripted")),
            SessionManagerConfig::default(),
        );
        let a = mgr.open_session("s1");
        let b = mgr.open_session("s1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.session_count(), 1);
    }

    #[tokio::test]
    async fn test_send_completes_and_commits() {
        let adapter = Arc::new(ScriptedAdapter::replying("scripted", &["Hel", "lo"]));
        let mgr = manager(adapter, SessionManagerConfig::default());
        let (sink, mut rx) = ChannelSink::channel(16);

        let outcome = mgr
            .send(&caller(), ChatRequest::new("hi").with_session("s1"), &sink)
            .await
            .unwrap();

        let turn = outcome.turn().unwrap();
        assert_eq!(turn.text(), "Hello");
        assert_eq!(turn.status, TurnStatus::Completed);
        assert_eq!(turn.model.as_deref(), Some("test-model"));

        assert_eq!(rx.recv().await, Some(TokenEvent::fragment("Hel")));
        assert_eq!(rx.recv().await, Some(TokenEvent::fragment("lo")));
        assert_eq!(rx.recv().await, Some(TokenEvent::End));

        let history = mgr.get_history(&SessionId::from("s1"), None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[0].text(), "hi");
        assert_eq!(mgr.open_session("s1").state().await, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_validation_rejects_empty_and_long() {
        let config = SessionManagerConfig {
            max_message_length: 5,
            ..SessionManagerConfig::default()
        };
        let adapter = Arc::new(ScriptedAdapter::echo("scripted"));
        let mgr = manager(adapter.clone(), config);
        let (sink, _rx) = ChannelSink::channel(4);

        let err = mgr.send(&caller(), ChatRequest::new("   "), &sink).await.unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));

        let err = mgr
            .send(&caller(), ChatRequest::new("too long"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidRequest(_)));
        assert_eq!(adapter.open_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_session_without_auto_create() {
        let config = SessionManagerConfig {
            auto_create_sessions: false,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(Arc::new(ScriptedAdapter::echo("scripted")), config);
        let (sink, _rx) = ChannelSink::channel(4);

        let err = mgr
            .send(&caller(), ChatRequest::new("hi").with_session("missing"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::SessionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_context_window_skips_unfinished_replies() {
        let adapter = Arc::new(ScriptedAdapter::echo("scripted"));
        let config = SessionManagerConfig {
            context_window: 3,
            ..SessionManagerConfig::default()
        };
        let mgr = manager(adapter, config);

        let prior = vec![
            Turn::user("one", Generation(1)),
            Turn::assistant(vec!["1".into()], "m", TurnStatus::Completed, Generation(1)),
            Turn::user("two", Generation(2)),
            Turn::assistant(vec!["2".into()], "m", TurnStatus::Cancelled, Generation(2)),
            Turn::user("three", Generation(3)),
        ];
        let context = mgr.build_context("test-model", &prior, &ChatRequest::new("four"));

        assert_eq!(context.system.as_deref(), Some(DEFAULT_SYSTEM_PROMPT));
        let texts: Vec<&str> = context.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["1", "two", "three", "four"]);
    }

    #[tokio::test]
    async fn test_sampling_options_reach_provider() {
        let adapter = Arc::new(ScriptedAdapter::echo("scripted"));
        let mgr = manager(adapter.clone(), SessionManagerConfig::default());
        let (sink, _rx) = ChannelSink::channel(16);

        let request = ChatRequest::new("warm")
            .with_session("t")
            .with_temperature(0.3)
            .with_max_tokens(64);
        mgr.send(&caller(), request, &sink).await.unwrap();

        let context = adapter.last_context().unwrap();
        assert_eq!(context.temperature, Some(0.3));
        assert_eq!(context.max_tokens, Some(64));

        for request in [
            ChatRequest::new("hot").with_temperature(2.5),
            ChatRequest::new("cold").with_temperature(-0.1),
            ChatRequest::new("mute").with_max_tokens(0),
        ] {
            let err = mgr.send(&caller(), request, &sink).await.unwrap_err();
            assert!(matches!(err, ChatError::InvalidRequest(_)));
        }
        assert_eq!(adapter.open_count(), 1);
    }

    #[tokio::test]
    async fn test_evicted_session_continues_generations() {
        let config = SessionManagerConfig {
            idle_timeout: Duration::from_secs(60),
            ..SessionManagerConfig::default()
        };
        let mgr = manager(Arc::new(ScriptedAdapter::echo("scripted")), config);
        let (sink, _rx) = ChannelSink::channel(64);
        for message in ["one", "two"] {
            mgr.send(&caller(), ChatRequest::new(message).with_session("e"), &sink)
                .await
                .unwrap();
        }

        assert_eq!(
            mgr.evict_idle(Instant::now() + Duration::from_secs(7200)),
            1
        );
        mgr.send(&caller(), ChatRequest::new("three").with_session("e"), &sink)
            .await
            .unwrap();

        let generations: Vec<u64> = mgr
            .get_history(&SessionId::from("e"), None)
            .await
            .unwrap()
            .iter()
            .map(|t| t.generation.0)
            .collect();
        assert_eq!(generations, vec![1, 1, 2, 2, 3, 3]);

        let summary = mgr.open_session("e").summary().await;
        assert_eq!(summary.generation, Generation(3));
        assert_eq!(summary.metadata.turn_count, 6);
        assert_eq!(summary.metadata.title.as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_rejected_model_leaves_no_session() {
        let mgr = manager(
            Arc::new(ScriptedAdapter::echo("scripted")),
            SessionManagerConfig::default(),
        );
        let (sink, _rx) = ChannelSink::channel(4);

        let err = mgr
            .send(
                &caller(),
                ChatRequest::new("hi").with_session("u").with_model("missing"),
                &sink,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::UnknownModel { .. }));
        assert_eq!(mgr.session_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_attempt_sets_no_title() {
        let adapter = Arc::new(ScriptedAdapter::refusing(
            "scripted",
            crate::backend::ProviderError::Timeout,
        ));
        let mgr = manager(adapter, SessionManagerConfig::default());
        let (sink, _rx) = ChannelSink::channel(4);

        let err = mgr
            .send(&caller(), ChatRequest::new("lost").with_session("n"), &sink)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::ProviderUnavailable { .. }));

        let summary = mgr.open_session("n").summary().await;
        assert_eq!(summary.metadata.title, None);
        assert_eq!(summary.metadata.turn_count, 0);
        assert_eq!(summary.state, SessionState::Idle);
    }

    #[tokio::test]
    async fn test_cancel_idle_and_unknown() {
        let mgr = manager(
            Arc::new(ScriptedAdapter::echo("scripted")),
            SessionManagerConfig::default(),
        );
        mgr.open_session("s1");
        assert!(!mgr.cancel(&SessionId::from("s1")).await.unwrap());
        assert!(matches!(
            mgr.cancel(&SessionId::from("nope")).await,
            Err(ChatError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_then_history_not_found() {
        let mgr = manager(
            Arc::new(ScriptedAdapter::echo("scripted")),
            SessionManagerConfig::default(),
        );
        let (sink, _rx) = ChannelSink::channel(16);
        mgr.send(&caller(), ChatRequest::new("hello").with_session("s1"), &sink)
            .await
            .unwrap();

        let id = SessionId::from("s1");
        mgr.delete_session(&id).await.unwrap();
        assert!(matches!(
            mgr.get_history(&id, None).await,
            Err(ChatError::SessionNotFound { .. })
        ));
        assert!(matches!(
            mgr.delete_session(&id).await,
            Err(ChatError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_history_limit_keeps_newest() {
        let mgr = manager(
            Arc::new(ScriptedAdapter::echo("scripted")),
            SessionManagerConfig::default(),
        );
        let (sink, _rx) = ChannelSink::channel(64);
        for message in ["a", "b"] {
            mgr.send(&caller(), ChatRequest::new(message).with_session("s1"), &sink)
                .await
                .unwrap();
        }

        let turns = mgr
            .get_history(&SessionId::from("s1"), Some(2))
            .await
            .unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text(), "b");
        assert_eq!(turns[0].generation, Generation(2));
    }

    #[tokio::test]
    async fn test_evict_idle_sessions() {
        let config = SessionManagerConfig {
            idle_timeout: Duration::from_secs(60),
            ..SessionManagerConfig::default()
        };
        let mgr = manager(Arc::new(ScriptedAdapter::echo("scripted")), config);
        mgr.open_session("s1");

        assert_eq!(mgr.evict_idle(Instant::now()), 0);
        assert_eq!(
            mgr.evict_idle(Instant::now() + Duration::from_secs(120)),
            1
        );
        assert_eq!(mgr.session_count(), 0);
    }

    #[tokio::test]
    async fn test_list_sessions_reports_title() {
        let mgr = manager(
            Arc::new(ScriptedAdapter::echo("scripted")),
            SessionManagerConfig::default(),
        );
        let (sink, _rx) = ChannelSink::channel(64);
        mgr.send(&caller(), ChatRequest::new("What is Rust?").with_session("s1"), &sink)
            .await
            .unwrap();

        let sessions = mgr.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].metadata.title.as_deref(), Some("What is Rust?"));
        assert_eq!(sessions[0].metadata.turn_count, 2);
        assert_eq!(sessions[0].generation, Generation(1));
    }
}
