//! In-memory history store

use async_trait::async_trait;
use dashmap::DashMap;

use super::{HistoryError, HistoryStore, Turn};
use crate::messages::SessionId;

/// Process-lifetime history backed by a concurrent map
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    sessions: DashMap<SessionId, Vec<Turn>>,
}

impl InMemoryHistory {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions with at least one turn
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, session_id: &SessionId, turn: Turn) -> Result<(), HistoryError> {
        self.sessions
            .entry(session_id.clone())
            .or_default()
            .push(turn);
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> Result<Vec<Turn>, HistoryError> {
        Ok(self
            .sessions
            .get(session_id)
            .map(|turns| turns.clone())
            .unwrap_or_default())
    }

    async fn contains(&self, session_id: &SessionId) -> Result<bool, HistoryError> {
        Ok(self.sessions.contains_key(session_id))
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, HistoryError> {
        Ok(self.sessions.remove(session_id).is_some())
    }
}
