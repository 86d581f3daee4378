//! JSON-lines history store
//!
//! Each session is a file `<dir>/<session_id>.jsonl` holding one serialized
//! [`Turn`] per line. Appends open the file in append mode and flush before
//! returning, so committed turns survive a restart.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{HistoryError, HistoryStore, Turn};
use crate::messages::SessionId;

/// Longest session id accepted as a file stem
const MAX_SESSION_ID_LEN: usize = 128;

/// File-backed history store
#[derive(Debug, Clone)]
pub struct JsonlHistoryStore {
    dir: PathBuf,
}

impl JsonlHistoryStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| HistoryError::Io {
                path: dir.clone(),
                source,
            })?;
        tracing::info!(dir = %dir.display(), "Opened JSONL history store");
        Ok(Self { dir })
    }

    /// Directory holding the session files
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file for a session
    ///
    /// Only ids made of ASCII alphanumerics, `-` and `_` are accepted so an
    /// id can never escape the store directory.
    fn session_path(&self, session_id: &SessionId) -> Result<PathBuf, HistoryError> {
        let id = session_id.as_str();
        let valid = !id.is_empty()
            && id.len() <= MAX_SESSION_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(HistoryError::InvalidSessionId(id.to_string()));
        }
        Ok(self.dir.join(format!("{id}.jsonl")))
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    fn name(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, session_id: &SessionId, turn: Turn) -> Result<(), HistoryError> {
        let path = self.session_path(session_id)?;
        let mut line = serde_json::to_string(&turn)?;
        line.push('\n');

        let io_err = |source| HistoryError::Io {
            path: path.clone(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(io_err)?;
        file.write_all(line.as_bytes()).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        Ok(())
    }

    async fn read(&self, session_id: &SessionId) -> Result<Vec<Turn>, HistoryError> {
        let path = self.session_path(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(HistoryError::Io { path, source }),
        };

        let mut turns = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Turn>(line) {
                Ok(turn) => turns.push(turn),
                Err(e) => {
                    // A torn final write leaves a partial line behind
                    tracing::warn!(
                        path = %path.display(),
                        line = line_no + 1,
                        error = %e,
                        "Skipping unreadable history line"
                    );
                }
            }
        }
        Ok(turns)
    }

    async fn contains(&self, session_id: &SessionId) -> Result<bool, HistoryError> {
        let path = self.session_path(session_id)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len() > 0),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(source) => Err(HistoryError::Io { path, source }),
        }
    }

    async fn remove(&self, session_id: &SessionId) -> Result<bool, HistoryError> {
        let path = self.session_path(session_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(source) => Err(HistoryError::Io { path, source }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::TurnStatus;
    use crate::messages::Generation;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
        let id = SessionId::from("session-1");

        store.append(&id, Turn::user("hello", Generation(1))).await.unwrap();
        store
            .append(
                &id,
                Turn::assistant(
                    vec!["Hi".into(), " there".into()],
                    "gpt-4o-mini",
                    TurnStatus::Completed,
                    Generation(1),
                ),
            )
            .await
            .unwrap();

        let turns = store.read(&id).await.unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].text(), "hello");
        assert_eq!(turns[1].content, vec!["Hi".to_string(), " there".to_string()]);
        assert!(store.contains(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = SessionId::from("persisted");
        {
            let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
            store.append(&id, Turn::user("kept", Generation(1))).await.unwrap();
        }
        let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
        let turns = store.read(&id).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].text(), "kept");
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
        let id = SessionId::from("../escape");
        let err = store.read(&id).await.unwrap_err();
        assert!(matches!(err, HistoryError::InvalidSessionId(_)));
    }

    #[tokio::test]
    async fn test_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
        let id = SessionId::from("torn");
        store.append(&id, Turn::user("ok", Generation(1))).await.unwrap();

        let path = dir.path().join("torn.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{\"role\":\"assis");
        std::fs::write(&path, content).unwrap();

        let turns = store.read(&id).await.unwrap();
        assert_eq!(turns.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_missing_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::open(dir.path()).await.unwrap();
        let id = SessionId::from("nothing");
        assert!(!store.remove(&id).await.unwrap());
        assert!(!store.contains(&id).await.unwrap());
        assert!(store.read(&id).await.unwrap().is_empty());
    }
}
