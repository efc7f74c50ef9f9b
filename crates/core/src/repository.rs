//! Session repository: optional persistence for session history.
//!
//! The core never owns a storage backend. It saves the history after each
//! finished turn together with the context manager's removed-message count,
//! so a backend can store incrementally, and loads it back on re-attach.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::error::RepositoryError;
use crate::history::History;

/// What a repository hands back on load.
#[derive(Debug, Clone, Default)]
pub struct StoredSession {
    pub history: History,
    pub removed_count: u64,
}

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn save(
        &self,
        session_id: &str,
        history: &History,
        removed_count: u64,
    ) -> Result<(), RepositoryError>;

    /// `Ok(None)` when nothing is stored for the id.
    async fn load(&self, session_id: &str) -> Result<Option<StoredSession>, RepositoryError>;

    async fn delete(&self, session_id: &str) -> Result<bool, RepositoryError>;
}

/// A repository that keeps everything in process memory.
#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<String, StoredSession>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn save(
        &self,
        session_id: &str,
        history: &History,
        removed_count: u64,
    ) -> Result<(), RepositoryError> {
        self.sessions.write().await.insert(
            session_id.to_string(),
            StoredSession {
                history: history.clone(),
                removed_count,
            },
        );
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<StoredSession>, RepositoryError> {
        Ok(self.sessions.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, RepositoryError> {
        Ok(self.sessions.write().await.remove(session_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[tokio::test]
    async fn save_and_load() {
        let repo = InMemorySessionRepository::new();
        let mut history = History::new();
        history.push(Message::user("hello"));
        history.push(Message::assistant("hi"));

        repo.save("s1", &history, 3).await.unwrap();
        let stored = repo.load("s1").await.unwrap().unwrap();
        assert_eq!(stored.history.len(), 2);
        assert_eq!(stored.removed_count, 3);
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let repo = InMemorySessionRepository::new();
        assert!(repo.load("nope").await.unwrap().is_none());
        assert!(repo.is_empty().await);
    }

    #[tokio::test]
    async fn save_overwrites_and_delete_removes() {
        let repo = InMemorySessionRepository::new();
        repo.save("s1", &History::new(), 0).await.unwrap();
        let mut history = History::new();
        history.push(Message::user("later"));
        repo.save("s1", &history, 1).await.unwrap();
        assert_eq!(repo.len().await, 1);
        assert_eq!(repo.load("s1").await.unwrap().unwrap().history.len(), 1);

        assert!(repo.delete("s1").await.unwrap());
        assert!(!repo.delete("s1").await.unwrap());
    }
}
