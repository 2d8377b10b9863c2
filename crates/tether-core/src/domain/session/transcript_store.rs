use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::transcript::{Transcript, Turn};
use crate::domain::types::SessionId;

#[derive(Debug, Error)]
pub enum TranscriptStoreError {
    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Migration error: {message}")]
    Migration { message: String },

    #[error("In-memory store lock poisoned: {message}")]
    LockPoisoned { message: String },
}

impl TranscriptStoreError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn lock_poisoned(message: impl Into<String>) -> Self {
        Self::LockPoisoned {
            message: message.into(),
        }
    }
}

/// Durable, append-only record of turns keyed by `(session_id, turn_id)`.
///
/// Appending a turn whose id is already stored replaces that record in
/// place; turn order is the order of first append.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn append(&self, session_id: &SessionId, turn: &Turn)
    -> Result<(), TranscriptStoreError>;

    async fn read_all(&self, session_id: &SessionId) -> Result<Transcript, TranscriptStoreError>;

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), TranscriptStoreError>;

    async fn list_session_ids(&self) -> Result<Vec<SessionId>, TranscriptStoreError>;
}

#[derive(Default)]
pub struct InMemoryTranscriptStore {
    sessions: RwLock<HashMap<SessionId, Transcript>>,
}

impl InMemoryTranscriptStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TranscriptStore for InMemoryTranscriptStore {
    async fn append(
        &self,
        session_id: &SessionId,
        turn: &Turn,
    ) -> Result<(), TranscriptStoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| TranscriptStoreError::lock_poisoned("sessions"))?;
        sessions
            .entry(session_id.clone())
            .or_default()
            .upsert(turn.clone());
        Ok(())
    }

    async fn read_all(&self, session_id: &SessionId) -> Result<Transcript, TranscriptStoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| TranscriptStoreError::lock_poisoned("sessions"))?;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), TranscriptStoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| TranscriptStoreError::lock_poisoned("sessions"))?;
        sessions.remove(session_id);
        Ok(())
    }

    async fn list_session_ids(&self) -> Result<Vec<SessionId>, TranscriptStoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| TranscriptStoreError::lock_poisoned("sessions"))?;
        let mut ids: Vec<SessionId> = sessions.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
