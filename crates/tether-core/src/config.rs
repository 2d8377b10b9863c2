use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::session::{InMemoryTranscriptStore, SqliteTranscriptStore, TranscriptStore};
use crate::error::{Error, Result};

pub const DEFAULT_OBSERVER_BUFFER: usize = 256;
pub const DEFAULT_DELTA_BUFFER: usize = 64;

/// Where transcripts are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PersistenceConfig {
    /// Nothing survives the process.
    Memory,
    /// SQLite database file
    Sqlite { path: PathBuf },
}

impl PersistenceConfig {
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::Sqlite { path: path.into() }
    }

    /// `~/.tether/sessions.db`
    pub fn default_sqlite() -> Result<Self> {
        let home_dir = dirs::home_dir().ok_or_else(|| {
            Error::Configuration("Could not determine home directory".to_string())
        })?;
        Ok(Self::sqlite(home_dir.join(".tether").join("sessions.db")))
    }

    pub async fn open(&self) -> Result<Arc<dyn TranscriptStore>> {
        match self {
            PersistenceConfig::Memory => Ok(Arc::new(InMemoryTranscriptStore::new())),
            PersistenceConfig::Sqlite { path } => {
                let store = SqliteTranscriptStore::new(path).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self::default_sqlite().unwrap_or_else(|_| Self::sqlite("./sessions.db"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of each channel-backed observer before it is dropped as lagged.
    pub observer_buffer: usize,
    /// Backend events queued between a backend and its session.
    pub delta_buffer: usize,
    pub persistence: PersistenceConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            observer_buffer: DEFAULT_OBSERVER_BUFFER,
            delta_buffer: DEFAULT_DELTA_BUFFER,
            persistence: PersistenceConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Default buffers with in-memory persistence.
    pub fn in_memory() -> Self {
        Self {
            persistence: PersistenceConfig::Memory,
            ..Self::default()
        }
    }

    pub fn with_observer_buffer(mut self, capacity: usize) -> Self {
        self.observer_buffer = capacity.max(1);
        self
    }

    pub fn with_delta_buffer(mut self, capacity: usize) -> Self {
        self.delta_buffer = capacity.max(1);
        self
    }

    pub fn with_persistence(mut self, persistence: PersistenceConfig) -> Self {
        self.persistence = persistence;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_sqlite_lives_under_tether_dir() {
        let config = PersistenceConfig::default_sqlite().expect("home dir");
        let PersistenceConfig::Sqlite { path } = config else {
            unreachable!("expected SQLite config")
        };
        let path = path.to_string_lossy();
        assert!(path.contains(".tether"));
        assert!(path.ends_with("sessions.db"));
    }

    #[test]
    fn deserializes_partial_runtime_config() {
        let config: RuntimeConfig = serde_json::from_value(serde_json::json!({
            "delta_buffer": 8,
            "persistence": { "type": "memory" }
        }))
        .expect("deserialize");

        assert_eq!(config.delta_buffer, 8);
        assert_eq!(config.observer_buffer, DEFAULT_OBSERVER_BUFFER);
        assert_eq!(config.persistence, PersistenceConfig::Memory);
    }

    #[test]
    fn builders_clamp_zero_capacity() {
        let config = RuntimeConfig::in_memory()
            .with_observer_buffer(0)
            .with_delta_buffer(0);
        assert_eq!(config.observer_buffer, 1);
        assert_eq!(config.delta_buffer, 1);
    }

    #[tokio::test]
    async fn opens_sqlite_store_at_configured_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("store.db");
        let store = PersistenceConfig::sqlite(&path)
            .open()
            .await
            .expect("open store");

        assert!(store.list_session_ids().await.expect("list").is_empty());
        assert!(path.exists());
    }
}
