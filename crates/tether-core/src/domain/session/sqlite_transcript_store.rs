use async_trait::async_trait;
use sqlx::{
    Row,
    sqlite::{
        SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
    },
};
use std::path::Path;
use std::str::FromStr;

use super::transcript_store::{TranscriptStore, TranscriptStoreError};
use crate::domain::transcript::{Transcript, Turn};
use crate::domain::types::SessionId;

/// SQLite-backed transcript persistence: one row per turn, JSON encoded.
pub struct SqliteTranscriptStore {
    pool: SqlitePool,
}

impl SqliteTranscriptStore {
    pub async fn new(path: &Path) -> Result<Self, TranscriptStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TranscriptStoreError::connection(format!("Failed to create directory: {e}"))
            })?;
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| TranscriptStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true);

        Self::connect(options).await
    }

    pub async fn new_in_memory() -> Result<Self, TranscriptStoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| TranscriptStoreError::connection(format!("Invalid SQLite path: {e}")))?
            .foreign_keys(true);

        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, TranscriptStoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| {
                TranscriptStoreError::connection(format!("Failed to connect to SQLite: {e}"))
            })?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), TranscriptStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TranscriptStoreError::Migration {
            message: format!("Failed to create sessions table: {e}"),
        })?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS turns (
                session_id TEXT NOT NULL,
                turn_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                role TEXT NOT NULL,
                status TEXT NOT NULL,
                turn_data TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (session_id, turn_id),
                FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TranscriptStoreError::Migration {
            message: format!("Failed to create turns table: {e}"),
        })?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_turns_session_position
            ON turns(session_id, position)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| TranscriptStoreError::Migration {
            message: format!("Failed to create index: {e}"),
        })?;

        Ok(())
    }
}

#[async_trait]
impl TranscriptStore for SqliteTranscriptStore {
    async fn append(
        &self,
        session_id: &SessionId,
        turn: &Turn,
    ) -> Result<(), TranscriptStoreError> {
        let turn_data = serde_json::to_string(turn).map_err(|e| {
            TranscriptStoreError::serialization(format!("Failed to serialize turn: {e}"))
        })?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| TranscriptStoreError::database(format!("Failed to begin: {e}")))?;

        sqlx::query("INSERT OR IGNORE INTO sessions (id) VALUES (?1)")
            .bind(session_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| TranscriptStoreError::database(format!("Failed to create session: {e}")))?;

        let next_position: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM turns WHERE session_id = ?1",
        )
        .bind(session_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| TranscriptStoreError::database(format!("Failed to get next position: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO turns (session_id, turn_id, position, role, status, turn_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (session_id, turn_id) DO UPDATE SET
                status = excluded.status,
                turn_data = excluded.turn_data,
                updated_at = datetime('now')
            "#,
        )
        .bind(session_id.as_str())
        .bind(turn.id.to_string())
        .bind(next_position)
        .bind(turn.role.to_string())
        .bind(turn.status.to_string())
        .bind(&turn_data)
        .execute(&mut *tx)
        .await
        .map_err(|e| TranscriptStoreError::database(format!("Failed to append turn: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| TranscriptStoreError::database(format!("Failed to commit: {e}")))?;

        Ok(())
    }

    async fn read_all(&self, session_id: &SessionId) -> Result<Transcript, TranscriptStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT turn_data
            FROM turns
            WHERE session_id = ?1
            ORDER BY position ASC
            "#,
        )
        .bind(session_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TranscriptStoreError::database(format!("Failed to load turns: {e}")))?;

        let mut turns = Vec::with_capacity(rows.len());
        for row in rows {
            let turn_data: String = row.get("turn_data");
            let turn: Turn = serde_json::from_str(&turn_data).map_err(|e| {
                TranscriptStoreError::serialization(format!("Invalid turn data: {e}"))
            })?;
            turns.push(turn);
        }

        Ok(Transcript::from_turns(turns))
    }

    async fn delete_session(&self, session_id: &SessionId) -> Result<(), TranscriptStoreError> {
        sqlx::query("DELETE FROM sessions WHERE id = ?1")
            .bind(session_id.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| TranscriptStoreError::database(format!("Failed to delete session: {e}")))?;
        Ok(())
    }

    async fn list_session_ids(&self) -> Result<Vec<SessionId>, TranscriptStoreError> {
        let rows = sqlx::query("SELECT id FROM sessions ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TranscriptStoreError::database(format!("Failed to list sessions: {e}")))?;

        Ok(rows
            .into_iter()
            .filter_map(|row| SessionId::parse(row.get::<String, _>("id")))
            .collect())
    }
}
