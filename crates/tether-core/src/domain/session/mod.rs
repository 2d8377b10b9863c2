pub mod sqlite_transcript_store;
pub mod transcript_store;

pub use sqlite_transcript_store::SqliteTranscriptStore;
pub use transcript_store::{InMemoryTranscriptStore, TranscriptStore, TranscriptStoreError};
