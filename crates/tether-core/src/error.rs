use thiserror::Error;

use crate::backend::BackendError;
use crate::domain::aggregator::AggregationError;
use crate::domain::observable::StreamError;
use crate::domain::runtime::SessionError;
use crate::domain::session::TranscriptStoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    TranscriptStore(#[from] TranscriptStoreError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Tracing setup failed: {0}")]
    Tracing(String),
}
