use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::domain::delta::BackendEvent;
use crate::domain::transcript::Transcript;
use crate::domain::types::{SessionId, TurnId};

pub mod echo;

pub use echo::EchoBackend;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("Backend unavailable: {message}")]
    Unavailable { message: String },

    #[error("Request rejected: {message}")]
    InvalidRequest { message: String },

    #[error("Request cancelled")]
    Cancelled,
}

/// Everything a backend needs to produce one assistant turn.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub session_id: SessionId,
    /// The assistant turn being generated.
    pub turn_id: TurnId,
    /// Transcript up to and including the latest user turn.
    pub transcript: Transcript,
}

pub type BackendStream = Pin<Box<dyn Stream<Item = BackendEvent> + Send>>;

/// A generative capability: given a transcript, an async sequence of delta
/// events ending in exactly one terminal event.
#[async_trait]
pub trait GenerativeBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Starts generation. Implementations should stop producing events once
    /// `cancel` fires; events produced afterwards are discarded anyway.
    async fn stream(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<BackendStream, BackendError>;
}
