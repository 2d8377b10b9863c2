use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{BackendError, BackendRequest, BackendStream, GenerativeBackend};
use crate::domain::delta::{BackendEvent, DeltaEvent};
use crate::domain::transcript::{Channel, Role};

/// Streams the latest user message back, one word per delta.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend {
    reasoning: bool,
    chunk_delay: Option<Duration>,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a short reasoning part before the text part.
    pub fn with_reasoning(mut self, reasoning: bool) -> Self {
        self.reasoning = reasoning;
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

/// Splits `text` into chunks that concatenate back to `text`.
fn word_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl GenerativeBackend for EchoBackend {
    fn name(&self) -> &'static str {
        "echo"
    }

    async fn stream(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<BackendStream, BackendError> {
        let prompt = request
            .transcript
            .turns()
            .iter()
            .rev()
            .find(|turn| turn.role == Role::User)
            .map(|turn| turn.text())
            .ok_or_else(|| BackendError::InvalidRequest {
                message: "transcript has no user turn".to_string(),
            })?;

        let reasoning = self.reasoning;
        let delay = self.chunk_delay;

        let stream = async_stream::stream! {
            if reasoning {
                yield BackendEvent::from(DeltaEvent::start(Channel::Reasoning));
                yield BackendEvent::from(DeltaEvent::delta(
                    Channel::Reasoning,
                    format!("Repeating {} characters.", prompt.chars().count()),
                ));
                yield BackendEvent::from(DeltaEvent::end(Channel::Reasoning));
            }

            yield BackendEvent::from(DeltaEvent::start(Channel::Text));
            for chunk in word_chunks(&prompt) {
                if let Some(delay) = delay {
                    tokio::select! {
                        () = cancel.cancelled() => return,
                        () = tokio::time::sleep(delay) => {}
                    }
                } else if cancel.is_cancelled() {
                    return;
                }
                yield BackendEvent::from(DeltaEvent::delta(Channel::Text, chunk));
            }
            yield BackendEvent::from(DeltaEvent::end(Channel::Text));
            yield BackendEvent::Completed;
        };

        Ok(Box::pin(stream))
    }
}
