//! Test backends for tether-core
//!
//! These are shared with the other workspace crates through the
//! `test-utils` feature.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendError, BackendRequest, BackendStream, GenerativeBackend};
use crate::domain::delta::{BackendEvent, DeltaEvent};
use crate::domain::transcript::Channel;

/// The events of a well-formed single text part followed by completion.
pub fn text_script(chunks: &[&str]) -> Vec<BackendEvent> {
    let mut events = vec![BackendEvent::from(DeltaEvent::start(Channel::Text))];
    events.extend(
        chunks
            .iter()
            .map(|chunk| BackendEvent::from(DeltaEvent::delta(Channel::Text, *chunk))),
    );
    events.push(DeltaEvent::end(Channel::Text).into());
    events.push(BackendEvent::Completed);
    events
}

/// Replays the same fixed event list for every request and records the
/// requests it received.
pub struct ScriptedBackend {
    events: Vec<BackendEvent>,
    start_error: Option<BackendError>,
    requests: Arc<Mutex<Vec<BackendRequest>>>,
}

impl ScriptedBackend {
    pub fn new(events: Vec<BackendEvent>) -> Self {
        Self {
            events,
            start_error: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A backend whose `stream` call itself fails.
    pub fn failing(error: BackendError) -> Self {
        Self {
            start_error: Some(error),
            ..Self::new(Vec::new())
        }
    }

    pub async fn requests(&self) -> Vec<BackendRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl GenerativeBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn stream(
        &self,
        request: BackendRequest,
        _cancel: CancellationToken,
    ) -> Result<BackendStream, BackendError> {
        self.requests.lock().await.push(request);
        if let Some(error) = &self.start_error {
            return Err(error.clone());
        }
        Ok(Box::pin(futures::stream::iter(self.events.clone())))
    }
}

/// One call to a [`GatedBackend`]; the test decides what the backend emits
/// and when.
pub struct BackendGate {
    pub request: BackendRequest,
    tx: mpsc::UnboundedSender<BackendEvent>,
    cancel: CancellationToken,
}

impl BackendGate {
    /// Releases one event. Returns false once the stream is no longer read.
    pub fn send(&self, event: impl Into<BackendEvent>) -> bool {
        self.tx.send(event.into()).is_ok()
    }

    pub fn send_all(&self, events: impl IntoIterator<Item = BackendEvent>) {
        for event in events {
            self.send(event);
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }
}

/// Backend whose output is released by the test through [`BackendGate`]s.
///
/// Dropping a gate ends its stream without a terminal event.
pub struct GatedBackend {
    gates: mpsc::UnboundedSender<BackendGate>,
}

impl GatedBackend {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<BackendGate>) {
        let (gates, gates_rx) = mpsc::unbounded_channel();
        (Self { gates }, gates_rx)
    }
}

#[async_trait]
impl GenerativeBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn stream(
        &self,
        request: BackendRequest,
        cancel: CancellationToken,
    ) -> Result<BackendStream, BackendError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.gates
            .send(BackendGate {
                request,
                tx,
                cancel,
            })
            .map_err(|_| BackendError::Unavailable {
                message: "gate receiver dropped".to_string(),
            })?;

        Ok(Box::pin(async_stream::stream! {
            while let Some(event) = rx.recv().await {
                yield event;
            }
        }))
    }
}
