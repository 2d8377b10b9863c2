use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendRequest, GenerativeBackend};
use crate::domain::aggregator::Aggregator;
use crate::domain::delta::BackendEvent;
use crate::domain::observable::panic_message;
use crate::domain::types::{AggregationId, SessionId, TurnId};

pub(crate) const STREAM_ENDED_EARLY: &str = "stream ended without completion";

/// Identifies one running (or finished) aggregation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationHandle {
    pub session_id: SessionId,
    pub aggregation_id: AggregationId,
    /// The assistant turn the aggregation writes to.
    pub turn_id: TurnId,
}

/// The session's single writer slot.
pub(crate) struct ActiveAggregation {
    pub id: AggregationId,
    pub turn_index: usize,
    pub aggregator: Aggregator,
    pub cancel: CancellationToken,
}

/// A backend event tagged with the aggregation that produced it.
pub(crate) struct BackendMsg {
    pub aggregation_id: AggregationId,
    pub event: BackendEvent,
}

/// Pumps one backend stream into the session actor.
///
/// Always delivers exactly one terminal event unless cancelled or the
/// session has gone away: a failure to start, a panic and a stream that
/// ends early are all reported as `Failed`.
pub(crate) async fn drive_backend(
    aggregation_id: AggregationId,
    backend: Arc<dyn GenerativeBackend>,
    request: BackendRequest,
    cancel: CancellationToken,
    tx: mpsc::Sender<BackendMsg>,
) {
    let started = tokio::select! {
        biased;
        () = cancel.cancelled() => return,
        result = AssertUnwindSafe(backend.stream(request, cancel.clone())).catch_unwind() => result,
    };

    let mut stream = match started {
        Ok(Ok(stream)) => stream,
        Ok(Err(error)) => {
            let event = BackendEvent::failed(error.to_string());
            let _ = tx.send(BackendMsg { aggregation_id, event }).await;
            return;
        }
        Err(payload) => {
            let event = BackendEvent::failed(format!(
                "backend panicked: {}",
                panic_message(payload.as_ref())
            ));
            let _ = tx.send(BackendMsg { aggregation_id, event }).await;
            return;
        }
    };

    loop {
        let next = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = AssertUnwindSafe(stream.next()).catch_unwind() => next,
        };

        let event = match next {
            Ok(Some(event)) => event,
            Ok(None) => BackendEvent::failed(STREAM_ENDED_EARLY),
            Err(payload) => BackendEvent::failed(format!(
                "backend panicked: {}",
                panic_message(payload.as_ref())
            )),
        };

        let terminal = event.is_terminal();
        if tx.send(BackendMsg { aggregation_id, event }).await.is_err() || terminal {
            break;
        }
    }

    tracing::trace!(
        target: "tether::aggregation",
        aggregation_id = %aggregation_id,
        "Backend driver finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::delta::DeltaEvent;
    use crate::domain::transcript::{Channel, Transcript};
    use crate::test_utils::ScriptedBackend;

    fn request() -> BackendRequest {
        BackendRequest {
            session_id: SessionId::generate(),
            turn_id: TurnId::new(),
            transcript: Transcript::new(),
        }
    }

    async fn drain(mut rx: mpsc::Receiver<BackendMsg>) -> Vec<BackendEvent> {
        let mut events = Vec::new();
        while let Some(msg) = rx.recv().await {
            events.push(msg.event);
        }
        events
    }

    #[tokio::test]
    async fn reports_stream_that_ends_without_terminal_event() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            DeltaEvent::start(Channel::Text).into(),
            DeltaEvent::delta(Channel::Text, "partial").into(),
        ]));
        let (tx, rx) = mpsc::channel(8);

        drive_backend(
            AggregationId::new(),
            backend,
            request(),
            CancellationToken::new(),
            tx,
        )
        .await;

        let events = drain(rx).await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[2], BackendEvent::failed(STREAM_ENDED_EARLY));
    }

    #[tokio::test]
    async fn stops_after_terminal_event() {
        let backend = Arc::new(ScriptedBackend::new(vec![
            BackendEvent::Completed,
            DeltaEvent::start(Channel::Text).into(),
        ]));
        let (tx, rx) = mpsc::channel(8);

        drive_backend(
            AggregationId::new(),
            backend,
            request(),
            CancellationToken::new(),
            tx,
        )
        .await;

        assert_eq!(drain(rx).await, vec![BackendEvent::Completed]);
    }

    #[tokio::test]
    async fn sends_nothing_once_cancelled() {
        let backend = Arc::new(ScriptedBackend::new(vec![BackendEvent::Completed]));
        let (tx, rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        cancel.cancel();

        drive_backend(AggregationId::new(), backend, request(), cancel, tx).await;

        assert!(drain(rx).await.is_empty());
    }
}
