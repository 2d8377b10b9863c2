use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendRequest, GenerativeBackend};
use crate::domain::aggregator::{AggregationError, Aggregator, Progress};
use crate::domain::delta::BackendEvent;
use crate::domain::observable::{Observer, StreamError, SubscriberList};
use crate::domain::session::{TranscriptStore, TranscriptStoreError};
use crate::domain::transcript::{Transcript, Turn};
use crate::domain::types::{AggregationId, SessionId, SubscriberId, TurnId};
use crate::domain::update::SessionUpdate;

use super::aggregation::{ActiveAggregation, AggregationHandle, BackendMsg, drive_backend};
use super::subscription::SessionObservable;

pub type UpdateObserver = Box<dyn Observer<SessionUpdate, StreamError>>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session {session_id} already has an active aggregation")]
    SessionBusy { session_id: SessionId },

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] TranscriptStoreError),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Session store shutting down")]
    ShuttingDown,
}

impl SessionError {
    pub fn is_busy(&self) -> bool {
        matches!(self, SessionError::SessionBusy { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub turn_count: usize,
    /// Whether an aggregation currently owns the transcript.
    pub busy: bool,
    pub subscribers: usize,
}

/// Result of a successful `send_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAccepted {
    pub user_turn: Turn,
    pub aggregation: AggregationHandle,
}

pub(crate) enum SessionCmd {
    Snapshot {
        reply: oneshot::Sender<Transcript>,
    },
    Summary {
        reply: oneshot::Sender<SessionSummary>,
    },
    AppendUserTurn {
        text: String,
        reply: oneshot::Sender<Result<Turn, SessionError>>,
    },
    StartAggregation {
        reply: oneshot::Sender<Result<AggregationHandle, SessionError>>,
    },
    SendMessage {
        text: String,
        reply: oneshot::Sender<Result<MessageAccepted, SessionError>>,
    },
    Attach {
        subscriber_id: SubscriberId,
        observer: UpdateObserver,
        terminated: Arc<AtomicBool>,
        until_idle: bool,
    },
    /// With an `attachment`, only that attachment is removed; a newer
    /// observer that reused the id stays.
    Detach {
        subscriber_id: SubscriberId,
        attachment: Option<Arc<AtomicBool>>,
        reply: Option<oneshot::Sender<bool>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap handle to one session actor.
///
/// The command channel is unbounded so observers can attach and detach from
/// synchronous code.
#[derive(Clone)]
pub(crate) struct SessionActorHandle {
    session_id: SessionId,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
}

impl SessionActorHandle {
    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> SessionCmd,
    ) -> Result<R, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .map_err(|_| SessionError::ChannelClosed)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)
    }

    pub async fn snapshot(&self) -> Result<Transcript, SessionError> {
        self.request(|reply| SessionCmd::Snapshot { reply }).await
    }

    pub async fn summary(&self) -> Result<SessionSummary, SessionError> {
        self.request(|reply| SessionCmd::Summary { reply }).await
    }

    pub async fn append_user_turn(&self, text: String) -> Result<Turn, SessionError> {
        self.request(|reply| SessionCmd::AppendUserTurn { text, reply })
            .await?
    }

    pub async fn start_aggregation(&self) -> Result<AggregationHandle, SessionError> {
        self.request(|reply| SessionCmd::StartAggregation { reply })
            .await?
    }

    pub async fn send_message(&self, text: String) -> Result<MessageAccepted, SessionError> {
        self.request(|reply| SessionCmd::SendMessage { text, reply })
            .await?
    }

    pub async fn detach(&self, subscriber_id: SubscriberId) -> Result<bool, SessionError> {
        self.request(|reply| SessionCmd::Detach {
            subscriber_id,
            attachment: None,
            reply: Some(reply),
        })
        .await
    }

    pub async fn cancel(&self) -> Result<bool, SessionError> {
        self.request(|reply| SessionCmd::Cancel { reply }).await
    }

    pub fn observable(&self, subscriber_id: SubscriberId) -> SessionObservable {
        SessionObservable::new(self.session_id.clone(), subscriber_id, self.cmd_tx.clone())
    }

    /// Cancels any aggregation and completes every subscriber.
    pub async fn shutdown(&self) {
        let _ = self.request(|reply| SessionCmd::Shutdown { reply }).await;
    }
}

struct SessionActor {
    session_id: SessionId,
    transcript: Transcript,
    persistence: Arc<dyn TranscriptStore>,
    backend: Arc<dyn GenerativeBackend>,
    subscribers: SubscriberList<SessionUpdate, StreamError>,
    /// Subscribers to complete when the current aggregation finishes.
    idle_watchers: HashSet<SubscriberId>,
    active: Option<ActiveAggregation>,
    /// Sequence number of the last published update.
    seq: u64,
    backend_tx: mpsc::Sender<BackendMsg>,
    backend_rx: mpsc::Receiver<BackendMsg>,
}

impl SessionActor {
    fn new(
        session_id: SessionId,
        transcript: Transcript,
        persistence: Arc<dyn TranscriptStore>,
        backend: Arc<dyn GenerativeBackend>,
        delta_buffer: usize,
    ) -> Self {
        let (backend_tx, backend_rx) = mpsc::channel(delta_buffer.max(1));
        Self {
            session_id,
            transcript,
            persistence,
            backend,
            subscribers: SubscriberList::new(),
            idle_watchers: HashSet::new(),
            active: None,
            seq: 0,
            backend_tx,
            backend_rx,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<SessionCmd>) {
        loop {
            tokio::select! {
                biased;

                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        self.shutdown().await;
                        break;
                    };
                    if let ControlFlow::Break(reply) = self.handle_cmd(cmd).await {
                        cmd_rx.close();
                        self.reject_pending(&mut cmd_rx);
                        let _ = reply.send(());
                        break;
                    }
                }

                Some(msg) = self.backend_rx.recv() => {
                    self.handle_backend_event(msg).await;
                }
            }
        }

        tracing::debug!(
            target: "tether::session",
            session_id = %self.session_id,
            "Session actor stopped"
        );
    }

    /// Breaks with the shutdown reply once the session has shut down.
    async fn handle_cmd(&mut self, cmd: SessionCmd) -> ControlFlow<oneshot::Sender<()>> {
        match cmd {
            SessionCmd::Snapshot { reply } => {
                let _ = reply.send(self.transcript.clone());
            }
            SessionCmd::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
            SessionCmd::AppendUserTurn { text, reply } => {
                let result = self.append_user_turn(text).await;
                let _ = reply.send(result);
            }
            SessionCmd::StartAggregation { reply } => {
                let result = self.start_aggregation();
                let _ = reply.send(result);
            }
            SessionCmd::SendMessage { text, reply } => {
                let result = match self.append_user_turn(text).await {
                    Ok(user_turn) => {
                        self.start_aggregation()
                            .map(|aggregation| MessageAccepted {
                                user_turn,
                                aggregation,
                            })
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            SessionCmd::Attach {
                subscriber_id,
                observer,
                terminated,
                until_idle,
            } => {
                self.attach(subscriber_id, observer, terminated, until_idle);
            }
            SessionCmd::Detach {
                subscriber_id,
                attachment,
                reply,
            } => {
                let detached = self.detach(subscriber_id, attachment.as_ref());
                if let Some(reply) = reply {
                    let _ = reply.send(detached);
                }
            }
            SessionCmd::Cancel { reply } => {
                let cancelled = self.cancel_aggregation().await;
                let _ = reply.send(cancelled);
            }
            SessionCmd::Shutdown { reply } => {
                self.shutdown().await;
                return ControlFlow::Break(reply);
            }
        }
        ControlFlow::Continue(())
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            turn_count: self.transcript.len(),
            busy: self.active.is_some(),
            subscribers: self.subscribers.len(),
        }
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if let Some(active) = &self.active {
            tracing::debug!(
                target: "tether::session",
                session_id = %self.session_id,
                aggregation_id = %active.id,
                "Rejecting write to busy session"
            );
            return Err(SessionError::SessionBusy {
                session_id: self.session_id.clone(),
            });
        }
        Ok(())
    }

    async fn append_user_turn(&mut self, text: String) -> Result<Turn, SessionError> {
        self.ensure_idle()?;
        if text.trim().is_empty() {
            return Err(SessionError::InvalidInput {
                message: "message text must not be empty".to_string(),
            });
        }

        let turn = Turn::user(text);
        self.persistence.append(&self.session_id, &turn).await?;
        self.transcript.push(turn.clone());

        let added = turn.clone();
        self.publish(|seq| SessionUpdate::TurnAdded { seq, turn: added });
        Ok(turn)
    }

    fn start_aggregation(&mut self) -> Result<AggregationHandle, SessionError> {
        self.ensure_idle()?;

        let request = BackendRequest {
            session_id: self.session_id.clone(),
            turn_id: TurnId::new(),
            transcript: self.transcript.clone(),
        };
        let mut turn = Turn::assistant();
        turn.id = request.turn_id;
        let turn_index = self.transcript.push(turn.clone());

        let aggregation_id = AggregationId::new();
        let cancel = CancellationToken::new();
        tokio::spawn(drive_backend(
            aggregation_id,
            self.backend.clone(),
            request,
            cancel.clone(),
            self.backend_tx.clone(),
        ));
        self.active = Some(ActiveAggregation {
            id: aggregation_id,
            turn_index,
            aggregator: Aggregator::new(),
            cancel,
        });

        tracing::info!(
            target: "tether::aggregation",
            session_id = %self.session_id,
            aggregation_id = %aggregation_id,
            turn_id = %turn.id,
            backend = self.backend.name(),
            "Aggregation started"
        );

        let handle = AggregationHandle {
            session_id: self.session_id.clone(),
            aggregation_id,
            turn_id: turn.id,
        };
        self.publish(|seq| SessionUpdate::TurnAdded { seq, turn });
        Ok(handle)
    }

    async fn handle_backend_event(&mut self, msg: BackendMsg) {
        let Some(active) = self.active.as_mut().filter(|a| a.id == msg.aggregation_id) else {
            tracing::trace!(
                target: "tether::aggregation",
                session_id = %self.session_id,
                aggregation_id = %msg.aggregation_id,
                "Dropping event from inactive aggregation"
            );
            return;
        };
        let Some(turn) = self.transcript.turn_at_mut(active.turn_index) else {
            tracing::error!(
                target: "tether::aggregation",
                session_id = %self.session_id,
                turn_index = active.turn_index,
                "Aggregation turn missing from transcript"
            );
            return;
        };

        let delta = match &msg.event {
            BackendEvent::Delta(delta) => Some(delta.clone()),
            BackendEvent::Completed | BackendEvent::Failed { .. } => None,
        };

        match active.aggregator.apply(turn, msg.event) {
            Ok(Progress::Streaming) => {
                let turn = turn.clone();
                if let Some(delta) = delta {
                    self.publish(|seq| SessionUpdate::TurnChanged { seq, turn, delta });
                }
            }
            Ok(Progress::Finished) => self.finish_aggregation(None).await,
            Ok(Progress::Ignored) => {}
            Err(error) => self.finish_aggregation(Some(error)).await,
        }
    }

    /// Releases the writer slot, persists the final turn and tells everyone.
    async fn finish_aggregation(&mut self, error: Option<AggregationError>) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.cancel.cancel();

        let Some(turn) = self.transcript.turns().get(active.turn_index).cloned() else {
            return;
        };

        if let Err(e) = self.persistence.append(&self.session_id, &turn).await {
            tracing::error!(
                target: "tether::session",
                session_id = %self.session_id,
                turn_id = %turn.id,
                error = %e,
                "Failed to persist assistant turn"
            );
        }

        match &error {
            Some(error) => tracing::warn!(
                target: "tether::aggregation",
                session_id = %self.session_id,
                aggregation_id = %active.id,
                error = %error,
                "Aggregation failed"
            ),
            None => tracing::info!(
                target: "tether::aggregation",
                session_id = %self.session_id,
                aggregation_id = %active.id,
                stop_reason = ?turn.stop_reason,
                "Aggregation finished"
            ),
        }

        self.publish(|seq| SessionUpdate::AggregationFinished { seq, turn, error });

        for subscriber_id in std::mem::take(&mut self.idle_watchers) {
            self.subscribers.complete(subscriber_id);
        }
    }

    async fn cancel_aggregation(&mut self) -> bool {
        let Some(active) = self.active.as_mut() else {
            return false;
        };
        if let Some(turn) = self.transcript.turn_at_mut(active.turn_index) {
            active.aggregator.cancel(turn);
        }

        tracing::info!(
            target: "tether::aggregation",
            session_id = %self.session_id,
            aggregation_id = %active.id,
            "Aggregation cancelled"
        );

        self.finish_aggregation(None).await;
        true
    }

    fn attach(
        &mut self,
        subscriber_id: SubscriberId,
        observer: UpdateObserver,
        terminated: Arc<AtomicBool>,
        until_idle: bool,
    ) {
        self.idle_watchers.remove(&subscriber_id);
        self.subscribers.attach(subscriber_id, observer, terminated);

        let active_turn = self
            .active
            .as_ref()
            .and_then(|active| self.transcript.turns().get(active.turn_index))
            .map(|turn| turn.id);
        let snapshot = SessionUpdate::Snapshot {
            seq: self.seq,
            session_id: self.session_id.clone(),
            transcript: self.transcript.clone(),
            active_turn,
        };

        if let Some(error) = self.subscribers.send_to(subscriber_id, snapshot) {
            tracing::warn!(
                target: "tether::subscriber",
                session_id = %self.session_id,
                subscriber_id = %subscriber_id,
                error = %error,
                "Subscriber failed on snapshot"
            );
            return;
        }

        tracing::debug!(
            target: "tether::subscriber",
            session_id = %self.session_id,
            subscriber_id = %subscriber_id,
            subscriber_count = self.subscribers.len(),
            "Subscriber attached"
        );

        if until_idle {
            if self.active.is_some() {
                self.idle_watchers.insert(subscriber_id);
            } else {
                self.subscribers.complete(subscriber_id);
            }
        }
    }

    fn detach(
        &mut self,
        subscriber_id: SubscriberId,
        attachment: Option<&Arc<AtomicBool>>,
    ) -> bool {
        let detached = match attachment {
            Some(attachment) => self.subscribers.detach_attachment(subscriber_id, attachment),
            None => self.subscribers.detach(subscriber_id),
        };
        if detached {
            self.idle_watchers.remove(&subscriber_id);
            tracing::debug!(
                target: "tether::subscriber",
                session_id = %self.session_id,
                subscriber_id = %subscriber_id,
                subscriber_count = self.subscribers.len(),
                "Subscriber detached"
            );
        }
        detached
    }

    fn publish(&mut self, build: impl FnOnce(u64) -> SessionUpdate) {
        self.seq += 1;
        let update = build(self.seq);
        for (subscriber_id, error) in self.subscribers.publish(&update) {
            self.idle_watchers.remove(&subscriber_id);
            tracing::warn!(
                target: "tether::subscriber",
                session_id = %self.session_id,
                subscriber_id = %subscriber_id,
                error = %error,
                "Subscriber dropped after delivery failure"
            );
        }
    }

    /// Fails commands queued behind a shutdown. Request senders see their
    /// reply channel close; observers get `SessionClosed`.
    fn reject_pending(&self, cmd_rx: &mut mpsc::UnboundedReceiver<SessionCmd>) {
        while let Ok(cmd) = cmd_rx.try_recv() {
            if let SessionCmd::Attach {
                mut observer,
                terminated,
                ..
            } = cmd
            {
                terminated.store(true, Ordering::Release);
                observer.on_error(StreamError::SessionClosed {
                    session_id: self.session_id.clone(),
                });
            }
        }
    }

    async fn shutdown(&mut self) {
        self.cancel_aggregation().await;
        self.idle_watchers.clear();
        self.subscribers.complete_all();
    }
}

pub(crate) fn spawn_session_actor(
    session_id: SessionId,
    transcript: Transcript,
    persistence: Arc<dyn TranscriptStore>,
    backend: Arc<dyn GenerativeBackend>,
    delta_buffer: usize,
) -> SessionActorHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let actor = SessionActor::new(
        session_id.clone(),
        transcript,
        persistence,
        backend,
        delta_buffer,
    );

    tokio::spawn(actor.run(cmd_rx));

    SessionActorHandle { session_id, cmd_tx }
}
