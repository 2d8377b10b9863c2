use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::GenerativeBackend;
use crate::config::RuntimeConfig;
use crate::domain::session::TranscriptStore;
use crate::domain::transcript::{Transcript, Turn};
use crate::domain::types::{SessionId, SubscriberId};
use crate::error::Result as CoreResult;

use super::aggregation::AggregationHandle;
use super::session_actor::{
    MessageAccepted, SessionActorHandle, SessionError, SessionSummary, spawn_session_actor,
};
use super::subscription::SessionObservable;

type SessionListing = Vec<(SessionId, Option<SessionActorHandle>)>;

pub(crate) enum SupervisorCmd {
    Resolve {
        session_id: SessionId,
        create: bool,
        reply: oneshot::Sender<Result<SessionActorHandle, SessionError>>,
    },
    Delete {
        session_id: SessionId,
        reply: oneshot::Sender<Result<(), SessionError>>,
    },
    List {
        reply: oneshot::Sender<Result<SessionListing, SessionError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Owns the mapping from session id to session actor.
///
/// Only lookups, creation and teardown go through the supervisor; all
/// per-session work is sent straight to the session actor so a slow session
/// never stalls another.
struct SessionStoreSupervisor {
    sessions: HashMap<SessionId, SessionActorHandle>,
    persistence: Arc<dyn TranscriptStore>,
    backend: Arc<dyn GenerativeBackend>,
    config: RuntimeConfig,
}

impl SessionStoreSupervisor {
    fn new(
        persistence: Arc<dyn TranscriptStore>,
        backend: Arc<dyn GenerativeBackend>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            sessions: HashMap::new(),
            persistence,
            backend,
            config,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SupervisorCmd>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                SupervisorCmd::Resolve {
                    session_id,
                    create,
                    reply,
                } => {
                    let result = self.resolve(session_id, create).await;
                    let _ = reply.send(result);
                }
                SupervisorCmd::Delete { session_id, reply } => {
                    let result = self.delete(session_id).await;
                    let _ = reply.send(result);
                }
                SupervisorCmd::List { reply } => {
                    let result = self.list().await;
                    let _ = reply.send(result);
                }
                SupervisorCmd::Shutdown { reply } => {
                    self.shutdown_all().await;
                    let _ = reply.send(());
                    break;
                }
            }
        }

        tracing::info!(target: "tether::session", "Session store stopped");
    }

    async fn resolve(
        &mut self,
        session_id: SessionId,
        create: bool,
    ) -> Result<SessionActorHandle, SessionError> {
        if let Some(handle) = self.sessions.get(&session_id) {
            return Ok(handle.clone());
        }

        let transcript = self.persistence.read_all(&session_id).await?;
        if transcript.is_empty() && !create {
            return Err(SessionError::SessionNotFound { session_id });
        }

        let turn_count = transcript.len();
        let handle = spawn_session_actor(
            session_id.clone(),
            transcript,
            self.persistence.clone(),
            self.backend.clone(),
            self.config.delta_buffer,
        );
        self.sessions.insert(session_id.clone(), handle.clone());

        if turn_count == 0 {
            tracing::info!(target: "tether::session", session_id = %session_id, "Created session");
        } else {
            tracing::info!(
                target: "tether::session",
                session_id = %session_id,
                turn_count,
                "Resumed session"
            );
        }

        Ok(handle)
    }

    async fn delete(&mut self, session_id: SessionId) -> Result<(), SessionError> {
        if let Some(handle) = self.sessions.remove(&session_id) {
            handle.shutdown().await;
        }

        self.persistence.delete_session(&session_id).await?;

        tracing::info!(target: "tether::session", session_id = %session_id, "Deleted session");

        Ok(())
    }

    async fn list(&self) -> Result<SessionListing, SessionError> {
        let mut ids = self.persistence.list_session_ids().await?;
        ids.extend(self.sessions.keys().cloned());
        ids.sort();
        ids.dedup();

        Ok(ids
            .into_iter()
            .map(|id| {
                let handle = self.sessions.get(&id).cloned();
                (id, handle)
            })
            .collect())
    }

    async fn shutdown_all(&mut self) {
        for (session_id, handle) in self.sessions.drain() {
            handle.shutdown().await;
            tracing::debug!(target: "tether::session", session_id = %session_id, "Shut down session");
        }
    }
}

/// Process-wide registry of sessions. Cheap to clone; every clone talks to
/// the same supervisor.
#[derive(Clone)]
pub struct SessionStore {
    tx: mpsc::Sender<SupervisorCmd>,
    persistence: Arc<dyn TranscriptStore>,
}

impl SessionStore {
    async fn resolve(
        &self,
        session_id: &SessionId,
        create: bool,
    ) -> Result<SessionActorHandle, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SupervisorCmd::Resolve {
                session_id: session_id.clone(),
                create,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Loads the session from persistence, or creates an empty one.
    pub async fn get_or_create(&self, session_id: &SessionId) -> Result<SessionSummary, SessionError> {
        self.resolve(session_id, true).await?.summary().await
    }

    pub async fn summary(&self, session_id: &SessionId) -> Result<SessionSummary, SessionError> {
        self.resolve(session_id, false).await?.summary().await
    }

    /// Read-only copy of the transcript, including the partial content of a
    /// running aggregation.
    pub async fn snapshot(&self, session_id: &SessionId) -> Result<Transcript, SessionError> {
        self.resolve(session_id, false).await?.snapshot().await
    }

    pub async fn append_user_turn(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
    ) -> Result<Turn, SessionError> {
        self.resolve(session_id, true)
            .await?
            .append_user_turn(text.into())
            .await
    }

    /// Claims the session's writer slot and starts generating an assistant
    /// turn. Fails with `SessionBusy` while another aggregation runs.
    pub async fn start_aggregation(
        &self,
        session_id: &SessionId,
    ) -> Result<AggregationHandle, SessionError> {
        self.resolve(session_id, false)
            .await?
            .start_aggregation()
            .await
    }

    /// Appends a user turn and starts an aggregation in one step; nothing
    /// is appended when the session is busy.
    pub async fn send_message(
        &self,
        session_id: &SessionId,
        text: impl Into<String>,
    ) -> Result<MessageAccepted, SessionError> {
        self.resolve(session_id, true)
            .await?
            .send_message(text.into())
            .await
    }

    /// Observable for `subscriber_id`. Subscribing twice with the same id
    /// replaces the earlier observer.
    pub async fn subscribe(
        &self,
        session_id: &SessionId,
        subscriber_id: SubscriberId,
    ) -> Result<SessionObservable, SessionError> {
        Ok(self
            .resolve(session_id, true)
            .await?
            .observable(subscriber_id))
    }

    pub async fn watch(&self, session_id: &SessionId) -> Result<SessionObservable, SessionError> {
        self.subscribe(session_id, SubscriberId::new()).await
    }

    /// Removes one subscriber without calling any of its callbacks.
    pub async fn detach(
        &self,
        session_id: &SessionId,
        subscriber_id: SubscriberId,
    ) -> Result<bool, SessionError> {
        self.resolve(session_id, false)
            .await?
            .detach(subscriber_id)
            .await
    }

    /// Returns whether an aggregation was running.
    pub async fn cancel_aggregation(&self, session_id: &SessionId) -> Result<bool, SessionError> {
        self.resolve(session_id, false).await?.cancel().await
    }

    pub async fn delete(&self, session_id: &SessionId) -> Result<(), SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SupervisorCmd::Delete {
                session_id: session_id.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        reply_rx.await.map_err(|_| SessionError::ChannelClosed)?
    }

    /// Every known session, loaded or only persisted.
    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(SupervisorCmd::List { reply: reply_tx })
            .await
            .map_err(|_| SessionError::ShuttingDown)?;
        let listing = reply_rx.await.map_err(|_| SessionError::ChannelClosed)??;
        self.summarize(listing).await
    }

    /// Sessions deleted after the listing was taken are left out.
    async fn summarize(
        &self,
        listing: SessionListing,
    ) -> Result<Vec<SessionSummary>, SessionError> {
        let mut summaries = Vec::with_capacity(listing.len());
        for (session_id, handle) in listing {
            let summary = match handle {
                Some(handle) => match handle.summary().await {
                    Ok(summary) => summary,
                    Err(SessionError::ChannelClosed) => {
                        tracing::debug!(
                            target: "tether::session",
                            session_id = %session_id,
                            "Session went away while listing"
                        );
                        continue;
                    }
                    Err(e) => return Err(e),
                },
                None => {
                    let turn_count = self.persistence.read_all(&session_id).await?.len();
                    if turn_count == 0 {
                        continue;
                    }
                    SessionSummary {
                        session_id,
                        turn_count,
                        busy: false,
                        subscribers: 0,
                    }
                }
            };
            summaries.push(summary);
        }
        Ok(summaries)
    }

    /// Cancels every aggregation and completes every subscriber. Later
    /// calls fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorCmd::Shutdown { reply: reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}

/// Owns the supervisor task.
pub struct SessionStoreService {
    store: SessionStore,
    task: JoinHandle<()>,
}

impl SessionStoreService {
    pub fn spawn(
        persistence: Arc<dyn TranscriptStore>,
        backend: Arc<dyn GenerativeBackend>,
        config: RuntimeConfig,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);

        let supervisor = SessionStoreSupervisor::new(persistence.clone(), backend, config);
        let task = tokio::spawn(supervisor.run(rx));

        Self {
            store: SessionStore { tx, persistence },
            task,
        }
    }

    /// Opens the configured persistence, then spawns the store.
    pub async fn open(
        config: RuntimeConfig,
        backend: Arc<dyn GenerativeBackend>,
    ) -> CoreResult<Self> {
        let persistence = config.persistence.open().await?;
        Ok(Self::spawn(persistence, backend, config))
    }

    pub fn store(&self) -> SessionStore {
        self.store.clone()
    }

    pub async fn shutdown(self) {
        self.store.shutdown().await;
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::observable::{Observable, channel_observer};
    use crate::domain::session::InMemoryTranscriptStore;
    use crate::domain::transcript::TurnStatus;
    use crate::test_utils::{ScriptedBackend, text_script};

    fn sid(value: &str) -> SessionId {
        SessionId::parse(value).expect("valid session id")
    }

    fn spawn_with(backend: ScriptedBackend) -> SessionStoreService {
        SessionStoreService::spawn(
            Arc::new(InMemoryTranscriptStore::new()),
            Arc::new(backend),
            RuntimeConfig::in_memory(),
        )
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_for_reads() {
        let service = spawn_with(ScriptedBackend::new(text_script(&["x"])));
        let store = service.store();

        let result = store.snapshot(&sid("missing")).await;
        assert!(matches!(result, Err(SessionError::SessionNotFound { .. })));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn get_or_create_creates_empty_session() {
        let service = spawn_with(ScriptedBackend::new(text_script(&["x"])));
        let store = service.store();

        let summary = store.get_or_create(&sid("s1")).await.expect("create");
        assert_eq!(summary.turn_count, 0);
        assert!(!summary.busy);
        assert!(store.snapshot(&sid("s1")).await.expect("snapshot").is_empty());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn rejects_blank_message() {
        let service = spawn_with(ScriptedBackend::new(text_script(&["x"])));
        let store = service.store();

        let result = store.send_message(&sid("s1"), "   ").await;
        assert!(matches!(result, Err(SessionError::InvalidInput { .. })));
        assert!(store.snapshot(&sid("s1")).await.expect("snapshot").is_empty());

        service.shutdown().await;
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail() {
        let service = spawn_with(ScriptedBackend::new(text_script(&["x"])));
        let store = service.store();
        service.shutdown().await;

        let result = store.get_or_create(&sid("s1")).await;
        assert!(matches!(result, Err(SessionError::ShuttingDown)));
    }

    #[tokio::test]
    async fn list_includes_loaded_and_persisted_sessions() {
        let persistence = Arc::new(InMemoryTranscriptStore::new());
        persistence
            .append(&sid("stored"), &Turn::user("old"))
            .await
            .expect("seed");
        let service = SessionStoreService::spawn(
            persistence,
            Arc::new(ScriptedBackend::new(text_script(&["x"]))),
            RuntimeConfig::in_memory(),
        );
        let store = service.store();
        store.get_or_create(&sid("fresh")).await.expect("create");

        let summaries = store.list_sessions().await.expect("list");
        let ids: Vec<&str> = summaries.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["fresh", "stored"]);
        assert_eq!(summaries[1].turn_count, 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn listing_skips_sessions_deleted_after_the_listing() {
        let persistence = Arc::new(InMemoryTranscriptStore::new());
        persistence
            .append(&sid("stored"), &Turn::user("old"))
            .await
            .expect("seed");
        let service = SessionStoreService::spawn(
            persistence.clone(),
            Arc::new(ScriptedBackend::new(text_script(&["x"]))),
            RuntimeConfig::in_memory(),
        );
        let store = service.store();

        let backend: Arc<dyn GenerativeBackend> =
            Arc::new(ScriptedBackend::new(text_script(&["x"])));
        let live = spawn_session_actor(
            sid("live"),
            Transcript::from_turns(vec![Turn::user("hi")]),
            persistence.clone(),
            backend.clone(),
            8,
        );
        let gone = spawn_session_actor(
            sid("gone"),
            Transcript::new(),
            persistence.clone(),
            backend,
            8,
        );
        gone.shutdown().await;

        let summaries = store
            .summarize(vec![
                (sid("gone"), Some(gone)),
                (sid("live"), Some(live.clone())),
                (sid("purged"), None),
                (sid("stored"), None),
            ])
            .await
            .expect("summarize");

        let ids: Vec<&str> = summaries.iter().map(|s| s.session_id.as_str()).collect();
        assert_eq!(ids, vec!["live", "stored"]);
        assert_eq!(summaries[0].turn_count, 1);

        live.shutdown().await;
        service.shutdown().await;
    }

    #[tokio::test]
    async fn start_aggregation_uses_transcript_so_far() {
        let backend = Arc::new(ScriptedBackend::new(text_script(&["ok"])));
        let service = SessionStoreService::spawn(
            Arc::new(InMemoryTranscriptStore::new()),
            backend.clone(),
            RuntimeConfig::in_memory(),
        );
        let store = service.store();

        store
            .append_user_turn(&sid("s1"), "first")
            .await
            .expect("append");
        let handle = store
            .start_aggregation(&sid("s1"))
            .await
            .expect("start");

        let (observer, stream) = channel_observer(64);
        let mut unsubscribe = store
            .watch(&sid("s1"))
            .await
            .expect("watch")
            .until_idle(true)
            .subscribe(Box::new(observer));
        let _ = stream.collect().await;
        unsubscribe.unsubscribe();

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].turn_id, handle.turn_id);
        assert_eq!(requests[0].transcript.len(), 1);

        let transcript = store.snapshot(&sid("s1")).await.expect("snapshot");
        let turn = transcript.turn(handle.turn_id).expect("assistant turn");
        assert_eq!(turn.status, TurnStatus::Complete);
        assert_eq!(turn.text(), "ok");

        service.shutdown().await;
    }
}
