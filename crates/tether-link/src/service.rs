//! Session operations served through the router.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tether_core::domain::runtime::{MessageAccepted, SessionError, SessionStore, SessionSummary};
use tether_core::domain::{SessionId, SessionUpdate, SubscriberId, Transcript};
use tracing::debug;

use crate::error::RouterError;
use crate::router::{Router, SharedObservable};

pub const SEND_MESSAGE: &str = "sendMessage";
pub const WATCH_SESSION: &str = "watchSession";
pub const GET_SESSION: &str = "getSession";
pub const STOP_GENERATION: &str = "stopGeneration";
pub const LIST_SESSIONS: &str = "listSessions";
pub const DELETE_SESSION: &str = "deleteSession";

/// State handed to every session handler.
#[derive(Clone)]
pub struct SessionContext {
    pub store: SessionStore,
}

impl SessionContext {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageInput {
    /// Target session; a new id is generated when absent.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSessionInput {
    pub session_id: SessionId,
    /// Complete the stream once no aggregation is running.
    #[serde(default)]
    pub until_idle: bool,
    /// Reusing an id replaces that subscriber's earlier observer.
    #[serde(default)]
    pub subscriber_id: Option<SubscriberId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInput {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopGenerationOutput {
    /// Whether an aggregation was running.
    pub stopped: bool,
}

async fn send_message(
    context: Arc<SessionContext>,
    input: SendMessageInput,
) -> Result<MessageAccepted, SessionError> {
    let session_id = input.session_id.unwrap_or_else(SessionId::generate);
    context.store.send_message(&session_id, input.text).await
}

async fn watch_session(
    context: Arc<SessionContext>,
    input: WatchSessionInput,
) -> Result<SharedObservable<SessionUpdate>, SessionError> {
    let subscriber_id = input.subscriber_id.unwrap_or_default();
    let observable = context
        .store
        .subscribe(&input.session_id, subscriber_id)
        .await?
        .until_idle(input.until_idle);
    debug!(
        target: "tether::subscriber",
        session_id = %input.session_id,
        %subscriber_id,
        until_idle = input.until_idle,
        "Watch requested"
    );
    Ok(Arc::new(observable))
}

async fn get_session(
    context: Arc<SessionContext>,
    input: SessionInput,
) -> Result<Transcript, SessionError> {
    context.store.snapshot(&input.session_id).await
}

async fn stop_generation(
    context: Arc<SessionContext>,
    input: SessionInput,
) -> Result<StopGenerationOutput, SessionError> {
    let stopped = context.store.cancel_aggregation(&input.session_id).await?;
    Ok(StopGenerationOutput { stopped })
}

async fn list_sessions(
    context: Arc<SessionContext>,
    _input: (),
) -> Result<Vec<SessionSummary>, SessionError> {
    context.store.list_sessions().await
}

async fn delete_session(
    context: Arc<SessionContext>,
    input: SessionInput,
) -> Result<(), SessionError> {
    context.store.delete(&input.session_id).await
}

/// Router with every session operation registered.
pub fn session_router() -> Result<Router<SessionContext>, RouterError> {
    let mut router = Router::new();
    router
        .mutation(SEND_MESSAGE, send_message)?
        .subscription(WATCH_SESSION, watch_session)?
        .query(GET_SESSION, get_session)?
        .mutation(STOP_GENERATION, stop_generation)?
        .query(LIST_SESSIONS, list_sessions)?
        .mutation(DELETE_SESSION, delete_session)?;
    Ok(router)
}
