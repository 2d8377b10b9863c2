use tether_core::domain::runtime::{MessageAccepted, SessionSummary};
use tether_core::domain::{
    NotificationStream, Observer, SessionId, SessionUpdate, SubscriberId, Transcript, Unsubscribe,
};

use crate::error::LinkError;
use crate::link::Link;
use crate::service::{
    DELETE_SESSION, GET_SESSION, LIST_SESSIONS, SEND_MESSAGE, STOP_GENERATION,
    SendMessageInput, SessionInput, StopGenerationOutput, WATCH_SESSION, WatchSessionInput,
};

/// Typed session API over any [`Link`].
#[derive(Clone)]
pub struct SessionClient<L> {
    link: L,
}

impl<L: Link> SessionClient<L> {
    pub fn new(link: L) -> Self {
        Self { link }
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Appends `text` as a user turn and starts generating the reply.
    /// Fails with `SessionBusy` while the session is already generating.
    pub async fn send_message(
        &self,
        session_id: Option<SessionId>,
        text: impl Into<String>,
    ) -> Result<MessageAccepted, LinkError> {
        self.link
            .mutate(
                SEND_MESSAGE,
                SendMessageInput {
                    session_id,
                    text: text.into(),
                },
            )
            .await
    }

    /// Streams a snapshot followed by every later update of the session.
    pub async fn watch_session(
        &self,
        session_id: &SessionId,
        until_idle: bool,
    ) -> (NotificationStream<SessionUpdate, LinkError>, Unsubscribe) {
        self.link
            .subscribe_channel(
                WATCH_SESSION,
                WatchSessionInput {
                    session_id: session_id.clone(),
                    until_idle,
                    subscriber_id: None,
                },
            )
            .await
    }

    pub async fn watch_session_with(
        &self,
        session_id: &SessionId,
        subscriber_id: SubscriberId,
        until_idle: bool,
        observer: Box<dyn Observer<SessionUpdate, LinkError>>,
    ) -> Unsubscribe {
        self.link
            .subscribe(
                WATCH_SESSION,
                WatchSessionInput {
                    session_id: session_id.clone(),
                    until_idle,
                    subscriber_id: Some(subscriber_id),
                },
                observer,
            )
            .await
    }

    pub async fn get_session(&self, session_id: &SessionId) -> Result<Transcript, LinkError> {
        self.link
            .query(
                GET_SESSION,
                SessionInput {
                    session_id: session_id.clone(),
                },
            )
            .await
    }

    /// Returns whether an aggregation was running.
    pub async fn stop_generation(&self, session_id: &SessionId) -> Result<bool, LinkError> {
        let output: StopGenerationOutput = self
            .link
            .mutate(
                STOP_GENERATION,
                SessionInput {
                    session_id: session_id.clone(),
                },
            )
            .await?;
        Ok(output.stopped)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionSummary>, LinkError> {
        self.link.query(LIST_SESSIONS, ()).await
    }

    pub async fn delete_session(&self, session_id: &SessionId) -> Result<(), LinkError> {
        self.link
            .mutate(
                DELETE_SESSION,
                SessionInput {
                    session_id: session_id.clone(),
                },
            )
            .await
    }
}
