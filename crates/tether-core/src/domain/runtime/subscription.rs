use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tokio::sync::mpsc;

use crate::domain::observable::{Observable, Observer, StreamError, Unsubscribe};
use crate::domain::types::{SessionId, SubscriberId};
use crate::domain::update::SessionUpdate;

use super::session_actor::SessionCmd;

/// The observable a session hands to watchers.
///
/// Every subscriber first receives a [`SessionUpdate::Snapshot`] of the
/// transcript so far, then every update the session publishes afterwards.
/// The stream completes when the session is deleted or the store shuts
/// down, or (with [`until_idle`](Self::until_idle)) once no aggregation is
/// running.
#[derive(Clone)]
pub struct SessionObservable {
    session_id: SessionId,
    subscriber_id: SubscriberId,
    until_idle: bool,
    cmd_tx: mpsc::UnboundedSender<SessionCmd>,
}

impl SessionObservable {
    pub(crate) fn new(
        session_id: SessionId,
        subscriber_id: SubscriberId,
        cmd_tx: mpsc::UnboundedSender<SessionCmd>,
    ) -> Self {
        Self {
            session_id,
            subscriber_id,
            until_idle: false,
            cmd_tx,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn subscriber_id(&self) -> SubscriberId {
        self.subscriber_id
    }

    pub fn until_idle(mut self, until_idle: bool) -> Self {
        self.until_idle = until_idle;
        self
    }
}

impl Observable<SessionUpdate, StreamError> for SessionObservable {
    fn subscribe(&self, observer: Box<dyn Observer<SessionUpdate, StreamError>>) -> Unsubscribe {
        let subscriber_id = self.subscriber_id;
        let terminated = Arc::new(AtomicBool::new(false));

        let attach = SessionCmd::Attach {
            subscriber_id,
            observer,
            terminated: terminated.clone(),
            until_idle: self.until_idle,
        };
        if let Err(mpsc::error::SendError(cmd)) = self.cmd_tx.send(attach) {
            if let SessionCmd::Attach { mut observer, .. } = cmd {
                observer.on_error(StreamError::SessionClosed {
                    session_id: self.session_id.clone(),
                });
            }
            return Unsubscribe::noop();
        }

        let cmd_tx = self.cmd_tx.clone();
        let attachment = terminated.clone();
        Unsubscribe::new(terminated, move || {
            let _ = cmd_tx.send(SessionCmd::Detach {
                subscriber_id,
                attachment: Some(attachment),
                reply: None,
            });
        })
    }
}
