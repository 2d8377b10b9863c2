use std::sync::Arc;

use tether_core::RuntimeConfig;
use tether_core::backend::GenerativeBackend;
use tether_core::domain::runtime::SessionStoreService;
use tracing::info;

use crate::client::SessionClient;
use crate::error::LinkError;
use crate::link::InProcessLink;
use crate::service::{SessionContext, session_router};

/// Everything needed to talk to a session store in this process.
pub struct LocalLinkSetup {
    pub link: InProcessLink<SessionContext>,
    pub store: SessionStoreService,
}

impl LocalLinkSetup {
    pub fn client(&self) -> SessionClient<InProcessLink<SessionContext>> {
        SessionClient::new(self.link.clone())
    }

    /// Stops every session, then the store itself.
    pub async fn shutdown(self) {
        self.store.shutdown().await;
    }
}

/// Opens the configured persistence, spawns the session store and wires the
/// session router to an in-process link.
pub async fn setup_local_link(
    config: RuntimeConfig,
    backend: Arc<dyn GenerativeBackend>,
) -> Result<LocalLinkSetup, LinkError> {
    let observer_buffer = config.observer_buffer;
    let backend_name = backend.name();
    let store = SessionStoreService::open(config, backend).await?;
    let router = session_router()?;

    let link = InProcessLink::new(router, SessionContext::new(store.store()))
        .with_observer_buffer(observer_buffer);

    info!(
        backend = backend_name,
        operations = link.router().operations().len(),
        "Local link ready"
    );
    Ok(LocalLinkSetup { link, store })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::Link;
    use tether_core::backend::EchoBackend;
    use tether_core::domain::runtime::SessionError;

    #[tokio::test]
    async fn local_setup_serves_session_operations() {
        let setup = setup_local_link(RuntimeConfig::in_memory(), Arc::new(EchoBackend::new()))
            .await
            .expect("local setup");

        assert_eq!(setup.link.observer_buffer(), RuntimeConfig::default().observer_buffer);

        let sessions = setup.client().list_sessions().await.expect("list sessions");
        assert!(sessions.is_empty());

        setup.shutdown().await;
    }

    #[tokio::test]
    async fn calls_after_shutdown_fail() {
        let setup = setup_local_link(RuntimeConfig::in_memory(), Arc::new(EchoBackend::new()))
            .await
            .expect("local setup");
        let client = setup.client();
        setup.shutdown().await;

        let err = client
            .send_message(None, "Hello")
            .await
            .err()
            .expect("store is gone");
        assert!(matches!(
            err.as_session_error(),
            Some(SessionError::ShuttingDown | SessionError::ChannelClosed)
        ));
    }
}
