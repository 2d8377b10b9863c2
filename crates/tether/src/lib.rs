pub mod cli;
pub mod commands;

pub use tether_core::{backend, config, domain, utils};

use std::sync::Arc;

use eyre::{Result, eyre};
use tether_core::backend::EchoBackend;
use tether_link::{InProcessLink, LocalLinkSetup, SessionClient, SessionContext, setup_local_link};

use crate::cli::config::CliConfig;

pub type LocalClient = SessionClient<InProcessLink<SessionContext>>;

/// Opens the session store described by `config` behind an in-process link.
pub async fn open_local(config: &CliConfig) -> Result<LocalLinkSetup> {
    let mut backend = EchoBackend::new().with_reasoning(config.backend.reasoning);
    if let Some(delay) = config.backend.chunk_delay() {
        backend = backend.with_chunk_delay(delay);
    }

    setup_local_link(config.runtime_config()?, Arc::new(backend))
        .await
        .map_err(|e| eyre!("Failed to open session store: {}", e))
}
