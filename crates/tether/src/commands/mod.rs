use async_trait::async_trait;
use eyre::Result;

use crate::LocalClient;

pub mod send;
pub mod sessions;
pub mod show;

#[async_trait]
pub trait Command {
    async fn execute(&self, client: &LocalClient) -> Result<()>;
}

pub(crate) fn parse_session_id(value: &str) -> Result<tether_core::domain::SessionId> {
    tether_core::domain::SessionId::parse(value)
        .ok_or_else(|| eyre::eyre!("Invalid session ID: {:?}", value))
}
