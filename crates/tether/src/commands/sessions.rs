use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::{self, Write};

use tether_core::domain::runtime::SessionError;

use super::{Command, parse_session_id};
use crate::LocalClient;
use crate::cli::SessionCommands;

pub struct SessionCommand {
    pub command: SessionCommands,
}

#[async_trait]
impl Command for SessionCommand {
    async fn execute(&self, client: &LocalClient) -> Result<()> {
        let mut stdout = io::stdout();
        self.run(client, &mut stdout).await
    }
}

impl SessionCommand {
    pub async fn run<W: Write + Send>(&self, client: &LocalClient, out: &mut W) -> Result<()> {
        match &self.command {
            SessionCommands::List => list(client, out).await,
            SessionCommands::Delete { session_id } => delete(client, session_id, out).await,
        }
    }
}

async fn list<W: Write + Send>(client: &LocalClient, out: &mut W) -> Result<()> {
    let sessions = client
        .list_sessions()
        .await
        .map_err(|e| eyre!("Failed to list sessions: {}", e))?;

    if sessions.is_empty() {
        writeln!(out, "No sessions found.")?;
        return Ok(());
    }

    writeln!(out, "{:<36} {:<8} {:<6}", "ID", "Turns", "Busy")?;
    writeln!(out, "{}", "-".repeat(52))?;
    for session in sessions {
        writeln!(
            out,
            "{:<36} {:<8} {:<6}",
            session.session_id,
            session.turn_count,
            if session.busy { "yes" } else { "no" },
        )?;
    }
    Ok(())
}

async fn delete<W: Write + Send>(
    client: &LocalClient,
    session_id: &str,
    out: &mut W,
) -> Result<()> {
    let session_id = parse_session_id(session_id)?;

    // Deleting is idempotent in the store; the command still reports unknown ids.
    match client.get_session(&session_id).await {
        Ok(_) => {}
        Err(e) if matches!(e.as_session_error(), Some(SessionError::SessionNotFound { .. })) => {
            return Err(eyre!("Session not found: {}", session_id));
        }
        Err(e) => return Err(eyre!("Failed to check session: {}", e)),
    }

    client
        .delete_session(&session_id)
        .await
        .map_err(|e| eyre!("Failed to delete session: {}", e))?;

    writeln!(out, "Session {session_id} deleted.")?;
    Ok(())
}
