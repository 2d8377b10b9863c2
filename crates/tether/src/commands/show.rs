use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::{self, Write};

use tether_core::domain::{Channel, Transcript, TurnStatus};

use super::{Command, parse_session_id};
use crate::LocalClient;

pub struct ShowCommand {
    pub session_id: String,
    pub json: bool,
}

#[async_trait]
impl Command for ShowCommand {
    async fn execute(&self, client: &LocalClient) -> Result<()> {
        let mut stdout = io::stdout();
        self.run(client, &mut stdout).await
    }
}

impl ShowCommand {
    pub async fn run<W: Write + Send>(&self, client: &LocalClient, out: &mut W) -> Result<()> {
        let session_id = parse_session_id(&self.session_id)?;
        let transcript = client
            .get_session(&session_id)
            .await
            .map_err(|e| eyre!("Failed to load session {}: {}", session_id, e))?;

        if self.json {
            serde_json::to_writer_pretty(&mut *out, &transcript)?;
            writeln!(out)?;
            return Ok(());
        }

        writeln!(out, "Session: {session_id}")?;
        write_transcript(&transcript, out)?;
        Ok(())
    }
}

fn write_transcript(transcript: &Transcript, out: &mut impl Write) -> io::Result<()> {
    for turn in transcript.turns() {
        match turn.status {
            TurnStatus::Complete => writeln!(out, "\n[{}]", turn.role)?,
            status => writeln!(out, "\n[{}] ({status})", turn.role)?,
        }

        for part in &turn.parts {
            match part.kind {
                Channel::Text => writeln!(out, "{}", part.content)?,
                kind => {
                    match &part.label {
                        Some(label) => writeln!(out, "<{kind} {label}>")?,
                        None => writeln!(out, "<{kind}>")?,
                    }
                    writeln!(out, "{}", part.content)?;
                    writeln!(out, "</{kind}>")?;
                }
            }
        }
        if let Some(error) = &turn.error {
            writeln!(out, "error: {error}")?;
        }
    }
    Ok(())
}
