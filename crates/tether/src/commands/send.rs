use async_trait::async_trait;
use eyre::{Result, eyre};
use std::io::{self, Read, Write};

use tether_core::domain::{Channel, Notification, SessionId, SessionUpdate, Turn, TurnStatus};

use super::{Command, parse_session_id};
use crate::LocalClient;

pub struct SendCommand {
    pub session: Option<String>,
    pub text: Option<String>,
    pub show_reasoning: bool,
}

/// What a finished send produced.
#[derive(Debug)]
pub struct SendOutcome {
    pub session_id: SessionId,
    pub turn: Turn,
}

#[async_trait]
impl Command for SendCommand {
    async fn execute(&self, client: &LocalClient) -> Result<()> {
        let text = match &self.text {
            Some(text) => text.clone(),
            None => {
                let mut buffer = String::new();
                io::stdin()
                    .read_to_string(&mut buffer)
                    .map_err(|e| eyre!("Failed to read from stdin: {}", e))?;
                buffer
            }
        };
        if text.trim().is_empty() {
            return Err(eyre!("No input provided"));
        }

        let mut stdout = io::stdout();
        let mut stderr = io::stderr();
        let outcome = self.run(client, text, &mut stdout, &mut stderr).await?;

        if self.session.is_none() {
            writeln!(stderr, "Session ID: {}", outcome.session_id)?;
        }
        if outcome.turn.status == TurnStatus::Errored {
            return Err(eyre!(
                "Generation failed: {}",
                outcome.turn.error.as_deref().unwrap_or("unknown error")
            ));
        }
        Ok(())
    }
}

impl SendCommand {
    /// Sends `text` and writes the reply to `out` as it streams in.
    /// Reasoning goes to `reasoning_out` when enabled.
    pub async fn run<O, R>(
        &self,
        client: &LocalClient,
        text: String,
        out: &mut O,
        reasoning_out: &mut R,
    ) -> Result<SendOutcome>
    where
        O: Write + Send,
        R: Write + Send,
    {
        let session_id = self
            .session
            .as_deref()
            .map(parse_session_id)
            .transpose()?;

        let accepted = client
            .send_message(session_id, text)
            .await
            .map_err(|e| eyre!("Failed to send message: {}", e))?;
        let session_id = accepted.aggregation.session_id;
        let turn_id = accepted.aggregation.turn_id;

        let (mut updates, _unsubscribe) = client.watch_session(&session_id, true).await;
        let mut text = Lane::new(Channel::Text);
        let mut reasoning = Lane::new(Channel::Reasoning);
        let mut finished = None;

        while let Some(notification) = updates.next().await {
            match notification {
                Notification::Next(update) => {
                    let turn = match &update {
                        SessionUpdate::Snapshot { transcript, .. } => transcript.turn(turn_id),
                        other => other.turn().filter(|turn| turn.id == turn_id),
                    };
                    let Some(turn) = turn else {
                        continue;
                    };
                    text.write(turn, out)?;
                    if self.show_reasoning {
                        reasoning.write(turn, reasoning_out)?;
                    }
                    if turn.is_terminal() {
                        finished = Some(turn.clone());
                    }
                }
                Notification::Error(e) => return Err(eyre!("Session stream failed: {}", e)),
                Notification::Complete => break,
            }
        }

        let turn = match finished {
            Some(turn) => turn,
            None => client
                .get_session(&session_id)
                .await
                .map_err(|e| eyre!("Failed to load session: {}", e))?
                .turn(turn_id)
                .cloned()
                .ok_or_else(|| eyre!("Reply turn {} is missing", turn_id))?,
        };

        if text.written {
            writeln!(out)?;
        }
        if reasoning.written {
            writeln!(reasoning_out)?;
        }

        Ok(SendOutcome { session_id, turn })
    }
}

/// Streams one channel's parts in transcript order.
///
/// Part content only grows, so each update prints what the current part
/// gained. A later part waits until every earlier part of the channel is
/// closed, which keeps the output equal to the final text even when parts
/// overlap.
struct Lane {
    channel: Channel,
    /// Parts fully printed and closed.
    done: usize,
    /// Bytes of the current part already printed.
    offset: usize,
    written: bool,
}

impl Lane {
    fn new(channel: Channel) -> Self {
        Self {
            channel,
            done: 0,
            offset: 0,
            written: false,
        }
    }

    fn write(&mut self, turn: &Turn, out: &mut impl Write) -> io::Result<()> {
        for part in turn.parts_of(self.channel).skip(self.done) {
            let rest = part.content.get(self.offset..).unwrap_or_default();
            if !rest.is_empty() {
                out.write_all(rest.as_bytes())?;
                out.flush()?;
                self.offset = part.content.len();
                self.written = true;
            }
            if !part.closed {
                break;
            }
            self.done += 1;
            self.offset = 0;
        }
        Ok(())
    }
}
