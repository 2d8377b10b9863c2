use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::delta::{BackendEvent, DeltaEvent, Phase};
use crate::domain::transcript::{Channel, Part, StopReason, Turn, TurnStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregationError {
    #[error("Orphan {phase} event on {channel} channel: no open part")]
    OrphanDelta { channel: Channel, phase: Phase },

    #[error("Backend failure: {message}")]
    BackendFailure { message: String },
}

impl AggregationError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendFailure {
            message: message.into(),
        }
    }
}

/// Outcome of applying one backend event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The turn changed and is still receiving output.
    Streaming,
    /// The turn reached `complete`.
    Finished,
    /// The turn was already terminal; nothing changed.
    Ignored,
}

/// Folds backend events into one assistant turn.
///
/// The aggregator holds only bookkeeping (which parts are open, the next
/// `delta_seq` of each lane); the turn itself is owned by the caller so the
/// transcript never has to be copied to stay current.
#[derive(Debug, Default)]
pub struct Aggregator {
    open: HashMap<Channel, Vec<usize>>,
    next_seq: HashMap<Channel, u64>,
    finished: bool,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Number of parts currently open on `channel`.
    pub fn open_parts(&self, channel: Channel) -> usize {
        self.open.get(&channel).map_or(0, Vec::len)
    }

    pub fn apply(
        &mut self,
        turn: &mut Turn,
        event: BackendEvent,
    ) -> Result<Progress, AggregationError> {
        if self.finished {
            return Ok(Progress::Ignored);
        }

        match event {
            BackendEvent::Delta(delta) => match self.apply_delta(turn, delta) {
                Ok(()) => Ok(Progress::Streaming),
                Err(error) => {
                    self.fail(turn, &error);
                    Err(error)
                }
            },
            BackendEvent::Completed => {
                self.finish(turn, TurnStatus::Complete, StopReason::Completed);
                Ok(Progress::Finished)
            }
            BackendEvent::Failed { message } => {
                let error = AggregationError::BackendFailure { message };
                self.fail(turn, &error);
                Err(error)
            }
        }
    }

    /// Stops the turn early: output so far is kept, the turn becomes `complete`.
    pub fn cancel(&mut self, turn: &mut Turn) {
        if !self.finished {
            self.finish(turn, TurnStatus::Complete, StopReason::Cancelled);
        }
    }

    /// Marks the turn `errored`; parts produced so far are kept.
    pub fn fail(&mut self, turn: &mut Turn, error: &AggregationError) {
        if !self.finished {
            self.finish(turn, TurnStatus::Errored, StopReason::Failed);
            turn.error = Some(error.to_string());
        }
    }

    fn apply_delta(&mut self, turn: &mut Turn, delta: DeltaEvent) -> Result<(), AggregationError> {
        let DeltaEvent {
            channel,
            phase,
            payload,
        } = delta;

        match phase {
            Phase::Start => {
                let seq = self.next_seq.entry(channel).or_insert(0);
                let label = (!payload.is_empty()).then_some(payload);
                turn.parts.push(Part::open(channel, *seq, label));
                *seq += 1;
                self.open
                    .entry(channel)
                    .or_default()
                    .push(turn.parts.len() - 1);
                turn.status = TurnStatus::Streaming;
                Ok(())
            }
            Phase::Delta => {
                let part = self
                    .current_open(channel)
                    .and_then(|index| turn.parts.get_mut(index))
                    .ok_or(AggregationError::OrphanDelta { channel, phase })?;
                part.content.push_str(&payload);
                Ok(())
            }
            Phase::End => {
                let index = self
                    .open
                    .get_mut(&channel)
                    .and_then(Vec::pop)
                    .ok_or(AggregationError::OrphanDelta { channel, phase })?;
                if let Some(part) = turn.parts.get_mut(index) {
                    part.closed = true;
                }
                Ok(())
            }
        }
    }

    fn current_open(&self, channel: Channel) -> Option<usize> {
        self.open.get(&channel).and_then(|stack| stack.last().copied())
    }

    fn finish(&mut self, turn: &mut Turn, status: TurnStatus, reason: StopReason) {
        for index in self.open.drain().flat_map(|(_, stack)| stack) {
            if let Some(part) = turn.parts.get_mut(index) {
                part.closed = true;
            }
        }
        turn.status = status;
        turn.stop_reason = Some(reason);
        self.finished = true;
    }
}
