use serde::{Deserialize, Serialize};

use crate::domain::transcript::Channel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Phase {
    Start,
    Delta,
    End,
}

/// One incremental fragment of generative output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaEvent {
    pub channel: Channel,
    pub phase: Phase,
    #[serde(default)]
    pub payload: String,
}

impl DeltaEvent {
    pub fn start(channel: Channel) -> Self {
        Self {
            channel,
            phase: Phase::Start,
            payload: String::new(),
        }
    }

    /// A `start` whose payload labels the part, e.g. the tool name of a tool call.
    pub fn start_labeled(channel: Channel, label: impl Into<String>) -> Self {
        Self {
            channel,
            phase: Phase::Start,
            payload: label.into(),
        }
    }

    pub fn delta(channel: Channel, payload: impl Into<String>) -> Self {
        Self {
            channel,
            phase: Phase::Delta,
            payload: payload.into(),
        }
    }

    pub fn end(channel: Channel) -> Self {
        Self {
            channel,
            phase: Phase::End,
            payload: String::new(),
        }
    }
}

/// Everything a generative backend can emit for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    Delta(DeltaEvent),
    Completed,
    Failed { message: String },
}

impl BackendEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendEvent::Completed | BackendEvent::Failed { .. })
    }

    pub fn failed(message: impl Into<String>) -> Self {
        BackendEvent::Failed {
            message: message.into(),
        }
    }
}

impl From<DeltaEvent> for BackendEvent {
    fn from(delta: DeltaEvent) -> Self {
        BackendEvent::Delta(delta)
    }
}
