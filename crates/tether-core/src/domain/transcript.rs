use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::types::TurnId;

/// Content lane of a part. Each lane keeps its own `delta_seq` ordering.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Channel {
    Text,
    Reasoning,
    ToolCall,
    ToolResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TurnStatus {
    Pending,
    Streaming,
    Complete,
    Errored,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnStatus::Complete | TurnStatus::Errored)
    }
}

/// Why a turn stopped receiving output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StopReason {
    Completed,
    Cancelled,
    Failed,
}

/// One channel's accumulated output within a turn.
///
/// Parts are only ever extended or closed; once `closed` is set the content
/// never changes again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub kind: Channel,
    pub content: String,
    pub delta_seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub closed: bool,
}

impl Part {
    pub fn open(kind: Channel, delta_seq: u64, label: Option<String>) -> Self {
        Self {
            kind,
            content: String::new(),
            delta_seq,
            label,
            closed: false,
        }
    }

    pub fn closed_text(text: impl Into<String>) -> Self {
        Self {
            kind: Channel::Text,
            content: text.into(),
            delta_seq: 0,
            label: None,
            closed: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub id: TurnId,
    pub role: Role,
    pub parts: Vec<Part>,
    pub created_at: DateTime<Utc>,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            role: Role::User,
            parts: vec![Part::closed_text(text)],
            created_at: Utc::now(),
            status: TurnStatus::Complete,
            stop_reason: Some(StopReason::Completed),
            error: None,
        }
    }

    /// An assistant turn awaiting its first backend event.
    pub fn assistant() -> Self {
        Self {
            id: TurnId::new(),
            role: Role::Assistant,
            parts: Vec::new(),
            created_at: Utc::now(),
            status: TurnStatus::Pending,
            stop_reason: None,
            error: None,
        }
    }

    pub fn parts_of(&self, channel: Channel) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(move |part| part.kind == channel)
    }

    /// Concatenated content of every text part, in lane order.
    pub fn text(&self) -> String {
        self.parts_of(Channel::Text)
            .map(|part| part.content.as_str())
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Ordered, append-only sequence of turns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn turn(&self, id: TurnId) -> Option<&Turn> {
        self.turns.iter().find(|turn| turn.id == id)
    }

    pub fn last_assistant(&self) -> Option<&Turn> {
        self.turns
            .iter()
            .rev()
            .find(|turn| turn.role == Role::Assistant)
    }

    /// Appends a turn and returns its index.
    pub fn push(&mut self, turn: Turn) -> usize {
        self.turns.push(turn);
        self.turns.len() - 1
    }

    pub(crate) fn turn_at_mut(&mut self, index: usize) -> Option<&mut Turn> {
        self.turns.get_mut(index)
    }

    /// Replaces the turn with the same id, or appends it when unknown.
    ///
    /// Used by clients folding published updates into a local copy.
    pub fn upsert(&mut self, turn: Turn) {
        match self.turns.iter_mut().find(|existing| existing.id == turn.id) {
            Some(existing) => *existing = turn,
            None => self.turns.push(turn),
        }
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }
}
