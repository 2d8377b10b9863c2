use serde::{Deserialize, Serialize};

use crate::domain::aggregator::AggregationError;
use crate::domain::delta::DeltaEvent;
use crate::domain::observable::Coalesce;
use crate::domain::transcript::{Transcript, Turn};
use crate::domain::types::{SessionId, TurnId};

/// "Transcript changed" notification published to session subscribers.
///
/// `seq` increases by one for every update a session publishes, so every
/// subscriber sees the same relative order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    /// Sent once, to a newly attached subscriber only: the transcript so far,
    /// including the accumulated content of parts that are still open.
    Snapshot {
        seq: u64,
        session_id: SessionId,
        transcript: Transcript,
        active_turn: Option<TurnId>,
    },
    TurnAdded {
        seq: u64,
        turn: Turn,
    },
    TurnChanged {
        seq: u64,
        turn: Turn,
        delta: DeltaEvent,
    },
    AggregationFinished {
        seq: u64,
        turn: Turn,
        error: Option<AggregationError>,
    },
}

impl SessionUpdate {
    pub fn seq(&self) -> u64 {
        match self {
            SessionUpdate::Snapshot { seq, .. }
            | SessionUpdate::TurnAdded { seq, .. }
            | SessionUpdate::TurnChanged { seq, .. }
            | SessionUpdate::AggregationFinished { seq, .. } => *seq,
        }
    }

    /// The turn this update is about, if any.
    pub fn turn(&self) -> Option<&Turn> {
        match self {
            SessionUpdate::Snapshot { .. } => None,
            SessionUpdate::TurnAdded { turn, .. }
            | SessionUpdate::TurnChanged { turn, .. }
            | SessionUpdate::AggregationFinished { turn, .. } => Some(turn),
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, SessionUpdate::AggregationFinished { .. })
    }
}

/// A lagging watcher needs only the latest state of each turn: a snapshot
/// replaces everything before it, and a turn's update replaces earlier
/// in-progress updates of the same turn. `AggregationFinished` is never
/// dropped.
impl Coalesce for SessionUpdate {
    fn supersedes(&self, older: &Self) -> bool {
        match (self, older) {
            (SessionUpdate::Snapshot { .. }, _) => true,
            (_, SessionUpdate::Snapshot { .. })
            | (_, SessionUpdate::AggregationFinished { .. }) => false,
            (newer, older) => match (newer.turn(), older.turn()) {
                (Some(newer), Some(older)) => newer.id == older.id,
                _ => false,
            },
        }
    }
}

impl Transcript {
    /// Folds a published update into a client-side copy of the transcript.
    pub fn apply_update(&mut self, update: &SessionUpdate) {
        match update {
            SessionUpdate::Snapshot { transcript, .. } => *self = transcript.clone(),
            SessionUpdate::TurnAdded { turn, .. }
            | SessionUpdate::TurnChanged { turn, .. }
            | SessionUpdate::AggregationFinished { turn, .. } => self.upsert(turn.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::transcript::{Channel, TurnStatus};

    #[test]
    fn apply_update_converges_on_latest_turn() {
        let session_id = SessionId::parse("s1").expect("valid id");
        let user = Turn::user("hi");
        let mut assistant = Turn::assistant();

        let mut local = Transcript::new();
        local.apply_update(&SessionUpdate::Snapshot {
            seq: 0,
            session_id,
            transcript: Transcript::from_turns(vec![user.clone()]),
            active_turn: None,
        });
        local.apply_update(&SessionUpdate::TurnAdded {
            seq: 1,
            turn: assistant.clone(),
        });
        assistant.status = TurnStatus::Complete;
        local.apply_update(&SessionUpdate::AggregationFinished {
            seq: 2,
            turn: assistant.clone(),
            error: None,
        });

        assert_eq!(local.turns(), &[user, assistant]);
    }

    #[test]
    fn later_state_of_a_turn_supersedes_earlier_progress() {
        let mut turn = Turn::assistant();
        let started = SessionUpdate::TurnAdded {
            seq: 1,
            turn: turn.clone(),
        };
        turn.status = TurnStatus::Streaming;
        let changed = SessionUpdate::TurnChanged {
            seq: 2,
            turn: turn.clone(),
            delta: DeltaEvent::start(Channel::Text),
        };
        turn.status = TurnStatus::Complete;
        let finished = SessionUpdate::AggregationFinished {
            seq: 3,
            turn,
            error: None,
        };
        let other = SessionUpdate::TurnAdded {
            seq: 4,
            turn: Turn::user("next"),
        };

        assert!(changed.supersedes(&started));
        assert!(finished.supersedes(&changed));
        assert!(!other.supersedes(&finished));
        assert!(!changed.supersedes(&finished));
        assert!(!other.supersedes(&changed));
    }

    #[test]
    fn serializes_with_type_tag() {
        let update = SessionUpdate::TurnChanged {
            seq: 4,
            turn: Turn::assistant(),
            delta: DeltaEvent::delta(Channel::Text, "x"),
        };
        let json = serde_json::to_value(&update).expect("serialize");
        assert_eq!(json["type"], "turn_changed");
        assert_eq!(json["seq"], 4);
        assert_eq!(update.seq(), 4);
    }
}
