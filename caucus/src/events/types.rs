//! Deliberation lifecycle events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::deliberation::stage::Stage;
use crate::deliberation::types::CycleTrigger;
use crate::store::SubmissionKind;

/// Event emitted by the state machine and the cycle worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum DeliberationEvent {
    DeliberationCreated {
        deliberation_id: String,
        capacity: u32,
        critique_rounds: u32,
        timestamp: DateTime<Utc>,
    },
    SubmissionAccepted {
        deliberation_id: String,
        kind: SubmissionKind,
        participant_id: String,
        round: u32,
        timestamp: DateTime<Utc>,
    },
    CycleStarted {
        deliberation_id: String,
        round: u32,
        trigger: CycleTrigger,
        timestamp: DateTime<Utc>,
    },
    CycleCompleted {
        deliberation_id: String,
        round: u32,
        candidates: u32,
        timestamp: DateTime<Utc>,
    },
    CycleFailed {
        deliberation_id: String,
        round: u32,
        error: String,
        attempts: u32,
        retriable: bool,
        timestamp: DateTime<Utc>,
    },
    StageAdvanced {
        deliberation_id: String,
        from: Stage,
        to: Stage,
        round: u32,
        timestamp: DateTime<Utc>,
    },
    WinnerSelected {
        deliberation_id: String,
        round: u32,
        statement_id: String,
        tie_broken: bool,
        timestamp: DateTime<Utc>,
    },
    Finalized {
        deliberation_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl DeliberationEvent {
    /// Short type tag for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::DeliberationCreated { .. } => "deliberation_created",
            Self::SubmissionAccepted { .. } => "submission_accepted",
            Self::CycleStarted { .. } => "cycle_started",
            Self::CycleCompleted { .. } => "cycle_completed",
            Self::CycleFailed { .. } => "cycle_failed",
            Self::StageAdvanced { .. } => "stage_advanced",
            Self::WinnerSelected { .. } => "winner_selected",
            Self::Finalized { .. } => "finalized",
        }
    }

    /// The deliberation this event belongs to.
    pub fn deliberation_id(&self) -> &str {
        match self {
            Self::DeliberationCreated { deliberation_id, .. }
            | Self::SubmissionAccepted { deliberation_id, .. }
            | Self::CycleStarted { deliberation_id, .. }
            | Self::CycleCompleted { deliberation_id, .. }
            | Self::CycleFailed { deliberation_id, .. }
            | Self::StageAdvanced { deliberation_id, .. }
            | Self::WinnerSelected { deliberation_id, .. }
            | Self::Finalized { deliberation_id, .. } => deliberation_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::DeliberationCreated { timestamp, .. }
            | Self::SubmissionAccepted { timestamp, .. }
            | Self::CycleStarted { timestamp, .. }
            | Self::CycleCompleted { timestamp, .. }
            | Self::CycleFailed { timestamp, .. }
            | Self::StageAdvanced { timestamp, .. }
            | Self::WinnerSelected { timestamp, .. }
            | Self::Finalized { timestamp, .. } => *timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_accessors() {
        let event = DeliberationEvent::CycleFailed {
            deliberation_id: "d-1".to_string(),
            round: 0,
            error: "quota".to_string(),
            attempts: 3,
            retriable: true,
            timestamp: Utc::now(),
        };
        assert_eq!(event.event_type(), "cycle_failed");
        assert_eq!(event.deliberation_id(), "d-1");
    }

    #[test]
    fn test_event_json_round_trip() {
        let event = DeliberationEvent::StageAdvanced {
            deliberation_id: "d-1".to_string(),
            from: Stage::Opinion,
            to: Stage::Ranking,
            round: 0,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("stage_advanced"));
        let parsed: DeliberationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.event_type(), "stage_advanced");
    }
}
