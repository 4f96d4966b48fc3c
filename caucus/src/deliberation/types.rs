//! Domain entities owned by a deliberation.
//!
//! The [`Deliberation`] is the aggregate root; opinions, candidate
//! statements, rankings, critiques, and feedback all belong to exactly one
//! deliberation and are append-only after creation. The only fields ever
//! rewritten are the candidate `rank` (set exactly once by aggregation) and
//! the deliberation's stage/round/generation fields (set only inside the
//! per-deliberation critical section).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::{Stage, TransitionError};

/// Unique identifier of a deliberation.
pub type DeliberationId = String;

/// Unique identifier of a participant within a deliberation.
pub type ParticipantId = String;

/// Unique identifier of a candidate statement.
pub type CandidateId = String;

/// Why a generation cycle was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleTrigger {
    /// All opinions collected — first round.
    OpinionComplete,
    /// All critiques collected and rounds remain — revision round.
    CritiqueComplete,
}

impl std::fmt::Display for CycleTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpinionComplete => write!(f, "opinion_complete"),
            Self::CritiqueComplete => write!(f, "critique_complete"),
        }
    }
}

/// State of the external generation pipeline for a deliberation.
///
/// The stage itself never advances until a cycle commits, so this is the
/// only place an in-flight or failed cycle is visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum GenerationStatus {
    /// No cycle pending.
    Idle,
    /// A cycle for `round` has been enqueued or is executing.
    InFlight { round: u32, since: DateTime<Utc> },
    /// The cycle for `round` exhausted its retries.
    Failed {
        round: u32,
        error: String,
        attempts: u32,
        failed_at: DateTime<Utc>,
        /// Whether an explicit retry can re-enqueue the cycle.
        retriable: bool,
    },
}

impl GenerationStatus {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::InFlight { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// A recorded stage transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTransition {
    pub from: Stage,
    pub to: Stage,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// A deliberation session — the aggregate root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deliberation {
    /// Unique identifier.
    pub id: DeliberationId,
    /// The question being deliberated.
    pub question: String,
    /// Current stage.
    pub stage: Stage,
    /// Fixed participant capacity (>= 2).
    pub capacity: u32,
    /// Configured number of critique rounds (>= 1).
    pub critique_rounds: u32,
    /// Current round; round 0 is the opinion round.
    pub round: u32,
    /// External generation pipeline state.
    pub generation: GenerationStatus,
    /// Stage transition history.
    pub transitions: Vec<StageTransition>,
    /// When the deliberation was created.
    pub created_at: DateTime<Utc>,
    /// When the current stage was entered.
    pub stage_entered_at: DateTime<Utc>,
    /// When the first generation cycle committed.
    pub started_at: Option<DateTime<Utc>>,
    /// When the deliberation reached Concluded.
    pub concluded_at: Option<DateTime<Utc>>,
    /// When the deliberation reached Finalized.
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Deliberation {
    /// Create a new deliberation in the Opinion stage.
    pub fn new(question: &str, capacity: u32, critique_rounds: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            question: question.to_string(),
            stage: Stage::Opinion,
            capacity,
            critique_rounds,
            round: 0,
            generation: GenerationStatus::Idle,
            transitions: Vec::new(),
            created_at: now,
            stage_entered_at: now,
            started_at: None,
            concluded_at: None,
            finalized_at: None,
        }
    }

    /// Transition to a new stage, recording the edge.
    pub fn transition(&mut self, to: Stage, reason: &str) -> Result<(), TransitionError> {
        if !self.stage.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.stage,
                to,
                reason: format!(
                    "not a valid transition (allowed: {:?})",
                    self.stage.valid_transitions()
                ),
            });
        }
        let now = Utc::now();
        self.transitions.push(StageTransition {
            from: self.stage,
            to,
            at: now,
            reason: reason.to_string(),
        });
        self.stage = to;
        self.stage_entered_at = now;
        match to {
            Stage::Concluded => self.concluded_at = Some(now),
            Stage::Finalized => self.finalized_at = Some(now),
            _ => {}
        }
        Ok(())
    }

    /// Critique stages still owed after the current round's critique stage.
    ///
    /// With 1 configured round, the first critique stage is also the last.
    pub fn critique_stages_remaining(&self) -> u32 {
        self.critique_rounds.saturating_sub(self.round + 1)
    }

    /// Whether the deliberation is complete.
    pub fn is_finalized(&self) -> bool {
        self.stage.is_terminal()
    }
}

/// A participant's immutable initial opinion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opinion {
    pub id: String,
    pub deliberation_id: DeliberationId,
    pub participant_id: ParticipantId,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

impl Opinion {
    pub fn new(deliberation_id: &str, participant_id: &str, text: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deliberation_id: deliberation_id.to_string(),
            participant_id: participant_id.to_string(),
            text: text.to_string(),
            submitted_at: Utc::now(),
        }
    }
}

/// Where a candidate statement came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    /// The generation cycle that produced this candidate.
    pub cycle_id: String,
    /// Ordinal position within the generation batch.
    pub ordinal: u32,
    /// Provisional rank from the predictor-based aggregation (1 = best).
    pub predicted_rank: u32,
}

/// A machine-generated candidate consensus statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateStatement {
    pub id: CandidateId,
    pub deliberation_id: DeliberationId,
    pub round: u32,
    pub text: String,
    /// Group rank assigned when the round's ranking stage completes
    /// (1 = winner). None until then; set exactly once.
    pub rank: Option<u32>,
    pub provenance: Provenance,
    pub generated_at: DateTime<Utc>,
}

impl CandidateStatement {
    /// Whether this statement won its round.
    pub fn is_winner(&self) -> bool {
        self.rank == Some(1)
    }
}

/// A participant's full strict ranking over one round's candidates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ranking {
    pub id: String,
    pub deliberation_id: DeliberationId,
    pub participant_id: ParticipantId,
    pub round: u32,
    /// Candidate ids, most preferred first; an exact permutation of the
    /// round's candidate set.
    pub order: Vec<CandidateId>,
    pub submitted_at: DateTime<Utc>,
}

impl Ranking {
    pub fn new(
        deliberation_id: &str,
        participant_id: &str,
        round: u32,
        order: Vec<CandidateId>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deliberation_id: deliberation_id.to_string(),
            participant_id: participant_id.to_string(),
            round,
            order,
            submitted_at: Utc::now(),
        }
    }
}

/// A participant's critique of the round's winning statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Critique {
    pub id: String,
    pub deliberation_id: DeliberationId,
    pub participant_id: ParticipantId,
    pub round: u32,
    /// The winning statement this critique addresses.
    pub statement_id: CandidateId,
    pub text: String,
    pub submitted_at: DateTime<Utc>,
}

impl Critique {
    pub fn new(
        deliberation_id: &str,
        participant_id: &str,
        round: u32,
        statement_id: &str,
        text: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deliberation_id: deliberation_id.to_string(),
            participant_id: participant_id.to_string(),
            round,
            statement_id: statement_id.to_string(),
            text: text.to_string(),
            submitted_at: Utc::now(),
        }
    }
}

/// Human feedback on the final winning statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub id: String,
    pub deliberation_id: DeliberationId,
    pub participant_id: ParticipantId,
    pub statement_id: CandidateId,
    /// Agreement with the final statement, 1 (strongly disagree) to 5
    /// (strongly agree).
    pub agreement: u8,
    pub text: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

impl HumanFeedback {
    pub fn new(
        deliberation_id: &str,
        participant_id: &str,
        statement_id: &str,
        agreement: u8,
        text: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            deliberation_id: deliberation_id.to_string(),
            participant_id: participant_id.to_string(),
            statement_id: statement_id.to_string(),
            agreement,
            text,
            submitted_at: Utc::now(),
        }
    }
}

/// Per-participant outcome of the predictor fan-out in one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictorOutcome {
    pub participant_id: ParticipantId,
    /// Attempts made before success or fallback.
    pub attempts: u32,
    /// Whether the neutral presentation-order fallback was used.
    pub fallback: bool,
}

/// Record of one committed generation cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub id: String,
    pub deliberation_id: DeliberationId,
    pub round: u32,
    pub trigger: CycleTrigger,
    /// Candidate ids in the predictor-based provisional order (best first).
    pub predicted_order: Vec<CandidateId>,
    pub predictor_outcomes: Vec<PredictorOutcome>,
    pub completed_at: DateTime<Utc>,
}

/// Externally observable snapshot of a deliberation.
///
/// This is the polling surface: a stalled stage alone never signals
/// failure — `generation_failed` does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliberationStatus {
    pub id: DeliberationId,
    pub stage: Stage,
    pub round: u32,
    /// Distinct participants who submitted an opinion.
    pub participants: u32,
    pub capacity: u32,
    /// Distinct submissions collected for the current stage and round.
    pub submissions_in_stage: u32,
    /// A generation cycle is enqueued or executing.
    pub generating: bool,
    /// The current round's cycle exhausted its retries.
    pub generation_failed: bool,
    /// Whether an explicit retry can revive a failed cycle.
    pub retriable: bool,
    pub last_error: Option<String>,
    /// Winner of the final round, once concluded.
    pub final_statement_id: Option<CandidateId>,
}
