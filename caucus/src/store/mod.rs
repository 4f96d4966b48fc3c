//! Durable record of a deliberation's submissions and candidates.
//!
//! Persistence technology is an external collaborator: the coordination
//! core only specifies the read/write contract it needs, and ships an
//! in-process [`MemoryStore`] reference implementation. All stage/round and
//! candidate-rank writes happen inside the state machine's per-deliberation
//! critical section; the other rows are append-only and participant-scoped.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::deliberation::stage::Stage;
use crate::deliberation::types::{
    CandidateId, CandidateStatement, Critique, CycleRecord, Deliberation, HumanFeedback, Opinion,
    Ranking,
};

pub mod memory;

pub use memory::MemoryStore;

/// Kind of a participant submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionKind {
    Opinion,
    Ranking,
    Critique,
    Feedback,
}

impl std::fmt::Display for SubmissionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opinion => write!(f, "opinion"),
            Self::Ranking => write!(f, "ranking"),
            Self::Critique => write!(f, "critique"),
            Self::Feedback => write!(f, "feedback"),
        }
    }
}

/// Error from the submission store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("deliberation not found: {0}")]
    DeliberationNotFound(String),

    #[error("duplicate {kind} submission from participant {participant}")]
    DuplicateRow {
        kind: SubmissionKind,
        participant: String,
    },

    #[error("candidate rank assignment rejected: {0}")]
    RankAssignment(String),

    #[error("store backend failure: {0}")]
    Backend(String),
}

/// Shared handle to a store implementation.
pub type SharedSubmissionStore = Arc<dyn SubmissionStore>;

/// Read/write contract the coordination core needs from persistence.
///
/// `set_candidate_ranks_and_stage` must apply both writes as a single
/// transactional unit — the ranking-stage commit depends on it.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    async fn put_deliberation(&self, deliberation: &Deliberation) -> Result<(), StoreError>;

    async fn get_deliberation(&self, id: &str) -> Result<Option<Deliberation>, StoreError>;

    async fn append_opinion(&self, opinion: &Opinion) -> Result<(), StoreError>;

    async fn append_ranking(&self, ranking: &Ranking) -> Result<(), StoreError>;

    async fn append_critique(&self, critique: &Critique) -> Result<(), StoreError>;

    async fn append_feedback(&self, feedback: &HumanFeedback) -> Result<(), StoreError>;

    /// Distinct participants with a stored submission of `kind` for
    /// `round`. Opinions and feedback are round-agnostic.
    async fn count_distinct_participants(
        &self,
        deliberation: &str,
        kind: SubmissionKind,
        round: u32,
    ) -> Result<u32, StoreError>;

    /// Whether `participant` already has a submission of `kind` for `round`.
    async fn has_submitted(
        &self,
        deliberation: &str,
        kind: SubmissionKind,
        round: u32,
        participant: &str,
    ) -> Result<bool, StoreError>;

    async fn list_opinions(&self, deliberation: &str) -> Result<Vec<Opinion>, StoreError>;

    async fn list_rankings(
        &self,
        deliberation: &str,
        round: u32,
    ) -> Result<Vec<Ranking>, StoreError>;

    async fn list_critiques(
        &self,
        deliberation: &str,
        round: u32,
    ) -> Result<Vec<Critique>, StoreError>;

    async fn list_feedback(&self, deliberation: &str) -> Result<Vec<HumanFeedback>, StoreError>;

    async fn insert_candidates(
        &self,
        candidates: &[CandidateStatement],
    ) -> Result<(), StoreError>;

    /// Candidates of one round in generation (ordinal) order.
    async fn list_candidates(
        &self,
        deliberation: &str,
        round: u32,
    ) -> Result<Vec<CandidateStatement>, StoreError>;

    /// Assign ranks 1..=N following `ordered_ids` (winner first). Ranks are
    /// set exactly once; a second assignment or an id set that does not
    /// exactly match the round's candidates is rejected.
    async fn set_candidate_ranks(
        &self,
        deliberation: &str,
        round: u32,
        ordered_ids: &[CandidateId],
    ) -> Result<(), StoreError>;

    async fn set_stage(
        &self,
        deliberation: &str,
        stage: Stage,
        round: u32,
    ) -> Result<(), StoreError>;

    /// Rank assignment plus stage advance as one transactional unit.
    async fn set_candidate_ranks_and_stage(
        &self,
        deliberation: &str,
        round: u32,
        ordered_ids: &[CandidateId],
        stage: Stage,
        new_round: u32,
    ) -> Result<(), StoreError>;

    async fn put_cycle_record(&self, record: &CycleRecord) -> Result<(), StoreError>;

    async fn list_cycle_records(
        &self,
        deliberation: &str,
    ) -> Result<Vec<CycleRecord>, StoreError>;
}
