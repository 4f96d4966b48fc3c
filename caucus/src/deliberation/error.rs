//! Submission error taxonomy.
//!
//! Client errors are rejected synchronously and never touch deliberation
//! state. Generation-pipeline failures are not represented here — they are
//! recorded on the deliberation and surfaced through the status view.

use thiserror::Error;

use super::stage::Stage;
use super::types::ParticipantId;
use crate::store::StoreError;

/// Error returned to a submitting caller.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SubmitError {
    #[error("unknown deliberation: {0}")]
    UnknownDeliberation(String),

    #[error("participant {0} is not part of this deliberation")]
    UnknownParticipant(ParticipantId),

    #[error("submission not accepted: stage is {actual}, requires {expected}")]
    WrongStage { expected: Stage, actual: Stage },

    #[error("submission targets round {got} but the current round is {expected}")]
    WrongRound { expected: u32, got: u32 },

    #[error("participant {0} already submitted for this stage")]
    DuplicateSubmission(ParticipantId),

    #[error("invalid ranking: {0}")]
    InvalidRanking(String),

    #[error("deliberation is full ({capacity} participants)")]
    DeliberationFull { capacity: u32 },

    #[error("invalid feedback: {0}")]
    InvalidFeedback(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Aggregation invariant violated — an internal bug, never retried.
    #[error("aggregation invariant violated: {0}")]
    Aggregation(String),

    /// Internal coordination bug (e.g. an impossible stage transition).
    #[error("internal error: {0}")]
    Internal(String),
}

impl SubmitError {
    /// Whether this is a client error (bad submission) as opposed to an
    /// internal or store failure.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::Store(_) | Self::Aggregation(_) | Self::Internal(_)
        )
    }
}
