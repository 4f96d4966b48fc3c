//! Capability interfaces for the external statement-generation pipeline.
//!
//! The orchestrator is written against these traits only; production code
//! plugs in the model-backed implementations while tests use the
//! deterministic doubles in [`mock`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod gemini;
pub mod mock;

pub use gemini::{GeminiConfig, GeminiGenerator, GeminiPredictor};
pub use mock::{overlap_order, MockGenerator, MockPredictor};

/// Inputs for one candidate-generation call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The deliberation question.
    pub question: String,
    /// All participant opinions, in submission order.
    pub opinions: Vec<String>,
    /// Winning statement of the previous round, for revision rounds.
    pub previous_winner: Option<String>,
    /// Critiques of the previous winner, for revision rounds.
    pub critiques: Option<Vec<String>>,
    /// How many candidate statements to produce.
    pub num_candidates: u32,
}

/// Inputs for one per-participant preference prediction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionRequest {
    pub question: String,
    /// The participant's own opinion.
    pub opinion: String,
    /// Candidate statement texts, in presentation order.
    pub candidates: Vec<String>,
    pub previous_winner: Option<String>,
    /// The participant's critique of the previous winner, if any.
    pub critique: Option<String>,
}

/// Failure of a candidate-generation call. All variants are transient and
/// retried by the orchestrator's policy.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    #[error("generation request failed: {0}")]
    Transport(String),

    #[error("generation rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("too few usable candidates: got {got}, need at least {need}")]
    TooFewCandidates { got: usize, need: usize },

    #[error("malformed generation response: {0}")]
    Malformed(String),
}

/// Failure of a single participant's preference prediction.
#[derive(Debug, Clone, Error)]
pub enum PredictionError {
    #[error("prediction request failed: {0}")]
    Transport(String),

    #[error("prediction rate limited")]
    RateLimited,

    #[error("prediction timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed ranking: {0}")]
    Malformed(String),
}

/// Produces candidate consensus statements for a round.
#[async_trait]
pub trait CandidateGenerator: Send + Sync {
    /// Generate candidate statement texts. Must return a non-empty list;
    /// the orchestrator enforces the usable-candidate floor.
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, GenerationError>;
}

/// Predicts one participant's full ranking over a candidate set.
#[async_trait]
pub trait PreferencePredictor: Send + Sync {
    /// Return a best-first permutation of candidate indices
    /// `0..request.candidates.len()`. Anything else is rejected as a
    /// per-participant failure.
    async fn rank(&self, request: &PredictionRequest) -> Result<Vec<usize>, PredictionError>;
}

/// Shared handle to a generator implementation.
pub type SharedGenerator = Arc<dyn CandidateGenerator>;

/// Shared handle to a predictor implementation.
pub type SharedPredictor = Arc<dyn PreferencePredictor>;

/// Whether `ranking` is an exact permutation of `0..len`.
pub fn is_permutation(ranking: &[usize], len: usize) -> bool {
    if ranking.len() != len {
        return false;
    }
    let mut seen = vec![false; len];
    for &index in ranking {
        if index >= len || seen[index] {
            return false;
        }
        seen[index] = true;
    }
    true
}
