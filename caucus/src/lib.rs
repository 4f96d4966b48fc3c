//! Coordination core for AI-mediated multi-party deliberation.
//!
//! A fixed set of participants each submit an opinion; an external
//! generative pipeline produces candidate consensus statements;
//! participants rank them; a Condorcet-consistent social choice rule
//! (Schulze with deterministic tie-breaking) selects a winner;
//! participants critique it; and the cycle optionally repeats before
//! finalizing with human feedback.
//!
//! The crate provides:
//! - [`DeliberationMachine`]: the five-stage state machine with
//!   race-free completion detection and exactly-once cycle triggering
//! - [`Orchestrator`] and [`CycleWorker`]: generate → predict → aggregate
//!   cycles with bounded retry, executed off the submission path
//! - [`social_choice`]: the pure Schulze aggregator and seeded tie-break
//! - [`CandidateGenerator`] / [`PreferencePredictor`] capability traits,
//!   with model-backed and deterministic mock implementations
//! - [`SubmissionStore`]: the persistence contract, with an in-memory
//!   reference implementation
//!
//! The [`Caucus`] facade wires all of it together:
//!
//! ```rust,ignore
//! use caucus::{Caucus, CaucusConfig};
//!
//! let caucus = Caucus::with_mocks(CaucusConfig::default());
//! let d = caucus.create_deliberation("Should we ...?", 3, Some(1)).await?;
//! caucus.submit_opinion(&d.id, "alice", "I think ...").await?;
//! ```

pub mod config;
pub mod deliberation;
pub mod events;
pub mod generation;
pub mod orchestrator;
pub mod service;
pub mod social_choice;
pub mod store;

// Re-export the key coordination types.
pub use config::{CaucusConfig, ConfigError};
pub use deliberation::{
    CandidateStatement, Critique, CycleRecord, CycleRequest, CycleTrigger, Deliberation,
    DeliberationMachine, DeliberationStatus, GenerationStatus, HumanFeedback, Opinion,
    PredictorOutcome, Provenance, Ranking, Stage, SubmitError,
};
pub use service::Caucus;

// Re-export the orchestration types.
pub use orchestrator::{CycleError, CycleOutput, CycleWorker, Orchestrator, RetryPolicy};

// Re-export the social choice surface.
pub use social_choice::{aggregate, tie_break_seed, AggregationError, SocialRanking};

// Re-export the capability interfaces and their implementations.
pub use generation::{
    CandidateGenerator, GeminiConfig, GeminiGenerator, GeminiPredictor, GenerationError,
    GenerationRequest, MockGenerator, MockPredictor, PredictionError, PredictionRequest,
    PreferencePredictor, SharedGenerator, SharedPredictor,
};

// Re-export the store contract.
pub use store::{MemoryStore, SharedSubmissionStore, StoreError, SubmissionKind, SubmissionStore};

// Re-export the event surface.
pub use events::{DeliberationEvent, EventBus, SharedEventBus};
