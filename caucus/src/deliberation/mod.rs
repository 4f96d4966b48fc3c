//! The deliberation aggregate: stages, entities, submission gating, and
//! the stage-gated state machine.

pub mod error;
pub mod machine;
pub mod stage;
pub mod types;

pub use error::SubmitError;
pub use machine::{CycleRequest, DeliberationMachine};
pub use stage::{Stage, TransitionError};
pub use types::{
    CandidateStatement, Critique, CycleRecord, CycleTrigger, Deliberation, DeliberationStatus,
    GenerationStatus, HumanFeedback, Opinion, PredictorOutcome, Provenance, Ranking,
};
