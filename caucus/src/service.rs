//! The `Caucus` facade: wires the store, state machine, event bus, and
//! cycle worker into one handle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CaucusConfig;
use crate::deliberation::machine::DeliberationMachine;
use crate::deliberation::types::{
    CandidateStatement, Critique, Deliberation, DeliberationStatus, HumanFeedback, Opinion,
    Ranking,
};
use crate::deliberation::{Stage, SubmitError};
use crate::events::{DeliberationEvent, EventBus, SharedEventBus};
use crate::generation::{MockGenerator, MockPredictor, SharedGenerator, SharedPredictor};
use crate::orchestrator::{CycleWorker, Orchestrator, RetryPolicy};
use crate::store::{MemoryStore, SharedSubmissionStore};

/// One deliberation coordinator: state machine plus its cycle worker.
///
/// Must be created inside a tokio runtime — construction spawns the worker
/// task.
pub struct Caucus {
    machine: Arc<DeliberationMachine>,
    events: SharedEventBus,
    worker: JoinHandle<()>,
}

impl Caucus {
    pub fn new(
        config: CaucusConfig,
        store: SharedSubmissionStore,
        generator: SharedGenerator,
        predictor: SharedPredictor,
    ) -> Self {
        let events = EventBus::new().shared();
        let (cycle_tx, cycle_rx) = mpsc::unbounded_channel();
        let machine = Arc::new(DeliberationMachine::new(
            store.clone(),
            events.clone(),
            config.clone(),
            cycle_tx,
        ));
        let orchestrator = Orchestrator::new(store, generator, predictor, config.clone());
        let worker = CycleWorker::new(
            machine.clone(),
            orchestrator,
            events.clone(),
            cycle_rx,
            RetryPolicy::from(&config),
        )
        .spawn();

        Self {
            machine,
            events,
            worker,
        }
    }

    /// In-memory store and deterministic doubles — for tests and demos.
    pub fn with_mocks(config: CaucusConfig) -> Self {
        let generator: SharedGenerator = Arc::new(MockGenerator::new(config.num_candidates));
        let predictor: SharedPredictor = Arc::new(MockPredictor::new());
        Self::new(config, MemoryStore::new().shared(), generator, predictor)
    }

    pub fn machine(&self) -> &Arc<DeliberationMachine> {
        &self.machine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliberationEvent> {
        self.events.subscribe()
    }

    /// Stop the worker task. In-flight cycles are dropped; their
    /// deliberations stay retriable after a restart.
    pub fn abort(&self) {
        self.worker.abort();
    }

    // Thin delegates over the state machine.

    pub async fn create_deliberation(
        &self,
        question: &str,
        capacity: u32,
        critique_rounds: Option<u32>,
    ) -> Result<Deliberation, SubmitError> {
        self.machine
            .create_deliberation(question, capacity, critique_rounds)
            .await
    }

    pub async fn submit_opinion(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        text: &str,
    ) -> Result<Opinion, SubmitError> {
        self.machine
            .submit_opinion(deliberation_id, participant_id, text)
            .await
    }

    pub async fn submit_ranking(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        round: u32,
        order: Vec<String>,
    ) -> Result<Ranking, SubmitError> {
        self.machine
            .submit_ranking(deliberation_id, participant_id, round, order)
            .await
    }

    pub async fn submit_critique(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        round: u32,
        text: &str,
    ) -> Result<Critique, SubmitError> {
        self.machine
            .submit_critique(deliberation_id, participant_id, round, text)
            .await
    }

    pub async fn submit_feedback(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        agreement: u8,
        text: Option<String>,
    ) -> Result<HumanFeedback, SubmitError> {
        self.machine
            .submit_feedback(deliberation_id, participant_id, agreement, text)
            .await
    }

    pub async fn retry_generation(&self, deliberation_id: &str) -> Result<bool, SubmitError> {
        self.machine.retry_generation(deliberation_id).await
    }

    pub async fn status(&self, deliberation_id: &str) -> Result<DeliberationStatus, SubmitError> {
        self.machine.status(deliberation_id).await
    }

    pub async fn candidates(
        &self,
        deliberation_id: &str,
        round: u32,
    ) -> Result<Vec<CandidateStatement>, SubmitError> {
        self.machine.candidates(deliberation_id, round).await
    }

    pub async fn final_statement(
        &self,
        deliberation_id: &str,
    ) -> Result<Option<CandidateStatement>, SubmitError> {
        self.machine.final_statement(deliberation_id).await
    }

    /// Poll the status view until `stage` is reached.
    ///
    /// Fails fast when the status view reports a generation failure —
    /// polling clients must not infer failure from a stalled stage.
    pub async fn wait_for_stage(
        &self,
        deliberation_id: &str,
        stage: Stage,
        limit: Duration,
    ) -> Result<DeliberationStatus, SubmitError> {
        let deadline = Instant::now() + limit;
        loop {
            let status = self.status(deliberation_id).await?;
            if status.stage == stage {
                return Ok(status);
            }
            if status.generation_failed {
                return Err(SubmitError::Internal(format!(
                    "generation failed while waiting for stage {}: {}",
                    stage,
                    status.last_error.unwrap_or_default()
                )));
            }
            if Instant::now() >= deadline {
                return Err(SubmitError::Internal(format!(
                    "timed out waiting for stage {} (currently {})",
                    stage, status.stage
                )));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
