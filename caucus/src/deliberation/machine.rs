//! The deliberation state machine.
//!
//! Owns the five-stage lifecycle: gates which submission kinds are accepted
//! per stage, detects "all participants have submitted" without races, and
//! triggers the generation cycle exactly once per stage boundary.
//!
//! Every stage/round read-modify-write happens under a per-deliberation
//! mutex (the critical section). The critical section never awaits an
//! external call: boundaries that need generation only flip the in-flight
//! marker and enqueue a [`CycleRequest`]; the long-running cycle executes
//! in the worker and re-enters here through [`commit_cycle`] /
//! [`fail_cycle`]. Different deliberations never contend.
//!
//! [`commit_cycle`]: DeliberationMachine::commit_cycle
//! [`fail_cycle`]: DeliberationMachine::fail_cycle

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::CaucusConfig;
use crate::events::{DeliberationEvent, SharedEventBus};
use crate::social_choice::{self, tie_break_seed};
use crate::store::{SharedSubmissionStore, SubmissionKind};

use super::error::SubmitError;
use super::stage::Stage;
use super::types::{
    CandidateStatement, Critique, CycleRecord, CycleTrigger, Deliberation, DeliberationStatus,
    GenerationStatus, HumanFeedback, Opinion, Ranking,
};

/// A unit of generation work handed from the critical section to the
/// cycle worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleRequest {
    pub deliberation_id: String,
    pub round: u32,
    pub trigger: CycleTrigger,
}

/// The stage-gated deliberation coordinator.
pub struct DeliberationMachine {
    store: SharedSubmissionStore,
    events: SharedEventBus,
    config: CaucusConfig,
    /// One critical-section cell per deliberation id.
    cells: RwLock<HashMap<String, Arc<Mutex<()>>>>,
    cycle_tx: mpsc::UnboundedSender<CycleRequest>,
}

impl DeliberationMachine {
    pub fn new(
        store: SharedSubmissionStore,
        events: SharedEventBus,
        config: CaucusConfig,
        cycle_tx: mpsc::UnboundedSender<CycleRequest>,
    ) -> Self {
        Self {
            store,
            events,
            config,
            cells: RwLock::new(HashMap::new()),
            cycle_tx,
        }
    }

    /// Get or create the critical-section cell for a deliberation.
    async fn cell(&self, id: &str) -> Arc<Mutex<()>> {
        if let Some(cell) = self.cells.read().await.get(id) {
            return cell.clone();
        }
        self.cells
            .write()
            .await
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    async fn load(&self, id: &str) -> Result<Deliberation, SubmitError> {
        self.store
            .get_deliberation(id)
            .await?
            .ok_or_else(|| SubmitError::UnknownDeliberation(id.to_string()))
    }

    // =====================================================================
    // Lifecycle
    // =====================================================================

    /// Create a new deliberation in the Opinion stage.
    pub async fn create_deliberation(
        &self,
        question: &str,
        capacity: u32,
        critique_rounds: Option<u32>,
    ) -> Result<Deliberation, SubmitError> {
        if question.trim().is_empty() {
            return Err(SubmitError::InvalidConfig(
                "question must not be empty".to_string(),
            ));
        }
        if capacity < 2 {
            return Err(SubmitError::InvalidConfig(format!(
                "capacity must be at least 2, got {}",
                capacity
            )));
        }
        let critique_rounds = critique_rounds.unwrap_or(self.config.default_critique_rounds);
        if critique_rounds == 0 {
            return Err(SubmitError::InvalidConfig(
                "critique_rounds must be at least 1".to_string(),
            ));
        }

        let deliberation = Deliberation::new(question, capacity, critique_rounds);
        self.store.put_deliberation(&deliberation).await?;
        self.cells
            .write()
            .await
            .insert(deliberation.id.clone(), Arc::default());

        info!(
            deliberation_id = %deliberation.id,
            capacity,
            critique_rounds,
            "deliberation created"
        );
        self.events.publish(DeliberationEvent::DeliberationCreated {
            deliberation_id: deliberation.id.clone(),
            capacity,
            critique_rounds,
            timestamp: Utc::now(),
        });
        Ok(deliberation)
    }

    // =====================================================================
    // Submissions
    // =====================================================================

    /// Submit a participant's initial opinion.
    pub async fn submit_opinion(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        text: &str,
    ) -> Result<Opinion, SubmitError> {
        let cell = self.cell(deliberation_id).await;
        let _guard = cell.lock().await;

        let mut deliberation = self.load(deliberation_id).await?;
        if deliberation.stage != Stage::Opinion {
            return Err(SubmitError::WrongStage {
                expected: Stage::Opinion,
                actual: deliberation.stage,
            });
        }
        if self
            .store
            .has_submitted(deliberation_id, SubmissionKind::Opinion, 0, participant_id)
            .await?
        {
            return Err(SubmitError::DuplicateSubmission(participant_id.to_string()));
        }
        let stored = self
            .store
            .count_distinct_participants(deliberation_id, SubmissionKind::Opinion, 0)
            .await?;
        if deliberation.generation.is_in_flight() || stored >= deliberation.capacity {
            return Err(SubmitError::DeliberationFull {
                capacity: deliberation.capacity,
            });
        }

        let opinion = Opinion::new(deliberation_id, participant_id, text);
        self.store.append_opinion(&opinion).await?;
        self.accepted(deliberation_id, SubmissionKind::Opinion, participant_id, 0);

        if stored + 1 == deliberation.capacity {
            self.mark_generating(&mut deliberation, 0, CycleTrigger::OpinionComplete)
                .await?;
        }
        Ok(opinion)
    }

    /// Submit a participant's full ranking over the current round's
    /// candidates.
    pub async fn submit_ranking(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        round: u32,
        order: Vec<String>,
    ) -> Result<Ranking, SubmitError> {
        let cell = self.cell(deliberation_id).await;
        let _guard = cell.lock().await;

        let mut deliberation = self.load(deliberation_id).await?;
        if deliberation.stage != Stage::Ranking {
            return Err(SubmitError::WrongStage {
                expected: Stage::Ranking,
                actual: deliberation.stage,
            });
        }
        if round != deliberation.round {
            return Err(SubmitError::WrongRound {
                expected: deliberation.round,
                got: round,
            });
        }
        self.require_participant(deliberation_id, participant_id)
            .await?;
        if self
            .store
            .has_submitted(
                deliberation_id,
                SubmissionKind::Ranking,
                round,
                participant_id,
            )
            .await?
        {
            return Err(SubmitError::DuplicateSubmission(participant_id.to_string()));
        }

        let candidates = self.store.list_candidates(deliberation_id, round).await?;
        validate_permutation(&order, &candidates)?;

        let ranking = Ranking::new(deliberation_id, participant_id, round, order);
        self.store.append_ranking(&ranking).await?;
        self.accepted(
            deliberation_id,
            SubmissionKind::Ranking,
            participant_id,
            round,
        );

        let stored = self
            .store
            .count_distinct_participants(deliberation_id, SubmissionKind::Ranking, round)
            .await?;
        if stored == deliberation.capacity {
            self.complete_ranking(&mut deliberation, round, candidates)
                .await?;
        }
        Ok(ranking)
    }

    /// Submit a participant's critique of the round's winning statement.
    pub async fn submit_critique(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        round: u32,
        text: &str,
    ) -> Result<Critique, SubmitError> {
        let cell = self.cell(deliberation_id).await;
        let _guard = cell.lock().await;

        let mut deliberation = self.load(deliberation_id).await?;
        if deliberation.stage != Stage::Critique {
            return Err(SubmitError::WrongStage {
                expected: Stage::Critique,
                actual: deliberation.stage,
            });
        }
        if round != deliberation.round {
            return Err(SubmitError::WrongRound {
                expected: deliberation.round,
                got: round,
            });
        }
        self.require_participant(deliberation_id, participant_id)
            .await?;
        if self
            .store
            .has_submitted(
                deliberation_id,
                SubmissionKind::Critique,
                round,
                participant_id,
            )
            .await?
        {
            return Err(SubmitError::DuplicateSubmission(participant_id.to_string()));
        }

        let winner = self
            .round_winner(deliberation_id, round)
            .await?
            .ok_or_else(|| {
                error!(deliberation_id, round, "critique stage without a winner");
                SubmitError::Aggregation(format!("round {} has no ranked winner", round))
            })?;

        let critique = Critique::new(deliberation_id, participant_id, round, &winner.id, text);
        self.store.append_critique(&critique).await?;
        self.accepted(
            deliberation_id,
            SubmissionKind::Critique,
            participant_id,
            round,
        );

        let stored = self
            .store
            .count_distinct_participants(deliberation_id, SubmissionKind::Critique, round)
            .await?;
        if stored == deliberation.capacity {
            if deliberation.critique_stages_remaining() > 0 {
                self.mark_generating(
                    &mut deliberation,
                    round + 1,
                    CycleTrigger::CritiqueComplete,
                )
                .await?;
            } else {
                self.advance(&mut deliberation, Stage::Concluded, "all critiques collected")
                    .await?;
            }
        }
        Ok(critique)
    }

    /// Submit a participant's feedback on the final statement.
    pub async fn submit_feedback(
        &self,
        deliberation_id: &str,
        participant_id: &str,
        agreement: u8,
        text: Option<String>,
    ) -> Result<HumanFeedback, SubmitError> {
        let cell = self.cell(deliberation_id).await;
        let _guard = cell.lock().await;

        let mut deliberation = self.load(deliberation_id).await?;
        if deliberation.stage != Stage::Concluded {
            return Err(SubmitError::WrongStage {
                expected: Stage::Concluded,
                actual: deliberation.stage,
            });
        }
        if !(1..=5).contains(&agreement) {
            return Err(SubmitError::InvalidFeedback(format!(
                "agreement must be within 1..=5, got {}",
                agreement
            )));
        }
        self.require_participant(deliberation_id, participant_id)
            .await?;
        if self
            .store
            .has_submitted(deliberation_id, SubmissionKind::Feedback, 0, participant_id)
            .await?
        {
            return Err(SubmitError::DuplicateSubmission(participant_id.to_string()));
        }

        let winner = self
            .round_winner(deliberation_id, deliberation.round)
            .await?
            .ok_or_else(|| {
                error!(deliberation_id, "concluded without a final winner");
                SubmitError::Aggregation("concluded deliberation has no winner".to_string())
            })?;

        let feedback =
            HumanFeedback::new(deliberation_id, participant_id, &winner.id, agreement, text);
        self.store.append_feedback(&feedback).await?;
        self.accepted(deliberation_id, SubmissionKind::Feedback, participant_id, 0);

        let stored = self
            .store
            .count_distinct_participants(deliberation_id, SubmissionKind::Feedback, 0)
            .await?;
        if stored == deliberation.capacity {
            self.advance(&mut deliberation, Stage::Finalized, "all feedback collected")
                .await?;
            self.events.publish(DeliberationEvent::Finalized {
                deliberation_id: deliberation_id.to_string(),
                timestamp: Utc::now(),
            });
        }
        Ok(feedback)
    }

    /// Re-enqueue the cycle for a deliberation stuck in `GenerationFailed`.
    ///
    /// Returns true if a cycle was enqueued; in-flight or idle generation
    /// is a no-op. Already-collected submissions are untouched.
    pub async fn retry_generation(&self, deliberation_id: &str) -> Result<bool, SubmitError> {
        let cell = self.cell(deliberation_id).await;
        let _guard = cell.lock().await;

        let mut deliberation = self.load(deliberation_id).await?;
        let round = match &deliberation.generation {
            GenerationStatus::Failed {
                round,
                retriable: true,
                ..
            } => *round,
            GenerationStatus::Failed { retriable: false, .. } => {
                return Err(SubmitError::Internal(
                    "generation failure is not retriable".to_string(),
                ))
            }
            _ => return Ok(false),
        };
        let trigger = if round == 0 {
            CycleTrigger::OpinionComplete
        } else {
            CycleTrigger::CritiqueComplete
        };
        info!(deliberation_id, round, "retrying generation cycle");
        self.mark_generating(&mut deliberation, round, trigger)
            .await?;
        Ok(true)
    }

    // =====================================================================
    // Cycle commit / failure (worker re-entry points)
    // =====================================================================

    /// Commit a completed generation cycle: persist candidates, advance to
    /// Ranking, and clear the in-flight marker.
    ///
    /// Idempotent by (deliberation, round): a duplicate commit for a round
    /// that already has candidates is a no-op.
    pub(crate) async fn commit_cycle(
        &self,
        request: &CycleRequest,
        candidates: Vec<CandidateStatement>,
        record: CycleRecord,
    ) -> Result<(), SubmitError> {
        let cell = self.cell(&request.deliberation_id).await;
        let _guard = cell.lock().await;

        let mut deliberation = self.load(&request.deliberation_id).await?;
        if !self
            .store
            .list_candidates(&request.deliberation_id, request.round)
            .await?
            .is_empty()
        {
            warn!(
                deliberation_id = %request.deliberation_id,
                round = request.round,
                "cycle already committed for this round, ignoring duplicate"
            );
            return Ok(());
        }
        match deliberation.generation {
            GenerationStatus::InFlight { round, .. } if round == request.round => {}
            ref status => {
                warn!(
                    deliberation_id = %request.deliberation_id,
                    round = request.round,
                    ?status,
                    "stale cycle commit, ignoring"
                );
                return Ok(());
            }
        }

        let count = candidates.len() as u32;
        self.store.insert_candidates(&candidates).await?;
        self.store.put_cycle_record(&record).await?;

        deliberation.round = request.round;
        deliberation.generation = GenerationStatus::Idle;
        if deliberation.started_at.is_none() {
            deliberation.started_at = Some(Utc::now());
        }
        let from = deliberation.stage;
        deliberation
            .transition(Stage::Ranking, "generation cycle committed")
            .map_err(|e| SubmitError::Internal(e.to_string()))?;
        self.store
            .set_stage(&request.deliberation_id, Stage::Ranking, request.round)
            .await?;
        self.store.put_deliberation(&deliberation).await?;

        info!(
            deliberation_id = %request.deliberation_id,
            round = request.round,
            candidates = count,
            "cycle committed, ranking open"
        );
        self.events.publish(DeliberationEvent::CycleCompleted {
            deliberation_id: request.deliberation_id.clone(),
            round: request.round,
            candidates: count,
            timestamp: Utc::now(),
        });
        self.events.publish(DeliberationEvent::StageAdvanced {
            deliberation_id: request.deliberation_id.clone(),
            from,
            to: Stage::Ranking,
            round: request.round,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Record a cycle failure. The stage does not advance; the failure is
    /// visible in the status view and retriable when `retriable` is true.
    pub(crate) async fn fail_cycle(
        &self,
        request: &CycleRequest,
        error: String,
        attempts: u32,
        retriable: bool,
    ) {
        let cell = self.cell(&request.deliberation_id).await;
        let _guard = cell.lock().await;

        let mut deliberation = match self.load(&request.deliberation_id).await {
            Ok(d) => d,
            Err(e) => {
                error!(
                    deliberation_id = %request.deliberation_id,
                    "failed cycle for unknown deliberation: {}",
                    e
                );
                return;
            }
        };
        match deliberation.generation {
            GenerationStatus::InFlight { round, .. } if round == request.round => {}
            ref status => {
                warn!(
                    deliberation_id = %request.deliberation_id,
                    round = request.round,
                    ?status,
                    "stale cycle failure, ignoring"
                );
                return;
            }
        }

        error!(
            deliberation_id = %request.deliberation_id,
            round = request.round,
            attempts,
            retriable,
            "generation cycle failed: {}",
            error
        );
        deliberation.generation = GenerationStatus::Failed {
            round: request.round,
            error: error.clone(),
            attempts,
            failed_at: Utc::now(),
            retriable,
        };
        if let Err(e) = self.store.put_deliberation(&deliberation).await {
            error!(
                deliberation_id = %request.deliberation_id,
                "failed to record cycle failure: {}",
                e
            );
        }
        self.events.publish(DeliberationEvent::CycleFailed {
            deliberation_id: request.deliberation_id.clone(),
            round: request.round,
            error,
            attempts,
            retriable,
            timestamp: Utc::now(),
        });
    }

    // =====================================================================
    // Queries
    // =====================================================================

    /// Externally observable snapshot for polling clients.
    pub async fn status(&self, deliberation_id: &str) -> Result<DeliberationStatus, SubmitError> {
        let deliberation = self.load(deliberation_id).await?;
        let participants = self
            .store
            .count_distinct_participants(deliberation_id, SubmissionKind::Opinion, 0)
            .await?;
        let (kind, round) = match deliberation.stage {
            Stage::Opinion => (SubmissionKind::Opinion, 0),
            Stage::Ranking => (SubmissionKind::Ranking, deliberation.round),
            Stage::Critique => (SubmissionKind::Critique, deliberation.round),
            Stage::Concluded | Stage::Finalized => (SubmissionKind::Feedback, 0),
        };
        let submissions_in_stage = self
            .store
            .count_distinct_participants(deliberation_id, kind, round)
            .await?;

        let (generating, generation_failed, retriable, last_error) = match &deliberation.generation
        {
            GenerationStatus::Idle => (false, false, false, None),
            GenerationStatus::InFlight { .. } => (true, false, false, None),
            GenerationStatus::Failed {
                error, retriable, ..
            } => (false, true, *retriable, Some(error.clone())),
        };

        let final_statement_id = if matches!(deliberation.stage, Stage::Concluded | Stage::Finalized)
        {
            self.round_winner(deliberation_id, deliberation.round)
                .await?
                .map(|c| c.id)
        } else {
            None
        };

        Ok(DeliberationStatus {
            id: deliberation.id.clone(),
            stage: deliberation.stage,
            round: deliberation.round,
            participants,
            capacity: deliberation.capacity,
            submissions_in_stage,
            generating,
            generation_failed,
            retriable,
            last_error,
            final_statement_id,
        })
    }

    pub async fn get_deliberation(
        &self,
        deliberation_id: &str,
    ) -> Result<Deliberation, SubmitError> {
        self.load(deliberation_id).await
    }

    /// Candidates of one round, in generation order.
    pub async fn candidates(
        &self,
        deliberation_id: &str,
        round: u32,
    ) -> Result<Vec<CandidateStatement>, SubmitError> {
        self.load(deliberation_id).await?;
        Ok(self.store.list_candidates(deliberation_id, round).await?)
    }

    /// Winner of a round, once its ranking-stage aggregation has run.
    pub async fn round_winner(
        &self,
        deliberation_id: &str,
        round: u32,
    ) -> Result<Option<CandidateStatement>, SubmitError> {
        Ok(self
            .store
            .list_candidates(deliberation_id, round)
            .await?
            .into_iter()
            .find(|c| c.is_winner()))
    }

    /// Collected human feedback on the final statement.
    pub async fn feedback(
        &self,
        deliberation_id: &str,
    ) -> Result<Vec<HumanFeedback>, SubmitError> {
        self.load(deliberation_id).await?;
        Ok(self.store.list_feedback(deliberation_id).await?)
    }

    /// Committed generation cycles with their predictor provenance.
    pub async fn cycle_records(
        &self,
        deliberation_id: &str,
    ) -> Result<Vec<CycleRecord>, SubmitError> {
        self.load(deliberation_id).await?;
        Ok(self.store.list_cycle_records(deliberation_id).await?)
    }

    /// The final consensus statement of a concluded deliberation.
    pub async fn final_statement(
        &self,
        deliberation_id: &str,
    ) -> Result<Option<CandidateStatement>, SubmitError> {
        let deliberation = self.load(deliberation_id).await?;
        if !matches!(deliberation.stage, Stage::Concluded | Stage::Finalized) {
            return Ok(None);
        }
        self.round_winner(deliberation_id, deliberation.round).await
    }

    // =====================================================================
    // Internals (caller holds the critical-section cell)
    // =====================================================================

    async fn require_participant(
        &self,
        deliberation_id: &str,
        participant_id: &str,
    ) -> Result<(), SubmitError> {
        if self
            .store
            .has_submitted(deliberation_id, SubmissionKind::Opinion, 0, participant_id)
            .await?
        {
            Ok(())
        } else {
            Err(SubmitError::UnknownParticipant(participant_id.to_string()))
        }
    }

    fn accepted(
        &self,
        deliberation_id: &str,
        kind: SubmissionKind,
        participant_id: &str,
        round: u32,
    ) {
        debug!(deliberation_id, %kind, participant_id, round, "submission accepted");
        self.events.publish(DeliberationEvent::SubmissionAccepted {
            deliberation_id: deliberation_id.to_string(),
            kind,
            participant_id: participant_id.to_string(),
            round,
            timestamp: Utc::now(),
        });
    }

    /// Flip the in-flight marker and enqueue the cycle. The stage itself is
    /// untouched until the cycle commits.
    async fn mark_generating(
        &self,
        deliberation: &mut Deliberation,
        round: u32,
        trigger: CycleTrigger,
    ) -> Result<(), SubmitError> {
        deliberation.generation = GenerationStatus::InFlight {
            round,
            since: Utc::now(),
        };
        self.store.put_deliberation(deliberation).await?;

        let request = CycleRequest {
            deliberation_id: deliberation.id.clone(),
            round,
            trigger,
        };
        info!(
            deliberation_id = %deliberation.id,
            round,
            %trigger,
            "stage complete, cycle enqueued"
        );
        if self.cycle_tx.send(request).is_err() {
            // Worker is gone; record the failure instead of losing it.
            deliberation.generation = GenerationStatus::Failed {
                round,
                error: "cycle worker unavailable".to_string(),
                attempts: 0,
                failed_at: Utc::now(),
                retriable: true,
            };
            self.store.put_deliberation(deliberation).await?;
            self.events.publish(DeliberationEvent::CycleFailed {
                deliberation_id: deliberation.id.clone(),
                round,
                error: "cycle worker unavailable".to_string(),
                attempts: 0,
                retriable: true,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Aggregate exactly the submitted ballots, assign ranks, and advance
    /// to Critique. Pure CPU; runs inside the critical section.
    async fn complete_ranking(
        &self,
        deliberation: &mut Deliberation,
        round: u32,
        candidates: Vec<CandidateStatement>,
    ) -> Result<(), SubmitError> {
        let rankings = self
            .store
            .list_rankings(&deliberation.id, round)
            .await?;
        if rankings.len() as u32 != deliberation.capacity {
            error!(
                deliberation_id = %deliberation.id,
                round,
                got = rankings.len(),
                expected = deliberation.capacity,
                "ranking set size mismatch at aggregation"
            );
            return Err(SubmitError::Aggregation(format!(
                "expected {} rankings, found {}",
                deliberation.capacity,
                rankings.len()
            )));
        }

        let index_of: HashMap<&str, usize> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (c.id.as_str(), i))
            .collect();
        let mut ballots = Vec::with_capacity(rankings.len());
        for ranking in &rankings {
            let ballot: Option<Vec<usize>> = ranking
                .order
                .iter()
                .map(|id| index_of.get(id.as_str()).copied())
                .collect();
            match ballot {
                Some(ballot) => ballots.push(ballot),
                None => {
                    error!(
                        deliberation_id = %deliberation.id,
                        round,
                        participant = %ranking.participant_id,
                        "stored ranking references unknown candidate"
                    );
                    return Err(SubmitError::Aggregation(
                        "stored ranking references unknown candidate".to_string(),
                    ));
                }
            }
        }

        let candidate_ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let seed = tie_break_seed(&deliberation.id, round, &candidate_ids);
        let result = social_choice::aggregate(&ballots, seed).map_err(|e| {
            error!(deliberation_id = %deliberation.id, round, "aggregation failed: {}", e);
            SubmitError::Aggregation(e.to_string())
        })?;

        let ordered_ids: Vec<String> = result
            .order
            .iter()
            .map(|&i| candidates[i].id.clone())
            .collect();

        let from = deliberation.stage;
        deliberation
            .transition(Stage::Critique, "all rankings collected")
            .map_err(|e| SubmitError::Internal(e.to_string()))?;
        self.store
            .set_candidate_ranks_and_stage(
                &deliberation.id,
                round,
                &ordered_ids,
                Stage::Critique,
                round,
            )
            .await?;
        self.store.put_deliberation(deliberation).await?;

        info!(
            deliberation_id = %deliberation.id,
            round,
            winner = %ordered_ids[0],
            tie_broken = result.tie_broken,
            "group ranking committed, critique open"
        );
        self.events.publish(DeliberationEvent::WinnerSelected {
            deliberation_id: deliberation.id.clone(),
            round,
            statement_id: ordered_ids[0].clone(),
            tie_broken: result.tie_broken,
            timestamp: Utc::now(),
        });
        self.events.publish(DeliberationEvent::StageAdvanced {
            deliberation_id: deliberation.id.clone(),
            from,
            to: Stage::Critique,
            round,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Advance to a stage that needs no generation cycle.
    async fn advance(
        &self,
        deliberation: &mut Deliberation,
        to: Stage,
        reason: &str,
    ) -> Result<(), SubmitError> {
        let from = deliberation.stage;
        deliberation
            .transition(to, reason)
            .map_err(|e| SubmitError::Internal(e.to_string()))?;
        self.store
            .set_stage(&deliberation.id, to, deliberation.round)
            .await?;
        self.store.put_deliberation(deliberation).await?;

        info!(deliberation_id = %deliberation.id, %from, %to, "stage advanced");
        self.events.publish(DeliberationEvent::StageAdvanced {
            deliberation_id: deliberation.id.clone(),
            from,
            to,
            round: deliberation.round,
            timestamp: Utc::now(),
        });
        Ok(())
    }
}

/// Validate that `order` is an exact permutation of the round's candidate
/// set: every candidate exactly once, nothing foreign, no ties possible.
fn validate_permutation(
    order: &[String],
    candidates: &[CandidateStatement],
) -> Result<(), SubmitError> {
    if order.len() != candidates.len() {
        return Err(SubmitError::InvalidRanking(format!(
            "ranking covers {} candidates, round has {}",
            order.len(),
            candidates.len()
        )));
    }
    let known: HashSet<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
    let mut seen: HashSet<&str> = HashSet::with_capacity(order.len());
    for id in order {
        if !known.contains(id.as_str()) {
            return Err(SubmitError::InvalidRanking(format!(
                "unknown candidate id {}",
                id
            )));
        }
        if !seen.insert(id.as_str()) {
            return Err(SubmitError::InvalidRanking(format!(
                "candidate {} ranked more than once",
                id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deliberation::types::Provenance;
    use crate::events::EventBus;
    use crate::store::MemoryStore;

    struct Fixture {
        machine: DeliberationMachine,
        rx: mpsc::UnboundedReceiver<CycleRequest>,
    }

    fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let machine = DeliberationMachine::new(
            MemoryStore::new().shared(),
            EventBus::new().shared(),
            CaucusConfig::default(),
            tx,
        );
        Fixture { machine, rx }
    }

    fn make_candidates(deliberation_id: &str, round: u32, count: u32) -> Vec<CandidateStatement> {
        (0..count)
            .map(|i| CandidateStatement {
                id: format!("c-{}-{}", round, i),
                deliberation_id: deliberation_id.to_string(),
                round,
                text: format!("statement {}", i),
                rank: None,
                provenance: Provenance {
                    cycle_id: "cy-1".to_string(),
                    ordinal: i,
                    predicted_rank: i + 1,
                },
                generated_at: Utc::now(),
            })
            .collect()
    }

    fn make_record(deliberation_id: &str, round: u32) -> CycleRecord {
        CycleRecord {
            id: uuid::Uuid::new_v4().to_string(),
            deliberation_id: deliberation_id.to_string(),
            round,
            trigger: if round == 0 {
                CycleTrigger::OpinionComplete
            } else {
                CycleTrigger::CritiqueComplete
            },
            predicted_order: vec![],
            predictor_outcomes: vec![],
            completed_at: Utc::now(),
        }
    }

    /// Drive a deliberation through opinions and a hand-committed cycle.
    async fn open_ranking(fixture: &mut Fixture, capacity: u32, candidates: u32) -> Deliberation {
        let d = fixture
            .machine
            .create_deliberation("q", capacity, Some(1))
            .await
            .unwrap();
        for i in 0..capacity {
            fixture
                .machine
                .submit_opinion(&d.id, &format!("p{}", i), &format!("opinion {}", i))
                .await
                .unwrap();
        }
        let request = fixture.rx.recv().await.unwrap();
        fixture
            .machine
            .commit_cycle(
                &request,
                make_candidates(&d.id, 0, candidates),
                make_record(&d.id, 0),
            )
            .await
            .unwrap();
        fixture.machine.get_deliberation(&d.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_validates_config() {
        let f = fixture();
        assert!(matches!(
            f.machine.create_deliberation("", 3, Some(1)).await,
            Err(SubmitError::InvalidConfig(_))
        ));
        assert!(matches!(
            f.machine.create_deliberation("q", 1, Some(1)).await,
            Err(SubmitError::InvalidConfig(_))
        ));
        assert!(matches!(
            f.machine.create_deliberation("q", 3, Some(0)).await,
            Err(SubmitError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_ranking_rejected_while_stage_opinion() {
        let f = fixture();
        let d = f.machine.create_deliberation("q", 2, Some(1)).await.unwrap();
        let err = f
            .machine
            .submit_ranking(&d.id, "p0", 0, vec![])
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SubmitError::WrongStage {
                expected: Stage::Ranking,
                actual: Stage::Opinion,
            }
        );
    }

    #[tokio::test]
    async fn test_duplicate_opinion_rejected() {
        let f = fixture();
        let d = f.machine.create_deliberation("q", 3, Some(1)).await.unwrap();
        f.machine.submit_opinion(&d.id, "p0", "first").await.unwrap();
        let err = f
            .machine
            .submit_opinion(&d.id, "p0", "second")
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::DuplicateSubmission("p0".to_string()));
    }

    #[tokio::test]
    async fn test_capacity_overflow_rejected() {
        let mut f = fixture();
        let d = f.machine.create_deliberation("q", 2, Some(1)).await.unwrap();
        f.machine.submit_opinion(&d.id, "p0", "a").await.unwrap();
        f.machine.submit_opinion(&d.id, "p1", "b").await.unwrap();
        // Capacity reached; a third participant cannot join.
        let err = f
            .machine
            .submit_opinion(&d.id, "p2", "c")
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::DeliberationFull { capacity: 2 });
        // Exactly one cycle was enqueued.
        assert!(f.rx.recv().await.is_some());
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_capacity_triggers_single_cycle_and_stage_holds() {
        let mut f = fixture();
        let d = f.machine.create_deliberation("q", 3, Some(1)).await.unwrap();
        for i in 0..3 {
            f.machine
                .submit_opinion(&d.id, &format!("p{}", i), "text")
                .await
                .unwrap();
        }
        let request = f.rx.recv().await.unwrap();
        assert_eq!(request.round, 0);
        assert_eq!(request.trigger, CycleTrigger::OpinionComplete);

        // Stage has not advanced; the status view shows generation running.
        let status = f.machine.status(&d.id).await.unwrap();
        assert_eq!(status.stage, Stage::Opinion);
        assert!(status.generating);
        assert!(!status.generation_failed);
    }

    #[tokio::test]
    async fn test_commit_cycle_opens_ranking() {
        let mut f = fixture();
        let d = open_ranking(&mut f, 3, 4).await;
        assert_eq!(d.stage, Stage::Ranking);
        assert_eq!(d.round, 0);
        assert_eq!(d.generation, GenerationStatus::Idle);
        assert!(d.started_at.is_some());
        assert_eq!(f.machine.candidates(&d.id, 0).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_commit_cycle_is_idempotent_by_round() {
        let mut f = fixture();
        let d = open_ranking(&mut f, 2, 3).await;
        // A duplicate commit for round 0 must not duplicate candidates.
        let request = CycleRequest {
            deliberation_id: d.id.clone(),
            round: 0,
            trigger: CycleTrigger::OpinionComplete,
        };
        f.machine
            .commit_cycle(&request, make_candidates(&d.id, 0, 3), make_record(&d.id, 0))
            .await
            .unwrap();
        assert_eq!(f.machine.candidates(&d.id, 0).await.unwrap().len(), 3);
        assert_eq!(
            f.machine.get_deliberation(&d.id).await.unwrap().stage,
            Stage::Ranking
        );
    }

    #[tokio::test]
    async fn test_invalid_rankings_rejected() {
        let mut f = fixture();
        let d = open_ranking(&mut f, 2, 3).await;
        let ids: Vec<String> = f
            .machine
            .candidates(&d.id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();

        // Too short.
        let err = f
            .machine
            .submit_ranking(&d.id, "p0", 0, ids[..2].to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidRanking(_)));

        // Duplicate entry.
        let err = f
            .machine
            .submit_ranking(
                &d.id,
                "p0",
                0,
                vec![ids[0].clone(), ids[0].clone(), ids[2].clone()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidRanking(_)));

        // Foreign id.
        let err = f
            .machine
            .submit_ranking(
                &d.id,
                "p0",
                0,
                vec![ids[0].clone(), ids[1].clone(), "c-9-9".to_string()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidRanking(_)));

        // Wrong round.
        let err = f
            .machine
            .submit_ranking(&d.id, "p0", 1, ids.clone())
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::WrongRound { expected: 0, got: 1 });

        // Unknown participant.
        let err = f
            .machine
            .submit_ranking(&d.id, "stranger", 0, ids)
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::UnknownParticipant("stranger".to_string()));
    }

    #[tokio::test]
    async fn test_ranking_completion_assigns_ranks_and_opens_critique() {
        let mut f = fixture();
        let d = open_ranking(&mut f, 2, 3).await;
        let ids: Vec<String> = f
            .machine
            .candidates(&d.id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();

        // Both participants prefer candidate 1.
        let order = vec![ids[1].clone(), ids[0].clone(), ids[2].clone()];
        f.machine
            .submit_ranking(&d.id, "p0", 0, order.clone())
            .await
            .unwrap();
        f.machine
            .submit_ranking(&d.id, "p1", 0, order)
            .await
            .unwrap();

        let d = f.machine.get_deliberation(&d.id).await.unwrap();
        assert_eq!(d.stage, Stage::Critique);
        let winner = f.machine.round_winner(&d.id, 0).await.unwrap().unwrap();
        assert_eq!(winner.id, ids[1]);

        // Late ranking fails rather than being silently dropped.
        let err = f
            .machine
            .submit_ranking(
                &d.id,
                "p0",
                0,
                vec![ids[0].clone(), ids[1].clone(), ids[2].clone()],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::WrongStage { .. }));
    }

    #[tokio::test]
    async fn test_final_critique_concludes() {
        let mut f = fixture();
        let d = open_ranking(&mut f, 2, 2).await;
        let ids: Vec<String> = f
            .machine
            .candidates(&d.id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        for p in ["p0", "p1"] {
            f.machine
                .submit_ranking(&d.id, p, 0, ids.clone())
                .await
                .unwrap();
        }
        for p in ["p0", "p1"] {
            f.machine
                .submit_critique(&d.id, p, 0, "needs more nuance")
                .await
                .unwrap();
        }
        let d = f.machine.get_deliberation(&d.id).await.unwrap();
        // One configured critique round: conclude instead of looping.
        assert_eq!(d.stage, Stage::Concluded);
        assert!(d.concluded_at.is_some());
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_critique_loops_back_when_rounds_remain() {
        let mut f = fixture();
        let d = f.machine.create_deliberation("q", 2, Some(2)).await.unwrap();
        for p in ["p0", "p1"] {
            f.machine.submit_opinion(&d.id, p, "text").await.unwrap();
        }
        let request = f.rx.recv().await.unwrap();
        f.machine
            .commit_cycle(&request, make_candidates(&d.id, 0, 2), make_record(&d.id, 0))
            .await
            .unwrap();
        let ids: Vec<String> = f
            .machine
            .candidates(&d.id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        for p in ["p0", "p1"] {
            f.machine
                .submit_ranking(&d.id, p, 0, ids.clone())
                .await
                .unwrap();
        }
        for p in ["p0", "p1"] {
            f.machine
                .submit_critique(&d.id, p, 0, "critique")
                .await
                .unwrap();
        }

        // A second cycle is enqueued for round 1; stage holds at Critique.
        let request = f.rx.recv().await.unwrap();
        assert_eq!(request.round, 1);
        assert_eq!(request.trigger, CycleTrigger::CritiqueComplete);
        let d = f.machine.get_deliberation(&d.id).await.unwrap();
        assert_eq!(d.stage, Stage::Critique);
        assert!(d.generation.is_in_flight());

        // Committing the revision cycle re-opens ranking at round 1.
        f.machine
            .commit_cycle(&request, make_candidates(&d.id, 1, 2), make_record(&d.id, 1))
            .await
            .unwrap();
        let d = f.machine.get_deliberation(&d.id).await.unwrap();
        assert_eq!(d.stage, Stage::Ranking);
        assert_eq!(d.round, 1);
    }

    #[tokio::test]
    async fn test_feedback_finalizes() {
        let mut f = fixture();
        let d = open_ranking(&mut f, 2, 2).await;
        let ids: Vec<String> = f
            .machine
            .candidates(&d.id, 0)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        for p in ["p0", "p1"] {
            f.machine
                .submit_ranking(&d.id, p, 0, ids.clone())
                .await
                .unwrap();
        }
        for p in ["p0", "p1"] {
            f.machine
                .submit_critique(&d.id, p, 0, "fine")
                .await
                .unwrap();
        }

        // Feedback gating.
        let err = f
            .machine
            .submit_feedback(&d.id, "p0", 9, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::InvalidFeedback(_)));

        f.machine
            .submit_feedback(&d.id, "p0", 4, Some("close enough".to_string()))
            .await
            .unwrap();
        f.machine
            .submit_feedback(&d.id, "p1", 5, None)
            .await
            .unwrap();

        let d = f.machine.get_deliberation(&d.id).await.unwrap();
        assert_eq!(d.stage, Stage::Finalized);
        assert!(d.finalized_at.is_some());
        assert!(f
            .machine
            .final_statement(&d.id)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_fail_cycle_surfaces_in_status_and_retry_reenqueues() {
        let mut f = fixture();
        let d = f.machine.create_deliberation("q", 2, Some(1)).await.unwrap();
        for p in ["p0", "p1"] {
            f.machine.submit_opinion(&d.id, p, "text").await.unwrap();
        }
        let request = f.rx.recv().await.unwrap();
        f.machine
            .fail_cycle(&request, "quota exhausted".to_string(), 3, true)
            .await;

        let status = f.machine.status(&d.id).await.unwrap();
        assert_eq!(status.stage, Stage::Opinion);
        assert!(status.generation_failed);
        assert!(status.retriable);
        assert_eq!(status.last_error.as_deref(), Some("quota exhausted"));
        assert!(f.machine.candidates(&d.id, 0).await.unwrap().is_empty());

        // Explicit retry re-enqueues the same round.
        assert!(f.machine.retry_generation(&d.id).await.unwrap());
        let retried = f.rx.recv().await.unwrap();
        assert_eq!(retried.round, 0);

        // Retry while in flight is a no-op.
        assert!(!f.machine.retry_generation(&d.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_deliberation() {
        let f = fixture();
        let err = f
            .machine
            .submit_opinion("missing", "p0", "text")
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::UnknownDeliberation("missing".to_string()));
    }
}
