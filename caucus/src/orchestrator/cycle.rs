//! One generation cycle: generate → predict → aggregate.
//!
//! Runs entirely outside the state machine's critical section; the worker
//! feeds its output back through the machine's commit path. Per-participant
//! predictor failures degrade to a neutral fallback ranking instead of
//! aborting the cycle; the fallback is flagged in the cycle record.

use std::collections::HashMap;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::CaucusConfig;
use crate::deliberation::machine::CycleRequest;
use crate::deliberation::types::{
    CandidateStatement, CycleRecord, Deliberation, Opinion, PredictorOutcome, Provenance,
};
use crate::generation::{
    is_permutation, GenerationError, GenerationRequest, PredictionRequest, SharedGenerator,
    SharedPredictor,
};
use crate::social_choice::{self, tie_break_seed, AggregationError};
use crate::store::{SharedSubmissionStore, StoreError};

use super::retry::RetryPolicy;

/// Error from one cycle execution.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Generation(#[from] GenerationError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("round {0} has no ranked winner to build on")]
    MissingWinner(u32),
}

impl CycleError {
    /// Fatal errors signal internal bugs; the worker must not retry them
    /// and marks the failure non-retriable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Aggregation(_) | Self::MissingWinner(_))
    }
}

/// Output of a successful cycle, ready for the machine's commit path.
#[derive(Debug, Clone)]
pub struct CycleOutput {
    pub candidates: Vec<CandidateStatement>,
    pub record: CycleRecord,
}

/// Drives one generate → predict → aggregate cycle against the capability
/// interfaces.
pub struct Orchestrator {
    store: SharedSubmissionStore,
    generator: SharedGenerator,
    predictor: SharedPredictor,
    config: CaucusConfig,
}

impl Orchestrator {
    pub fn new(
        store: SharedSubmissionStore,
        generator: SharedGenerator,
        predictor: SharedPredictor,
        config: CaucusConfig,
    ) -> Self {
        Self {
            store,
            generator,
            predictor,
            config,
        }
    }

    /// Execute the cycle for `request` and build the candidates to commit.
    pub async fn run_cycle(
        &self,
        deliberation: &Deliberation,
        request: &CycleRequest,
    ) -> Result<CycleOutput, CycleError> {
        let opinions = self.store.list_opinions(&deliberation.id).await?;
        info!(
            deliberation_id = %deliberation.id,
            round = request.round,
            trigger = %request.trigger,
            participants = opinions.len(),
            "running generation cycle"
        );

        // Revision rounds build on the previous winner and its critiques.
        let (previous_winner, critique_of) = if request.round > 0 {
            let prev_round = request.round - 1;
            let winner = self
                .store
                .list_candidates(&deliberation.id, prev_round)
                .await?
                .into_iter()
                .find(|c| c.is_winner())
                .ok_or(CycleError::MissingWinner(prev_round))?;
            let critiques: HashMap<String, String> = self
                .store
                .list_critiques(&deliberation.id, prev_round)
                .await?
                .into_iter()
                .map(|c| (c.participant_id, c.text))
                .collect();
            (Some(winner.text), Some(critiques))
        } else {
            (None, None)
        };
        let all_critiques = critique_of.as_ref().map(|by_participant| {
            opinions
                .iter()
                .filter_map(|o| by_participant.get(&o.participant_id).cloned())
                .collect::<Vec<String>>()
        });

        let generation_request = GenerationRequest {
            question: deliberation.question.clone(),
            opinions: opinions.iter().map(|o| o.text.clone()).collect(),
            previous_winner: previous_winner.clone(),
            critiques: all_critiques,
            num_candidates: self.config.num_candidates,
        };
        let texts = timeout(
            self.config.generate_timeout(),
            self.generator.generate(&generation_request),
        )
        .await
        .map_err(|_| GenerationError::Timeout(self.config.generate_timeout()))??;

        let usable: Vec<String> = texts
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .take(self.config.num_candidates as usize)
            .collect();
        if usable.len() < self.config.min_candidates as usize {
            return Err(GenerationError::TooFewCandidates {
                got: usable.len(),
                need: self.config.min_candidates as usize,
            }
            .into());
        }
        debug!(
            deliberation_id = %deliberation.id,
            candidates = usable.len(),
            "candidates generated"
        );

        // Per-participant predictions, joined concurrently; order-independent.
        let predictions = join_all(opinions.iter().map(|opinion| {
            let critique = critique_of
                .as_ref()
                .and_then(|m| m.get(&opinion.participant_id).cloned());
            self.predict_with_retry(deliberation, opinion, &usable, previous_winner.clone(), critique)
        }))
        .await;

        let ballots: Vec<Vec<usize>> = predictions.iter().map(|(b, _)| b.clone()).collect();
        let outcomes: Vec<PredictorOutcome> =
            predictions.into_iter().map(|(_, o)| o).collect();

        let cycle_id = uuid::Uuid::new_v4().to_string();
        let candidate_ids: Vec<String> = (0..usable.len())
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect();
        let seed = tie_break_seed(&deliberation.id, request.round, &candidate_ids);
        let predicted = social_choice::aggregate(&ballots, seed)?;

        let now = Utc::now();
        let candidates: Vec<CandidateStatement> = usable
            .into_iter()
            .enumerate()
            .map(|(i, text)| CandidateStatement {
                id: candidate_ids[i].clone(),
                deliberation_id: deliberation.id.clone(),
                round: request.round,
                text,
                rank: None,
                provenance: Provenance {
                    cycle_id: cycle_id.clone(),
                    ordinal: i as u32,
                    predicted_rank: predicted.ranks[i],
                },
                generated_at: now,
            })
            .collect();
        let record = CycleRecord {
            id: cycle_id,
            deliberation_id: deliberation.id.clone(),
            round: request.round,
            trigger: request.trigger,
            predicted_order: predicted
                .order
                .iter()
                .map(|&i| candidate_ids[i].clone())
                .collect(),
            predictor_outcomes: outcomes,
            completed_at: now,
        };
        Ok(CycleOutput { candidates, record })
    }

    /// Predict one participant's ranking with bounded retry; exhausted
    /// retries degrade to the neutral presentation-order ranking.
    async fn predict_with_retry(
        &self,
        deliberation: &Deliberation,
        opinion: &Opinion,
        candidates: &[String],
        previous_winner: Option<String>,
        critique: Option<String>,
    ) -> (Vec<usize>, PredictorOutcome) {
        let request = PredictionRequest {
            question: deliberation.question.clone(),
            opinion: opinion.text.clone(),
            candidates: candidates.to_vec(),
            previous_winner,
            critique,
        };
        let policy = RetryPolicy::new(
            self.config.predictor_retries,
            self.config.backoff_base_ms,
            self.config.backoff_max_ms,
        );

        let mut attempts = 0;
        loop {
            attempts += 1;
            match timeout(self.config.predict_timeout(), self.predictor.rank(&request)).await {
                Ok(Ok(order)) if is_permutation(&order, candidates.len()) => {
                    return (
                        order,
                        PredictorOutcome {
                            participant_id: opinion.participant_id.clone(),
                            attempts,
                            fallback: false,
                        },
                    );
                }
                Ok(Ok(order)) => warn!(
                    deliberation_id = %deliberation.id,
                    participant = %opinion.participant_id,
                    attempts,
                    "predictor returned a non-permutation of length {}",
                    order.len()
                ),
                Ok(Err(e)) => warn!(
                    deliberation_id = %deliberation.id,
                    participant = %opinion.participant_id,
                    attempts,
                    "prediction failed: {}",
                    e
                ),
                Err(_) => warn!(
                    deliberation_id = %deliberation.id,
                    participant = %opinion.participant_id,
                    attempts,
                    "prediction timed out"
                ),
            }
            if !policy.allows_retry(attempts) {
                break;
            }
            tokio::time::sleep(policy.delay(attempts - 1)).await;
        }

        warn!(
            deliberation_id = %deliberation.id,
            participant = %opinion.participant_id,
            attempts,
            "predictor exhausted, using neutral fallback ranking"
        );
        (
            (0..candidates.len()).collect(),
            PredictorOutcome {
                participant_id: opinion.participant_id.clone(),
                attempts,
                fallback: true,
            },
        )
    }
}
