//! In-process reference implementation of the submission store.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::deliberation::stage::Stage;
use crate::deliberation::types::{
    CandidateId, CandidateStatement, Critique, CycleRecord, Deliberation, HumanFeedback, Opinion,
    Ranking,
};

use super::{StoreError, SubmissionKind, SubmissionStore};

#[derive(Default)]
struct Inner {
    deliberations: HashMap<String, Deliberation>,
    opinions: HashMap<String, Vec<Opinion>>,
    rankings: HashMap<String, Vec<Ranking>>,
    critiques: HashMap<String, Vec<Critique>>,
    feedback: HashMap<String, Vec<HumanFeedback>>,
    candidates: HashMap<String, Vec<CandidateStatement>>,
    cycles: HashMap<String, Vec<CycleRecord>>,
}

/// All rows behind one `RwLock`; writers never hold the lock across an
/// await point, so poisoning is recovered rather than propagated.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap in the shared handle the machine and orchestrator expect.
    pub fn shared(self) -> std::sync::Arc<Self> {
        std::sync::Arc::new(self)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn require(&self, deliberation: &str) -> Result<(), StoreError> {
        if self.deliberations.contains_key(deliberation) {
            Ok(())
        } else {
            Err(StoreError::DeliberationNotFound(deliberation.to_string()))
        }
    }

    fn assign_ranks(
        &mut self,
        deliberation: &str,
        round: u32,
        ordered_ids: &[CandidateId],
    ) -> Result<(), StoreError> {
        let rows = self.candidates.entry(deliberation.to_string()).or_default();
        let round_ids: HashSet<&str> = rows
            .iter()
            .filter(|c| c.round == round)
            .map(|c| c.id.as_str())
            .collect();

        if round_ids.len() != ordered_ids.len()
            || !ordered_ids.iter().all(|id| round_ids.contains(id.as_str()))
        {
            return Err(StoreError::RankAssignment(format!(
                "ordered ids do not match round {} candidate set",
                round
            )));
        }
        if rows
            .iter()
            .any(|c| c.round == round && c.rank.is_some())
        {
            return Err(StoreError::RankAssignment(format!(
                "ranks already assigned for round {}",
                round
            )));
        }

        for (position, id) in ordered_ids.iter().enumerate() {
            if let Some(row) = rows.iter_mut().find(|c| &c.id == id) {
                row.rank = Some(position as u32 + 1);
            }
        }
        Ok(())
    }

    fn set_stage(&mut self, deliberation: &str, stage: Stage, round: u32) -> Result<(), StoreError> {
        let row = self
            .deliberations
            .get_mut(deliberation)
            .ok_or_else(|| StoreError::DeliberationNotFound(deliberation.to_string()))?;
        row.stage = stage;
        row.round = round;
        Ok(())
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn put_deliberation(&self, deliberation: &Deliberation) -> Result<(), StoreError> {
        self.write()
            .deliberations
            .insert(deliberation.id.clone(), deliberation.clone());
        Ok(())
    }

    async fn get_deliberation(&self, id: &str) -> Result<Option<Deliberation>, StoreError> {
        Ok(self.read().deliberations.get(id).cloned())
    }

    async fn append_opinion(&self, opinion: &Opinion) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.require(&opinion.deliberation_id)?;
        let rows = inner
            .opinions
            .entry(opinion.deliberation_id.clone())
            .or_default();
        if rows
            .iter()
            .any(|o| o.participant_id == opinion.participant_id)
        {
            return Err(StoreError::DuplicateRow {
                kind: SubmissionKind::Opinion,
                participant: opinion.participant_id.clone(),
            });
        }
        rows.push(opinion.clone());
        Ok(())
    }

    async fn append_ranking(&self, ranking: &Ranking) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.require(&ranking.deliberation_id)?;
        let rows = inner
            .rankings
            .entry(ranking.deliberation_id.clone())
            .or_default();
        if rows
            .iter()
            .any(|r| r.participant_id == ranking.participant_id && r.round == ranking.round)
        {
            return Err(StoreError::DuplicateRow {
                kind: SubmissionKind::Ranking,
                participant: ranking.participant_id.clone(),
            });
        }
        rows.push(ranking.clone());
        Ok(())
    }

    async fn append_critique(&self, critique: &Critique) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.require(&critique.deliberation_id)?;
        let rows = inner
            .critiques
            .entry(critique.deliberation_id.clone())
            .or_default();
        if rows
            .iter()
            .any(|c| c.participant_id == critique.participant_id && c.round == critique.round)
        {
            return Err(StoreError::DuplicateRow {
                kind: SubmissionKind::Critique,
                participant: critique.participant_id.clone(),
            });
        }
        rows.push(critique.clone());
        Ok(())
    }

    async fn append_feedback(&self, feedback: &HumanFeedback) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.require(&feedback.deliberation_id)?;
        let rows = inner
            .feedback
            .entry(feedback.deliberation_id.clone())
            .or_default();
        if rows
            .iter()
            .any(|f| f.participant_id == feedback.participant_id)
        {
            return Err(StoreError::DuplicateRow {
                kind: SubmissionKind::Feedback,
                participant: feedback.participant_id.clone(),
            });
        }
        rows.push(feedback.clone());
        Ok(())
    }

    async fn count_distinct_participants(
        &self,
        deliberation: &str,
        kind: SubmissionKind,
        round: u32,
    ) -> Result<u32, StoreError> {
        let inner = self.read();
        let participants: HashSet<&str> = match kind {
            SubmissionKind::Opinion => inner
                .opinions
                .get(deliberation)
                .map(|rows| rows.iter().map(|o| o.participant_id.as_str()).collect())
                .unwrap_or_default(),
            SubmissionKind::Ranking => inner
                .rankings
                .get(deliberation)
                .map(|rows| {
                    rows.iter()
                        .filter(|r| r.round == round)
                        .map(|r| r.participant_id.as_str())
                        .collect()
                })
                .unwrap_or_default(),
            SubmissionKind::Critique => inner
                .critiques
                .get(deliberation)
                .map(|rows| {
                    rows.iter()
                        .filter(|c| c.round == round)
                        .map(|c| c.participant_id.as_str())
                        .collect()
                })
                .unwrap_or_default(),
            SubmissionKind::Feedback => inner
                .feedback
                .get(deliberation)
                .map(|rows| rows.iter().map(|f| f.participant_id.as_str()).collect())
                .unwrap_or_default(),
        };
        Ok(participants.len() as u32)
    }

    async fn has_submitted(
        &self,
        deliberation: &str,
        kind: SubmissionKind,
        round: u32,
        participant: &str,
    ) -> Result<bool, StoreError> {
        let inner = self.read();
        let found = match kind {
            SubmissionKind::Opinion => inner
                .opinions
                .get(deliberation)
                .is_some_and(|rows| rows.iter().any(|o| o.participant_id == participant)),
            SubmissionKind::Ranking => inner.rankings.get(deliberation).is_some_and(|rows| {
                rows.iter()
                    .any(|r| r.round == round && r.participant_id == participant)
            }),
            SubmissionKind::Critique => inner.critiques.get(deliberation).is_some_and(|rows| {
                rows.iter()
                    .any(|c| c.round == round && c.participant_id == participant)
            }),
            SubmissionKind::Feedback => inner
                .feedback
                .get(deliberation)
                .is_some_and(|rows| rows.iter().any(|f| f.participant_id == participant)),
        };
        Ok(found)
    }

    async fn list_opinions(&self, deliberation: &str) -> Result<Vec<Opinion>, StoreError> {
        let mut rows = self
            .read()
            .opinions
            .get(deliberation)
            .cloned()
            .unwrap_or_default();
        rows.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(rows)
    }

    async fn list_rankings(
        &self,
        deliberation: &str,
        round: u32,
    ) -> Result<Vec<Ranking>, StoreError> {
        let mut rows: Vec<Ranking> = self
            .read()
            .rankings
            .get(deliberation)
            .map(|rows| rows.iter().filter(|r| r.round == round).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(rows)
    }

    async fn list_critiques(
        &self,
        deliberation: &str,
        round: u32,
    ) -> Result<Vec<Critique>, StoreError> {
        let mut rows: Vec<Critique> = self
            .read()
            .critiques
            .get(deliberation)
            .map(|rows| rows.iter().filter(|c| c.round == round).cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at));
        Ok(rows)
    }

    async fn list_feedback(&self, deliberation: &str) -> Result<Vec<HumanFeedback>, StoreError> {
        Ok(self
            .read()
            .feedback
            .get(deliberation)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_candidates(
        &self,
        candidates: &[CandidateStatement],
    ) -> Result<(), StoreError> {
        let mut inner = self.write();
        for candidate in candidates {
            inner.require(&candidate.deliberation_id)?;
            inner
                .candidates
                .entry(candidate.deliberation_id.clone())
                .or_default()
                .push(candidate.clone());
        }
        Ok(())
    }

    async fn list_candidates(
        &self,
        deliberation: &str,
        round: u32,
    ) -> Result<Vec<CandidateStatement>, StoreError> {
        let mut rows: Vec<CandidateStatement> = self
            .read()
            .candidates
            .get(deliberation)
            .map(|rows| rows.iter().filter(|c| c.round == round).cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|c| c.provenance.ordinal);
        Ok(rows)
    }

    async fn set_candidate_ranks(
        &self,
        deliberation: &str,
        round: u32,
        ordered_ids: &[CandidateId],
    ) -> Result<(), StoreError> {
        self.write().assign_ranks(deliberation, round, ordered_ids)
    }

    async fn set_stage(
        &self,
        deliberation: &str,
        stage: Stage,
        round: u32,
    ) -> Result<(), StoreError> {
        self.write().set_stage(deliberation, stage, round)
    }

    async fn set_candidate_ranks_and_stage(
        &self,
        deliberation: &str,
        round: u32,
        ordered_ids: &[CandidateId],
        stage: Stage,
        new_round: u32,
    ) -> Result<(), StoreError> {
        // One write guard spans both mutations.
        let mut inner = self.write();
        inner.assign_ranks(deliberation, round, ordered_ids)?;
        inner.set_stage(deliberation, stage, new_round)
    }

    async fn put_cycle_record(&self, record: &CycleRecord) -> Result<(), StoreError> {
        let mut inner = self.write();
        inner.require(&record.deliberation_id)?;
        inner
            .cycles
            .entry(record.deliberation_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn list_cycle_records(
        &self,
        deliberation: &str,
    ) -> Result<Vec<CycleRecord>, StoreError> {
        Ok(self
            .read()
            .cycles
            .get(deliberation)
            .cloned()
            .unwrap_or_default())
    }
}
