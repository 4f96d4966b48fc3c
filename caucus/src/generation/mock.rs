//! Deterministic in-process doubles for the generation pipeline.
//!
//! The mock generator produces templated statements; the mock predictor
//! ranks candidates by word overlap with the participant's own opinion and
//! critique. Both support fail-first-N injection and expose call counters
//! so tests can assert exactly-once invocation.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    CandidateGenerator, GenerationError, GenerationRequest, PredictionError, PredictionRequest,
    PreferencePredictor,
};

/// Rank candidate indices by descending word overlap with `reference`,
/// lower index first on equal overlap. Deterministic for fixed inputs.
pub fn overlap_order(reference: &str, candidates: &[String]) -> Vec<usize> {
    let reference_words: HashSet<String> = tokenize(reference);
    let scores: Vec<usize> = candidates
        .iter()
        .map(|text| tokenize(text).intersection(&reference_words).count())
        .collect();
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| scores[b].cmp(&scores[a]).then(a.cmp(&b)));
    order
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

/// Mock candidate generator producing templated statements.
pub struct MockGenerator {
    num_candidates: u32,
    fail_remaining: AtomicU32,
    calls: AtomicU32,
}

impl MockGenerator {
    pub fn new(num_candidates: u32) -> Self {
        Self {
            num_candidates,
            fail_remaining: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` calls with a rate-limit error.
    pub fn fail_times(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Total calls observed.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CandidateGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(GenerationError::RateLimited {
                retry_after: Some(Duration::from_millis(10)),
            });
        }

        let count = self.num_candidates.min(request.num_candidates);
        let revision = if request.critiques.is_some() {
            "Revised consensus"
        } else {
            "Consensus"
        };
        Ok((0..count)
            .map(|i| {
                format!(
                    "{} statement {} on \"{}\", drawing on {} opinions: {}",
                    revision,
                    i + 1,
                    request.question,
                    request.opinions.len(),
                    request
                        .opinions
                        .get(i as usize % request.opinions.len().max(1))
                        .map(String::as_str)
                        .unwrap_or("")
                )
            })
            .collect())
    }
}

/// Mock preference predictor ranking by opinion/critique word overlap.
pub struct MockPredictor {
    fail_remaining: AtomicU32,
    calls: AtomicU32,
}

impl MockPredictor {
    pub fn new() -> Self {
        Self {
            fail_remaining: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }

    /// Fail the first `n` calls (across all participants).
    pub fn fail_times(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    /// Total calls observed.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for MockPredictor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PreferencePredictor for MockPredictor {
    async fn rank(&self, request: &PredictionRequest) -> Result<Vec<usize>, PredictionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PredictionError::RateLimited);
        }

        let reference = match &request.critique {
            Some(critique) => format!("{} {}", request.opinion, critique),
            None => request.opinion.clone(),
        };
        Ok(overlap_order(&reference, &request.candidates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(opinions: &[&str]) -> GenerationRequest {
        GenerationRequest {
            question: "Should the library stay open late?".to_string(),
            opinions: opinions.iter().map(|s| s.to_string()).collect(),
            previous_winner: None,
            critiques: None,
            num_candidates: 16,
        }
    }

    #[tokio::test]
    async fn test_generator_produces_requested_count() {
        let generator = MockGenerator::new(16);
        let texts = generator.generate(&request(&["a", "b", "c"])).await.unwrap();
        assert_eq!(texts.len(), 16);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_generator_is_deterministic() {
        let generator = MockGenerator::new(4);
        let a = generator.generate(&request(&["x", "y"])).await.unwrap();
        let b = generator.generate(&request(&["x", "y"])).await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_generator_fail_injection() {
        let generator = MockGenerator::new(4).fail_times(2);
        assert!(matches!(
            generator.generate(&request(&["a"])).await,
            Err(GenerationError::RateLimited { .. })
        ));
        assert!(matches!(
            generator.generate(&request(&["a"])).await,
            Err(GenerationError::RateLimited { .. })
        ));
        assert!(generator.generate(&request(&["a"])).await.is_ok());
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_predictor_prefers_overlapping_candidate() {
        let predictor = MockPredictor::new();
        let order = predictor
            .rank(&PredictionRequest {
                question: "q".to_string(),
                opinion: "later closing hours help working families".to_string(),
                candidates: vec![
                    "budget cuts are needed".to_string(),
                    "later closing hours support working families".to_string(),
                ],
                previous_winner: None,
                critique: None,
            })
            .await
            .unwrap();
        assert_eq!(order[0], 1);
        assert_eq!(order.len(), 2);
    }

    #[tokio::test]
    async fn test_predictor_fail_injection() {
        let predictor = MockPredictor::new().fail_times(1);
        let req = PredictionRequest {
            question: "q".to_string(),
            opinion: "o".to_string(),
            candidates: vec!["a".to_string(), "b".to_string()],
            previous_winner: None,
            critique: None,
        };
        assert!(predictor.rank(&req).await.is_err());
        assert!(predictor.rank(&req).await.is_ok());
    }

    #[test]
    fn test_overlap_order_tie_goes_to_lower_index() {
        let order = overlap_order(
            "nothing in common",
            &["alpha beta".to_string(), "gamma delta".to_string()],
        );
        assert_eq!(order, vec![0, 1]);
    }
}
