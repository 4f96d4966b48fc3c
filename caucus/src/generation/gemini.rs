//! AI-Studio-backed generator and predictor.
//!
//! Both adapters call the Gemini `generateContent` endpoint. The generator
//! fires one sampled request per candidate (opinions rotated per sample to
//! avoid ordering bias) and keeps whatever succeeds; the predictor asks for
//! a single "Ranking: 3 > 1 > 2" line and parses it into a permutation.

use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

use super::{
    is_permutation, CandidateGenerator, GenerationError, GenerationRequest, PredictionError,
    PredictionRequest, PreferencePredictor,
};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Configuration for the AI Studio adapters.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
}

impl GeminiConfig {
    /// Build from `GEMINI_API_KEY`, with the fast default model.
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").ok()?;
        Some(Self {
            api_key,
            model: "gemini-flash-latest".to_string(),
            temperature: 0.7,
            max_output_tokens: 1024,
            timeout: Duration::from_secs(120),
        })
    }
}

fn build_client(config: &GeminiConfig) -> Result<reqwest::Client, String> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(|e| e.to_string())
}

/// One generateContent call; returns the first candidate's text.
async fn generate_content(
    client: &reqwest::Client,
    config: &GeminiConfig,
    prompt: String,
) -> Result<String, GeminiCallError> {
    let url = format!(
        "{}/{}:generateContent?key={}",
        API_BASE, config.model, config.api_key
    );
    let body = serde_json::json!({
        "contents": [{
            "parts": [{ "text": prompt }]
        }],
        "generationConfig": {
            "temperature": config.temperature,
            "maxOutputTokens": config.max_output_tokens,
        }
    });

    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| GeminiCallError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        if status.as_u16() == 429 || body.contains("RESOURCE_EXHAUSTED") {
            return Err(GeminiCallError::RateLimited);
        }
        return Err(GeminiCallError::Transport(format!(
            "API error ({}): {}",
            status, body
        )));
    }

    let json: Value = response
        .json()
        .await
        .map_err(|e| GeminiCallError::Malformed(e.to_string()))?;

    json["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GeminiCallError::Malformed("no text in response".to_string()))
}

/// Internal error for a single API call, mapped to the public taxonomies
/// at the trait boundary.
#[derive(Debug, Clone)]
enum GeminiCallError {
    Transport(String),
    RateLimited,
    Malformed(String),
}

/// Model-backed candidate statement generator.
pub struct GeminiGenerator {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiGenerator {
    pub fn new(config: GeminiConfig) -> Result<Self, GenerationError> {
        let client = build_client(&config).map_err(GenerationError::Transport)?;
        Ok(Self { client, config })
    }

    fn sample_prompt(&self, request: &GenerationRequest, sample: usize) -> String {
        let mut prompt = String::from(
            "You are mediating a group deliberation. Write one consensus \
             statement that captures the common ground of the participants' \
             views.\n\n",
        );
        prompt.push_str(&format!("Question: {}\n\nOpinions:\n", request.question));

        // Rotate opinion order per sample to avoid ordering bias.
        let n = request.opinions.len();
        for offset in 0..n {
            let opinion = &request.opinions[(sample + offset) % n];
            prompt.push_str(&format!("- {}\n", opinion));
        }

        if let Some(previous) = &request.previous_winner {
            prompt.push_str(&format!("\nPrevious group statement:\n{}\n", previous));
        }
        if let Some(critiques) = request.critiques.as_deref().filter(|c| !c.is_empty()) {
            prompt.push_str("\nCritiques of the previous statement:\n");
            for offset in 0..critiques.len() {
                prompt.push_str(&format!("- {}\n", critiques[(sample + offset) % critiques.len()]));
            }
            prompt.push_str("\nRevise the statement to address the critiques while keeping the common ground.\n");
        }

        prompt.push_str("\nRespond with the statement text only.");
        prompt
    }
}

#[async_trait]
impl CandidateGenerator for GeminiGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<String>, GenerationError> {
        if request.opinions.is_empty() {
            return Err(GenerationError::Malformed("no opinions provided".to_string()));
        }

        let samples = (0..request.num_candidates as usize)
            .map(|i| generate_content(&self.client, &self.config, self.sample_prompt(request, i)));
        let results = join_all(samples).await;

        let mut texts = Vec::new();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(text) => texts.push(text),
                Err(e) => {
                    debug!(error = ?e, "candidate sample failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if texts.is_empty() {
            return Err(match first_error {
                Some(GeminiCallError::RateLimited) => GenerationError::RateLimited {
                    retry_after: None,
                },
                Some(GeminiCallError::Transport(msg)) => GenerationError::Transport(msg),
                Some(GeminiCallError::Malformed(msg)) => GenerationError::Malformed(msg),
                None => GenerationError::Malformed("no samples requested".to_string()),
            });
        }

        if first_error.is_some() {
            warn!(
                usable = texts.len(),
                requested = request.num_candidates,
                "some candidate samples failed"
            );
        }
        Ok(texts)
    }
}

/// Model-backed per-participant preference predictor.
pub struct GeminiPredictor {
    client: reqwest::Client,
    config: GeminiConfig,
    digits: Regex,
}

impl GeminiPredictor {
    pub fn new(config: GeminiConfig) -> Result<Self, PredictionError> {
        let client = build_client(&config).map_err(PredictionError::Transport)?;
        let digits = Regex::new(r"\d+").map_err(|e| PredictionError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            config,
            digits,
        })
    }

    fn prompt(&self, request: &PredictionRequest) -> String {
        let mut prompt = String::from(
            "You are predicting how one participant in a group deliberation \
             would rank candidate consensus statements.\n\n",
        );
        prompt.push_str(&format!("Question: {}\n\n", request.question));
        prompt.push_str(&format!("The participant's opinion: {}\n", request.opinion));
        if let Some(previous) = &request.previous_winner {
            prompt.push_str(&format!("\nPrevious group statement: {}\n", previous));
        }
        if let Some(critique) = &request.critique {
            prompt.push_str(&format!("The participant's critique of it: {}\n", critique));
        }
        prompt.push_str("\nCandidate statements:\n");
        for (i, candidate) in request.candidates.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", i + 1, candidate));
        }
        prompt.push_str(&format!(
            "\nRank all {} statements from the participant's most to least \
             preferred. Reply with a single line of the form \
             \"Ranking: 3 > 1 > 2\" listing every statement number exactly once.",
            request.candidates.len()
        ));
        prompt
    }

    /// Parse a "Ranking: 3 > 1 > 2" line into a 0-based permutation.
    fn parse_ranking(&self, text: &str, len: usize) -> Result<Vec<usize>, PredictionError> {
        let line = text
            .lines()
            .rev()
            .find(|l| l.to_lowercase().contains("ranking"))
            .unwrap_or(text);

        let order: Vec<usize> = self
            .digits
            .find_iter(line)
            .filter_map(|m| m.as_str().parse::<usize>().ok())
            .filter_map(|n| n.checked_sub(1))
            .collect();

        if !is_permutation(&order, len) {
            return Err(PredictionError::Malformed(format!(
                "expected a permutation of 1..={}, got {:?}",
                len, order
            )));
        }
        Ok(order)
    }
}

#[async_trait]
impl PreferencePredictor for GeminiPredictor {
    async fn rank(&self, request: &PredictionRequest) -> Result<Vec<usize>, PredictionError> {
        let text = generate_content(&self.client, &self.config, self.prompt(request))
            .await
            .map_err(|e| match e {
                GeminiCallError::RateLimited => PredictionError::RateLimited,
                GeminiCallError::Transport(msg) => PredictionError::Transport(msg),
                GeminiCallError::Malformed(msg) => PredictionError::Malformed(msg),
            })?;
        self.parse_ranking(&text, request.candidates.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn predictor() -> GeminiPredictor {
        GeminiPredictor::new(GeminiConfig {
            api_key: "test-key".to_string(),
            model: "gemini-flash-latest".to_string(),
            temperature: 0.7,
            max_output_tokens: 256,
            timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn test_parse_ranking_line() {
        let p = predictor();
        let order = p
            .parse_ranking("Thinking it through...\nRanking: 3 > 1 > 2", 3)
            .unwrap();
        assert_eq!(order, vec![2, 0, 1]);
    }

    #[test]
    fn test_parse_ranking_bare_numbers() {
        let p = predictor();
        let order = p.parse_ranking("2, 1", 2).unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn test_parse_ranking_rejects_incomplete() {
        let p = predictor();
        assert!(p.parse_ranking("Ranking: 1 > 2", 3).is_err());
        assert!(p.parse_ranking("Ranking: 1 > 1 > 2", 3).is_err());
        assert!(p.parse_ranking("Ranking: 1 > 2 > 4", 3).is_err());
        assert!(p.parse_ranking("no numbers here", 3).is_err());
    }

    #[test]
    fn test_parse_uses_last_ranking_line() {
        let p = predictor();
        let text = "Ranking: 1 > 2 > 3 would be naive.\nRanking: 2 > 3 > 1";
        assert_eq!(p.parse_ranking(text, 3).unwrap(), vec![1, 2, 0]);
    }

    #[test]
    fn test_generator_prompt_mentions_critiques() {
        let generator = GeminiGenerator::new(GeminiConfig {
            api_key: "test-key".to_string(),
            model: "gemini-flash-latest".to_string(),
            temperature: 0.7,
            max_output_tokens: 256,
            timeout: Duration::from_secs(5),
        })
        .unwrap();
        let prompt = generator.sample_prompt(
            &GenerationRequest {
                question: "q".to_string(),
                opinions: vec!["one".to_string(), "two".to_string()],
                previous_winner: Some("old statement".to_string()),
                critiques: Some(vec!["too vague".to_string()]),
                num_candidates: 4,
            },
            1,
        );
        assert!(prompt.contains("old statement"));
        assert!(prompt.contains("too vague"));
        // Rotation starts from the second opinion for sample 1.
        let one = prompt.find("- two").unwrap();
        let two = prompt.find("- one").unwrap();
        assert!(one < two);
    }
}
