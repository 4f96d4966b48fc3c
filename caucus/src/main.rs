//! Scenario runner for the deliberation core.
//!
//! Drives a scripted deliberation end-to-end from a TOML scenario file:
//! opinions in, generation cycle, rankings (derived from each
//! participant's opinion), critiques, feedback, final statement out.
//!
//! ```bash
//! # Deterministic in-process pipeline
//! caucus scenarios/town_square.toml
//!
//! # Model-backed pipeline
//! GEMINI_API_KEY=... caucus scenarios/town_square.toml --live
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use caucus::generation::overlap_order;
use caucus::{
    Caucus, CaucusConfig, GeminiConfig, GeminiGenerator, GeminiPredictor, MemoryStore,
    SharedGenerator, SharedPredictor, Stage,
};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(author, version, about = "Run a scripted multi-party deliberation", long_about = None)]
struct Args {
    /// Path to the scenario TOML file.
    scenario: PathBuf,

    /// Optional config TOML; otherwise CAUCUS_* env vars over defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the model-backed pipeline (requires GEMINI_API_KEY).
    #[arg(long)]
    live: bool,

    /// Override the scenario's critique rounds.
    #[arg(long)]
    rounds: Option<u32>,
}

/// A scripted deliberation.
#[derive(Debug, Deserialize)]
struct Scenario {
    question: String,
    #[serde(default)]
    critique_rounds: Option<u32>,
    participants: Vec<Participant>,
}

#[derive(Debug, Deserialize)]
struct Participant {
    name: String,
    opinion: String,
    /// Critique text; defaults to restating the opinion.
    #[serde(default)]
    critique: Option<String>,
    /// Agreement with the final statement, 1-5.
    #[serde(default = "default_agreement")]
    agreement: u8,
    #[serde(default)]
    feedback: Option<String>,
}

fn default_agreement() -> u8 {
    4
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => CaucusConfig::from_toml_path(path)?,
        None => CaucusConfig::from_env(),
    };
    config.validate()?;

    let text = std::fs::read_to_string(&args.scenario)
        .with_context(|| format!("reading scenario {}", args.scenario.display()))?;
    let scenario: Scenario = toml::from_str(&text).context("parsing scenario")?;
    if scenario.participants.len() < 2 {
        bail!("scenario needs at least 2 participants");
    }

    let caucus = if args.live {
        let gemini = GeminiConfig::from_env().context("GEMINI_API_KEY is not set")?;
        let generator: SharedGenerator = Arc::new(GeminiGenerator::new(gemini.clone())?);
        let predictor: SharedPredictor = Arc::new(GeminiPredictor::new(gemini)?);
        Caucus::new(config.clone(), MemoryStore::new().shared(), generator, predictor)
    } else {
        Caucus::with_mocks(config.clone())
    };

    let rounds = args.rounds.or(scenario.critique_rounds);
    let deliberation = caucus
        .create_deliberation(
            &scenario.question,
            scenario.participants.len() as u32,
            rounds,
        )
        .await?;
    info!(deliberation_id = %deliberation.id, "deliberation created");
    println!("Question: {}\n", scenario.question);

    for participant in &scenario.participants {
        caucus
            .submit_opinion(&deliberation.id, &participant.name, &participant.opinion)
            .await?;
        println!("[opinion] {}: {}", participant.name, participant.opinion);
    }

    // Generous ceiling: a full cycle worth of retries plus slack.
    let stage_wait = Duration::from_secs(
        config.generate_timeout_secs * u64::from(config.cycle_attempts) + 120,
    );

    for round in 0..deliberation.critique_rounds {
        caucus
            .wait_for_stage(&deliberation.id, Stage::Ranking, stage_wait)
            .await?;
        let candidates = caucus.candidates(&deliberation.id, round).await?;
        println!("\n-- round {}: {} candidate statements --", round, candidates.len());

        let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
        for participant in &scenario.participants {
            let order: Vec<String> = overlap_order(&participant.opinion, &texts)
                .into_iter()
                .map(|i| candidates[i].id.clone())
                .collect();
            caucus
                .submit_ranking(&deliberation.id, &participant.name, round, order)
                .await?;
        }

        caucus
            .wait_for_stage(&deliberation.id, Stage::Critique, stage_wait)
            .await?;
        let winner = caucus
            .machine()
            .round_winner(&deliberation.id, round)
            .await?
            .context("critique stage without a winner")?;
        println!("[winner, round {}] {}", round, winner.text);

        for participant in &scenario.participants {
            let critique = participant.critique.clone().unwrap_or_else(|| {
                format!(
                    "The statement should better reflect that {}",
                    participant.opinion
                )
            });
            caucus
                .submit_critique(&deliberation.id, &participant.name, round, &critique)
                .await?;
            println!("[critique] {}: {}", participant.name, critique);
        }
    }

    caucus
        .wait_for_stage(&deliberation.id, Stage::Concluded, stage_wait)
        .await?;
    let final_statement = caucus
        .final_statement(&deliberation.id)
        .await?
        .context("concluded without a final statement")?;
    println!("\n== final statement ==\n{}\n", final_statement.text);

    for participant in &scenario.participants {
        caucus
            .submit_feedback(
                &deliberation.id,
                &participant.name,
                participant.agreement,
                participant.feedback.clone(),
            )
            .await?;
    }
    let status = caucus
        .wait_for_stage(&deliberation.id, Stage::Finalized, stage_wait)
        .await?;
    let feedback = caucus.machine().feedback(&deliberation.id).await?;
    let mean_agreement =
        feedback.iter().map(|f| f.agreement as f64).sum::<f64>() / feedback.len().max(1) as f64;
    println!(
        "Deliberation finalized: {} participants, {} round(s), mean agreement {:.1}/5.",
        status.participants, deliberation.critique_rounds, mean_agreement
    );

    caucus.abort();
    Ok(())
}
