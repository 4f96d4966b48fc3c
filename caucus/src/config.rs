//! Runtime configuration for the coordination core.
//!
//! Three layers, later wins: struct defaults, `CAUCUS_*` environment
//! variables, and an optional TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Error loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Configuration for the deliberation core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaucusConfig {
    /// Candidate statements requested per generation cycle.
    pub num_candidates: u32,
    /// Floor of usable candidates below which a cycle fails.
    pub min_candidates: u32,
    /// Critique rounds used when a deliberation does not specify its own.
    pub default_critique_rounds: u32,
    /// Per-participant prediction attempts before the neutral fallback.
    pub predictor_retries: u32,
    /// Whole-cycle attempts before the round is marked failed.
    pub cycle_attempts: u32,
    /// Base backoff between retries, in milliseconds.
    pub backoff_base_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub backoff_max_ms: u64,
    /// Timeout for one candidate-generation call, in seconds.
    pub generate_timeout_secs: u64,
    /// Timeout for one prediction call, in seconds.
    pub predict_timeout_secs: u64,
}

impl Default for CaucusConfig {
    fn default() -> Self {
        Self {
            num_candidates: 16,
            min_candidates: 2,
            default_critique_rounds: 1,
            predictor_retries: 5,
            cycle_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            generate_timeout_secs: 120,
            predict_timeout_secs: 60,
        }
    }
}

impl CaucusConfig {
    /// Defaults overridden by `CAUCUS_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        override_from_env("CAUCUS_NUM_CANDIDATES", &mut config.num_candidates);
        override_from_env("CAUCUS_MIN_CANDIDATES", &mut config.min_candidates);
        override_from_env(
            "CAUCUS_CRITIQUE_ROUNDS",
            &mut config.default_critique_rounds,
        );
        override_from_env("CAUCUS_PREDICTOR_RETRIES", &mut config.predictor_retries);
        override_from_env("CAUCUS_CYCLE_ATTEMPTS", &mut config.cycle_attempts);
        override_from_env("CAUCUS_BACKOFF_BASE_MS", &mut config.backoff_base_ms);
        override_from_env("CAUCUS_BACKOFF_MAX_MS", &mut config.backoff_max_ms);
        override_from_env(
            "CAUCUS_GENERATE_TIMEOUT_SECS",
            &mut config.generate_timeout_secs,
        );
        override_from_env(
            "CAUCUS_PREDICT_TIMEOUT_SECS",
            &mut config.predict_timeout_secs,
        );
        config
    }

    /// Load from a TOML file; absent keys keep their defaults.
    pub fn from_toml_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_candidates < 2 {
            return Err(ConfigError::Invalid(
                "min_candidates must be at least 2".to_string(),
            ));
        }
        if self.num_candidates < self.min_candidates {
            return Err(ConfigError::Invalid(format!(
                "num_candidates ({}) below min_candidates ({})",
                self.num_candidates, self.min_candidates
            )));
        }
        if self.default_critique_rounds == 0 {
            return Err(ConfigError::Invalid(
                "default_critique_rounds must be at least 1".to_string(),
            ));
        }
        if self.cycle_attempts == 0 {
            return Err(ConfigError::Invalid(
                "cycle_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn generate_timeout(&self) -> Duration {
        Duration::from_secs(self.generate_timeout_secs)
    }

    pub fn predict_timeout(&self) -> Duration {
        Duration::from_secs(self.predict_timeout_secs)
    }
}

fn override_from_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(value) = std::env::var(name) {
        match value.parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!(name, %value, "ignoring unparseable override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CaucusConfig::default();
        assert_eq!(config.num_candidates, 16);
        assert_eq!(config.default_critique_rounds, 1);
        assert_eq!(config.predictor_retries, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_floors() {
        let config = CaucusConfig {
            min_candidates: 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CaucusConfig {
            num_candidates: 2,
            min_candidates: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CaucusConfig {
            default_critique_rounds: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "num_candidates = 8\npredictor_retries = 2").unwrap();

        let config = CaucusConfig::from_toml_path(file.path()).unwrap();
        assert_eq!(config.num_candidates, 8);
        assert_eq!(config.predictor_retries, 2);
        // Untouched keys keep their defaults.
        assert_eq!(config.backoff_base_ms, 500);
    }

    #[test]
    fn test_from_toml_rejects_invalid() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "min_candidates = 0").unwrap();
        assert!(CaucusConfig::from_toml_path(file.path()).is_err());
    }

    #[test]
    fn test_from_toml_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CaucusConfig::from_toml_path(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
