//! Engine configuration.
//!
//! All options are optional in the file; defaults match the documented
//! engine behavior. Tracing toggles additionally honor environment
//! variables with the `OPENAI_AGENTS_` prefix.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable disabling all trace persistence.
pub const ENV_DISABLE_TRACING: &str = "OPENAI_AGENTS_DISABLE_TRACING";
/// Environment variable overriding the trace directory.
pub const ENV_TRACE_DIR: &str = "OPENAI_AGENTS_TRACE_DIR";

/// Tunables for a policy evolution run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum evolution generations per run.
    pub max_generations: u32,

    /// Tournament rounds per generation.
    pub rounds_per_gen: u32,

    /// Pairwise comparisons per round; auto-sized to the proposal count
    /// when unset.
    pub pairs_per_round: Option<u32>,

    /// Initial proposals requested from the generator.
    pub initial_proposals: u32,

    /// Top proposals evolved each generation.
    pub top_m_evolve: u32,

    /// Elo K-factor.
    pub k_factor: f64,

    /// Elo gap below which two consecutive generations count as converged.
    pub convergence_epsilon: f64,

    /// Maximum concurrent worker calls.
    pub max_inflight: u32,

    /// Soft worker timeout; exceeding it logs a warning.
    pub soft_timeout_secs: u64,

    /// Hard worker timeout; exceeding it classifies as transient failure.
    pub hard_timeout_secs: u64,

    /// Evaluate each pair twice with positions swapped.
    pub double_blind: bool,

    pub worker_endpoint: Option<String>,
    pub worker_model: String,
    pub search_endpoint: Option<String>,
    pub search_fallback_endpoint: Option<String>,

    /// Directory for trace files.
    pub trace_dir: PathBuf,

    /// Postgres DSN for the relational trace sink; file-only when unset.
    pub db_dsn: Option<String>,

    pub disable_tracing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_generations: 3,
            rounds_per_gen: 5,
            pairs_per_round: None,
            initial_proposals: 3,
            top_m_evolve: 2,
            k_factor: 32.0,
            convergence_epsilon: 20.0,
            max_inflight: 4,
            soft_timeout_secs: 60,
            hard_timeout_secs: 120,
            double_blind: false,
            worker_endpoint: None,
            worker_model: "gpt-4o".to_string(),
            search_endpoint: None,
            search_fallback_endpoint: None,
            trace_dir: PathBuf::from("traces"),
            db_dsn: None,
            disable_tracing: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file, falling back to defaults
    /// when the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?
        } else {
            Self::default()
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `OPENAI_AGENTS_`-prefixed environment overrides for the
    /// tracing toggles.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(ENV_DISABLE_TRACING) {
            self.disable_tracing = matches!(value.trim(), "1" | "true" | "yes");
        }
        if let Ok(value) = std::env::var(ENV_TRACE_DIR) {
            if !value.trim().is_empty() {
                self.trace_dir = PathBuf::from(value);
            }
        }
    }

    /// Check the documented lower bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_generations < 1 {
            return Err(ConfigError::Invalid("max_generations must be >= 1".into()));
        }
        if self.rounds_per_gen < 1 {
            return Err(ConfigError::Invalid("rounds_per_gen must be >= 1".into()));
        }
        if let Some(pairs) = self.pairs_per_round {
            if pairs < 1 {
                return Err(ConfigError::Invalid("pairs_per_round must be >= 1".into()));
            }
        }
        if self.initial_proposals < 2 {
            return Err(ConfigError::Invalid("initial_proposals must be >= 2".into()));
        }
        if self.top_m_evolve < 1 {
            return Err(ConfigError::Invalid("top_m_evolve must be >= 1".into()));
        }
        if self.max_inflight < 1 {
            return Err(ConfigError::Invalid("max_inflight must be >= 1".into()));
        }
        if self.hard_timeout_secs < self.soft_timeout_secs {
            return Err(ConfigError::Invalid(
                "hard_timeout_secs must be >= soft_timeout_secs".into(),
            ));
        }
        Ok(())
    }

    /// Pairs per round, auto-sized to the active proposal count when not
    /// configured: between 3 and 5, never more than the unique pairs that
    /// exist.
    pub fn pairs_for_round(&self, active_proposals: usize) -> u32 {
        let unique = if active_proposals < 2 {
            0
        } else {
            (active_proposals * (active_proposals - 1) / 2) as u32
        };
        match self.pairs_per_round {
            Some(configured) => configured.min(unique),
            None => unique.clamp(3, 5).min(unique),
        }
    }

    /// Total comparison budget for the whole run.
    pub fn total_pair_budget(&self) -> u32 {
        let per_round = self.pairs_per_round.unwrap_or(5);
        self.max_generations * self.rounds_per_gen * per_round
    }
}
