//! Configuration for the [`OrchestratorEngine`](super::engine::OrchestratorEngine).
//!
//! Every knob has a default, so an empty JSON object is a valid config file.
//! Override a subset through the struct fields or from a file:
//!
//! ```ignore
//! let config = OrchestratorConfig::load(Path::new("relay.json"))?
//!     .with_data_dir("/tmp/relay")
//!     .with_max_handoffs(5);
//! ```
//!
//! Disabling the optimizer is an explicit override:
//!
//! ```ignore
//! let config = OrchestratorConfig {
//!     optimizer: Toggle::disabled(),
//!     ..OrchestratorConfig::default()
//! };
//! ```

use crate::agent::decision::DecisionThresholds;
use crate::agent::turns::TurnBudgetConfig;
use crate::api::client::DEFAULT_MODEL;
use crate::api::retry::RetryConfig;
use crate::checkpoint::manager::CheckpointConfig;
use crate::context::optimizer::OptimizerConfig;
use crate::context::window::ZoneThresholds;
use crate::context::working::WorkingMemoryConfig;
use crate::error::{RelayError, Result};
use crate::memory::document::DEFAULT_VERSION_RETENTION;
use crate::memory::episodic::EpisodicMemoryConfig;
use crate::memory::session::SessionMemoryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Generic toggle ────────────────────────────────────────────────

/// Enabled/disabled wrapper for an optional module's configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Toggle<T: Default> {
    pub enabled: bool,
    pub config: T,
}

impl<T: Default> Toggle<T> {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            config: T::default(),
        }
    }
}

impl<T: Default> Default for Toggle<T> {
    fn default() -> Self {
        Self {
            enabled: true,
            config: T::default(),
        }
    }
}

// ── OrchestratorConfig ────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Model context window in tokens.
    pub context_window: usize,
    /// Fraction of the window the engine may fill.
    pub utilization_limit: f64,
    /// Calibrated characters per token, if measured for the model.
    pub chars_per_token: Option<f64>,
    pub zones: ZoneThresholds,
    pub working_memory: WorkingMemoryConfig,
    pub optimizer: Toggle<OptimizerConfig>,
    /// Pin an optimization profile by name instead of choosing by window size.
    pub profile_override: Option<String>,
    pub session_memory: SessionMemoryConfig,
    pub episodic_memory: EpisodicMemoryConfig,
    /// Versions kept per memory document.
    pub version_retention: usize,
    pub checkpoint: CheckpointConfig,
    pub decision: DecisionThresholds,
    pub turns: TurnBudgetConfig,
    pub retry: RetryConfig,
    /// Per-turn agent timeout.
    pub agent_timeout_secs: u64,
    /// Self-handoffs allowed per session.
    pub max_handoffs_per_session: u32,
    /// Share of the effective window a single prompt may use.
    pub prompt_budget_fraction: f64,
    /// Deliverable quality needed for success with limits.
    pub deliverable_quality_threshold: f64,
    /// Root of all persisted state.
    pub data_dir: PathBuf,
    /// Model for the OpenRouter adapters.
    pub model: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            utilization_limit: 0.9,
            chars_per_token: None,
            zones: ZoneThresholds::default(),
            working_memory: WorkingMemoryConfig::default(),
            optimizer: Toggle::default(),
            profile_override: None,
            session_memory: SessionMemoryConfig::default(),
            episodic_memory: EpisodicMemoryConfig::default(),
            version_retention: DEFAULT_VERSION_RETENTION,
            checkpoint: CheckpointConfig::default(),
            decision: DecisionThresholds::default(),
            turns: TurnBudgetConfig::default(),
            retry: RetryConfig::default(),
            agent_timeout_secs: 600,
            max_handoffs_per_session: 3,
            prompt_budget_fraction: 0.25,
            deliverable_quality_threshold: 0.7,
            data_dir: PathBuf::from(".relay"),
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RelayError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| RelayError::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.context_window == 0 {
            return Err(RelayError::Config("context_window must be positive".into()));
        }
        if !(self.utilization_limit > 0.0 && self.utilization_limit <= 1.0) {
            return Err(RelayError::Config(format!(
                "utilization_limit must be within (0, 1]: {}",
                self.utilization_limit
            )));
        }
        if !(self.prompt_budget_fraction > 0.0 && self.prompt_budget_fraction <= 1.0) {
            return Err(RelayError::Config(format!(
                "prompt_budget_fraction must be within (0, 1]: {}",
                self.prompt_budget_fraction
            )));
        }
        if let Some(cpt) = self.chars_per_token
            && cpt <= 0.0
        {
            return Err(RelayError::Config(format!(
                "chars_per_token must be positive: {cpt}"
            )));
        }
        self.zones.validate()
    }

    pub fn with_context_window(mut self, tokens: usize) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_utilization_limit(mut self, limit: f64) -> Self {
        self.utilization_limit = limit;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_profile_override(mut self, name: impl Into<String>) -> Self {
        self.profile_override = Some(name.into());
        self
    }

    pub fn with_max_handoffs(mut self, max: u32) -> Self {
        self.max_handoffs_per_session = max;
        self
    }

    pub fn with_agent_timeout(mut self, secs: u64) -> Self {
        self.agent_timeout_secs = secs;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.data_dir.join("checkpoints")
    }

    pub fn memory_dir(&self) -> PathBuf {
        self.data_dir.join("memory")
    }
}
