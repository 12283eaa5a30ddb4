//! Pipeline configuration, loadable from a JSON file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::learning::LearningConfig;
use crate::mode::{ModeDecisionEngine, DEFAULT_SOFT_THRESHOLD};
use crate::types::{PipelineError, PipelineResult, ProcessingMode};

fn default_soft_threshold() -> f64 {
    DEFAULT_SOFT_THRESHOLD
}

fn default_capability_timeout_ms() -> u64 {
    30_000
}

fn default_max_samples() -> usize {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub mode: ProcessingMode,
    #[serde(default = "default_soft_threshold")]
    pub soft_threshold: f64,
    /// Upper bound on any single external capability call.
    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,
    /// Candidates below this detector confidence are ignored.
    #[serde(default)]
    pub min_hit_confidence: f32,
    /// Samples kept per discovered candidate pattern.
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    #[serde(default)]
    pub learning: LearningConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: ProcessingMode::Soft,
            soft_threshold: default_soft_threshold(),
            capability_timeout_ms: default_capability_timeout_ms(),
            min_hit_confidence: 0.0,
            max_samples: default_max_samples(),
            learning: LearningConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> PipelineResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        tracing::debug!("Loaded pipeline config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if !(0.0..=1.0).contains(&self.soft_threshold) {
            return Err(PipelineError::InvalidInput(format!(
                "soft_threshold {} is outside [0, 1]",
                self.soft_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.min_hit_confidence) {
            return Err(PipelineError::InvalidInput(format!(
                "min_hit_confidence {} is outside [0, 1]",
                self.min_hit_confidence
            )));
        }
        if self.capability_timeout_ms == 0 {
            return Err(PipelineError::InvalidInput(
                "capability_timeout_ms must be positive".into(),
            ));
        }
        self.learning.validate()
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_millis(self.capability_timeout_ms)
    }

    pub fn mode_engine(&self) -> PipelineResult<ModeDecisionEngine> {
        ModeDecisionEngine::new(self.mode).with_threshold(self.soft_threshold)
    }
}
