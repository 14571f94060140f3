//! Council configuration — all engine tunables arrive through [`CouncilConfig`].
//!
//! The engine has no process-wide state and performs no environment lookup;
//! the binary (or another embedding) assembles a config and hands it to the
//! orchestrator. A JSON file form is accepted via [`CouncilConfig::from_json_file`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CouncilError;
use crate::query::{DeliberationMode, ModelId};

/// Labels are single letters A..Z, so a council cannot exceed 26 members.
pub const MAX_COUNCIL_SIZE: usize = 26;

/// Per-stage wall-clock timeouts in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageTimeouts {
    /// Stage 1 (independent responses).
    pub s1: u64,
    /// Stage 2 (peer ranking).
    pub s2: u64,
    /// Stage 3 (synthesis).
    pub s3: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            s1: 30_000,
            s2: 45_000,
            s3: 30_000,
        }
    }
}

impl StageTimeouts {
    pub fn stage1(&self) -> Duration {
        Duration::from_millis(self.s1)
    }

    pub fn stage2(&self) -> Duration {
        Duration::from_millis(self.s2)
    }

    pub fn stage3(&self) -> Duration {
        Duration::from_millis(self.s3)
    }

    /// Hard ceiling for the whole request: sum of stages plus 5 s grace.
    pub fn request_ceiling(&self) -> Duration {
        Duration::from_millis(self.s1 + self.s2 + self.s3) + Duration::from_secs(5)
    }
}

/// Weights for the confidence blend. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceWeights {
    /// Weight of ranking agreement (Kendall-τ based).
    pub rank: f64,
    /// Weight of rubric-variance agreement.
    pub rubric: f64,
    /// Weight of Borda spread between winner and runner-up.
    pub spread: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            rank: 0.5,
            rubric: 0.3,
            spread: 0.2,
        }
    }
}

/// Resolved configuration for one council.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    /// Responder models, in council order. At least two, all unique.
    pub council_models: Vec<ModelId>,
    /// The model performing Stage 3 synthesis.
    pub chairman_model: ModelId,
    /// Optional model used for style normalization.
    #[serde(default)]
    pub normalizer_model: Option<ModelId>,
    /// Drop each reviewer's score for their own response during aggregation.
    #[serde(default = "default_true")]
    pub exclude_self_votes: bool,
    /// Rewrite Stage 1 responses in a neutral style before peer review.
    #[serde(default)]
    pub style_normalization: bool,
    /// Cap on reviewers per response (stratified sampling when the council
    /// is larger). `None` means every reviewer reviews every response.
    #[serde(default)]
    pub max_reviewers: Option<usize>,
    /// Default deliberation mode for queries that do not choose one.
    #[serde(default)]
    pub mode: DeliberationMode,
    /// Default confidence threshold for binary verdicts.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Per-stage wall-clock timeouts.
    #[serde(default)]
    pub per_stage_timeout_ms: StageTimeouts,
    /// Confidence blend weights.
    #[serde(default)]
    pub confidence_weights: ConfidenceWeights,
}

fn default_true() -> bool {
    true
}

fn default_confidence_threshold() -> f64 {
    0.7
}

impl CouncilConfig {
    /// Minimal config: a council plus a chairman, defaults elsewhere.
    pub fn new(council_models: Vec<ModelId>, chairman_model: impl Into<ModelId>) -> Self {
        Self {
            council_models,
            chairman_model: chairman_model.into(),
            normalizer_model: None,
            exclude_self_votes: true,
            style_normalization: false,
            max_reviewers: None,
            mode: DeliberationMode::default(),
            confidence_threshold: default_confidence_threshold(),
            per_stage_timeout_ms: StageTimeouts::default(),
            confidence_weights: ConfidenceWeights::default(),
        }
    }

    /// Load and validate a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self, CouncilError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CouncilError::ConfigInvalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            CouncilError::ConfigInvalid(format!("cannot parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid configurations before Stage 1.
    pub fn validate(&self) -> Result<(), CouncilError> {
        if self.council_models.len() < 2 {
            return Err(CouncilError::ConfigInvalid(format!(
                "council needs at least 2 models, got {}",
                self.council_models.len()
            )));
        }
        if self.council_models.len() > MAX_COUNCIL_SIZE {
            return Err(CouncilError::ConfigInvalid(format!(
                "council exceeds {} models",
                MAX_COUNCIL_SIZE
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for model in &self.council_models {
            if model.trim().is_empty() {
                return Err(CouncilError::ConfigInvalid("empty council model id".into()));
            }
            if !seen.insert(model.as_str()) {
                return Err(CouncilError::ConfigInvalid(format!(
                    "duplicate council model: {}",
                    model
                )));
            }
        }
        if self.chairman_model.trim().is_empty() {
            return Err(CouncilError::ConfigInvalid("chairman model is empty".into()));
        }
        if self.style_normalization && self.normalizer_model.is_none() {
            return Err(CouncilError::ConfigInvalid(
                "style_normalization enabled without a normalizer_model".into(),
            ));
        }
        if self.max_reviewers == Some(0) {
            return Err(CouncilError::ConfigInvalid(
                "max_reviewers must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(CouncilError::ConfigInvalid(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        let t = &self.per_stage_timeout_ms;
        if t.s1 == 0 || t.s2 == 0 || t.s3 == 0 {
            return Err(CouncilError::ConfigInvalid(
                "stage timeouts must be nonzero".into(),
            ));
        }
        let w = &self.confidence_weights;
        let sum = w.rank + w.rubric + w.spread;
        if w.rank < 0.0 || w.rubric < 0.0 || w.spread < 0.0 || (sum - 1.0).abs() > 1e-6 {
            return Err(CouncilError::ConfigInvalid(format!(
                "confidence weights must be nonnegative and sum to 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> CouncilConfig {
        CouncilConfig::new(vec!["m1".into(), "m2".into(), "m3".into()], "mc")
    }

    #[test]
    fn test_valid_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_too_few_models() {
        let config = CouncilConfig::new(vec!["m1".into()], "mc");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_models() {
        let config = CouncilConfig::new(vec!["m1".into(), "m1".into()], "mc");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_chairman() {
        let mut config = base_config();
        config.chairman_model = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_normalization_requires_normalizer() {
        let mut config = base_config();
        config.style_normalization = true;
        assert!(config.validate().is_err());
        config.normalizer_model = Some("mn".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_max_reviewers() {
        let mut config = base_config();
        config.max_reviewers = Some(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout() {
        let mut config = base_config();
        config.per_stage_timeout_ms.s2 = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_weights() {
        let mut config = base_config();
        config.confidence_weights = ConfidenceWeights {
            rank: 0.9,
            rubric: 0.3,
            spread: 0.2,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_request_ceiling() {
        let t = StageTimeouts {
            s1: 1000,
            s2: 2000,
            s3: 3000,
        };
        assert_eq!(t.request_ceiling(), Duration::from_millis(11_000));
    }

    #[test]
    fn test_config_from_json() {
        let json = r#"{
            "council_models": ["openai/gpt-5.2", "anthropic/claude-opus-4-5"],
            "chairman_model": "google/gemini-3-pro",
            "max_reviewers": 2
        }"#;
        let config: CouncilConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.exclude_self_votes);
        assert_eq!(config.max_reviewers, Some(2));
        assert_eq!(config.per_stage_timeout_ms.s1, 30_000);
    }
}
