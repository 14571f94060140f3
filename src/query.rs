//! Query value objects — the immutable request a deliberation runs over.

use serde::{Deserialize, Serialize};

use crate::error::CouncilError;

/// Opaque model identifier. Only the [`ModelCaller`](crate::caller::ModelCaller)
/// implementation gives it meaning.
pub type ModelId = String;

/// How the chairman is asked to combine the council's responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliberationMode {
    /// Produce the single best synthesized answer.
    Consensus,
    /// Structure as agreements / disagreements / recommended resolution.
    Debate,
}

impl Default for DeliberationMode {
    fn default() -> Self {
        Self::Consensus
    }
}

impl std::fmt::Display for DeliberationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consensus => write!(f, "consensus"),
            Self::Debate => write!(f, "debate"),
        }
    }
}

/// Whether the chairman is asked for a machine-checkable verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictType {
    /// No verdict line requested.
    None,
    /// Request a final `FINAL_VERDICT: APPROVED|REJECTED` line.
    Binary,
}

impl Default for VerdictType {
    fn default() -> Self {
        Self::None
    }
}

/// A single deliberation request. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// The question put to the council.
    pub prompt: String,
    /// Synthesis mode.
    #[serde(default)]
    pub mode: DeliberationMode,
    /// Verdict extraction mode.
    #[serde(default)]
    pub verdict_type: VerdictType,
    /// Minimum confidence for a binary APPROVED to map to PASS.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Whether the returned envelope carries the full stage arrays.
    #[serde(default)]
    pub include_details: bool,
}

fn default_confidence_threshold() -> f64 {
    0.7
}

impl Query {
    /// Create a consensus query with defaults.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            mode: DeliberationMode::default(),
            verdict_type: VerdictType::default(),
            confidence_threshold: default_confidence_threshold(),
            include_details: false,
        }
    }

    /// Switch to debate mode.
    pub fn debate(mut self) -> Self {
        self.mode = DeliberationMode::Debate;
        self
    }

    /// Request a binary verdict with the given confidence threshold.
    pub fn with_binary_verdict(mut self, threshold: f64) -> Self {
        self.verdict_type = VerdictType::Binary;
        self.confidence_threshold = threshold;
        self
    }

    /// Include full stage detail in the returned envelope.
    pub fn with_details(mut self) -> Self {
        self.include_details = true;
        self
    }

    /// Reject malformed queries before any stage runs.
    pub fn validate(&self) -> Result<(), CouncilError> {
        if self.prompt.trim().is_empty() {
            return Err(CouncilError::ConfigInvalid("query prompt is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(CouncilError::ConfigInvalid(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        Ok(())
    }
}
