//! Reviewer output parsing.
//!
//! Reviewers are instructed to reply with a single JSON object, but real
//! model output arrives wrapped in prose, code fences, or trailing
//! commentary. The extractor takes the first balanced top-level object and
//! validates it against the ranking invariants: the ordering covers exactly
//! the reviewed labels, the rubric keys match, and every dimension is scored.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::labels::Label;
use crate::query::ModelId;

/// The fixed rubric dimensions, scored 0–10 each.
pub const RUBRIC_DIMENSIONS: [&str; 5] = [
    "accuracy",
    "relevance",
    "completeness",
    "conciseness",
    "clarity",
];

/// Per-response rubric scores, clamped to [0, 10].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RubricScores {
    pub accuracy: f64,
    pub relevance: f64,
    pub completeness: f64,
    pub conciseness: f64,
    pub clarity: f64,
}

impl RubricScores {
    pub fn uniform(score: f64) -> Self {
        Self {
            accuracy: score,
            relevance: score,
            completeness: score,
            conciseness: score,
            clarity: score,
        }
    }

    /// Score for a dimension by name. Panics on unknown names; callers only
    /// pass entries of [`RUBRIC_DIMENSIONS`].
    pub fn get(&self, dimension: &str) -> f64 {
        match dimension {
            "accuracy" => self.accuracy,
            "relevance" => self.relevance,
            "completeness" => self.completeness,
            "conciseness" => self.conciseness,
            "clarity" => self.clarity,
            other => panic!("unknown rubric dimension: {}", other),
        }
    }

    fn clamped(self) -> Self {
        Self {
            accuracy: self.accuracy.clamp(0.0, 10.0),
            relevance: self.relevance.clamp(0.0, 10.0),
            completeness: self.completeness.clamp(0.0, 10.0),
            conciseness: self.conciseness.clamp(0.0, 10.0),
            clarity: self.clarity.clamp(0.0, 10.0),
        }
    }
}

/// A validated reviewer ranking over a set of labeled responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ranking {
    pub reviewer: ModelId,
    /// Best-to-worst labels, covering the reviewed set exactly once each.
    pub ordering: Vec<Label>,
    /// Rubric scores keyed by label; keys equal the reviewed set.
    pub rubric: BTreeMap<Label, RubricScores>,
}

impl Ranking {
    /// Position of `label` in the ordering, 1-indexed.
    pub fn position(&self, label: &str) -> Option<usize> {
        self.ordering
            .iter()
            .position(|l| l == label)
            .map(|p| p + 1)
    }

    /// Number of ranked responses.
    pub fn len(&self) -> usize {
        self.ordering.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordering.is_empty()
    }
}

/// Why a reviewer's output failed to parse or validate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RankingParseError {
    #[error("no balanced JSON object found in response")]
    NoJsonObject,

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("label {0} appears more than once in ranking")]
    DuplicateLabel(String),

    #[error("unknown label {0} in reviewer output")]
    UnknownLabel(String),

    #[error("label {0} missing from {1}")]
    MissingLabel(String, &'static str),

    #[error("label {label} is missing rubric dimension {dimension}")]
    MissingDimension { label: String, dimension: String },
}

/// Slice out the first balanced top-level JSON object in `text`.
///
/// Tracks string and escape state so braces inside string values do not
/// confuse the depth count. Leading prose, code fences, and trailing
/// commentary are all ignored.
pub fn first_json_object(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Wire shape reviewers are instructed to produce.
#[derive(Debug, Deserialize)]
struct RawRanking {
    ranking: Vec<String>,
    scores: BTreeMap<String, BTreeMap<String, f64>>,
}

/// Parse and validate one reviewer's output against the labels it was given.
pub fn parse_ranking(
    reviewer: &str,
    text: &str,
    reviewed: &BTreeSet<Label>,
) -> Result<Ranking, RankingParseError> {
    let object = first_json_object(text).ok_or(RankingParseError::NoJsonObject)?;
    let raw: RawRanking =
        serde_json::from_str(object).map_err(|e| RankingParseError::Json(e.to_string()))?;

    // Ordering must cover the reviewed set exactly once each.
    let mut seen = BTreeSet::new();
    for label in &raw.ranking {
        if !reviewed.contains(label) {
            return Err(RankingParseError::UnknownLabel(label.clone()));
        }
        if !seen.insert(label.clone()) {
            return Err(RankingParseError::DuplicateLabel(label.clone()));
        }
    }
    for label in reviewed {
        if !seen.contains(label) {
            return Err(RankingParseError::MissingLabel(label.clone(), "ranking"));
        }
    }

    // Rubric keys must equal the reviewed set, with all five dimensions.
    let mut rubric = BTreeMap::new();
    for (label, dims) in &raw.scores {
        if !reviewed.contains(label) {
            return Err(RankingParseError::UnknownLabel(label.clone()));
        }
        for dimension in RUBRIC_DIMENSIONS {
            if !dims.contains_key(dimension) {
                return Err(RankingParseError::MissingDimension {
                    label: label.clone(),
                    dimension: dimension.to_string(),
                });
            }
        }
        let scores = RubricScores {
            accuracy: dims["accuracy"],
            relevance: dims["relevance"],
            completeness: dims["completeness"],
            conciseness: dims["conciseness"],
            clarity: dims["clarity"],
        }
        .clamped();
        rubric.insert(label.clone(), scores);
    }
    for label in reviewed {
        if !rubric.contains_key(label) {
            return Err(RankingParseError::MissingLabel(label.clone(), "scores"));
        }
    }

    Ok(Ranking {
        reviewer: reviewer.to_string(),
        ordering: raw.ranking,
        rubric,
    })
}
