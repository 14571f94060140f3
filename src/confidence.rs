//! Confidence scoring from reviewer agreement.
//!
//! Confidence blends three signals: how similarly reviewers ordered the
//! responses (pairwise Kendall-τ distance), how tightly their rubric scores
//! cluster (variance against a ceiling), and how decisively the Borda winner
//! leads the runner-up. Fewer than two surviving reviewers means there is no
//! agreement to measure, so confidence pins at 0.50.

use serde::{Deserialize, Serialize};

use crate::aggregate::{mean_rubric_variance, AggregateEntry};
use crate::config::ConfidenceWeights;
use crate::labels::Label;
use crate::parse::Ranking;
use crate::stages::synthesize::{RawVerdict, Verdict};

/// Variance ceiling: the variance of scores spread uniformly over [0, 10].
pub const V_MAX: f64 = 6.25;

/// Confidence floor and ceiling after blending.
pub const CONFIDENCE_CLAMP: (f64, f64) = (0.05, 0.99);

/// Confidence used whenever agreement cannot be measured.
pub const NEUTRAL_CONFIDENCE: f64 = 0.50;

/// The blended confidence with its components, kept for the transcript.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceBreakdown {
    /// 1 − normalized mean pairwise Kendall-τ distance.
    pub rank_agreement: f64,
    /// 1 − clamp(mean rubric variance / V_MAX, 0, 1).
    pub rubric_agreement: f64,
    /// Normalized Borda lead of the winner over the runner-up.
    pub spread: f64,
    /// The final blended, clamped confidence.
    pub confidence: f64,
}

/// Score reviewer agreement into a confidence in [0.05, 0.99].
pub fn score(
    rankings: &[Ranking],
    aggregate: &[AggregateEntry],
    weights: &ConfidenceWeights,
) -> ConfidenceBreakdown {
    if rankings.len() < 2 {
        return ConfidenceBreakdown {
            rank_agreement: NEUTRAL_CONFIDENCE,
            rubric_agreement: NEUTRAL_CONFIDENCE,
            spread: NEUTRAL_CONFIDENCE,
            confidence: NEUTRAL_CONFIDENCE,
        };
    }

    let rank_agreement = 1.0 - mean_pairwise_tau_distance(rankings);
    let rubric_agreement = 1.0 - (mean_rubric_variance(aggregate) / V_MAX).clamp(0.0, 1.0);
    let spread = borda_spread(aggregate);

    let blended =
        weights.rank * rank_agreement + weights.rubric * rubric_agreement + weights.spread * spread;
    let confidence = blended.clamp(CONFIDENCE_CLAMP.0, CONFIDENCE_CLAMP.1);

    ConfidenceBreakdown {
        rank_agreement,
        rubric_agreement,
        spread,
        confidence,
    }
}

/// Map the chairman's raw marker to the engine verdict.
///
/// APPROVED passes only at or above the threshold; REJECTED fails at any
/// confidence; a missing marker is unclear at neutral confidence.
pub fn map_verdict(
    raw: Option<RawVerdict>,
    confidence: f64,
    threshold: f64,
) -> (Verdict, f64) {
    match raw {
        Some(RawVerdict::Approved) if confidence >= threshold => (Verdict::Pass, confidence),
        Some(RawVerdict::Approved) => (Verdict::Unclear, confidence),
        Some(RawVerdict::Rejected) => (Verdict::Fail, confidence),
        None => (Verdict::Unclear, NEUTRAL_CONFIDENCE),
    }
}

/// Normalized Kendall-τ distance between two orderings over their common
/// labels: discordant pairs / total pairs. `None` when fewer than two labels
/// are shared (possible under stratified sampling).
fn tau_distance(a: &[Label], b: &[Label]) -> Option<f64> {
    let common: Vec<&Label> = a.iter().filter(|l| b.contains(l)).collect();
    let n = common.len();
    if n < 2 {
        return None;
    }

    let pos = |ordering: &[Label], label: &Label| {
        ordering.iter().position(|l| l == label).unwrap_or(usize::MAX)
    };

    let mut discordant = 0usize;
    for i in 0..n {
        for j in (i + 1)..n {
            let a_agrees = pos(a, common[i]) < pos(a, common[j]);
            let b_agrees = pos(b, common[i]) < pos(b, common[j]);
            if a_agrees != b_agrees {
                discordant += 1;
            }
        }
    }
    Some(discordant as f64 / (n * (n - 1) / 2) as f64)
}

/// Mean pairwise τ distance across all comparable reviewer pairs. With no
/// comparable pair the orderings cannot disagree, so the distance is 0.
fn mean_pairwise_tau_distance(rankings: &[Ranking]) -> f64 {
    let mut total = 0.0;
    let mut pairs = 0usize;
    for i in 0..rankings.len() {
        for j in (i + 1)..rankings.len() {
            if let Some(d) = tau_distance(&rankings[i].ordering, &rankings[j].ordering) {
                total += d;
                pairs += 1;
            }
        }
    }
    if pairs == 0 {
        0.0
    } else {
        total / pairs as f64
    }
}

/// `(borda_top − borda_second) / borda_top`, clamped to [0, 1]. A single
/// responder has nothing to be beaten by, so the spread is 1.
fn borda_spread(aggregate: &[AggregateEntry]) -> f64 {
    match aggregate {
        [] => 0.0,
        [_] => 1.0,
        [top, second, ..] => {
            if top.borda_points == 0 {
                0.0
            } else {
                ((top.borda_points - second.borda_points) as f64 / top.borda_points as f64)
                    .clamp(0.0, 1.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::RubricScores;
    use std::collections::BTreeMap;

    fn ranking(reviewer: &str, ordering: &[&str]) -> Ranking {
        let rubric: BTreeMap<String, RubricScores> = ordering
            .iter()
            .map(|l| (l.to_string(), RubricScores::uniform(5.0)))
            .collect();
        Ranking {
            reviewer: reviewer.to_string(),
            ordering: ordering.iter().map(|s| s.to_string()).collect(),
            rubric,
        }
    }

    fn entry(model: &str, borda: u32, variance: f64) -> AggregateEntry {
        AggregateEntry {
            model: model.to_string(),
            borda_points: borda,
            mean_rubric: RubricScores::uniform(5.0),
            rubric_variance: RubricScores::uniform(variance),
            reviewer_count: 2,
            self_excluded: false,
        }
    }

    #[test]
    fn test_tau_identical_orderings() {
        let a = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        assert_eq!(tau_distance(&a, &a), Some(0.0));
    }

    #[test]
    fn test_tau_reversed_orderings() {
        let a = vec!["A".to_string(), "B".to_string(), "C".to_string()];
        let b = vec!["C".to_string(), "B".to_string(), "A".to_string()];
        assert_eq!(tau_distance(&a, &b), Some(1.0));
    }

    #[test]
    fn test_tau_partial_overlap() {
        let a = vec!["A".to_string(), "B".to_string()];
        let b = vec!["B".to_string(), "C".to_string()];
        // Only one common label — not comparable.
        assert_eq!(tau_distance(&a, &b), None);
    }

    #[test]
    fn test_unanimous_rankings_high_confidence() {
        let rankings = vec![
            ranking("m1", &["B", "C", "A"]),
            ranking("m2", &["B", "C", "A"]),
            ranking("m3", &["B", "C", "A"]),
        ];
        let aggregate = vec![entry("m2", 9, 0.0), entry("m3", 6, 0.0), entry("m1", 3, 0.0)];
        let breakdown = score(&rankings, &aggregate, &ConfidenceWeights::default());

        assert!((breakdown.rank_agreement - 1.0).abs() < f64::EPSILON);
        assert!((breakdown.rubric_agreement - 1.0).abs() < f64::EPSILON);
        assert!(breakdown.confidence > 0.8);
    }

    #[test]
    fn test_contradictory_rankings_low_rank_agreement() {
        let rankings = vec![
            ranking("m1", &["A", "B", "C"]),
            ranking("m2", &["C", "B", "A"]),
        ];
        let aggregate = vec![entry("m1", 4, 0.0), entry("m2", 4, 0.0)];
        let breakdown = score(&rankings, &aggregate, &ConfidenceWeights::default());
        assert!((breakdown.rank_agreement - 0.0).abs() < f64::EPSILON);
        assert!((breakdown.spread - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_single_reviewer_pins_neutral() {
        let rankings = vec![ranking("m1", &["A", "B"])];
        let aggregate = vec![entry("m1", 2, 0.0)];
        let breakdown = score(&rankings, &aggregate, &ConfidenceWeights::default());
        assert!((breakdown.confidence - NEUTRAL_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_s4_arithmetic() {
        // c_rank=0.9, c_rubric=0.8, c_spread=0.6 → 0.81 with default weights.
        let w = ConfidenceWeights::default();
        let blended = w.rank * 0.9 + w.rubric * 0.8 + w.spread * 0.6;
        assert!((blended - 0.81).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_monotone_in_variance() {
        let rankings = vec![
            ranking("m1", &["A", "B"]),
            ranking("m2", &["A", "B"]),
        ];
        let weights = ConfidenceWeights::default();

        let mut previous = f64::INFINITY;
        for variance in [0.0, 1.0, 2.5, 5.0, 6.25, 9.0] {
            let aggregate = vec![entry("m1", 4, variance), entry("m2", 2, variance)];
            let breakdown = score(&rankings, &aggregate, &weights);
            assert!(
                breakdown.confidence <= previous,
                "confidence rose when variance grew to {}",
                variance
            );
            previous = breakdown.confidence;
        }
    }

    #[test]
    fn test_spread_edges() {
        assert!((borda_spread(&[]) - 0.0).abs() < f64::EPSILON);
        assert!((borda_spread(&[entry("m1", 5, 0.0)]) - 1.0).abs() < f64::EPSILON);
        assert!(
            (borda_spread(&[entry("m1", 0, 0.0), entry("m2", 0, 0.0)]) - 0.0).abs() < f64::EPSILON
        );
        let spread = borda_spread(&[entry("m1", 5, 0.0), entry("m2", 3, 0.0)]);
        assert!((spread - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_clamped() {
        let rankings = vec![
            ranking("m1", &["A", "B"]),
            ranking("m2", &["B", "A"]),
        ];
        // Total disagreement plus maximal variance: floor applies.
        let aggregate = vec![entry("m1", 1, 100.0), entry("m2", 1, 100.0)];
        let breakdown = score(&rankings, &aggregate, &ConfidenceWeights::default());
        assert!(breakdown.confidence >= CONFIDENCE_CLAMP.0);
    }

    #[test]
    fn test_verdict_mapping() {
        assert_eq!(
            map_verdict(Some(RawVerdict::Approved), 0.81, 0.7),
            (Verdict::Pass, 0.81)
        );
        assert_eq!(
            map_verdict(Some(RawVerdict::Approved), 0.55, 0.7),
            (Verdict::Unclear, 0.55)
        );
        assert_eq!(
            map_verdict(Some(RawVerdict::Rejected), 0.95, 0.7),
            (Verdict::Fail, 0.95)
        );
        assert_eq!(
            map_verdict(None, 0.9, 0.7),
            (Verdict::Unclear, NEUTRAL_CONFIDENCE)
        );
    }
}
