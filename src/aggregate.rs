//! Ranking aggregation — de-anonymize, exclude self-votes, score.
//!
//! Borda scoring: position `p` in a ranking of length `k` earns `k − p + 1`
//! points, summed across retained reviewers. Rubric dimensions get a mean
//! and a population variance per responder. The final table is sorted by
//! Borda points, then mean accuracy, then mean relevance, then model id.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::labels::LabelMap;
use crate::parse::{Ranking, RubricScores, RUBRIC_DIMENSIONS};
use crate::query::ModelId;

/// Aggregated standing of one responder after peer review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub model: ModelId,
    pub borda_points: u32,
    pub mean_rubric: RubricScores,
    pub rubric_variance: RubricScores,
    /// Reviewers whose votes were retained for this responder.
    pub reviewer_count: usize,
    /// Whether a self-vote was dropped for this responder.
    pub self_excluded: bool,
}

/// Build the aggregate table for `responders` from validated rankings.
///
/// Labels inside each ranking are mapped back to model ids through `labels`.
/// When `exclude_self_votes` is set, a reviewer's vote for their own response
/// is dropped without re-compacting the positions of their peers.
pub fn aggregate(
    rankings: &[Ranking],
    labels: &LabelMap,
    responders: &[ModelId],
    exclude_self_votes: bool,
) -> Vec<AggregateEntry> {
    let mut entries: Vec<AggregateEntry> = responders
        .iter()
        .map(|responder| {
            let label = labels.label(responder);

            let mut borda_points = 0u32;
            let mut retained: Vec<RubricScores> = Vec::new();
            let mut self_excluded = false;

            for ranking in rankings {
                let Some(label) = label else { continue };
                let Some(position) = ranking.position(label) else {
                    // Under stratified sampling this reviewer may not have
                    // seen this response at all.
                    continue;
                };
                if exclude_self_votes && ranking.reviewer == *responder {
                    self_excluded = true;
                    continue;
                }
                borda_points += (ranking.len() - position + 1) as u32;
                if let Some(scores) = ranking.rubric.get(label) {
                    retained.push(*scores);
                }
            }

            AggregateEntry {
                model: responder.clone(),
                borda_points,
                mean_rubric: mean_scores(&retained),
                rubric_variance: variance_scores(&retained),
                reviewer_count: retained.len(),
                self_excluded,
            }
        })
        .collect();

    entries.sort_by(compare_entries);
    entries
}

/// Tie-break order: Borda desc, mean accuracy desc, mean relevance desc,
/// model id asc.
fn compare_entries(a: &AggregateEntry, b: &AggregateEntry) -> Ordering {
    b.borda_points
        .cmp(&a.borda_points)
        .then_with(|| total_cmp_desc(a.mean_rubric.accuracy, b.mean_rubric.accuracy))
        .then_with(|| total_cmp_desc(a.mean_rubric.relevance, b.mean_rubric.relevance))
        .then_with(|| a.model.cmp(&b.model))
}

fn total_cmp_desc(a: f64, b: f64) -> Ordering {
    b.total_cmp(&a)
}

fn mean_scores(samples: &[RubricScores]) -> RubricScores {
    if samples.is_empty() {
        return RubricScores::uniform(0.0);
    }
    let n = samples.len() as f64;
    fold_dimensions(|dim| samples.iter().map(|s| s.get(dim)).sum::<f64>() / n)
}

/// Population variance per dimension; a single sample yields 0.
fn variance_scores(samples: &[RubricScores]) -> RubricScores {
    if samples.len() < 2 {
        return RubricScores::uniform(0.0);
    }
    let n = samples.len() as f64;
    let means = mean_scores(samples);
    fold_dimensions(|dim| {
        let mean = means.get(dim);
        samples
            .iter()
            .map(|s| {
                let d = s.get(dim) - mean;
                d * d
            })
            .sum::<f64>()
            / n
    })
}

fn fold_dimensions(mut f: impl FnMut(&str) -> f64) -> RubricScores {
    let mut out = RubricScores::uniform(0.0);
    for dim in RUBRIC_DIMENSIONS {
        let value = f(dim);
        match dim {
            "accuracy" => out.accuracy = value,
            "relevance" => out.relevance = value,
            "completeness" => out.completeness = value,
            "conciseness" => out.conciseness = value,
            "clarity" => out.clarity = value,
            _ => unreachable!(),
        }
    }
    out
}

/// Mean of all rubric variances across responders and dimensions.
pub fn mean_rubric_variance(entries: &[AggregateEntry]) -> f64 {
    let scored: Vec<&AggregateEntry> = entries.iter().filter(|e| e.reviewer_count > 0).collect();
    if scored.is_empty() {
        return 0.0;
    }
    let per_entry: f64 = scored
        .iter()
        .map(|e| {
            RUBRIC_DIMENSIONS
                .iter()
                .map(|d| e.rubric_variance.get(d))
                .sum::<f64>()
                / RUBRIC_DIMENSIONS.len() as f64
        })
        .sum();
    per_entry / scored.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn label_map() -> LabelMap {
        LabelMap::from_pairs([
            ("m1".to_string(), "A".to_string()),
            ("m2".to_string(), "B".to_string()),
            ("m3".to_string(), "C".to_string()),
        ])
    }

    fn ranking(reviewer: &str, ordering: &[&str], accuracy: &[(&str, f64)]) -> Ranking {
        let mut rubric = BTreeMap::new();
        for label in ordering {
            let acc = accuracy
                .iter()
                .find(|(l, _)| l == label)
                .map(|(_, a)| *a)
                .unwrap_or(5.0);
            let mut scores = RubricScores::uniform(5.0);
            scores.accuracy = acc;
            rubric.insert(label.to_string(), scores);
        }
        Ranking {
            reviewer: reviewer.to_string(),
            ordering: ordering.iter().map(|s| s.to_string()).collect(),
            rubric,
        }
    }

    fn responders() -> Vec<ModelId> {
        vec!["m1".to_string(), "m2".to_string(), "m3".to_string()]
    }

    /// The S1 fixture: m1→[B,C,A], m2→[B,A,C], m3→[C,B,A].
    fn s1_rankings() -> Vec<Ranking> {
        vec![
            ranking("m1", &["B", "C", "A"], &[("C", 7.0)]),
            ranking("m2", &["B", "A", "C"], &[("C", 7.0)]),
            ranking("m3", &["C", "B", "A"], &[]),
        ]
    }

    #[test]
    fn test_borda_with_self_exclusion() {
        let table = aggregate(&s1_rankings(), &label_map(), &responders(), true);

        // m2 (B): 3 from m1 + 2 from m3; own first place dropped.
        assert_eq!(table[0].model, "m2");
        assert_eq!(table[0].borda_points, 5);
        assert!(table[0].self_excluded);

        // m3 (C) and m1 (A) both score 3; C wins on mean accuracy.
        assert_eq!(table[1].model, "m3");
        assert_eq!(table[1].borda_points, 3);
        assert_eq!(table[2].model, "m1");
        assert_eq!(table[2].borda_points, 3);
    }

    #[test]
    fn test_borda_without_self_exclusion() {
        let table = aggregate(&s1_rankings(), &label_map(), &responders(), false);
        let points: BTreeMap<&str, u32> = table
            .iter()
            .map(|e| (e.model.as_str(), e.borda_points))
            .collect();

        // Each reviewer's own position now counts: B adds its own 3,
        // C its own 3, A its own 1.
        assert_eq!(points["m2"], 8);
        assert_eq!(points["m3"], 6);
        assert_eq!(points["m1"], 4);
        assert!(table.iter().all(|e| !e.self_excluded));
    }

    #[test]
    fn test_self_exclusion_delta_is_own_position_points() {
        // Property: flipping exclude_self_votes changes each responder's
        // score by exactly the points of their own position.
        let with = aggregate(&s1_rankings(), &label_map(), &responders(), true);
        let without = aggregate(&s1_rankings(), &label_map(), &responders(), false);

        let get = |table: &[AggregateEntry], model: &str| {
            table
                .iter()
                .find(|e| e.model == model)
                .unwrap()
                .borda_points
        };

        assert_eq!(get(&without, "m2") - get(&with, "m2"), 3); // own 1st place
        assert_eq!(get(&without, "m3") - get(&with, "m3"), 3); // own 1st place
        assert_eq!(get(&without, "m1") - get(&with, "m1"), 1); // own 3rd place
    }

    #[test]
    fn test_lexicographic_tiebreak() {
        // Two reviewers disagree symmetrically; all rubric scores equal.
        let rankings = vec![
            ranking("m3", &["A", "B"], &[]),
            ranking("m3b", &["B", "A"], &[]),
        ];
        let labels = LabelMap::from_pairs([
            ("m1".to_string(), "A".to_string()),
            ("m2".to_string(), "B".to_string()),
        ]);
        let table = aggregate(
            &rankings,
            &labels,
            &["m1".to_string(), "m2".to_string()],
            true,
        );
        assert_eq!(table[0].borda_points, table[1].borda_points);
        assert_eq!(table[0].model, "m1");
        assert_eq!(table[1].model, "m2");
    }

    #[test]
    fn test_rubric_mean_and_variance() {
        let mut r1 = ranking("ra", &["A"], &[("A", 4.0)]);
        let mut r2 = ranking("rb", &["A"], &[("A", 8.0)]);
        r1.rubric.get_mut("A").unwrap().clarity = 6.0;
        r2.rubric.get_mut("A").unwrap().clarity = 6.0;

        let labels = LabelMap::from_pairs([("m1".to_string(), "A".to_string())]);
        let table = aggregate(&[r1, r2], &labels, &["m1".to_string()], true);

        let entry = &table[0];
        assert_eq!(entry.reviewer_count, 2);
        assert!((entry.mean_rubric.accuracy - 6.0).abs() < 1e-9);
        assert!((entry.rubric_variance.accuracy - 4.0).abs() < 1e-9);
        assert!((entry.rubric_variance.clarity - 0.0).abs() < 1e-9);
    }

    #[test]
    fn test_single_reviewer_variance_zero() {
        let labels = LabelMap::from_pairs([("m1".to_string(), "A".to_string())]);
        let table = aggregate(
            &[ranking("rx", &["A"], &[("A", 9.0)])],
            &labels,
            &["m1".to_string()],
            true,
        );
        assert!((table[0].rubric_variance.accuracy - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_rankings_give_zeroed_table() {
        let table = aggregate(&[], &label_map(), &responders(), true);
        assert_eq!(table.len(), 3);
        assert!(table.iter().all(|e| e.borda_points == 0));
        assert!(table.iter().all(|e| e.reviewer_count == 0));
    }

    #[test]
    fn test_sampled_reviewer_skips_unseen_responses() {
        // Reviewer only saw A and B; C gets no contribution from them.
        let rankings = vec![ranking("m9", &["B", "A"], &[])];
        let table = aggregate(&rankings, &label_map(), &responders(), true);
        let by_model: BTreeMap<&str, &AggregateEntry> =
            table.iter().map(|e| (e.model.as_str(), e)).collect();
        assert_eq!(by_model["m2"].borda_points, 2);
        assert_eq!(by_model["m1"].borda_points, 1);
        assert_eq!(by_model["m3"].borda_points, 0);
        assert_eq!(by_model["m3"].reviewer_count, 0);
    }

    #[test]
    fn test_mean_rubric_variance_helper() {
        let entries = vec![
            AggregateEntry {
                model: "m1".to_string(),
                borda_points: 0,
                mean_rubric: RubricScores::uniform(5.0),
                rubric_variance: RubricScores::uniform(2.0),
                reviewer_count: 2,
                self_excluded: false,
            },
            AggregateEntry {
                model: "m2".to_string(),
                borda_points: 0,
                mean_rubric: RubricScores::uniform(5.0),
                rubric_variance: RubricScores::uniform(4.0),
                reviewer_count: 2,
                self_excluded: false,
            },
        ];
        assert!((mean_rubric_variance(&entries) - 3.0).abs() < 1e-9);
        assert!((mean_rubric_variance(&[]) - 0.0).abs() < f64::EPSILON);
    }
}
