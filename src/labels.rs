//! Request-scoped anonymization labels.
//!
//! Each deliberation assigns every council responder an opaque label (A, B,
//! C, …) via a fresh random permutation, so Stage 2 reviewers never see model
//! identities. The full mapping is persisted in `request.json` and used to
//! de-anonymize rankings after parsing.

use std::collections::BTreeMap;

use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::query::ModelId;

/// An opaque reviewer-facing label: one uppercase letter.
pub type Label = String;

const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Bijection between model ids and labels for a single request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelMap {
    assignments: BTreeMap<ModelId, Label>,
}

impl LabelMap {
    /// Assign labels to `models` by shuffling with the OS RNG.
    ///
    /// Panics if `models` exceeds 26 entries; config validation rules that
    /// out before any request is accepted.
    pub fn assign(models: &[ModelId]) -> Self {
        assert!(models.len() <= ALPHABET.len(), "more models than labels");
        let mut positions: Vec<usize> = (0..models.len()).collect();
        positions.shuffle(&mut OsRng);

        let assignments = models
            .iter()
            .zip(positions)
            .map(|(model, pos)| (model.clone(), (ALPHABET[pos] as char).to_string()))
            .collect();
        Self { assignments }
    }

    /// Build a map from explicit pairs. Used by tests and transcript replay.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (ModelId, Label)>) -> Self {
        Self {
            assignments: pairs.into_iter().collect(),
        }
    }

    /// The label assigned to `model`.
    pub fn label(&self, model: &str) -> Option<&str> {
        self.assignments.get(model).map(String::as_str)
    }

    /// The model behind `label`.
    pub fn delabel(&self, label: &str) -> Option<&ModelId> {
        self.assignments
            .iter()
            .find(|(_, l)| l.as_str() == label)
            .map(|(m, _)| m)
    }

    /// All `(model, label)` pairs, ordered by model id.
    pub fn pairs(&self) -> impl Iterator<Item = (&ModelId, &Label)> {
        self.assignments.iter()
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn models(n: usize) -> Vec<ModelId> {
        (1..=n).map(|i| format!("m{}", i)).collect()
    }

    #[test]
    fn test_bijection() {
        let council = models(5);
        let map = LabelMap::assign(&council);
        assert_eq!(map.len(), 5);

        let labels: BTreeSet<&str> = council
            .iter()
            .map(|m| map.label(m).expect("every model labeled"))
            .collect();
        assert_eq!(labels.len(), 5, "labels must be distinct");

        for model in &council {
            let label = map.label(model).unwrap();
            assert_eq!(map.delabel(label), Some(model));
        }
    }

    #[test]
    fn test_labels_drawn_from_alphabet_prefix() {
        let council = models(3);
        let map = LabelMap::assign(&council);
        for (_, label) in map.pairs() {
            assert!(["A", "B", "C"].contains(&label.as_str()));
        }
    }

    #[test]
    fn test_unknown_lookups() {
        let map = LabelMap::assign(&models(2));
        assert_eq!(map.label("nope"), None);
        assert_eq!(map.delabel("Z"), None);
    }

    #[test]
    fn test_serde_roundtrip() {
        let map = LabelMap::from_pairs([
            ("m1".to_string(), "B".to_string()),
            ("m2".to_string(), "A".to_string()),
        ]);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"m1":"B","m2":"A"}"#);
        let back: LabelMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_full_alphabet() {
        let council = models(26);
        let map = LabelMap::assign(&council);
        let labels: BTreeSet<&str> = map.pairs().map(|(_, l)| l.as_str()).collect();
        assert_eq!(labels.len(), 26);
    }
}
