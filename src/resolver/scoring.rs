//! Fixed-weight fuzzy candidate scoring.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::Product;
use crate::normalize::{normalize_title, NormalizedInput};

pub const WEIGHTS_VERSION: u32 = 1;

/// Default component weights. The sum is 1.0 so a perfect candidate scores 1.0.
#[derive(Debug, Clone, Copy)]
pub struct Weights {
    pub brand: f64,
    pub caliber: f64,
    pub pack: f64,
    pub grain: f64,
    pub title: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self {
            brand: 0.25,
            caliber: 0.30,
            pack: 0.20,
            grain: 0.15,
            title: 0.10,
        }
    }
}

/// Weighted per-component contribution for one candidate.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreComponents {
    pub brand: f64,
    pub caliber: f64,
    pub pack: f64,
    pub grain: f64,
    pub title: f64,
}

impl ScoreComponents {
    pub fn total(&self) -> f64 {
        self.brand + self.caliber + self.pack + self.grain + self.title
    }
}

fn eq_component<T: PartialEq>(a: Option<&T>, b: Option<&T>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) if a == b => 1.0,
        _ => 0.0,
    }
}

fn title_similarity(input_title: &str, candidate_name: &str) -> f64 {
    let a: HashSet<String> = input_title
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect();
    let b: HashSet<String> = normalize_title(candidate_name)
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .map(str::to_string)
        .collect();

    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(&b).count() as f64;
    let union = a.union(&b).count() as f64;
    intersection / union
}

/// Score one candidate against the normalized input.
pub fn score_candidate(
    input: &NormalizedInput,
    candidate: &Product,
    weights: &Weights,
) -> ScoreComponents {
    ScoreComponents {
        brand: weights.brand
            * eq_component(input.brand_norm.as_ref(), candidate.brand_norm.as_ref()),
        caliber: weights.caliber
            * eq_component(input.caliber_norm.as_ref(), candidate.caliber_norm.as_ref()),
        pack: weights.pack * eq_component(input.round_count.as_ref(), candidate.round_count.as_ref()),
        grain: weights.grain
            * eq_component(input.grain_weight.as_ref(), candidate.grain_weight.as_ref()),
        title: weights.title * title_similarity(&input.title, &candidate.name),
    }
}

/// A fuzzy decision is ambiguous when the best score sits in the grey band
/// or the runner-up is too close.
pub fn is_ambiguous(best: f64, second: Option<f64>) -> bool {
    if (0.55..0.70).contains(&best) {
        return true;
    }
    match second {
        Some(second) => best - second < 0.03,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_input, AliasLookup, RawInput};

    fn no_alias(s: &str) -> AliasLookup {
        AliasLookup {
            resolved: s.to_string(),
            alias_applied: false,
            alias_id: None,
        }
    }

    fn candidate(name: &str, brand: &str, caliber: &str, grain: Option<u32>, pack: Option<u32>) -> Product {
        Product {
            id: 1,
            canonical_key: "FP:v1:test".to_string(),
            name: name.to_string(),
            category: None,
            brand: Some(brand.to_string()),
            brand_norm: Some(brand.to_lowercase()),
            caliber: Some(caliber.to_string()),
            caliber_norm: Some(caliber.to_string()),
            grain_weight: grain,
            round_count: pack,
            upc_norm: None,
        }
    }

    #[test]
    fn test_perfect_candidate_scores_near_one() {
        let raw = RawInput {
            title: "Federal 9mm Luger 124gr JHP 50 Rounds",
            brand: Some("Federal"),
            ..Default::default()
        };
        let input = normalize_input(&raw, no_alias);
        let product = candidate(
            "Federal 9mm Luger 124gr JHP 50 Rounds",
            "Federal",
            "9mm",
            Some(124),
            Some(50),
        );

        let components = score_candidate(&input, &product, &Weights::default());
        assert!(components.total() > 0.99, "total = {}", components.total());
        assert_eq!(components.brand, 0.25);
        assert_eq!(components.caliber, 0.30);
    }

    #[test]
    fn test_missing_components_score_zero() {
        let raw = RawInput {
            title: "Federal 9mm JHP",
            brand: Some("Federal"),
            ..Default::default()
        };
        let input = normalize_input(&raw, no_alias);
        // No grain/pack anywhere: those components contribute nothing.
        let product = candidate("Federal 9mm JHP", "Federal", "9mm", None, None);

        let components = score_candidate(&input, &product, &Weights::default());
        assert_eq!(components.pack, 0.0);
        assert_eq!(components.grain, 0.0);
        assert!(components.total() < 0.70);
    }

    #[test]
    fn test_ambiguity_band_and_gap() {
        // Grey band.
        assert!(is_ambiguous(0.55, None));
        assert!(is_ambiguous(0.63, Some(0.40)));
        assert!(!is_ambiguous(0.70, None));
        assert!(!is_ambiguous(0.54, None));

        // Gap rule.
        assert!(is_ambiguous(0.80, Some(0.79)));
        assert!(is_ambiguous(0.63, Some(0.62)));
        assert!(!is_ambiguous(0.80, Some(0.70)));
    }
}
