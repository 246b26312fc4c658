//! Replayable evidence attached to every resolver decision.
//!
//! Evidence is user-facing debugging data with a hard persisted-size cap.
//! The truncation ladder is a pure function with an explicit step log so a
//! truncated document says exactly what was dropped.

use serde::{Deserialize, Serialize};

use crate::models::{LinkStatus, MatchType};
use crate::normalize::{sha256_hex, NormalizedInput};

/// Rule names recorded in `rules_fired`, in firing order.
pub mod rules {
    pub const SOURCE_NOT_FOUND: &str = "SOURCE_NOT_FOUND";
    pub const MANUAL_LOCKED: &str = "MANUAL_LOCKED";
    pub const INPUT_HASH_UNCHANGED: &str = "INPUT_HASH_UNCHANGED";
    pub const UPC_NOT_TRUSTED: &str = "UPC_NOT_TRUSTED";
    pub const UPC_MATCH_ATTEMPTED: &str = "UPC_MATCH_ATTEMPTED";
    pub const PRODUCT_RACE_RETRY: &str = "PRODUCT_RACE_RETRY";
    pub const IDENTITY_KEY_ATTEMPTED: &str = "IDENTITY_KEY_ATTEMPTED";
    pub const IDENTITY_KEY_CREATED: &str = "IDENTITY_KEY_CREATED";
    pub const FUZZY_SCORED: &str = "FUZZY_SCORED";
    pub const CANDIDATE_OVERFLOW: &str = "CANDIDATE_OVERFLOW";
    pub const FUZZY_AMBIGUOUS: &str = "FUZZY_AMBIGUOUS";
    pub const INSUFFICIENT_DATA: &str = "INSUFFICIENT_DATA";
    pub const ALIAS_CHAIN_RESOLVED: &str = "ALIAS_CHAIN_RESOLVED";
    pub const ALIAS_CHAIN_TOO_DEEP: &str = "ALIAS_CHAIN_TOO_DEEP";
    pub const RELINK_ALLOWED: &str = "RELINK_ALLOWED";
    pub const RELINK_BLOCKED_HYSTERESIS: &str = "RELINK_BLOCKED_HYSTERESIS";
}

/// Maximum persisted evidence size.
pub const MAX_EVIDENCE_BYTES: usize = 500 * 1024;

/// Scoring detail for one fuzzy candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateEvidence {
    pub product_id: i64,
    pub canonical_key: String,
    pub score: f64,
    pub components: crate::resolver::scoring::ScoreComponents,
}

/// The decision this resolve found already persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviousDecision {
    pub product_id: Option<i64>,
    pub match_type: MatchType,
    pub status: LinkStatus,
    pub confidence: f64,
    pub resolved_at: i64,
}

/// One hop of the alias chain walk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AliasHop {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemErrorEvidence {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub resolver_version: u32,
    pub dictionary_version: u32,
    pub trust_config_version: i64,
    pub weights_version: u32,
    pub input_normalized: NormalizedInput,
    pub input_hash: String,
    pub rules_fired: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub candidates: Vec<CandidateEvidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_decision: Option<PreviousDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alias_hops: Vec<AliasHop>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_error: Option<SystemErrorEvidence>,
    pub truncated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub truncation_steps: Vec<String>,
}

impl Evidence {
    pub fn fire(&mut self, rule: &'static str) {
        self.rules_fired.push(rule.to_string());
    }

    pub fn fired(&self, rule: &str) -> bool {
        self.rules_fired.iter().any(|r| r == rule)
    }
}

/// Hash over the normalized input, the extraction dictionary version and the
/// trust config version. Identical inputs resolve identically, so a matching
/// hash short-circuits the whole decision.
pub fn compute_input_hash(input: &NormalizedInput, trust_config_version: i64) -> String {
    let serialized = serde_json::to_string(input).unwrap_or_default();
    let material = format!(
        "{}|{}|{}",
        serialized, input.dictionary_version, trust_config_version
    );
    sha256_hex(material.as_bytes())
}

/// Serialize evidence under the size cap, applying the truncation ladder as
/// needed: candidates to top 5, then drop candidates, then trim
/// normalization errors to 3, then truncate the normalized title to 100
/// chars. Each applied step is recorded on the document itself.
pub fn serialize_capped(evidence: &mut Evidence) -> serde_json::Result<String> {
    let mut json = serde_json::to_string(evidence)?;
    if json.len() <= MAX_EVIDENCE_BYTES {
        return Ok(json);
    }

    evidence.truncated = true;

    if evidence.candidates.len() > 5 {
        evidence.candidates.truncate(5);
        evidence.truncation_steps.push("CANDIDATES_TOP5".to_string());
        json = serde_json::to_string(evidence)?;
        if json.len() <= MAX_EVIDENCE_BYTES {
            return Ok(json);
        }
    }

    if !evidence.candidates.is_empty() {
        evidence.candidates.clear();
        evidence
            .truncation_steps
            .push("CANDIDATES_DROPPED".to_string());
        json = serde_json::to_string(evidence)?;
        if json.len() <= MAX_EVIDENCE_BYTES {
            return Ok(json);
        }
    }

    if evidence.input_normalized.normalization_errors.len() > 3 {
        evidence.input_normalized.normalization_errors.truncate(3);
        evidence
            .truncation_steps
            .push("NORMALIZATION_ERRORS_TRIMMED".to_string());
        json = serde_json::to_string(evidence)?;
        if json.len() <= MAX_EVIDENCE_BYTES {
            return Ok(json);
        }
    }

    if evidence.input_normalized.title.chars().count() > 100 {
        let truncated: String = evidence.input_normalized.title.chars().take(100).collect();
        evidence.input_normalized.title = format!("{}…", truncated);
        evidence.truncation_steps.push("TITLE_TRUNCATED".to_string());
        json = serde_json::to_string(evidence)?;
    }

    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_input, AliasLookup, RawInput};
    use crate::resolver::scoring::ScoreComponents;

    fn no_alias(s: &str) -> AliasLookup {
        AliasLookup {
            resolved: s.to_string(),
            alias_applied: false,
            alias_id: None,
        }
    }

    fn base_evidence() -> Evidence {
        let raw = RawInput {
            title: "Federal 9mm Luger 124gr JHP 50 Rounds",
            brand: Some("Federal"),
            ..Default::default()
        };
        let input = normalize_input(&raw, no_alias);
        let hash = compute_input_hash(&input, 1);
        Evidence {
            resolver_version: 3,
            dictionary_version: input.dictionary_version,
            trust_config_version: 1,
            weights_version: 1,
            input_normalized: input,
            input_hash: hash,
            rules_fired: Vec::new(),
            candidates: Vec::new(),
            previous_decision: None,
            manual: None,
            alias_hops: Vec::new(),
            system_error: None,
            truncated: false,
            truncation_steps: Vec::new(),
        }
    }

    fn big_candidate(i: i64) -> CandidateEvidence {
        CandidateEvidence {
            product_id: i,
            canonical_key: format!("FP:v1:{}", "a".repeat(64)),
            score: 0.8,
            components: ScoreComponents {
                brand: 0.25,
                caliber: 0.30,
                pack: 0.20,
                grain: 0.15,
                title: 0.10,
            },
        }
    }

    #[test]
    fn test_input_hash_is_stable() {
        let raw = RawInput {
            title: "Federal 9mm Luger 124gr JHP 50 Rounds",
            brand: Some("Federal"),
            ..Default::default()
        };
        let a = compute_input_hash(&normalize_input(&raw, no_alias), 1);
        let b = compute_input_hash(&normalize_input(&raw, no_alias), 1);
        assert_eq!(a, b);

        // A trust config change produces a different hash.
        let c = compute_input_hash(&normalize_input(&raw, no_alias), 2);
        assert_ne!(a, c);
    }

    #[test]
    fn test_small_evidence_is_untouched() {
        let mut evidence = base_evidence();
        evidence.candidates = (0..10).map(big_candidate).collect();

        let json = serialize_capped(&mut evidence).unwrap();
        assert!(!evidence.truncated);
        assert!(evidence.truncation_steps.is_empty());
        assert_eq!(evidence.candidates.len(), 10);
        assert!(json.len() <= MAX_EVIDENCE_BYTES);
    }

    #[test]
    fn test_truncation_ladder_steps_are_recorded() {
        let mut evidence = base_evidence();
        // Inflate far past the cap: huge candidate payloads.
        evidence.candidates = (0..10)
            .map(|i| {
                let mut c = big_candidate(i);
                c.canonical_key = "x".repeat(120_000);
                c
            })
            .collect();

        let json = serialize_capped(&mut evidence).unwrap();
        assert!(evidence.truncated);
        assert_eq!(
            evidence.truncation_steps,
            vec!["CANDIDATES_TOP5".to_string(), "CANDIDATES_DROPPED".to_string()]
        );
        assert!(evidence.candidates.is_empty());
        assert!(json.len() <= MAX_EVIDENCE_BYTES);
    }

    #[test]
    fn test_rules_fired_order_preserved() {
        let mut evidence = base_evidence();
        evidence.fire(rules::UPC_NOT_TRUSTED);
        evidence.fire(rules::IDENTITY_KEY_ATTEMPTED);
        assert!(evidence.fired(rules::UPC_NOT_TRUSTED));
        assert_eq!(
            evidence.rules_fired,
            vec!["UPC_NOT_TRUSTED", "IDENTITY_KEY_ATTEMPTED"]
        );
    }
}
