//! The product resolver: a deterministic, auditable function from one source
//! product to a canonical product identity.
//!
//! Fixed decision priority: missing source, manual lock, unchanged input
//! hash, trusted UPC, identity-key fingerprint, fuzzy fingerprint fallback,
//! insufficient data. After any match: alias chain resolution, then relink
//! hysteresis against the prior link. The resolver never persists links or
//! requests; that is the worker's job. Dependency errors propagate;
//! resolver-internal errors become an ERROR result carrying
//! `evidence.system_error`.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::Arc;

use crate::metrics::{MatchPath, MissingField};
use crate::models::{
    IdentifierKind, LinkStatus, MatchType, Pipeline, Product, ReasonCode, ResolveTrigger,
    SourceProduct, TrustConfig,
};
use crate::normalize::{
    identity::{identity_key, upc_canonical_key},
    normalize_input, NormalizedInput, RawInput,
};
use crate::resolver::caches::{BrandAliasCache, TrustCache};
use crate::resolver::evidence::{
    compute_input_hash, rules, AliasHop, Evidence, PreviousDecision, SystemErrorEvidence,
};
use crate::resolver::scoring::{
    is_ambiguous, score_candidate, Weights, WEIGHTS_VERSION,
};
use crate::store::{ProductCreate, ProductFields, Store};

pub const RESOLVER_VERSION: u32 = 3;

const MAX_CANDIDATES: usize = 200;
const TOP_K: usize = 10;
const MAX_ALIAS_DEPTH: usize = 10;
const RELINK_CONFIDENCE_MARGIN: f64 = 0.10;

const UPC_MATCH_CONFIDENCE: f64 = 0.95;
const IDENTITY_KEY_CONFIDENCE: f64 = 1.0;

/// Everything one resolve call decides, for the worker to persist and count.
#[derive(Debug, Clone)]
pub struct ResolveOutcome {
    pub source_product_id: i64,
    pub source_kind: Pipeline,
    pub trigger: ResolveTrigger,
    pub product_id: Option<i64>,
    pub match_type: MatchType,
    pub status: LinkStatus,
    pub reason_code: Option<ReasonCode>,
    pub confidence: f64,
    pub resolver_version: u32,
    pub evidence: Evidence,
    pub skipped: bool,
    pub is_relink: bool,
    pub relink_blocked: bool,
    pub created_product: bool,
    pub match_path: MatchPath,
    pub missing_fields: Vec<MissingField>,
}

/// Intermediate decision before alias resolution and hysteresis.
struct Decision {
    product_id: Option<i64>,
    match_type: MatchType,
    status: LinkStatus,
    reason_code: ReasonCode,
    confidence: f64,
    created_product: bool,
    match_path: MatchPath,
}

pub struct Resolver {
    store: Store,
    trust: Arc<TrustCache>,
    aliases: Arc<BrandAliasCache>,
    weights: Weights,
}

impl Resolver {
    pub fn new(store: Store, trust: Arc<TrustCache>, aliases: Arc<BrandAliasCache>) -> Arc<Self> {
        Arc::new(Self {
            store,
            trust,
            aliases,
            weights: Weights::default(),
        })
    }

    /// Resolve one source product. Pure over its inputs and lookups; all
    /// writes besides canonical-product creation happen elsewhere.
    pub fn resolve(&self, source_product_id: i64, trigger: ResolveTrigger) -> Result<ResolveOutcome> {
        let Some(source) = self.store.get_source_product(source_product_id)? else {
            return Ok(self.source_not_found(source_product_id, trigger));
        };

        let source_kind = self
            .store
            .get_source_pipeline(source.source_id)?
            .unwrap_or(Pipeline::Affiliate);

        let prior = self.store.get_link(source_product_id)?;

        // A manual link is never overwritten by the resolver.
        if let Some(prior) = &prior {
            if prior.match_type == MatchType::Manual {
                return Ok(self.manual_locked(&source, source_kind, trigger, prior));
            }
        }

        let trust = self.trust.get(source.source_id)?;

        let upc_raw = source
            .identifiers
            .iter()
            .find(|(kind, _)| *kind == IdentifierKind::Upc)
            .map(|(_, value)| value.as_str());

        let raw = RawInput {
            title: &source.title,
            brand: source.brand.as_deref(),
            url: source.url.as_deref(),
            attributes: source.attributes.as_deref(),
            upc: upc_raw,
        };
        let input = normalize_input(&raw, |b| self.aliases.lookup(b));
        let input_hash = compute_input_hash(&input, trust.version);

        // Idempotent re-run: nothing changed since the persisted decision.
        if let Some(prior) = &prior {
            if prior_input_hash(prior).as_deref() == Some(input_hash.as_str()) {
                return Ok(self.unchanged_input(
                    &source,
                    source_kind,
                    trigger,
                    prior,
                    input,
                    input_hash,
                    trust.version,
                ));
            }
        }

        let missing_fields = collect_missing_fields(&input);

        let mut evidence = Evidence {
            resolver_version: RESOLVER_VERSION,
            dictionary_version: input.dictionary_version,
            trust_config_version: trust.version,
            weights_version: WEIGHTS_VERSION,
            input_normalized: input.clone(),
            input_hash,
            rules_fired: Vec::new(),
            candidates: Vec::new(),
            previous_decision: prior.as_ref().map(previous_decision),
            manual: None,
            alias_hops: Vec::new(),
            system_error: None,
            truncated: false,
            truncation_steps: Vec::new(),
        };

        let mut decision = self.decide(&source, &input, &trust, &mut evidence)?;

        // Alias chain resolution for any matched or created product.
        if let Some(product_id) = decision.product_id {
            match self.walk_alias_chain(product_id, &mut evidence)? {
                Some(final_id) => decision.product_id = Some(final_id),
                None => {
                    evidence.system_error = Some(SystemErrorEvidence {
                        code: "ALIAS_CHAIN_TOO_DEEP".to_string(),
                        message: format!(
                            "alias chain from product {} exceeds depth {}",
                            product_id, MAX_ALIAS_DEPTH
                        ),
                    });
                    decision = Decision {
                        product_id: None,
                        match_type: MatchType::Error,
                        status: LinkStatus::Error,
                        reason_code: ReasonCode::SystemError,
                        confidence: 0.0,
                        created_product: decision.created_product,
                        match_path: decision.match_path,
                    };
                }
            }
        }

        // Relink hysteresis: a changed target must be materially better.
        let mut is_relink = false;
        let mut relink_blocked = false;
        if let (Some(prior), Some(new_id)) = (&prior, decision.product_id) {
            if let Some(prior_id) = prior.product_id {
                if prior_id != new_id {
                    let stronger = decision.match_type.strength() > prior.match_type.strength();
                    let confident =
                        decision.confidence >= prior.confidence + RELINK_CONFIDENCE_MARGIN;
                    if stronger || confident {
                        is_relink = true;
                        evidence.fire(rules::RELINK_ALLOWED);
                    } else {
                        relink_blocked = true;
                        decision.product_id = Some(prior_id);
                        decision.reason_code = ReasonCode::RelinkBlockedHysteresis;
                        evidence.fire(rules::RELINK_BLOCKED_HYSTERESIS);
                    }
                }
            }
        }

        Ok(ResolveOutcome {
            source_product_id,
            source_kind,
            trigger,
            product_id: decision.product_id,
            match_type: decision.match_type,
            status: decision.status,
            reason_code: Some(decision.reason_code),
            confidence: decision.confidence,
            resolver_version: RESOLVER_VERSION,
            evidence,
            skipped: false,
            is_relink,
            relink_blocked,
            created_product: decision.created_product,
            match_path: decision.match_path,
            missing_fields,
        })
    }

    /// The fixed-priority match pipeline.
    fn decide(
        &self,
        source: &SourceProduct,
        input: &NormalizedInput,
        trust: &TrustConfig,
        evidence: &mut Evidence,
    ) -> Result<Decision> {
        // Trusted UPC first.
        if let Some(upc) = &input.upc_norm {
            if trust.upc_trusted {
                evidence.fire(rules::UPC_MATCH_ATTEMPTED);
                let key = upc_canonical_key(upc);
                if let Some(product) = self.store.get_product_by_canonical_key(&key)? {
                    return Ok(Decision {
                        product_id: Some(product.id),
                        match_type: MatchType::Upc,
                        status: LinkStatus::Matched,
                        reason_code: ReasonCode::UpcMatch,
                        confidence: UPC_MATCH_CONFIDENCE,
                        created_product: false,
                        match_path: MatchPath::Upc,
                    });
                }

                let fields = product_fields(source, input, key, Some(upc.clone()));
                let (product_id, created) = self.create_product(&fields, evidence)?;
                return Ok(Decision {
                    product_id: Some(product_id),
                    match_type: MatchType::Upc,
                    status: if created {
                        LinkStatus::Created
                    } else {
                        LinkStatus::Matched
                    },
                    reason_code: if created {
                        ReasonCode::UpcCreated
                    } else {
                        ReasonCode::UpcMatch
                    },
                    confidence: UPC_MATCH_CONFIDENCE,
                    created_product: created,
                    match_path: MatchPath::Upc,
                });
            }

            // Present but untrusted: note it and fall through to fingerprints.
            evidence.fire(rules::UPC_NOT_TRUSTED);
            evidence
                .input_normalized
                .normalization_errors
                .push(format!("UPC_NOT_TRUSTED: source {}", source.source_id));
        }

        // Identity-key-first fingerprint.
        if let Some(identity) = identity_key(input) {
            evidence.fire(rules::IDENTITY_KEY_ATTEMPTED);
            if let Some(product) = self.store.get_product_by_canonical_key(&identity.key)? {
                return Ok(Decision {
                    product_id: Some(product.id),
                    match_type: MatchType::Fingerprint,
                    status: LinkStatus::Matched,
                    reason_code: ReasonCode::IdentityKeyMatch,
                    confidence: IDENTITY_KEY_CONFIDENCE,
                    created_product: false,
                    match_path: MatchPath::IdentityKey,
                });
            }

            let fields = product_fields(source, input, identity.key, input.upc_norm.clone());
            let (product_id, created) = self.create_product(&fields, evidence)?;
            if created {
                evidence.fire(rules::IDENTITY_KEY_CREATED);
            }
            return Ok(Decision {
                product_id: Some(product_id),
                match_type: MatchType::Fingerprint,
                status: if created {
                    LinkStatus::Created
                } else {
                    LinkStatus::Matched
                },
                reason_code: if created {
                    ReasonCode::IdentityKeyCreated
                } else {
                    ReasonCode::IdentityKeyMatch
                },
                confidence: IDENTITY_KEY_CONFIDENCE,
                created_product: created,
                match_path: MatchPath::IdentityKey,
            });
        }

        // Fuzzy fallback needs at least brand and caliber.
        let (Some(brand), Some(caliber)) = (&input.brand_norm, &input.caliber_norm) else {
            evidence.fire(rules::INSUFFICIENT_DATA);
            return Ok(Decision {
                product_id: None,
                match_type: MatchType::None,
                status: LinkStatus::NeedsReview,
                reason_code: ReasonCode::InsufficientData,
                confidence: 0.0,
                created_product: false,
                match_path: MatchPath::None,
            });
        };

        let candidates = self.store.find_candidates(brand, caliber, MAX_CANDIDATES + 1)?;

        if candidates.len() > MAX_CANDIDATES {
            evidence.fire(rules::CANDIDATE_OVERFLOW);
            return Ok(Decision {
                product_id: None,
                match_type: MatchType::None,
                status: LinkStatus::NeedsReview,
                reason_code: ReasonCode::AmbiguousFingerprint,
                confidence: 0.0,
                created_product: false,
                match_path: MatchPath::Fuzzy,
            });
        }

        if candidates.is_empty() {
            // The identity key was unavailable, so there is nothing safe to
            // create either.
            evidence.fire(rules::INSUFFICIENT_DATA);
            return Ok(Decision {
                product_id: None,
                match_type: MatchType::None,
                status: LinkStatus::NeedsReview,
                reason_code: ReasonCode::InsufficientData,
                confidence: 0.0,
                created_product: false,
                match_path: MatchPath::Fuzzy,
            });
        }

        evidence.fire(rules::FUZZY_SCORED);
        let mut scored: Vec<(f64, &Product, crate::resolver::scoring::ScoreComponents)> =
            candidates
                .iter()
                .map(|candidate| {
                    let components = score_candidate(input, candidate, &self.weights);
                    (components.total(), candidate, components)
                })
                .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        evidence.candidates = scored
            .iter()
            .take(TOP_K)
            .map(|(score, candidate, components)| crate::resolver::evidence::CandidateEvidence {
                product_id: candidate.id,
                canonical_key: candidate.canonical_key.clone(),
                score: *score,
                components: *components,
            })
            .collect();

        let best = scored[0].0;
        let second = scored.get(1).map(|(score, _, _)| *score);

        if is_ambiguous(best, second) {
            evidence.fire(rules::FUZZY_AMBIGUOUS);
            return Ok(Decision {
                product_id: None,
                match_type: MatchType::None,
                status: LinkStatus::NeedsReview,
                reason_code: ReasonCode::AmbiguousFingerprint,
                confidence: 0.0,
                created_product: false,
                match_path: MatchPath::Fuzzy,
            });
        }

        Ok(Decision {
            product_id: Some(scored[0].1.id),
            match_type: MatchType::Fingerprint,
            status: LinkStatus::Matched,
            reason_code: ReasonCode::FuzzyMatch,
            confidence: best,
            created_product: false,
            match_path: MatchPath::Fuzzy,
        })
    }

    /// Atomic create with race handling: a unique violation means another
    /// writer won, so adopt their product and record the retry rule.
    fn create_product(
        &self,
        fields: &ProductFields,
        evidence: &mut Evidence,
    ) -> Result<(i64, bool)> {
        match self.store.insert_product(fields)? {
            ProductCreate::Created(id) => Ok((id, true)),
            ProductCreate::Raced(id) => {
                evidence.fire(rules::PRODUCT_RACE_RETRY);
                Ok((id, false))
            }
        }
    }

    /// Walk `from -> to` alias edges. Returns the final product id, or None
    /// when the chain exceeds the depth cap or cycles.
    fn walk_alias_chain(&self, start: i64, evidence: &mut Evidence) -> Result<Option<i64>> {
        let mut current = start;
        let mut visited: HashSet<i64> = HashSet::from([start]);

        for _ in 0..MAX_ALIAS_DEPTH {
            let Some(next) = self.store.get_alias_target(current)? else {
                if current != start {
                    evidence.fire(rules::ALIAS_CHAIN_RESOLVED);
                }
                return Ok(Some(current));
            };

            evidence.alias_hops.push(AliasHop {
                from: current,
                to: next,
            });

            if !visited.insert(next) {
                evidence.fire(rules::ALIAS_CHAIN_TOO_DEEP);
                return Ok(None);
            }
            current = next;
        }

        if self.store.get_alias_target(current)?.is_some() {
            evidence.fire(rules::ALIAS_CHAIN_TOO_DEEP);
            return Ok(None);
        }
        evidence.fire(rules::ALIAS_CHAIN_RESOLVED);
        Ok(Some(current))
    }

    fn source_not_found(&self, source_product_id: i64, trigger: ResolveTrigger) -> ResolveOutcome {
        let mut evidence = empty_evidence(0);
        evidence.fire(rules::SOURCE_NOT_FOUND);
        evidence.system_error = Some(SystemErrorEvidence {
            code: "SOURCE_NOT_FOUND".to_string(),
            message: format!("source product {} does not exist", source_product_id),
        });

        ResolveOutcome {
            source_product_id,
            source_kind: Pipeline::Affiliate,
            trigger,
            product_id: None,
            match_type: MatchType::Error,
            status: LinkStatus::Error,
            reason_code: Some(ReasonCode::SourceNotFound),
            confidence: 0.0,
            resolver_version: RESOLVER_VERSION,
            evidence,
            skipped: false,
            is_relink: false,
            relink_blocked: false,
            created_product: false,
            match_path: MatchPath::None,
            missing_fields: Vec::new(),
        }
    }

    fn manual_locked(
        &self,
        source: &SourceProduct,
        source_kind: Pipeline,
        trigger: ResolveTrigger,
        prior: &crate::models::ProductLink,
    ) -> ResolveOutcome {
        let mut evidence = empty_evidence(0);
        evidence.fire(rules::MANUAL_LOCKED);
        evidence.previous_decision = Some(previous_decision(prior));

        ResolveOutcome {
            source_product_id: source.id,
            source_kind,
            trigger,
            product_id: prior.product_id,
            match_type: prior.match_type,
            status: prior.status,
            reason_code: Some(ReasonCode::ManualLocked),
            confidence: prior.confidence,
            resolver_version: RESOLVER_VERSION,
            evidence,
            skipped: true,
            is_relink: false,
            relink_blocked: true,
            created_product: false,
            match_path: MatchPath::None,
            missing_fields: Vec::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn unchanged_input(
        &self,
        source: &SourceProduct,
        source_kind: Pipeline,
        trigger: ResolveTrigger,
        prior: &crate::models::ProductLink,
        input: NormalizedInput,
        input_hash: String,
        trust_config_version: i64,
    ) -> ResolveOutcome {
        let mut evidence = Evidence {
            resolver_version: RESOLVER_VERSION,
            dictionary_version: input.dictionary_version,
            trust_config_version,
            weights_version: WEIGHTS_VERSION,
            input_normalized: input,
            input_hash,
            rules_fired: Vec::new(),
            candidates: Vec::new(),
            previous_decision: Some(previous_decision(prior)),
            manual: None,
            alias_hops: Vec::new(),
            system_error: None,
            truncated: false,
            truncation_steps: Vec::new(),
        };
        evidence.fire(rules::INPUT_HASH_UNCHANGED);

        ResolveOutcome {
            source_product_id: source.id,
            source_kind,
            trigger,
            product_id: prior.product_id,
            match_type: prior.match_type,
            status: prior.status,
            reason_code: prior.reason_code,
            confidence: prior.confidence,
            resolver_version: RESOLVER_VERSION,
            evidence,
            skipped: true,
            is_relink: false,
            relink_blocked: false,
            created_product: false,
            match_path: MatchPath::None,
            missing_fields: Vec::new(),
        }
    }
}

fn prior_input_hash(prior: &crate::models::ProductLink) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(&prior.evidence_json).ok()?;
    value
        .get("input_hash")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn previous_decision(prior: &crate::models::ProductLink) -> PreviousDecision {
    PreviousDecision {
        product_id: prior.product_id,
        match_type: prior.match_type,
        status: prior.status,
        confidence: prior.confidence,
        resolved_at: prior.resolved_at,
    }
}

fn product_fields(
    source: &SourceProduct,
    input: &NormalizedInput,
    canonical_key: String,
    upc_norm: Option<String>,
) -> ProductFields {
    ProductFields {
        canonical_key,
        name: source.title.clone(),
        category: None,
        brand: source.brand.clone(),
        brand_norm: input.brand_norm.clone(),
        caliber: source.caliber.clone().or_else(|| input.caliber_norm.clone()),
        caliber_norm: input.caliber_norm.clone(),
        grain_weight: input.grain_weight,
        round_count: input.round_count,
        upc_norm,
    }
}

fn collect_missing_fields(input: &NormalizedInput) -> Vec<MissingField> {
    let mut missing = Vec::new();
    if input.brand_norm.is_none() {
        missing.push(MissingField::Brand);
    }
    if input.caliber_norm.is_none() {
        missing.push(MissingField::Caliber);
    }
    if input.grain_weight.is_none() {
        missing.push(MissingField::Grain);
    }
    if input.round_count.is_none() {
        missing.push(MissingField::PackCount);
    }
    if input.title.is_empty() {
        missing.push(MissingField::Title);
    }
    if input.upc_norm.is_none() {
        missing.push(MissingField::Upc);
    }
    missing
}

fn empty_evidence(trust_config_version: i64) -> Evidence {
    Evidence {
        resolver_version: RESOLVER_VERSION,
        dictionary_version: crate::normalize::DICTIONARY_VERSION,
        trust_config_version,
        weights_version: WEIGHTS_VERSION,
        input_normalized: NormalizedInput {
            title: String::new(),
            title_signature: String::new(),
            brand_raw: None,
            brand_norm: None,
            alias_applied: false,
            alias_id: None,
            upc_norm: None,
            caliber_norm: None,
            grain_weight: None,
            round_count: None,
            shot_size: None,
            slug_weight: None,
            shell_length: None,
            load_type: None,
            dictionary_version: crate::normalize::DICTIONARY_VERSION,
            normalization_errors: Vec::new(),
        },
        input_hash: String::new(),
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProductLink;
    use crate::resolver::evidence::serialize_capped;
    use crate::store::NewSourceProduct;
    use tempfile::NamedTempFile;

    struct Harness {
        store: Store,
        resolver: Arc<Resolver>,
        _temp: NamedTempFile,
    }

    fn harness() -> Harness {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::open(temp.path().to_str().unwrap()).unwrap();
        let trust = TrustCache::new(store.clone());
        let aliases = BrandAliasCache::new(store.clone());
        let resolver = Resolver::new(store.clone(), trust, aliases);
        Harness {
            store,
            resolver,
            _temp: temp,
        }
    }

    fn insert_source(
        store: &Store,
        source_id: i64,
        key: &str,
        title: &str,
        brand: Option<&str>,
        upc: Option<&str>,
    ) -> i64 {
        let identifiers = match upc {
            Some(u) => vec![(IdentifierKind::Upc, u.to_string())],
            None => Vec::new(),
        };
        store
            .upsert_source_product(&NewSourceProduct {
                source_id,
                stable_key: key.to_string(),
                title: title.to_string(),
                brand: brand.map(str::to_string),
                url: None,
                normalized_url: None,
                attributes: None,
                caliber: None,
                grain_weight: None,
                round_count: None,
                price_cents: None,
                identifiers,
            })
            .unwrap()
            .id
    }

    fn persist_outcome(store: &Store, outcome: &ResolveOutcome) {
        let mut evidence = outcome.evidence.clone();
        let json = serialize_capped(&mut evidence).unwrap();
        store
            .upsert_link(&ProductLink {
                source_product_id: outcome.source_product_id,
                product_id: outcome.product_id,
                match_type: outcome.match_type,
                status: outcome.status,
                reason_code: outcome.reason_code,
                confidence: outcome.confidence,
                resolver_version: outcome.resolver_version,
                evidence_json: json,
                resolved_at: crate::models::now_ts(),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_upc_exact_match() {
        let h = harness();
        h.store.upsert_trust_config(1, true).unwrap();

        h.store
            .insert_product(&ProductFields {
                canonical_key: "UPC:012345678901".to_string(),
                name: "Federal 9mm 124gr JHP".to_string(),
                category: None,
                brand: Some("Federal".to_string()),
                brand_norm: Some("federal".to_string()),
                caliber: Some("9mm".to_string()),
                caliber_norm: Some("9mm".to_string()),
                grain_weight: Some(124),
                round_count: None,
                upc_norm: Some("012345678901".to_string()),
            })
            .unwrap();

        let sp = insert_source(
            &h.store,
            1,
            "SKU-1",
            "Federal 9mm 124gr JHP",
            Some("Federal"),
            Some("012345678901"),
        );

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::Matched);
        assert_eq!(outcome.match_type, MatchType::Upc);
        assert_eq!(outcome.confidence, 0.95);
        assert!(outcome.evidence.fired(rules::UPC_MATCH_ATTEMPTED));
        assert!(outcome.product_id.is_some());
        assert!(!outcome.created_product);
    }

    #[tokio::test]
    async fn test_upc_create_race_reads_winner() {
        let h = harness();

        let fields = ProductFields {
            canonical_key: "UPC:012345678901".to_string(),
            name: "Federal 9mm 124gr JHP".to_string(),
            category: None,
            brand: Some("Federal".to_string()),
            brand_norm: Some("federal".to_string()),
            caliber: Some("9mm".to_string()),
            caliber_norm: Some("9mm".to_string()),
            grain_weight: Some(124),
            round_count: None,
            upc_norm: Some("012345678901".to_string()),
        };

        // The "other writer" wins first.
        let winner = h.store.insert_product(&fields).unwrap().product_id();

        let mut evidence = empty_evidence(1);
        let (id, created) = h.resolver.create_product(&fields, &mut evidence).unwrap();
        assert_eq!(id, winner);
        assert!(!created);
        assert!(evidence.fired(rules::PRODUCT_RACE_RETRY));
    }

    #[tokio::test]
    async fn test_identity_key_shotgun_create() {
        let h = harness();
        let sp = insert_source(
            &h.store,
            2,
            "SKU-SG",
            "Federal Top Gun 12ga 2-3/4in #8 Shot 25 Rounds",
            Some("Federal"),
            None,
        );

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::Created);
        assert_eq!(outcome.match_type, MatchType::Fingerprint);
        assert_eq!(outcome.confidence, 1.0);
        assert!(outcome.evidence.fired(rules::IDENTITY_KEY_CREATED));
        assert!(outcome.created_product);

        let product = h
            .store
            .get_product(outcome.product_id.unwrap())
            .unwrap()
            .unwrap();
        assert!(product.canonical_key.starts_with("FP_SG:v1:"));
    }

    #[tokio::test]
    async fn test_ambiguous_fuzzy_fallback() {
        let h = harness();

        // Two near-identical candidates; no grain on the input so the
        // identity key is unavailable and fuzzy scoring applies.
        for (i, name) in [
            "Winchester 9mm Range Pack JHP Defender",
            "Winchester 9mm Range Pack JHP Defender Pro",
        ]
        .iter()
        .enumerate()
        {
            h.store
                .insert_product(&ProductFields {
                    canonical_key: format!("FP:v1:{}", i),
                    name: name.to_string(),
                    category: None,
                    brand: Some("Winchester".to_string()),
                    brand_norm: Some("winchester".to_string()),
                    caliber: Some("9mm".to_string()),
                    caliber_norm: Some("9mm".to_string()),
                    grain_weight: Some(115),
                    round_count: Some(100),
                    upc_norm: None,
                })
                .unwrap();
        }

        let sp = insert_source(
            &h.store,
            2,
            "SKU-AMB",
            "Winchester 9mm Range Pack JHP Defender",
            Some("Winchester"),
            None,
        );

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::NeedsReview);
        assert_eq!(
            outcome.reason_code,
            Some(ReasonCode::AmbiguousFingerprint)
        );
        assert!(outcome.product_id.is_none());
        assert!(outcome.evidence.candidates.len() <= TOP_K);
        assert_eq!(outcome.evidence.candidates.len(), 2);
    }

    #[tokio::test]
    async fn test_candidate_overflow_needs_review() {
        let h = harness();

        for i in 0..(MAX_CANDIDATES + 1) {
            h.store
                .insert_product(&ProductFields {
                    canonical_key: format!("FP:v1:overflow-{}", i),
                    name: format!("Blazer 9mm Brass Variant {}", i),
                    category: None,
                    brand: Some("Blazer".to_string()),
                    brand_norm: Some("blazer".to_string()),
                    caliber: Some("9mm".to_string()),
                    caliber_norm: Some("9mm".to_string()),
                    grain_weight: None,
                    round_count: None,
                    upc_norm: None,
                })
                .unwrap();
        }

        let sp = insert_source(
            &h.store,
            2,
            "SKU-OVERFLOW",
            "Blazer 9mm Brass",
            Some("Blazer"),
            None,
        );

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::NeedsReview);
        assert_eq!(
            outcome.reason_code,
            Some(ReasonCode::AmbiguousFingerprint)
        );
        assert!(outcome.evidence.fired(rules::CANDIDATE_OVERFLOW));
        assert!(outcome.product_id.is_none());
        assert!(outcome.evidence.candidates.is_empty());
    }

    #[tokio::test]
    async fn test_alias_chain_beyond_depth_cap_is_error() {
        let h = harness();
        h.store.upsert_trust_config(1, true).unwrap();

        // A straight chain of 12 products: the walk gives up past depth 10.
        let mut ids = Vec::new();
        for i in 0..12 {
            let id = h
                .store
                .insert_product(&ProductFields {
                    canonical_key: format!("UPC:0000000001{:02}", i),
                    name: format!("Chain {}", i),
                    category: None,
                    brand: None,
                    brand_norm: None,
                    caliber: None,
                    caliber_norm: None,
                    grain_weight: None,
                    round_count: None,
                    upc_norm: None,
                })
                .unwrap()
                .product_id();
            ids.push(id);
        }
        for pair in ids.windows(2) {
            h.store
                .insert_product_alias(pair[0], pair[1], Some("merged"))
                .unwrap();
        }

        // Point the trusted UPC at the head of the chain.
        let head = h
            .store
            .insert_product(&ProductFields {
                canonical_key: "UPC:012345678901".to_string(),
                name: "Chain Head".to_string(),
                category: None,
                brand: None,
                brand_norm: None,
                caliber: None,
                caliber_norm: None,
                grain_weight: None,
                round_count: None,
                upc_norm: Some("012345678901".to_string()),
            })
            .unwrap()
            .product_id();
        h.store
            .insert_product_alias(head, ids[0], Some("merged"))
            .unwrap();

        let sp = insert_source(
            &h.store,
            1,
            "SKU-DEEP",
            "Federal 9mm 124gr JHP",
            Some("Federal"),
            Some("012345678901"),
        );

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::Error);
        assert!(outcome.evidence.fired(rules::ALIAS_CHAIN_TOO_DEEP));
    }

    #[tokio::test]
    async fn test_insufficient_data() {
        let h = harness();
        let sp = insert_source(
            &h.store,
            2,
            "SKU-NODATA",
            "Mystery Widget Deluxe",
            None,
            None,
        );

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::NeedsReview);
        assert_eq!(outcome.reason_code, Some(ReasonCode::InsufficientData));
        assert!(outcome.evidence.fired(rules::INSUFFICIENT_DATA));
        assert!(outcome.product_id.is_none());
        assert!(outcome
            .missing_fields
            .contains(&MissingField::Brand));
    }

    #[tokio::test]
    async fn test_hysteresis_blocks_equal_strength_relink() {
        let h = harness();
        h.store.upsert_trust_config(1, true).unwrap();

        // Prior link points at product A with UPC confidence 0.95.
        let product_a = h
            .store
            .insert_product(&ProductFields {
                canonical_key: "UPC:000000000001".to_string(),
                name: "Old Product".to_string(),
                category: None,
                brand: None,
                brand_norm: None,
                caliber: None,
                caliber_norm: None,
                grain_weight: None,
                round_count: None,
                upc_norm: Some("000000000001".to_string()),
            })
            .unwrap()
            .product_id();

        // Product B owns the UPC the feed row now carries.
        h.store
            .insert_product(&ProductFields {
                canonical_key: "UPC:012345678901".to_string(),
                name: "New Product".to_string(),
                category: None,
                brand: None,
                brand_norm: None,
                caliber: None,
                caliber_norm: None,
                grain_weight: None,
                round_count: None,
                upc_norm: Some("012345678901".to_string()),
            })
            .unwrap();

        let sp = insert_source(
            &h.store,
            1,
            "SKU-HYST",
            "Federal 9mm 124gr JHP",
            Some("Federal"),
            Some("012345678901"),
        );

        h.store
            .upsert_link(&ProductLink {
                source_product_id: sp,
                product_id: Some(product_a),
                match_type: MatchType::Upc,
                status: LinkStatus::Matched,
                reason_code: Some(ReasonCode::UpcMatch),
                confidence: 0.95,
                resolver_version: RESOLVER_VERSION,
                evidence_json: "{}".to_string(),
                resolved_at: crate::models::now_ts(),
            })
            .unwrap();

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Reconcile).unwrap();
        assert_eq!(outcome.product_id, Some(product_a));
        assert!(outcome.relink_blocked);
        assert_eq!(
            outcome.reason_code,
            Some(ReasonCode::RelinkBlockedHysteresis)
        );
        assert!(outcome.evidence.fired(rules::RELINK_BLOCKED_HYSTERESIS));
    }

    #[tokio::test]
    async fn test_manual_link_is_never_overwritten() {
        let h = harness();
        let sp = insert_source(
            &h.store,
            1,
            "SKU-MANUAL",
            "Federal 9mm 124gr JHP",
            Some("Federal"),
            None,
        );

        h.store
            .upsert_link(&ProductLink {
                source_product_id: sp,
                product_id: Some(99),
                match_type: MatchType::Manual,
                status: LinkStatus::Matched,
                reason_code: None,
                confidence: 1.0,
                resolver_version: RESOLVER_VERSION,
                evidence_json: "{}".to_string(),
                resolved_at: crate::models::now_ts(),
            })
            .unwrap();

        let outcome = h.resolver.resolve(sp, ResolveTrigger::Manual).unwrap();
        assert!(outcome.skipped);
        assert!(outcome.relink_blocked);
        assert_eq!(outcome.product_id, Some(99));
        assert_eq!(outcome.reason_code, Some(ReasonCode::ManualLocked));
    }

    #[tokio::test]
    async fn test_unchanged_input_skips_second_resolve() {
        let h = harness();
        let sp = insert_source(
            &h.store,
            2,
            "SKU-IDEM",
            "Federal 9mm Luger 124gr JHP 50 Rounds",
            Some("Federal"),
            None,
        );

        let first = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert!(!first.skipped);
        persist_outcome(&h.store, &first);

        let second = h.resolver.resolve(sp, ResolveTrigger::Reconcile).unwrap();
        assert!(second.skipped);
        assert!(second.evidence.fired(rules::INPUT_HASH_UNCHANGED));
        assert_eq!(second.product_id, first.product_id);
        assert_eq!(second.evidence.input_hash, first.evidence.input_hash);
    }

    #[tokio::test]
    async fn test_source_not_found() {
        let h = harness();
        let outcome = h.resolver.resolve(123456, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::Error);
        assert_eq!(outcome.reason_code, Some(ReasonCode::SourceNotFound));
        assert!(outcome.evidence.system_error.is_some());
    }

    #[tokio::test]
    async fn test_alias_chain_walk_and_depth_cap() {
        let h = harness();
        h.store.upsert_trust_config(1, true).unwrap();

        // Chain A -> B: the UPC match on A must land on B.
        let product_a = h
            .store
            .insert_product(&ProductFields {
                canonical_key: "UPC:012345678901".to_string(),
                name: "Deprecated".to_string(),
                category: None,
                brand: None,
                brand_norm: None,
                caliber: None,
                caliber_norm: None,
                grain_weight: None,
                round_count: None,
                upc_norm: Some("012345678901".to_string()),
            })
            .unwrap()
            .product_id();
        let product_b = h
            .store
            .insert_product(&ProductFields {
                canonical_key: "UPC:012345678902".to_string(),
                name: "Replacement".to_string(),
                category: None,
                brand: None,
                brand_norm: None,
                caliber: None,
                caliber_norm: None,
                grain_weight: None,
                round_count: None,
                upc_norm: Some("012345678902".to_string()),
            })
            .unwrap()
            .product_id();
        h.store
            .insert_product_alias(product_a, product_b, Some("merged"))
            .unwrap();

        let sp = insert_source(
            &h.store,
            1,
            "SKU-ALIAS",
            "Federal 9mm 124gr JHP",
            Some("Federal"),
            Some("012345678901"),
        );
        let outcome = h.resolver.resolve(sp, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.product_id, Some(product_b));
        assert!(outcome.evidence.fired(rules::ALIAS_CHAIN_RESOLVED));
        assert_eq!(outcome.evidence.alias_hops.len(), 1);

        // A cycle yields an ERROR outcome.
        h.store
            .insert_product_alias(product_b, product_a, Some("oops"))
            .unwrap();
        let sp2 = insert_source(
            &h.store,
            1,
            "SKU-ALIAS-2",
            "Federal 9mm 147gr JHP",
            Some("Federal"),
            Some("012345678901"),
        );
        let outcome = h.resolver.resolve(sp2, ResolveTrigger::Ingest).unwrap();
        assert_eq!(outcome.status, LinkStatus::Error);
        assert_eq!(outcome.reason_code, Some(ReasonCode::SystemError));
        assert!(outcome.evidence.fired(rules::ALIAS_CHAIN_TOO_DEEP));
    }
}
