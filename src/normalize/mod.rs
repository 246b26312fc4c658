//! Pure normalization of raw feed rows.
//!
//! Everything in this module is deterministic and non-throwing: bad input
//! degrades to `None` plus a note in `normalization_errors`, never an error.

pub mod extract;
pub mod identity;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use extract::DICTIONARY_VERSION;

/// Lowercase, map non-alphanumeric/underscore to space, collapse whitespace,
/// trim. Idempotent.
pub fn normalize_title(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_was_space = true;
    for c in s.chars() {
        let c = if c.is_alphanumeric() || c == '_' {
            c.to_ascii_lowercase()
        } else {
            ' '
        };
        if c == ' ' {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    while out.ends_with(' ') {
        out.pop();
    }
    out
}

/// Brand text uses the same character rules as titles.
pub fn normalize_brand_chars(s: &str) -> String {
    normalize_title(s)
}

/// sha256 over the sorted distinct lowercase tokens longer than 2 chars,
/// truncated to 16 hex characters.
pub fn title_signature(title: &str) -> String {
    let normalized = normalize_title(title);
    let mut tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|t| t.len() > 2)
        .collect();
    tokens.sort_unstable();
    tokens.dedup();

    let joined = tokens.join(" ");
    let digest = sha256_hex(joined.as_bytes());
    digest[..16].to_string()
}

/// Keep digits; reject when fewer than 10 or more than 14 remain; left-pad
/// to 12. A 12-digit UPC-A maps to itself.
pub fn normalize_upc(s: &str) -> Option<String> {
    let digits: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 10 || digits.len() > 14 {
        return None;
    }
    if digits.len() >= 12 {
        // Strip EAN-13/GTIN-14 leading zeros down to 12 where possible.
        let trimmed = digits.trim_start_matches('0');
        if trimmed.len() > 12 {
            return None;
        }
        return Some(format!("{:0>12}", trimmed));
    }
    Some(format!("{:0>12}", digits))
}

#[inline]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Result of a brand-alias lookup.
#[derive(Debug, Clone, Default)]
pub struct AliasLookup {
    pub resolved: String,
    pub alias_applied: bool,
    pub alias_id: Option<i64>,
}

/// The normalized view of one source product, the resolver's working input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedInput {
    pub title: String,
    pub title_signature: String,
    pub brand_raw: Option<String>,
    pub brand_norm: Option<String>,
    pub alias_applied: bool,
    pub alias_id: Option<i64>,
    pub upc_norm: Option<String>,
    pub caliber_norm: Option<String>,
    pub grain_weight: Option<u32>,
    pub round_count: Option<u32>,
    pub shot_size: Option<String>,
    pub slug_weight: Option<String>,
    pub shell_length: Option<String>,
    pub load_type: Option<String>,
    pub dictionary_version: u32,
    pub normalization_errors: Vec<String>,
}

/// Raw fields feeding normalization.
#[derive(Debug, Clone, Default)]
pub struct RawInput<'a> {
    pub title: &'a str,
    pub brand: Option<&'a str>,
    pub url: Option<&'a str>,
    pub attributes: Option<&'a str>,
    pub upc: Option<&'a str>,
}

/// Build the full normalized input. Caliber, grain and round count fall back
/// to the attributes blob and the URL when the title yields nothing.
pub fn normalize_input(raw: &RawInput, alias: impl Fn(&str) -> AliasLookup) -> NormalizedInput {
    let mut errors: Vec<String> = Vec::new();

    let title = normalize_title(raw.title);
    let signature = title_signature(raw.title);

    let (brand_norm, alias_applied, alias_id) = match raw.brand {
        Some(b) if !b.trim().is_empty() => {
            let chars = normalize_brand_chars(b);
            let looked = alias(&chars);
            (Some(looked.resolved), looked.alias_applied, looked.alias_id)
        }
        _ => (None, false, None),
    };

    let upc_norm = match raw.upc {
        Some(u) if !u.trim().is_empty() => {
            let norm = normalize_upc(u);
            if norm.is_none() {
                errors.push(format!("UPC_INVALID: {}", u.trim()));
            }
            norm
        }
        _ => None,
    };

    // Title first, then the attributes blob, then the URL.
    let fallbacks: [Option<&str>; 2] = [raw.attributes, raw.url];

    let caliber_norm = extract::extract_caliber(raw.title)
        .or_else(|| {
            fallbacks
                .iter()
                .flatten()
                .find_map(|alt| extract::extract_caliber(alt))
        })
        .map(str::to_string);

    let grain_weight = extract::extract_grain_weight(raw.title).or_else(|| {
        fallbacks
            .iter()
            .flatten()
            .find_map(|alt| extract::extract_grain_weight(alt))
    });

    let round_count = extract::extract_round_count(raw.title).or_else(|| {
        fallbacks
            .iter()
            .flatten()
            .find_map(|alt| extract::extract_round_count(alt))
    });

    let shot_size = extract::extract_shot_size(raw.title);
    let slug_weight = extract::extract_slug_weight(raw.title);
    let shell_length = extract::extract_shell_length(raw.title);

    let load_type = match caliber_norm.as_deref() {
        Some(c) if extract::is_shotgun_gauge(c) => extract::derive_shotgun_load_type(
            raw.title,
            shot_size.as_deref(),
            slug_weight.as_deref(),
        ),
        _ => None,
    };

    NormalizedInput {
        title,
        title_signature: signature,
        brand_raw: raw.brand.map(str::to_string),
        brand_norm,
        alias_applied,
        alias_id,
        upc_norm,
        caliber_norm,
        grain_weight,
        round_count,
        shot_size,
        slug_weight,
        shell_length,
        load_type,
        dictionary_version: DICTIONARY_VERSION,
        normalization_errors: errors,
    }
}
