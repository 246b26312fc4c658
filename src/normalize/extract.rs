//! Regex-table extraction over a frozen dictionary.
//!
//! The dictionary version is recorded in resolver evidence; bump it whenever
//! a pattern or canonical value changes.

use lazy_static::lazy_static;
use regex::Regex;

/// Version of the extraction dictionary below.
pub const DICTIONARY_VERSION: u32 = 3;

lazy_static! {
    /// Ordered caliber patterns; first hit wins, so more specific entries
    /// come first.
    static ref CALIBER_TABLE: Vec<(Regex, &'static str)> = vec![
        (re(r"6\.5\s*creedmoor"), "6.5 Creedmoor"),
        (re(r"7\.62\s*x\s*39"), "7.62x39"),
        (re(r"5\.56(\s*x\s*45)?(\s*nato)?"), "5.56 NATO"),
        (re(r"(\.300|\b300)\s*(blk|blackout)"), ".300 Blackout"),
        (re(r"(\.30-06|\b30-06)"), ".30-06 Springfield"),
        (re(r"(\.308|\b308\s*win(chester)?)"), ".308 Winchester"),
        (re(r"(\.223|\b223\s*rem(ington)?)"), ".223 Remington"),
        (re(r"(\.22\s*lr|\b22\s*(lr|long\s*rifle))"), ".22 LR"),
        (re(r"(\.357|\b357)\s*(mag(num)?)?"), ".357 Magnum"),
        (re(r"(\.38|\b38)\s*(spl|special)"), ".38 Special"),
        (re(r"(\.380|\b380\s*(acp|auto))"), ".380 ACP"),
        (re(r"(\.45|\b45)\s*(acp|auto)"), ".45 ACP"),
        (re(r"(\.44|\b44)\s*mag(num)?"), ".44 Magnum"),
        (re(r"(\.40|\b40)\s*s\s*&\s*w"), ".40 S&W"),
        (re(r"\b10\s*mm"), "10mm"),
        (re(r"\b9\s*mm"), "9mm"),
        (re(r"\b10\s*(ga\b|gauge)"), "10 Gauge"),
        (re(r"\b12\s*(ga\b|gauge)"), "12 Gauge"),
        (re(r"\b16\s*(ga\b|gauge)"), "16 Gauge"),
        (re(r"\b20\s*(ga\b|gauge)"), "20 Gauge"),
        (re(r"\b28\s*(ga\b|gauge)"), "28 Gauge"),
        (re(r"(\.410\b|\b410\s*(bore|ga\b|gauge))"), ".410 Bore"),
    ];

    static ref GRAIN_RE: Regex = re(r"\b(\d{1,3})\s*(?:gr\b|grains?\b)");

    static ref ROUND_COUNT_RES: Vec<Regex> = vec![
        re(r"\b(\d{1,4})\s*(?:rounds?\b|rnds?\b|rds?\b|count\b|ct\b)"),
        re(r"\b(?:box|pack|case)\s*of\s*(\d{1,4})\b"),
        re(r"\b(\d{1,4})\s*(?:/|per\s*)(?:box|case|pack)\b"),
    ];

    static ref SHOT_SIZE_RES: Vec<(Regex, ShotKind)> = vec![
        (re(r"(?:#|no\.?\s*)([1-9])\s*shot"), ShotKind::Shot),
        (re(r"\b(bbb|bb)\s*shot"), ShotKind::Shot),
        (re(r"\b(000|00)\s*buck"), ShotKind::Buck),
        (re(r"\b([0-4])\s*buck"), ShotKind::Buck),
    ];

    static ref SLUG_WEIGHT_RE: Regex =
        re(r"\b(\d(?:\s*-\s*\d/\d|\s+\d/\d)?|\d/\d)\s*oz\b");

    static ref SHELL_LENGTH_TABLE: Vec<(Regex, &'static str)> = vec![
        (re(r#"\b(?:2-3/4|2\s+3/4|2\.75)\s*(?:in\b|inch(?:es)?\b|")"#), "2.75in"),
        (re(r#"\b(?:3-1/2|3\s+1/2|3\.5)\s*(?:in\b|inch(?:es)?\b|")"#), "3.5in"),
        (re(r#"\b(?:2-1/2|2\s+1/2|2\.5)\s*(?:in\b|inch(?:es)?\b|")"#), "2.5in"),
        (re(r#"\b3\s*(?:in\b|inch(?:es)?\b|")"#), "3in"),
    ];
}

#[derive(Debug, Clone, Copy)]
enum ShotKind {
    Shot,
    Buck,
}

fn re(pattern: &str) -> Regex {
    Regex::new(&format!("(?i){}", pattern)).expect("invalid dictionary regex")
}

/// Canonical caliber for a text fragment, if any pattern matches.
pub fn extract_caliber(text: &str) -> Option<&'static str> {
    CALIBER_TABLE
        .iter()
        .find(|(regex, _)| regex.is_match(text))
        .map(|(_, canonical)| *canonical)
}

pub fn extract_grain_weight(text: &str) -> Option<u32> {
    GRAIN_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

pub fn extract_round_count(text: &str) -> Option<u32> {
    for regex in ROUND_COUNT_RES.iter() {
        if let Some(v) = regex
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
        {
            return Some(v);
        }
    }
    None
}

/// Shot size like "8 Shot", "BB Shot" or "00 Buck".
pub fn extract_shot_size(text: &str) -> Option<String> {
    for (regex, kind) in SHOT_SIZE_RES.iter() {
        if let Some(c) = regex.captures(text) {
            let size = c.get(1)?.as_str().to_uppercase();
            return Some(match kind {
                ShotKind::Shot => format!("{} Shot", size),
                ShotKind::Buck => format!("{} Buck", size),
            });
        }
    }
    None
}

/// Slug weight like "1oz", "1-1/8oz" or "7/8oz".
pub fn extract_slug_weight(text: &str) -> Option<String> {
    SLUG_WEIGHT_RE.captures(text).and_then(|c| c.get(1)).map(|m| {
        let compact: String = m.as_str().chars().filter(|c| !c.is_whitespace()).collect();
        format!("{}oz", compact)
    })
}

/// Shell length canonicalized to "2.5in" / "2.75in" / "3in" / "3.5in".
pub fn extract_shell_length(text: &str) -> Option<String> {
    SHELL_LENGTH_TABLE
        .iter()
        .find(|(regex, _)| regex.is_match(text))
        .map(|(_, canonical)| canonical.to_string())
}

/// Shotgun identities use the gauge-specific fingerprint.
pub fn is_shotgun_gauge(caliber_norm: &str) -> bool {
    caliber_norm.ends_with("Gauge") || caliber_norm == ".410 Bore"
}

/// Load type precedence: explicit shot size, slug weight with "slug" in the
/// title, a bare "slug" mention, then weight plus buck/shot wording.
pub fn derive_shotgun_load_type(
    title: &str,
    shot_size: Option<&str>,
    slug_weight: Option<&str>,
) -> Option<String> {
    if let Some(size) = shot_size {
        return Some(size.to_string());
    }

    let lower = title.to_lowercase();
    if lower.contains("slug") {
        if let Some(weight) = slug_weight {
            return Some(format!("{} Slug", weight));
        }
        return Some("Slug".to_string());
    }

    if let Some(weight) = slug_weight {
        if lower.contains("buck") {
            return Some(format!("{} Buck", weight));
        }
        if lower.contains("shot") {
            return Some(format!("{} Shot", weight));
        }
    }

    None
}
