//! Canonical key construction.
//!
//! A canonical key is exactly one of:
//! - `UPC:<12 digits>`
//! - `FP:v1:<64-hex sha256>` for rifle/handgun identities
//! - `FP_SG:v1:<64-hex sha256>` for shotgun identities

use super::{extract, sha256_hex, NormalizedInput};

pub const UPC_PREFIX: &str = "UPC:";
pub const FP_PREFIX: &str = "FP:v1:";
pub const FP_SG_PREFIX: &str = "FP_SG:v1:";

/// A deterministically computed identity key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityKey {
    pub key: String,
    pub shotgun: bool,
}

/// Canonical key for a trusted, normalized UPC.
pub fn upc_canonical_key(upc_norm: &str) -> String {
    format!("{}{}", UPC_PREFIX, upc_norm)
}

/// Compose the identity key from normalized fields, when they suffice.
///
/// Shotgun gauges require brand, gauge, pack count, load type and either a
/// shell length or the title signature. Everything else requires brand,
/// caliber, title signature, grain and pack count. Anything less means the
/// identity key is unavailable and fuzzy fallback applies.
pub fn identity_key(input: &NormalizedInput) -> Option<IdentityKey> {
    let brand = input.brand_norm.as_deref()?;
    let caliber = input.caliber_norm.as_deref()?;

    if extract::is_shotgun_gauge(caliber) {
        let pack = input.round_count?;
        let load_type = input.load_type.as_deref()?;
        let shell_or_sig = input
            .shell_length
            .as_deref()
            .unwrap_or(&input.title_signature);

        let material = format!("{}|{}|{}|{}|{}", brand, caliber, pack, load_type, shell_or_sig);
        return Some(IdentityKey {
            key: format!("{}{}", FP_SG_PREFIX, sha256_hex(material.as_bytes())),
            shotgun: true,
        });
    }

    let grain = input.grain_weight?;
    let pack = input.round_count?;
    if input.title_signature.is_empty() {
        return None;
    }

    let material = format!(
        "{}|{}|{}|{}|{}",
        brand, caliber, grain, pack, input.title_signature
    );
    Some(IdentityKey {
        key: format!("{}{}", FP_PREFIX, sha256_hex(material.as_bytes())),
        shotgun: false,
    })
}
