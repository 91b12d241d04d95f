//! Caller identity normalization
//!
//! Maps any caller-supplied identifier (wallet address, email, user handle, ...)
//! to a canonical UUID-shaped key so ledger entries are keyed consistently.
//!
//! The mapping is pure: no salt, no lookup table. Identical input always
//! yields the identical key.

use serde::Serialize;
use sha2::{Digest, Sha256};
use utoipa::ToSchema;

/// Key used for empty or blank identifiers
pub const EMPTY_CALLER_KEY: &str = "00000000-0000-0000-0000-000000000000";

/// Key used for the literal `anonymous` caller (any case)
pub const ANONYMOUS_CALLER_KEY: &str = "ffffffff-ffff-ffff-ffff-ffffffffffff";

/// A caller identifier together with its canonical key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CallerIdentity {
    pub raw_id: String,
    #[serde(rename = "canonicalUUID")]
    pub canonical_uuid: String,
}

impl CallerIdentity {
    pub fn new(raw_id: impl Into<String>) -> Self {
        let raw_id = raw_id.into();
        let canonical_uuid = normalize(&raw_id);
        Self { raw_id, canonical_uuid }
    }

    /// Identity used when a request carries no caller id at all
    pub fn anonymous() -> Self {
        Self::new("anonymous")
    }
}

/// Check whether `s` already has the canonical 8-4-4-4-12 hex shape
pub fn is_canonical(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => *b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}

/// Normalize a raw caller id into its canonical key
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();

    if trimmed.is_empty() {
        return EMPTY_CALLER_KEY.to_string();
    }

    if trimmed.eq_ignore_ascii_case("anonymous") {
        return ANONYMOUS_CALLER_KEY.to_string();
    }

    if is_canonical(raw) {
        return raw.to_string();
    }

    let digest = Sha256::digest(trimmed.to_lowercase().as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);

    // Version nibble forced to 4, variant bits forced to 10xx; the rest is hash material
    uuid::Builder::from_random_bytes(bytes)
        .into_uuid()
        .hyphenated()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_maps_to_zero_sentinel() {
        assert_eq!(normalize(""), EMPTY_CALLER_KEY);
        assert_eq!(normalize("   \t"), EMPTY_CALLER_KEY);
    }

    #[test]
    fn test_anonymous_any_case() {
        assert_eq!(normalize("anonymous"), ANONYMOUS_CALLER_KEY);
        assert_eq!(normalize("ANONYMOUS"), ANONYMOUS_CALLER_KEY);
        assert_eq!(normalize("AnonyMous"), ANONYMOUS_CALLER_KEY);
        assert_ne!(ANONYMOUS_CALLER_KEY, EMPTY_CALLER_KEY);
    }

    #[test]
    fn test_canonical_passes_through_unchanged() {
        let key = "123e4567-E89B-12d3-a456-426614174000";
        assert_eq!(normalize(key), key);
    }

    #[test]
    fn test_deterministic() {
        let a = normalize("0xAbC0000000000000000000000000000000000001");
        let b = normalize("0xAbC0000000000000000000000000000000000001");
        assert_eq!(a, b);
    }

    #[test]
    fn test_case_and_whitespace_insensitive() {
        assert_eq!(normalize("  Alice@Example.com "), normalize("alice@example.com"));
    }

    #[test]
    fn test_shape_version_and_variant() {
        let key = normalize("some-user-handle");
        assert!(is_canonical(&key));
        let chars: Vec<char> = key.chars().collect();
        assert_eq!(chars[14], '4');
        assert!(matches!(chars[19], '8' | '9' | 'a' | 'b'));
    }

    #[test]
    fn test_distinct_inputs_distinct_keys() {
        assert_ne!(normalize("alice"), normalize("bob"));
        assert_ne!(normalize("user-1"), normalize("user-2"));
    }

    #[test]
    fn test_is_canonical_rejects_near_misses() {
        assert!(!is_canonical("123e4567e89b12d3a456426614174000"));
        assert!(!is_canonical("123e4567-e89b-12d3-a456-42661417400g"));
        assert!(!is_canonical("{123e4567-e89b-12d3-a456-426614174000}"));
    }

    #[test]
    fn test_caller_identity_carries_both_forms() {
        let id = CallerIdentity::new("Bob");
        assert_eq!(id.raw_id, "Bob");
        assert_eq!(id.canonical_uuid, normalize("bob"));
    }
}
