//! Deterministic bucketing — maps an identity string to a stable point in
//! `[0, 1)`. Per spec §4.2: SHA-256 of the identity, first 8 bytes read as a
//! big-endian integer, reduced modulo 2^53 and normalized. Stable across
//! processes and languages.

use sha2::{Digest, Sha256};

/// 2^53 — the modulus (and normalization divisor) from spec §4.2.
const MODULUS: u64 = 1 << 53;

/// Map `identity` to a deterministic value in `[0, 1)`.
pub fn bucket(identity: &str) -> f64 {
    let digest = Sha256::digest(identity.as_bytes());
    let mut first8 = [0u8; 8];
    first8.copy_from_slice(&digest[..8]);
    let value = u64::from_be_bytes(first8) % MODULUS;
    value as f64 / MODULUS as f64
}

/// Bucket the `user_id` within a `scope`, joining the parts with `:`.
pub fn bucket_scoped(user_id: &str, scope: &str) -> f64 {
    bucket(&format!("{}:{}", user_id, scope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range() {
        for id in ["user-1", "user-2", "abc", ""] {
            let b = bucket(id);
            assert!((0.0..1.0).contains(&b), "bucket out of range: {b}");
        }
    }

    #[test]
    fn test_deterministic() {
        assert_eq!(bucket("user-1"), bucket("user-1"));
        assert_eq!(bucket_scoped("u", "s"), bucket_scoped("u", "s"));
    }

    #[test]
    fn test_scope_joins_with_colon() {
        assert_eq!(bucket_scoped("u", "s"), bucket("u:s"));
    }
}
