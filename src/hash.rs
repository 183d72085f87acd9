//! Content hashing helpers.
//!
//! Two distinct hashes are used, grounded in `src/util.cc`'s `hashString`
//! and the teacher's `hash.rs`:
//!
//! - [`tarpath_hash`]: a DJB2 variant (seed 0, not the classic 5381) used
//!   to deterministically place a path into one of N buckets without an
//!   avalanche effect on single-byte path changes (spec §4.7).
//! - [`sha256_hex`] / [`Sha256Writer`]: ordinary SHA-256 content hashing
//!   used to name synthesized tar files (spec §6), built on `sha2`'s
//!   standard `Digest` trait (this crate has no need for the teacher's
//!   incremental `compress256` state-save/verify machinery, since page-level
//!   integrity checking of real file content is not part of this spec).
use sha2::{Digest, Sha256};

/// `h = 33*h + byte`, seed 0. Deliberately not classic DJB2 (seed 5381):
/// ported byte-for-byte from `util.cc::hashString`.
pub fn tarpath_hash(s: &str) -> u64 {
    let mut h: u64 = 0;
    for b in s.as_bytes() {
        h = h.wrapping_mul(33).wrapping_add(*b as u64);
    }
    h
}

/// Hex-encoded SHA-256 digest of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

/// Incrementally accumulates a SHA-256 digest across several `update`
/// calls, e.g. over the entries a `TarFile` is assembled from, without
/// holding the whole tar body in memory at once.
#[derive(Default)]
pub struct RollingHasher {
    hasher: Sha256,
}

impl RollingHasher {
    pub fn new() -> RollingHasher {
        RollingHasher { hasher: Sha256::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish_hex(self) -> String {
        hex_encode(&self.hasher.finalize())
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// The 32-hex-char truncation used in tar file names (spec §6): the first
/// 16 bytes of the digest.
pub fn short_hex(full_hex: &str) -> &str {
    &full_hex[..32.min(full_hex.len())]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tarpath_hash_is_djb2_variant_seed_zero() {
        // h = 33*0 + b'a' = 97; h = 33*97 + b'b' = 3199
        assert_eq!(tarpath_hash("a"), 97);
        assert_eq!(tarpath_hash("ab"), 33 * 97 + 'b' as u64);
    }

    #[test]
    fn tarpath_hash_changes_completely_on_one_byte_difference() {
        // Not a strict property test, just a sanity check that different
        // inputs land on different values (no trivial collision).
        assert_ne!(tarpath_hash("/a/b/c"), tarpath_hash("/a/b/d"));
    }

    #[test]
    fn sha256_hex_is_64_hex_chars() {
        let h = sha256_hex(b"hello world");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn rolling_hasher_matches_one_shot() {
        let mut r = RollingHasher::new();
        r.update(b"hello ");
        r.update(b"world");
        assert_eq!(r.finish_hex(), sha256_hex(b"hello world"));
    }
}
