//! 32-bit byte-string hash used for bucket selection.
//!
//! Every process attached to the same region must compute the same bucket
//! index for a key, so the hasher is seeded with fixed keys instead of the
//! usual per-process random state.

use std::hash::{BuildHasher, Hasher};

use ahash::RandomState;

const SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

pub fn hash(key: &[u8]) -> u32 {
    let state = RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]);
    let mut h = state.build_hasher();
    h.write(key);
    h.finish() as u32
}

#[cfg(test)]
mod tests {
    use super::hash;

    #[test]
    fn stable_across_calls() {
        assert_eq!(hash(b"netshell"), hash(b"netshell"));
        assert_eq!(hash(b""), hash(b""));
    }

    #[test]
    fn distinct_keys_differ() {
        // Not a guarantee in general, but these must not all collide.
        let hs: Vec<u32> = (0..64u32)
            .map(|i| hash(format!("key-{i}").as_bytes()))
            .collect();
        let mut uniq = hs.clone();
        uniq.sort_unstable();
        uniq.dedup();
        assert!(uniq.len() > 32);
    }
}
