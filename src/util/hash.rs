//! # Hash Utilities
//!
//! Content fingerprints for shader modules and pipeline identities.

/// FNV-1a hash (fast, non-cryptographic)
pub fn fnv1a(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// 32-bit content fingerprint
///
/// Folds the 64-bit FNV-1a state and runs a final avalanche so that short
/// inputs (entry point names) still spread over all 32 bits.
pub fn fingerprint32(data: &[u8]) -> u32 {
    let h = fnv1a(data);
    let mut x = (h ^ (h >> 32)) as u32;
    x ^= x >> 16;
    x = x.wrapping_mul(0x85eb_ca6b);
    x ^= x >> 13;
    x = x.wrapping_mul(0xc2b2_ae35);
    x ^= x >> 16;
    x
}

/// Fingerprint of SPIR-V words, hashed as little-endian bytes
pub fn fingerprint32_words(words: &[u32]) -> u32 {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    fingerprint32(&bytes)
}
