//! WebSocket frame masking
//!
//! The mask is a 4-byte XOR key. Payload may arrive in arbitrary chunks, so
//! every function takes the key position the chunk starts at and returns the
//! position the next chunk continues from.
//!
//! Random keys come from one of two backends selected via feature flags:
//! - `fastrand`: fast PRNG (default)
//! - `getrandom`: OS entropy
//!
//! If both are enabled `getrandom` wins.

/// XOR `data` with `key`, starting at key position `offset`. Returns the key
/// position following the last byte.
#[inline]
pub fn mask_inplace(data: &mut [u8], key: [u8; 4], offset: usize) -> usize {
    let start = offset & 3;
    let key = [
        key[start],
        key[(start + 1) & 3],
        key[(start + 2) & 3],
        key[(start + 3) & 3],
    ];

    let wide = u64::from_ne_bytes([
        key[0], key[1], key[2], key[3], key[0], key[1], key[2], key[3],
    ]);

    let mut chunks = data.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ wide;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }

    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }

    (start + data.len()) & 3
}

/// Mask a whole payload starting at key position 0
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    mask_inplace(data, key, 0);
}

/// Generate a random mask for client frames.
#[inline]
pub fn generate_mask() -> [u8; 4] {
    let mut key = [0u8; 4];
    fill_random(&mut key);
    key
}

#[cfg(feature = "getrandom")]
pub(crate) fn fill_random(buf: &mut [u8]) {
    if getrandom::getrandom(buf).is_err() {
        // Entropy source unavailable; fall back to a time-seeded generator.
        let mut rng = fallback_seed();
        for byte in buf.iter_mut() {
            rng ^= rng << 13;
            rng ^= rng >> 7;
            rng ^= rng << 17;
            *byte = rng as u8;
        }
    }
}

#[cfg(feature = "getrandom")]
fn fallback_seed() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x9E37_79B9_7F4A_7C15)
        | 1
}

#[cfg(all(feature = "fastrand", not(feature = "getrandom")))]
pub(crate) fn fill_random(buf: &mut [u8]) {
    fastrand::fill(buf);
}

#[cfg(not(any(feature = "fastrand", feature = "getrandom")))]
pub(crate) fn fill_random(_buf: &mut [u8]) {
    compile_error!("At least one RNG feature must be enabled: fastrand or getrandom");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_is_involution() {
        let original: Vec<u8> = (0..=255u8).cycle().take(1031).collect();
        let key = [0x37, 0xfa, 0x21, 0x3d];

        let mut data = original.clone();
        mask_inplace(&mut data, key, 0);
        assert_ne!(data, original);
        mask_inplace(&mut data, key, 0);
        assert_eq!(data, original);
    }

    #[test]
    fn test_rfc_example() {
        // RFC 6455 section 5.7, masked "Hello"
        let mut data = *b"Hello";
        apply_mask(&mut data, [0x37, 0xfa, 0x21, 0x3d]);
        assert_eq!(data, [0x7f, 0x9f, 0x4d, 0x51, 0x58]);
    }

    #[test]
    fn test_chunked_matches_whole() {
        let key = [1, 2, 3, 4];
        let original: Vec<u8> = (0..100u8).collect();

        let mut whole = original.clone();
        mask_inplace(&mut whole, key, 0);

        for split in [1, 3, 7, 8, 9, 50, 99] {
            let mut chunked = original.clone();
            let (a, b) = chunked.split_at_mut(split);
            let offset = mask_inplace(a, key, 0);
            assert_eq!(offset, split % 4);
            mask_inplace(b, key, offset);
            assert_eq!(chunked, whole, "split at {}", split);
        }
    }

    #[test]
    fn test_empty() {
        let mut data: [u8; 0] = [];
        assert_eq!(mask_inplace(&mut data, [1, 2, 3, 4], 3), 3);
    }

    #[test]
    fn test_generate_mask_varies() {
        let masks: Vec<[u8; 4]> = (0..8).map(|_| generate_mask()).collect();
        assert!(masks.iter().any(|m| *m != masks[0]));
    }
}
