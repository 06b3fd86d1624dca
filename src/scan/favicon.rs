//! Favicon hashing for icon-based fingerprint matchers.
//!
//! The hash is the 32-bit MurmurHash3 (x86 variant, seed 0) of the icon
//! bytes base64-encoded with 76-column line wrapping and a trailing
//! newline. This matches the encoding used by internet-scan indexes, so
//! hashes in rule files can be taken straight from published fingerprints.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

/// Hash raw favicon bytes into the 32-bit rule-file form.
pub fn favicon_hash(icon: &[u8]) -> i32 {
    murmur3_32(wrapped_base64(icon).as_bytes(), 0)
}

/// Base64 with a newline every 76 output characters and one at the end.
fn wrapped_base64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut wrapped = String::with_capacity(encoded.len().saturating_add(encoded.len() / 76).saturating_add(1));
    let chars: Vec<char> = encoded.chars().collect();
    for chunk in chars.chunks(76) {
        wrapped.extend(chunk.iter());
        wrapped.push('\n');
    }
    if chars.is_empty() {
        wrapped.push('\n');
    }
    wrapped
}

/// MurmurHash3 x86 32-bit.
///
/// Returned as `i32` because published favicon hashes are written in the
/// signed form.
pub fn murmur3_32(data: &[u8], seed: u32) -> i32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut hash = seed;
    let chunks = data.chunks_exact(4);
    let tail = chunks.remainder();

    for chunk in chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
        hash = hash.rotate_left(13);
        hash = hash.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    if !tail.is_empty() {
        let mut k: u32 = 0;
        for (i, &byte) in tail.iter().enumerate() {
            k |= u32::from(byte) << (8u32.saturating_mul(u32::try_from(i).unwrap_or(0)));
        }
        k = k.wrapping_mul(C1);
        k = k.rotate_left(15);
        k = k.wrapping_mul(C2);
        hash ^= k;
    }

    hash ^= u32::try_from(data.len()).unwrap_or(u32::MAX);
    hash ^= hash >> 16;
    hash = hash.wrapping_mul(0x85eb_ca6b);
    hash ^= hash >> 13;
    hash = hash.wrapping_mul(0xc2b2_ae35);
    hash ^= hash >> 16;

    i32::from_le_bytes(hash.to_le_bytes())
}
