//! # Shard Hash
//!
//! MurmurHash3 x86_32 over the UTF-8 bytes of a key. Placement of existing
//! data depends on this output, so it must stay bit-for-bit compatible with
//! the reference algorithm.
//!
//! ## Layout
//!
//! ```text
//! body:  4-byte little-endian blocks   k *= C1; k = rotl(k, 15); k *= C2
//!                                      h ^= k; h = rotl(h, 13); h = h * 5 + N
//! tail:  0..=3 trailing bytes          folded high-to-low into one k, mixed once
//! final: h ^= len; fmix32(h)
//! ```

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;
const BLOCK_ADD: u32 = 0xe654_6b64;

/// Mask that clears the sign bit so the result fits a non-negative `i32`.
pub const SHARD_HASH_MASK: u32 = 0x7fff_ffff;

/// Computes MurmurHash3 x86_32 of `data` with the given `seed`.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h1 = seed;
    let mut blocks = data.chunks_exact(4);

    for block in &mut blocks {
        let k1 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        h1 ^= mix_k1(k1);
        h1 = h1.rotate_left(13);
        h1 = h1.wrapping_mul(5).wrapping_add(BLOCK_ADD);
    }

    let tail = blocks.remainder();
    let mut k1 = 0u32;
    if tail.len() >= 3 {
        k1 |= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        k1 |= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        k1 |= tail[0] as u32;
        h1 ^= mix_k1(k1);
    }

    // Length is mixed in modulo 2^32, matching the reference implementation.
    h1 ^= data.len() as u32;
    fmix32(h1)
}

/// Hash used for shard placement: seed 0, sign bit cleared.
#[inline]
pub fn shard_hash(key: &str) -> u32 {
    murmur3_32(key.as_bytes(), 0) & SHARD_HASH_MASK
}

#[inline]
fn mix_k1(k1: u32) -> u32 {
    k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

#[inline]
fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
