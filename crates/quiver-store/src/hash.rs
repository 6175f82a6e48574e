//! Hash functions for derived index structures.
//!
//! Consume queue entries carry a tag hash code so filters can reject
//! entries without touching the commit log, and index files bucket keys by
//! a 32-bit key hash. Both are murmur2 so they are stable across restarts
//! and platforms.

/// murmur2 hash (seed 0x9747b28c), compatible with the Kafka Java client.
///
/// # Example
/// ```
/// # use quiver_store::hash::murmur2;
/// assert_eq!(murmur2(b"hello"), 1682149141);
/// ```
pub fn murmur2(data: &[u8]) -> u32 {
    const SEED: u32 = 0x9747b28c;
    const M: u32 = 0x5bd1e995;
    const R: u32 = 24;

    let len = data.len();
    let mut h: u32 = SEED ^ (len as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= (tail[2] as u32) << 16;
    }
    if tail.len() >= 2 {
        h ^= (tail[1] as u32) << 8;
    }
    if !tail.is_empty() {
        h ^= tail[0] as u32;
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;

    h
}

/// Tag hash code stored in consume queue entries. Untagged records use 0.
#[inline]
pub fn tags_hash_code(tags: Option<&str>) -> u64 {
    match tags {
        Some(t) if !t.is_empty() => murmur2(t.as_bytes()) as u64,
        _ => 0,
    }
}

/// Bucket hash for an index key, sign bit masked so it is never "empty".
#[inline]
pub fn index_key_hash(topic: &str, key: &str) -> u32 {
    let mut buf = Vec::with_capacity(topic.len() + key.len() + 1);
    buf.extend_from_slice(topic.as_bytes());
    buf.push(b'#');
    buf.extend_from_slice(key.as_bytes());
    murmur2(&buf) & 0x7fff_ffff
}
