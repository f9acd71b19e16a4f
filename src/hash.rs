//! Consistent hashing used to place keys into buckets.
//!
//! Every SDK evaluating the same definitions must place a given key in the same bucket, so the
//! algorithms here are fixed: any change to them is a breaking change for every flag already
//! rolled out. They are checked against published reference vectors in the tests below.

/// Number of buckets a key can land in. Partition sizes and traffic allocation are expressed as
/// percentages of this range.
pub const BUCKETS: u32 = 100;

/// The hashing algorithm a flag was created with, taken from the `algo` field of its definition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    /// Java-style string hash. Only flags created before murmur hashing was introduced use it.
    Legacy,
    /// 32-bit x86 MurmurHash3.
    #[default]
    Murmur,
}

impl HashAlgorithm {
    pub(crate) fn from_algo(algo: Option<u8>) -> Self {
        match algo {
            Some(1) => HashAlgorithm::Legacy,
            _ => HashAlgorithm::Murmur,
        }
    }

    pub(crate) fn bucket(self, key: &str, seed: i32) -> u32 {
        match self {
            HashAlgorithm::Legacy => legacy_bucket(key, seed),
            HashAlgorithm::Murmur => bucket(key, seed),
        }
    }
}

/// Returns the bucket in `[0, 100)` for `key` hashed with `seed`.
pub fn bucket(key: &str, seed: i32) -> u32 {
    murmur3_32(key.as_bytes(), seed as u32) % BUCKETS
}

/// Returns the bucket in `[0, 100)` for `key` under the legacy hashing algorithm.
pub fn legacy_bucket(key: &str, seed: i32) -> u32 {
    (legacy_hash(key, seed) % BUCKETS as i32).unsigned_abs()
}

fn legacy_hash(key: &str, seed: i32) -> i32 {
    key.encode_utf16()
        .fold(0_i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
        ^ seed
}

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// 32-bit x86 MurmurHash3 of `data`.
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= scramble(k);
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let k = tail
            .iter()
            .rev()
            .fold(0_u32, |k, byte| (k << 8) | u32::from(*byte));
        h ^= scramble(k);
    }

    // only the low 32 bits of the length take part in the hash
    h ^= data.len() as u32;
    fmix32(h)
}

fn scramble(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

fn fmix32(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
