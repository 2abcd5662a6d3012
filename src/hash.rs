//! Key hash functions.
//!
//! All hashes produce 32 bits. The 64-bit FNV variants are truncated, matching
//! what other memcached clients do so that a mixed fleet of clients agrees on
//! key placement.

use serde::Deserialize;

/// Hash function used to place keys on servers.
///
/// Fixed per pool: two pools only route identically if they use the same hash.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashKind {
    /// Jenkins one-at-a-time.
    Default,
    Md5,
    /// Upper 15 bits of CRC-32.
    Crc,
    Fnv1_64,
    Fnv1a_64,
    #[default]
    Fnv1_32,
    Fnv1a_32,
    /// MurmurHash2.
    Murmur,
}

impl HashKind {
    /// Hash `key` with this function.
    pub fn hash(&self, key: &[u8]) -> u32 {
        match self {
            HashKind::Default => one_at_a_time(key),
            HashKind::Md5 => md5_hash(key),
            HashKind::Crc => crc_hash(key),
            HashKind::Fnv1_64 => fnv1_64(key) as u32,
            HashKind::Fnv1a_64 => fnv1a_64(key) as u32,
            HashKind::Fnv1_32 => fnv1_32(key),
            HashKind::Fnv1a_32 => fnv1a_32(key),
            HashKind::Murmur => murmur2(key),
        }
    }
}

const FNV_32_OFFSET: u32 = 0x811c_9dc5;
const FNV_32_PRIME: u32 = 0x0100_0193;
const FNV_64_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_64_PRIME: u64 = 0x0000_0100_0000_01b3;

fn one_at_a_time(key: &[u8]) -> u32 {
    let mut hash: u32 = 0;
    for &byte in key {
        hash = hash.wrapping_add(byte as u32);
        hash = hash.wrapping_add(hash << 10);
        hash ^= hash >> 6;
    }
    hash = hash.wrapping_add(hash << 3);
    hash ^= hash >> 11;
    hash.wrapping_add(hash << 15)
}

fn md5_hash(key: &[u8]) -> u32 {
    let digest = md5::compute(key).0;
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn crc_hash(key: &[u8]) -> u32 {
    (crc32(key) >> 16) & 0x7fff
}

/// CRC-32 (IEEE, reflected).
fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

fn fnv1_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_OFFSET;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_32_PRIME);
        hash ^= byte as u32;
    }
    hash
}

fn fnv1a_32(key: &[u8]) -> u32 {
    let mut hash = FNV_32_OFFSET;
    for &byte in key {
        hash ^= byte as u32;
        hash = hash.wrapping_mul(FNV_32_PRIME);
    }
    hash
}

fn fnv1_64(key: &[u8]) -> u64 {
    let mut hash = FNV_64_OFFSET;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_64_PRIME);
        hash ^= byte as u64;
    }
    hash
}

fn fnv1a_64(key: &[u8]) -> u64 {
    let mut hash = FNV_64_OFFSET;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_64_PRIME);
    }
    hash
}

fn murmur2(key: &[u8]) -> u32 {
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let len = key.len() as u32;
    let seed = 0xdead_beefu32.wrapping_mul(len);
    let mut h = seed ^ len;

    let mut chunks = key.chunks_exact(4);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv1_32_reference_value() {
        assert_eq!(HashKind::Fnv1_32.hash(b"test"), 3157003241);
    }

    #[test]
    fn known_values() {
        assert_eq!(HashKind::Default.hash(b"a"), 3392050242);
        assert_eq!(HashKind::Default.hash(b"test"), 1064684737);
        assert_eq!(HashKind::Fnv1a_32.hash(b"test"), 2949673445);
        assert_eq!(HashKind::Fnv1_64.hash(b"test"), 2680995689);
        assert_eq!(HashKind::Fnv1a_64.hash(b"test"), 427567909);
        assert_eq!(HashKind::Murmur.hash(b"test"), 1931824287);
        assert_eq!(HashKind::Murmur.hash(b"a"), 1262581116);
        assert_eq!(HashKind::Md5.hash(b"test"), 3446378249);
        assert_eq!(HashKind::Crc.hash(b"test"), 22655);
    }

    #[test]
    fn crc32_check_value() {
        assert_eq!(crc32(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn deterministic() {
        for kind in [
            HashKind::Default,
            HashKind::Md5,
            HashKind::Crc,
            HashKind::Fnv1_64,
            HashKind::Fnv1a_64,
            HashKind::Fnv1_32,
            HashKind::Fnv1a_32,
            HashKind::Murmur,
        ] {
            assert_eq!(kind.hash(b"some-key"), kind.hash(b"some-key"), "{kind:?}");
        }
    }

    #[test]
    fn deserializes_snake_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            hash: HashKind,
        }
        let w: Wrapper = toml::from_str("hash = \"fnv1a_64\"").unwrap();
        assert_eq!(w.hash, HashKind::Fnv1a_64);
        let w: Wrapper = toml::from_str("hash = \"default\"").unwrap();
        assert_eq!(w.hash, HashKind::Default);
    }
}
