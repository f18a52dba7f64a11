//! Content hashing for global states and shared resources.
//!
//! A state hash is the XOR of per-component hashes, one per rank plus one per
//! active collective. XOR decomposition keeps the hash independent of
//! container iteration order and lets equal states collapse to one graph node
//! regardless of which worker produced them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A 64-bit hash identifying a global state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateHash(u64);

impl StateHash {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(v: u64) -> Self {
        StateHash(v)
    }
}

impl fmt::Debug for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateHash({:016x})", self.0)
    }
}

impl fmt::Display for StateHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A 64-bit content hash of a shared heavy object (snapshot or buffer).
///
/// For snapshots this is the value reported by the Execution Controller's
/// `HASH` command and is assumed collision-free for the explored space; for
/// engine-owned buffers it is computed locally over the payload bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash(u64);

impl ContentHash {
    #[inline]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_u64(v: u64) -> Self {
        ContentHash(v)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:016x})", self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Mix a component hash with its position using splitmix64-style constants,
/// so that swapping the contents of two positions changes the XOR total.
#[inline]
pub fn mix_component(idx: usize, h: u64) -> u64 {
    let m = ((idx as u64) ^ 0x2d35_8dcc_aa6c_78a5).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let m = (m ^ h).wrapping_mul(0x517c_c1b7_2722_0a95);
    m ^ (m >> 32)
}

/// Hash any `Hash` value with the deterministic AHash keys.
#[inline]
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = ahash::AHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Content-hash a byte payload (engine-owned message buffers).
#[inline]
pub fn hash_bytes(bytes: &[u8]) -> ContentHash {
    ContentHash(hash_value(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_bytes_deterministic() {
        assert_eq!(hash_bytes(b"abc"), hash_bytes(b"abc"));
        assert_ne!(hash_bytes(b"abc"), hash_bytes(b"abd"));
    }

    #[test]
    fn test_mix_component_position_sensitive() {
        let h = hash_value(&42u64);
        assert_ne!(mix_component(0, h), mix_component(1, h));
        // XOR of swapped components must differ from the original total.
        let a = hash_value(&1u64);
        let b = hash_value(&2u64);
        let orig = mix_component(0, a) ^ mix_component(1, b);
        let swapped = mix_component(0, b) ^ mix_component(1, a);
        assert_ne!(orig, swapped);
    }

    #[test]
    fn test_display_hex() {
        let h = StateHash::from_u64(0xdead_beef);
        assert_eq!(h.to_string(), "00000000deadbeef");
    }
}
