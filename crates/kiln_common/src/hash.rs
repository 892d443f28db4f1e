//! Content hashing for cache invalidation and build-result validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use xxhash_rust::xxh3::Xxh3;

/// A 128-bit content hash computed using XXH3.
///
/// Two inputs with the same `ContentHash` are assumed to be identical. Used to
/// fingerprint source files, dependency sets, and compiler configuration so
/// that a cached build result can be checked against the current state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 16]);

impl ContentHash {
    /// The hash of nothing; used as the "never computed" marker.
    pub const EMPTY: ContentHash = ContentHash([0; 16]);

    /// Computes a content hash from a byte slice using XXH3-128.
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = xxhash_rust::xxh3::xxh3_128(data);
        Self(hash.to_le_bytes())
    }

    /// Parses the 32-character lowercase hex form produced by `Display`.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(s.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({:02x}{:02x}..)", self.0[0], self.0[1])
    }
}

/// Incrementally combines heterogeneous inputs into a single [`ContentHash`].
///
/// Every added item is length-prefixed and tagged so that `("ab", "c")` and
/// `("a", "bc")` never collide.
pub struct HashCombiner {
    state: Xxh3,
}

impl HashCombiner {
    /// Creates an empty combiner.
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    /// Adds raw bytes.
    pub fn add_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.state.update(b"B");
        self.state.update(&(data.len() as u64).to_le_bytes());
        self.state.update(data);
        self
    }

    /// Adds a string.
    pub fn add_str(&mut self, s: &str) -> &mut Self {
        self.state.update(b"S");
        self.state.update(&(s.len() as u64).to_le_bytes());
        self.state.update(s.as_bytes());
        self
    }

    /// Adds a boolean flag.
    pub fn add_bool(&mut self, b: bool) -> &mut Self {
        self.state.update(if b { b"T" } else { b"F" });
        self
    }

    /// Adds an unsigned integer.
    pub fn add_u64(&mut self, n: u64) -> &mut Self {
        self.state.update(b"N");
        self.state.update(&n.to_le_bytes());
        self
    }

    /// Adds a previously computed hash.
    pub fn add_hash(&mut self, hash: &ContentHash) -> &mut Self {
        self.state.update(b"H");
        self.state.update(hash.as_bytes());
        self
    }

    /// Returns the combined hash of everything added so far.
    pub fn finish(&self) -> ContentHash {
        ContentHash(self.state.digest128().to_le_bytes())
    }
}

impl Default for HashCombiner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        let a = ContentHash::from_bytes(b"hello world");
        let b = ContentHash::from_bytes(b"hello world");
        assert_eq!(a, b);
    }

    #[test]
    fn different_inputs_differ() {
        let a = ContentHash::from_bytes(b"hello");
        let b = ContentHash::from_bytes(b"world");
        assert_ne!(a, b);
    }

    #[test]
    fn display_format() {
        let h = ContentHash::from_bytes(b"test");
        let s = format!("{h}");
        assert_eq!(s.len(), 32, "Display should be 32 hex chars");
        assert!(s.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hex_parses_back() {
        let h = ContentHash::from_bytes(b"record");
        assert_eq!(ContentHash::from_hex(&h.to_string()), Some(h));
        assert_eq!(ContentHash::from_hex("not hex"), None);
        assert_eq!(ContentHash::from_hex(&"zz".repeat(16)), None);
    }

    #[test]
    fn debug_abbreviated() {
        let h = ContentHash::from_bytes(b"test");
        let s = format!("{h:?}");
        assert!(s.starts_with("ContentHash("));
        assert!(s.ends_with(")"));
    }

    #[test]
    fn combiner_is_order_sensitive() {
        let mut a = HashCombiner::new();
        a.add_str("x").add_str("y");
        let mut b = HashCombiner::new();
        b.add_str("y").add_str("x");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn combiner_separates_boundaries() {
        let mut a = HashCombiner::new();
        a.add_str("ab").add_str("c");
        let mut b = HashCombiner::new();
        b.add_str("a").add_str("bc");
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn combiner_is_deterministic() {
        let build = || {
            let mut c = HashCombiner::new();
            c.add_str("csharp").add_bool(true).add_u64(7);
            c.finish()
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn serde_roundtrip() {
        let h = ContentHash::from_bytes(b"serde test");
        let json = serde_json::to_string(&h).unwrap();
        let back: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }
}
