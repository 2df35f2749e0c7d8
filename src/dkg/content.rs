//! Content items and content-addressable replication keys.

use crate::skipgraph::Key;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// A piece of indexable content: an identifier (usually a hash) plus the
/// raw bytes the extraction rules run over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Content {
    pub identifier: Vec<u8>,
    pub data: Vec<u8>,
}

impl Content {
    pub fn new(identifier: Vec<u8>, data: Vec<u8>) -> Self {
        Self { identifier, data }
    }
}

/// Strategy deriving the skip-graph keys a content item replicates to.
pub trait ContentKeying: Send + Sync {
    /// The replication set: `count` keys, each a skip-graph position.
    fn keys(&self, identifier: &[u8], count: usize) -> Vec<Key>;

    /// Whether `key` belongs to the replication set of `identifier`.
    fn verify_key(&self, identifier: &[u8], key: Key, count: usize) -> bool {
        self.keys(identifier, count).contains(&key)
    }
}

/// `sha1(identifier || ascii_decimal(i)) mod 2^32` for each replica index.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha1Keying;

impl ContentKeying for Sha1Keying {
    fn keys(&self, identifier: &[u8], count: usize) -> Vec<Key> {
        (0..count)
            .map(|i| {
                let mut hasher = Sha1::new();
                hasher.update(identifier);
                hasher.update(i.to_string().as_bytes());
                let digest = hasher.finalize();
                // The low 32 bits of the big-endian digest value.
                u32::from_be_bytes([digest[16], digest[17], digest[18], digest[19]])
            })
            .collect()
    }
}

/// Fixed key list, injected by tests in place of hash derivation.
#[derive(Debug, Clone)]
pub struct FixedKeying(pub Vec<Key>);

impl ContentKeying for FixedKeying {
    fn keys(&self, _identifier: &[u8], _count: usize) -> Vec<Key> {
        self.0.clone()
    }
}

/// In-memory content inventory feeding the rule engine.
#[derive(Debug, Default)]
pub struct ContentStore {
    items: HashMap<Vec<u8>, Content>,
}

impl ContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_content(&mut self, content: Content) {
        self.items.insert(content.identifier.clone(), content);
    }

    pub fn has_content(&self, identifier: &[u8]) -> bool {
        self.items.contains_key(identifier)
    }

    pub fn get_content(&self, identifier: &[u8]) -> Option<&Content> {
        self.items.get(identifier)
    }

    pub fn all_content(&self) -> Vec<Content> {
        self.items.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_deterministic() {
        let keying = Sha1Keying;
        let first = keying.keys(b"abc", 3);
        let second = keying.keys(b"abc", 3);
        assert_eq!(first, second);
        assert_eq!(first.len(), 3);
    }

    #[test]
    fn replica_indices_derive_distinct_keys() {
        let keying = Sha1Keying;
        let keys = keying.keys(b"some-content", 4);
        for (i, a) in keys.iter().enumerate() {
            for b in keys.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn verify_key_accepts_only_derived_keys() {
        let keying = Sha1Keying;
        let keys = keying.keys(b"abc", 2);
        assert!(keying.verify_key(b"abc", keys[0], 2));
        assert!(keying.verify_key(b"abc", keys[1], 2));
        assert!(!keying.verify_key(b"abc", keys[0].wrapping_add(1), 2));
        // A key for a later replica index is outside the set.
        let more = keying.keys(b"abc", 3);
        assert!(!keying.verify_key(b"abc", more[2], 2));
    }

    #[test]
    fn fixed_keying_overrides_derivation() {
        let keying = FixedKeying(vec![20, 50]);
        assert_eq!(keying.keys(b"whatever", 2), vec![20, 50]);
        assert!(keying.verify_key(b"whatever", 50, 2));
        assert!(!keying.verify_key(b"whatever", 51, 2));
    }

    #[test]
    fn content_store_round_trip() {
        let mut store = ContentStore::new();
        assert!(store.is_empty());
        store.add_content(Content::new(b"a".to_vec(), b"test1".to_vec()));
        store.add_content(Content::new(b"b".to_vec(), b"test2".to_vec()));
        assert_eq!(store.len(), 2);
        assert!(store.has_content(b"a"));
        assert!(!store.has_content(b"c"));
        assert_eq!(store.get_content(b"b").unwrap().data, b"test2");
        assert_eq!(store.all_content().len(), 2);
    }
}
