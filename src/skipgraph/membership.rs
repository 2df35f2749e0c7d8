//! Membership vectors: the random symbol sequence assigned to a node at
//! birth, determining which higher-level lists it joins.

use rand::Rng;
use std::fmt;

/// Alphabet size. Two nodes are buddies at level `l + 1` iff they share the
/// first `l + 1` symbols.
pub const ALPHA: u8 = 2;

/// Default number of symbols, bounding the height of the skip graph.
pub const DEFAULT_LENGTH: usize = 32;

/// Immutable after creation; one symbol per byte on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MembershipVector {
    symbols: Vec<u8>,
}

impl MembershipVector {
    /// Sample `length` uniform symbols from `0..ALPHA`.
    pub fn random(length: usize) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            symbols: (0..length).map(|_| rng.gen_range(0..ALPHA)).collect(),
        }
    }

    pub fn new(symbols: Vec<u8>) -> Self {
        debug_assert!(symbols.iter().all(|&s| s < ALPHA));
        Self { symbols }
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            symbols: bytes.to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.symbols.clone()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbol(&self, index: usize) -> Option<u8> {
        self.symbols.get(index).copied()
    }
}

impl fmt::Display for MembershipVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for s in &self.symbols {
            write!(f, "{}", s)?;
        }
        Ok(())
    }
}
