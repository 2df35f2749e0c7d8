//! Skip-graph node descriptors.
//!
//! Remote nodes are referenced by value through these descriptors; there is
//! no in-process object graph between peers. Identity is the key.

use crate::skipgraph::membership::MembershipVector;
use crate::skipgraph::Key;
use crate::wire::{self, Reader, WireError};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{Ipv4Addr, SocketAddrV4};

/// Descriptor of one skip-graph position: where to reach it, who it is, and
/// where it sits in the order. An empty public key encodes "no neighbour".
#[derive(Debug, Clone)]
pub struct SgNode {
    pub address: SocketAddrV4,
    pub public_key: Vec<u8>,
    pub key: Key,
    pub mv: MembershipVector,
}

impl SgNode {
    pub fn new(address: SocketAddrV4, public_key: Vec<u8>, key: Key, mv: MembershipVector) -> Self {
        Self {
            address,
            public_key,
            key,
            mv,
        }
    }

    pub fn empty() -> Self {
        Self {
            address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
            public_key: Vec::new(),
            key: 0,
            mv: MembershipVector::from_bytes(&[]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.public_key.is_empty()
    }

    /// Last public-key bytes in hex, for logs.
    pub fn short_id(&self) -> String {
        short_id(&self.public_key)
    }

    /// Inline node-info encoding: address, public key, key, membership vector.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), WireError> {
        wire::put_addr(buf, &self.address);
        wire::put_bytes(buf, &self.public_key)?;
        wire::put_u32(buf, self.key);
        wire::put_bytes(buf, &self.mv.to_bytes())
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let address = r.get_addr()?;
        let public_key = r.get_bytes()?;
        let key = r.get_u32()?;
        let mv = MembershipVector::from_bytes(&r.get_bytes()?);
        Ok(Self {
            address,
            public_key,
            key,
            mv,
        })
    }
}

pub fn short_id(public_key: &[u8]) -> String {
    let tail = public_key.len().saturating_sub(4);
    hex::encode(&public_key[tail..])
}

impl PartialEq for SgNode {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for SgNode {}

impl Hash for SgNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for SgNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({} => {})", self.key, self.address)
    }
}
