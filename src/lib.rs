pub mod cache;
pub mod dkg;
pub mod skipgraph;
pub mod transport;
pub mod wire;

pub use dkg::{Content, ContentKeying, DkgConfig, DkgNode, KnowledgeGraph, Sha1Keying, Triplet};
pub use skipgraph::{Direction, Key, MembershipVector, SgNode, SkipGraphNode};
pub use transport::{Delivery, Endpoint, MemoryNetwork, UdpEndpoint};
pub use wire::WireError;
