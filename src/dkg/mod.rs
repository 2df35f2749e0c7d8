//! Decentralized knowledge graph overlay: rule-driven triplet extraction,
//! content-addressed replication over co-resident skip graphs, and parallel
//! edge search.

pub mod cache;
pub mod content;
pub mod edge_search;
pub mod engine;
pub mod knowledge_graph;
pub mod payload;
pub mod protocol;
pub mod rules;

pub use content::{Content, ContentKeying, ContentStore, FixedKeying, Sha1Keying};
pub use knowledge_graph::{KnowledgeGraph, Triplet};
pub use protocol::{DkgConfig, DkgNode};
pub use rules::{Rule, RuleOutput, RuleRegistry};
