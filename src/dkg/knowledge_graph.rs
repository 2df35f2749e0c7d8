//! The local knowledge graph: a directed multigraph on byte-string nodes.

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap, HashSet};

/// An atomic knowledge-graph edge, tagged with the rules that produced it.
/// Equality and hashing ignore the tags.
#[derive(Debug, Clone)]
pub struct Triplet {
    pub head: Vec<u8>,
    pub relation: Vec<u8>,
    pub tail: Vec<u8>,
    pub rules: BTreeSet<Vec<u8>>,
}

impl Triplet {
    pub fn new(head: impl Into<Vec<u8>>, relation: impl Into<Vec<u8>>, tail: impl Into<Vec<u8>>) -> Self {
        Self {
            head: head.into(),
            relation: relation.into(),
            tail: tail.into(),
            rules: BTreeSet::new(),
        }
    }

    pub fn add_rule(&mut self, rule: impl Into<Vec<u8>>) {
        self.rules.insert(rule.into());
    }
}

impl PartialEq for Triplet {
    fn eq(&self, other: &Self) -> bool {
        self.head == other.head && self.relation == other.relation && self.tail == other.tail
    }
}

impl Eq for Triplet {}

impl std::hash::Hash for Triplet {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.head.hash(state);
        self.relation.hash(state);
        self.tail.hash(state);
    }
}

#[derive(Debug, Clone)]
struct EdgeAttr {
    relation: Vec<u8>,
    rules: BTreeSet<Vec<u8>>,
}

/// Edges are keyed by `(head, tail, relation)`: re-adding an identical
/// triplet merges its rule tags, a different relation between the same pair
/// becomes a parallel edge.
#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    graph: DiGraph<Vec<u8>, EdgeAttr>,
    indices: HashMap<Vec<u8>, NodeIndex>,
    stored_content: HashSet<Vec<u8>>,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn node_index(&mut self, label: &[u8]) -> NodeIndex {
        if let Some(&idx) = self.indices.get(label) {
            return idx;
        }
        let idx = self.graph.add_node(label.to_vec());
        self.indices.insert(label.to_vec(), idx);
        idx
    }

    pub fn add_triplet(&mut self, triplet: Triplet) {
        self.stored_content.insert(triplet.head.clone());
        let head = self.node_index(&triplet.head);
        let tail = self.node_index(&triplet.tail);

        let existing = self
            .graph
            .edges_connecting(head, tail)
            .find(|e| e.weight().relation == triplet.relation)
            .map(|e| e.id());
        match existing {
            Some(id) => {
                if let Some(attr) = self.graph.edge_weight_mut(id) {
                    attr.rules.extend(triplet.rules);
                }
            }
            None => {
                self.graph.add_edge(
                    head,
                    tail,
                    EdgeAttr {
                        relation: triplet.relation,
                        rules: triplet.rules,
                    },
                );
            }
        }
    }

    /// Every edge incident to the node labelled `content`, in both directions.
    pub fn triplets_of_node(&self, content: &[u8]) -> Vec<Triplet> {
        let Some(&idx) = self.indices.get(content) else {
            return Vec::new();
        };
        let mut triplets = Vec::new();
        for direction in [Direction::Incoming, Direction::Outgoing] {
            for edge in self.graph.edges_directed(idx, direction) {
                triplets.push(Triplet {
                    head: self.graph[edge.source()].clone(),
                    relation: edge.weight().relation.clone(),
                    tail: self.graph[edge.target()].clone(),
                    rules: edge.weight().rules.clone(),
                });
            }
        }
        triplets
    }

    pub fn num_edges(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn has_stored_content(&self, identifier: &[u8]) -> bool {
        self.stored_content.contains(identifier)
    }
}
