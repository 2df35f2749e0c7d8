//! Shared helpers for the multi-node tests: in-process cluster construction
//! and the skip-graph integrity checker.

#![allow(dead_code)]

use lattice::dkg::rules::DummyRule;
use lattice::dkg::{ContentKeying, DkgConfig, DkgNode, RuleRegistry};
use lattice::skipgraph::{Direction, Key, MembershipVector, SkipGraphNode};
use lattice::transport::MemoryNetwork;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

fn addr(port: u16) -> SocketAddrV4 {
    format!("127.0.0.1:{}", port).parse().unwrap()
}

fn public_key(key: Key) -> Vec<u8> {
    format!("test-peer-{:08}", key).into_bytes()
}

/// Standalone skip-graph nodes wired over one in-process mesh, with their
/// routing tables initialized from `(key, membership symbols)` pairs.
pub async fn build_sg_nodes(specs: &[(Key, &[u8])]) -> Vec<Arc<SkipGraphNode>> {
    let net = MemoryNetwork::new();
    let mut nodes = Vec::new();
    for (i, (key, symbols)) in specs.iter().enumerate() {
        let (endpoint, deliveries) = net.register(addr(9100 + i as u16));
        let node = SkipGraphNode::new(endpoint, 1, public_key(*key), 4);
        node.initialize_routing_table(*key, MembershipVector::new(symbols.to_vec()))
            .await;
        node.spawn_dispatcher(deliveries);
        nodes.push(node);
    }
    nodes
}

/// Join every node after the first through the first one.
pub async fn join_all(nodes: &[Arc<SkipGraphNode>]) {
    let introducer = nodes[0].my_node().await.unwrap();
    for node in &nodes[1..] {
        assert!(node.join(&introducer).await.unwrap());
    }
}

pub async fn node_with_key(nodes: &[Arc<SkipGraphNode>], key: Key) -> Arc<SkipGraphNode> {
    for node in nodes {
        if node.key().await == Some(key) {
            return node.clone();
        }
    }
    panic!("no live node with key {}", key);
}

/// Link symmetry, key ordering, and membership-prefix agreement across every
/// live node, at every level.
pub async fn verify_skip_graph_integrity(nodes: &[Arc<SkipGraphNode>]) {
    let mut tables = HashMap::new();
    for node in nodes {
        if let Some(rt) = node.routing_table().await {
            tables.insert(rt.key(), rt);
        }
    }

    for rt in tables.values() {
        for level in 0..rt.height() {
            if let Some(ln) = rt.get(level, Direction::Left) {
                assert!(
                    ln.key < rt.key(),
                    "left neighbour of {} at level {} should be smaller (is {})",
                    rt.key(),
                    level,
                    ln.key
                );
                if level >= 1 {
                    assert_eq!(
                        ln.mv.to_bytes()[..level],
                        rt.mv().to_bytes()[..level],
                        "level-{} neighbour {} of {} disagrees on the mv prefix",
                        level,
                        ln.key,
                        rt.key()
                    );
                }
                let peer = tables
                    .get(&ln.key)
                    .unwrap_or_else(|| panic!("left neighbour {} is not a live node", ln.key));
                let back = peer
                    .get(level, Direction::Right)
                    .unwrap_or_else(|| {
                        panic!("right neighbour of {} at level {} should be set", ln.key, level)
                    });
                assert_eq!(
                    back.key,
                    rt.key(),
                    "right neighbour of {} at level {} should be {}",
                    ln.key,
                    level,
                    rt.key()
                );
            }

            if let Some(rn) = rt.get(level, Direction::Right) {
                assert!(
                    rn.key > rt.key(),
                    "right neighbour of {} at level {} should be larger (is {})",
                    rt.key(),
                    level,
                    rn.key
                );
                let peer = tables
                    .get(&rn.key)
                    .unwrap_or_else(|| panic!("right neighbour {} is not a live node", rn.key));
                let back = peer
                    .get(level, Direction::Left)
                    .unwrap_or_else(|| {
                        panic!("left neighbour of {} at level {} should be set", rn.key, level)
                    });
                assert_eq!(
                    back.key,
                    rt.key(),
                    "left neighbour of {} at level {} should be {}",
                    rn.key,
                    level,
                    rt.key()
                );
            }
        }
    }
}

/// DKG nodes over one mesh, each with its skip graphs initialized from
/// `(key, one membership vector per skip graph)`.
pub async fn build_dkg_nodes(
    specs: &[(Key, Vec<Vec<u8>>)],
    config: DkgConfig,
    keying: Arc<dyn ContentKeying>,
) -> Vec<Arc<DkgNode>> {
    let net = MemoryNetwork::new();
    let mut registry = RuleRegistry::new();
    registry.add_rule(Arc::new(DummyRule));
    let registry = Arc::new(registry);

    let mut nodes = Vec::new();
    for (i, (key, mvs)) in specs.iter().enumerate() {
        let (endpoint, deliveries) = net.register(addr(9300 + i as u16));
        let node = DkgNode::new(endpoint, config.clone(), registry.clone(), keying.clone());
        assert_eq!(node.skip_graphs().len(), mvs.len());
        for (sg, symbols) in node.skip_graphs().iter().zip(mvs) {
            sg.initialize_routing_table(*key, MembershipVector::new(symbols.clone()))
                .await;
        }
        node.spawn_dispatcher(deliveries);
        nodes.push(node);
    }
    nodes
}

/// Join every DKG node's skip graphs through the first node.
pub async fn join_dkg(nodes: &[Arc<DkgNode>]) {
    for sg_ind in 0..nodes[0].skip_graphs().len() {
        let introducer = nodes[0].skip_graphs()[sg_ind].my_node().await.unwrap();
        for node in &nodes[1..] {
            assert!(node.skip_graphs()[sg_ind].join(&introducer).await.unwrap());
        }
    }
}

pub async fn dkg_node_with_key(nodes: &[Arc<DkgNode>], key: Key) -> Arc<DkgNode> {
    for node in nodes {
        if node.sg_key().await == Some(key) {
            return node.clone();
        }
    }
    panic!("no dkg node with key {}", key);
}
