//! Multi-node skip-graph tests over the in-process mesh: joins, searches,
//! leaves, and routing around failed peers.

mod common;

use common::{build_sg_nodes, join_all, node_with_key, verify_skip_graph_integrity};
use lattice::skipgraph::{Direction, SkipGraphError, SkipGraphNode};
use lattice::transport::MemoryNetwork;

// =============================================================================
// TWO NODES
// =============================================================================

const TWO_NODES: &[(u32, &[u8])] = &[(0, &[0, 0]), (1, &[0, 1])];

#[tokio::test]
async fn two_node_join() {
    let nodes = build_sg_nodes(TWO_NODES).await;
    let introducer = nodes[1].my_node().await.unwrap();
    assert!(nodes[0].join(&introducer).await.unwrap());

    verify_skip_graph_integrity(&nodes).await;
    assert_eq!(nodes[0].routing_table().await.unwrap().height(), 3);
    assert_eq!(nodes[1].routing_table().await.unwrap().height(), 3);
}

#[tokio::test]
async fn two_node_get_neighbour() {
    let nodes = build_sg_nodes(TWO_NODES).await;
    let peer = nodes[1].local_addr();

    let (found, _) = nodes[0].get_neighbour(peer, Direction::Left, 0).await;
    assert!(!found);

    let introducer = nodes[1].my_node().await.unwrap();
    assert!(nodes[0].join(&introducer).await.unwrap());

    let (found, neighbour) = nodes[0].get_neighbour(peer, Direction::Left, 0).await;
    assert!(found);
    assert_eq!(neighbour.key, 0);

    // Levels beyond the peer's height have no neighbour.
    let (found, _) = nodes[0].get_neighbour(peer, Direction::Left, 7).await;
    assert!(!found);
}

#[tokio::test]
async fn two_node_search() {
    let nodes = build_sg_nodes(TWO_NODES).await;
    let introducer = nodes[1].my_node().await.unwrap();
    assert!(nodes[0].join(&introducer).await.unwrap());

    let result = nodes[1].search(0, None).await.unwrap().unwrap();
    assert_eq!(result.key, 0);
    let result = nodes[1].search(1, None).await.unwrap().unwrap();
    assert_eq!(result.key, 1);
}

#[tokio::test]
async fn two_node_leave() {
    let nodes = build_sg_nodes(TWO_NODES).await;
    let introducer = nodes[1].my_node().await.unwrap();
    assert!(nodes[0].join(&introducer).await.unwrap());
    verify_skip_graph_integrity(&nodes).await;

    assert!(nodes[0].leave().await.unwrap());
    verify_skip_graph_integrity(&nodes).await;
    assert!(nodes[0].routing_table().await.is_none());
}

#[tokio::test]
async fn uninitialized_routing_table_fails_fast() {
    let net = MemoryNetwork::new();
    let (endpoint, deliveries) = net.register("127.0.0.1:9050".parse().unwrap());
    let node = SkipGraphNode::new(endpoint, 1, b"bare-node".to_vec(), 4);
    node.spawn_dispatcher(deliveries);

    assert_eq!(
        node.search(5, None).await.unwrap_err(),
        SkipGraphError::RoutingTableNotInitialized
    );
    let ghost = lattice::SgNode::empty();
    assert_eq!(
        node.join(&ghost).await.unwrap_err(),
        SkipGraphError::RoutingTableNotInitialized
    );
}

// =============================================================================
// FOUR NODES
// =============================================================================

const FOUR_NODES: &[(u32, &[u8])] = &[
    (99, &[0, 0, 0, 0]),
    (21, &[1, 0, 0, 0]),
    (33, &[0, 1, 0, 0]),
    (36, &[1, 1, 0, 0]),
];

#[tokio::test]
async fn four_node_join() {
    let nodes = build_sg_nodes(FOUR_NODES).await;
    let introducer = nodes[0].my_node().await.unwrap();
    for node in &nodes[1..] {
        assert!(node.join(&introducer).await.unwrap());
        verify_skip_graph_integrity(&nodes).await;
    }
}

#[tokio::test]
async fn four_node_search() {
    let nodes = build_sg_nodes(FOUR_NODES).await;
    join_all(&nodes).await;

    let n99 = node_with_key(&nodes, 99).await;
    let n21 = node_with_key(&nodes, 21).await;

    assert_eq!(n99.search(21, None).await.unwrap().unwrap().key, 21);
    assert_eq!(n99.search(20, None).await.unwrap().unwrap().key, 21);
    assert_eq!(n99.search(34, None).await.unwrap().unwrap().key, 33);
    assert_eq!(n21.search(99, None).await.unwrap().unwrap().key, 99);
    assert_eq!(n21.search(45, None).await.unwrap().unwrap().key, 36);
    assert_eq!(n99.search(99, None).await.unwrap().unwrap().key, 99);
}

#[tokio::test]
async fn four_node_search_records_stats() {
    let nodes = build_sg_nodes(FOUR_NODES).await;
    join_all(&nodes).await;

    let n99 = node_with_key(&nodes, 99).await;
    n99.search(21, None).await.unwrap().unwrap();
    let stats = n99.search_stats().await;
    assert_eq!(stats.search_latencies.len(), 1);
    assert_eq!(stats.hops.values().sum::<u32>(), 1);

    // The introducer never joined; everyone else did exactly once.
    assert!(stats.join_latencies.is_empty());
    let joiner = node_with_key(&nodes, 21).await;
    assert_eq!(joiner.search_stats().await.join_latencies.len(), 1);
}

#[tokio::test]
async fn search_routes_around_offline_peer() {
    let nodes = build_sg_nodes(FOUR_NODES).await;
    join_all(&nodes).await;

    // Node 33 goes silent; the forward timeout evicts it and the search is
    // re-routed along the level-0 chain.
    node_with_key(&nodes, 33).await.set_offline(true);

    let n99 = node_with_key(&nodes, 99).await;
    let result = n99.search(21, None).await.unwrap().unwrap();
    assert_eq!(result.key, 21);
}

#[tokio::test]
async fn malicious_peer_poisons_search() {
    let nodes = build_sg_nodes(FOUR_NODES).await;
    join_all(&nodes).await;

    node_with_key(&nodes, 33).await.set_malicious(true);

    // The search terminates at the malicious hop, which names itself.
    let n99 = node_with_key(&nodes, 99).await;
    let result = n99.search(21, None).await.unwrap().unwrap();
    assert_eq!(result.key, 33);
}

#[tokio::test]
async fn four_node_leave() {
    let nodes = build_sg_nodes(FOUR_NODES).await;
    join_all(&nodes).await;
    verify_skip_graph_integrity(&nodes).await;

    let n21 = node_with_key(&nodes, 21).await;
    let n33 = node_with_key(&nodes, 33).await;
    let n36 = node_with_key(&nodes, 36).await;

    assert!(n33.leave().await.unwrap());

    assert_eq!(n21.neighbour(0, Direction::Right).await.unwrap().key, 36);
    assert_eq!(n36.neighbour(0, Direction::Left).await.unwrap().key, 21);
    verify_skip_graph_integrity(&nodes).await;

    assert!(n21.leave().await.unwrap());
    assert!(n36.leave().await.unwrap());
    verify_skip_graph_integrity(&nodes).await;
}

// =============================================================================
// SEVEN NODES — the graph from the Skip Graphs paper
// =============================================================================

const SEVEN_NODES: &[(u32, &[u8])] = &[
    (13, &[0, 0]),
    (21, &[1, 0]),
    (33, &[0, 1]),
    (36, &[0, 1]),
    (48, &[0, 0]),
    (75, &[1, 1]),
    (99, &[1, 1]),
];

async fn assert_neighbour(
    node: &std::sync::Arc<SkipGraphNode>,
    level: usize,
    side: Direction,
    expected: Option<u32>,
) {
    let got = node.neighbour(level, side).await.map(|n| n.key);
    assert_eq!(
        got,
        expected,
        "node {:?}: {} neighbour at level {}",
        node.key().await,
        side.name(),
        level
    );
}

#[tokio::test]
async fn seven_node_join_builds_expected_levels() {
    let nodes = build_sg_nodes(SEVEN_NODES).await;
    let introducer = nodes[0].my_node().await.unwrap();
    for node in &nodes[1..] {
        assert!(node.join(&introducer).await.unwrap());
    }
    verify_skip_graph_integrity(&nodes).await;

    let n13 = node_with_key(&nodes, 13).await;
    let n21 = node_with_key(&nodes, 21).await;
    let n33 = node_with_key(&nodes, 33).await;
    let n36 = node_with_key(&nodes, 36).await;
    let n48 = node_with_key(&nodes, 48).await;
    let n75 = node_with_key(&nodes, 75).await;
    let n99 = node_with_key(&nodes, 99).await;

    // Level 0: the full chain 13-21-33-36-48-75-99.
    assert_neighbour(&n13, 0, Direction::Left, None).await;
    assert_neighbour(&n13, 0, Direction::Right, Some(21)).await;
    assert_neighbour(&n21, 0, Direction::Left, Some(13)).await;
    assert_neighbour(&n21, 0, Direction::Right, Some(33)).await;
    assert_neighbour(&n33, 0, Direction::Left, Some(21)).await;
    assert_neighbour(&n33, 0, Direction::Right, Some(36)).await;
    assert_neighbour(&n36, 0, Direction::Left, Some(33)).await;
    assert_neighbour(&n36, 0, Direction::Right, Some(48)).await;
    assert_neighbour(&n48, 0, Direction::Left, Some(36)).await;
    assert_neighbour(&n48, 0, Direction::Right, Some(75)).await;
    assert_neighbour(&n75, 0, Direction::Left, Some(48)).await;
    assert_neighbour(&n75, 0, Direction::Right, Some(99)).await;
    assert_neighbour(&n99, 0, Direction::Left, Some(75)).await;
    assert_neighbour(&n99, 0, Direction::Right, None).await;

    // Level 1: chains split by the first membership symbol.
    assert_neighbour(&n13, 1, Direction::Left, None).await;
    assert_neighbour(&n13, 1, Direction::Right, Some(33)).await;
    assert_neighbour(&n21, 1, Direction::Left, None).await;
    assert_neighbour(&n21, 1, Direction::Right, Some(75)).await;
    assert_neighbour(&n33, 1, Direction::Left, Some(13)).await;
    assert_neighbour(&n33, 1, Direction::Right, Some(36)).await;
    assert_neighbour(&n36, 1, Direction::Left, Some(33)).await;
    assert_neighbour(&n36, 1, Direction::Right, Some(48)).await;
    assert_neighbour(&n48, 1, Direction::Left, Some(36)).await;
    assert_neighbour(&n48, 1, Direction::Right, None).await;
    assert_neighbour(&n75, 1, Direction::Left, Some(21)).await;
    assert_neighbour(&n75, 1, Direction::Right, Some(99)).await;
    assert_neighbour(&n99, 1, Direction::Left, Some(75)).await;
    assert_neighbour(&n99, 1, Direction::Right, None).await;

    // Level 2: {13,48}, {33,36}, {75,99}; 21 is alone.
    assert_neighbour(&n13, 2, Direction::Left, None).await;
    assert_neighbour(&n13, 2, Direction::Right, Some(48)).await;
    assert_neighbour(&n21, 2, Direction::Left, None).await;
    assert_neighbour(&n21, 2, Direction::Right, None).await;
    assert_neighbour(&n33, 2, Direction::Left, None).await;
    assert_neighbour(&n33, 2, Direction::Right, Some(36)).await;
    assert_neighbour(&n36, 2, Direction::Left, Some(33)).await;
    assert_neighbour(&n36, 2, Direction::Right, None).await;
    assert_neighbour(&n48, 2, Direction::Left, Some(13)).await;
    assert_neighbour(&n48, 2, Direction::Right, None).await;
    assert_neighbour(&n75, 2, Direction::Left, None).await;
    assert_neighbour(&n75, 2, Direction::Right, Some(99)).await;
    assert_neighbour(&n99, 2, Direction::Left, Some(75)).await;
    assert_neighbour(&n99, 2, Direction::Right, None).await;
}

#[tokio::test]
async fn seven_node_search() {
    let nodes = build_sg_nodes(SEVEN_NODES).await;
    join_all(&nodes).await;

    // 13 is the greatest key at most 20, from anywhere in the graph.
    for node in &nodes {
        assert_eq!(node.search(20, None).await.unwrap().unwrap().key, 13);
    }

    let n13 = node_with_key(&nodes, 13).await;
    assert_eq!(n13.search(13, None).await.unwrap().unwrap().key, 13);
    assert_eq!(n13.search(22, None).await.unwrap().unwrap().key, 21);
    assert_eq!(n13.search(100, None).await.unwrap().unwrap().key, 99);

    let n21 = node_with_key(&nodes, 21).await;
    assert_eq!(n21.search(40, None).await.unwrap().unwrap().key, 36);
}
