//! End-to-end DKG tests: replicated triplet storage, edge search, storage
//! admission, and fault behavior, all over the in-process mesh.

mod common;

use common::{build_dkg_nodes, dkg_node_with_key, join_dkg};
use lattice::dkg::{Content, DkgConfig, FixedKeying, Sha1Keying, Triplet};
use lattice::skipgraph::Direction;
use std::sync::Arc;
use std::time::Duration;

fn config(replication_factor: usize, skip_graphs: usize) -> DkgConfig {
    DkgConfig {
        replication_factor,
        skip_graphs,
        should_verify_key: false,
        ..DkgConfig::default()
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}

// =============================================================================
// SINGLE REPLICATION
// =============================================================================

const TWO_NODES: &[(u32, &[u8])] = &[(0, &[0, 0]), (1, &[0, 1])];

fn two_node_specs(skip_graphs: usize) -> Vec<(u32, Vec<Vec<u8>>)> {
    TWO_NODES
        .iter()
        .map(|(key, mv)| (*key, vec![mv.to_vec(); skip_graphs]))
        .collect()
}

#[tokio::test]
async fn store_and_search_single_replica() {
    let nodes = build_dkg_nodes(&two_node_specs(1), config(1, 1), Arc::new(Sha1Keying)).await;
    join_dkg(&nodes).await;

    // Nothing stored yet: the search resolves empty.
    let triplets = nodes[0].search_edges(b"abcdefg").await;
    assert!(triplets.is_empty());

    let triplet = Triplet::new(b"abcdefg".as_slice(), b"b".as_slice(), b"c".as_slice());
    nodes[0]
        .on_new_triplets_generated(&Content::new(b"abcdefg".to_vec(), Vec::new()), vec![triplet])
        .await;
    settle().await;

    // The SHA-1 derived key lands above node 1, so node 1 is responsible.
    assert_eq!(nodes[1].knowledge_graph_edges().await, 1);

    let triplets = nodes[0].search_edges(b"abcdefg").await;
    assert_eq!(triplets.len(), 1);
    assert_eq!(triplets[0].head, b"abcdefg");
    assert!(!nodes[0].edge_search_latencies().await.is_empty());

    // Searching from the storing node itself is served locally.
    let triplets = nodes[1].search_edges(b"abcdefg").await;
    assert_eq!(triplets.len(), 1);
}

#[tokio::test]
async fn storage_request_admission() {
    let nodes = build_dkg_nodes(&two_node_specs(1), config(1, 1), Arc::new(Sha1Keying)).await;
    join_dkg(&nodes).await;

    let target0 = nodes[0].skip_graphs()[0].my_node().await.unwrap();
    let target1 = nodes[1].skip_graphs()[0].my_node().await.unwrap();

    // Key 0 belongs at node 0, key 1 at node 1.
    assert!(nodes[0].send_storage_request(&target0, b"", 0).await);
    assert!(!nodes[1].send_storage_request(&target0, b"\x01", 1).await);
    assert!(!nodes[1].send_storage_request(&target1, b"", 0).await);
    assert!(nodes[1].send_storage_request(&target1, b"\x01", 1).await);
}

#[tokio::test]
async fn bogus_storage_keys_are_rejected() {
    let specs = vec![(7u32, vec![vec![0u8, 0]])];
    let keying = Sha1Keying;
    let mut cfg = config(1, 1);
    cfg.should_verify_key = true;
    let nodes = build_dkg_nodes(&specs, cfg, Arc::new(keying)).await;

    let target = nodes[0].skip_graphs()[0].my_node().await.unwrap();
    let derived = lattice::dkg::ContentKeying::keys(&keying, b"abc", 1)[0];
    assert!(nodes[0].send_storage_request(&target, b"abc", derived).await);
    assert!(
        !nodes[0]
            .send_storage_request(&target, b"abc", derived.wrapping_add(1))
            .await
    );
}

#[tokio::test]
async fn malicious_responder_contributes_nothing() {
    let nodes = build_dkg_nodes(&two_node_specs(1), config(1, 1), Arc::new(Sha1Keying)).await;
    join_dkg(&nodes).await;

    let triplet = Triplet::new(b"abcdefg".as_slice(), b"b".as_slice(), b"c".as_slice());
    nodes[0]
        .on_new_triplets_generated(&Content::new(b"abcdefg".to_vec(), Vec::new()), vec![triplet])
        .await;
    settle().await;
    assert_eq!(nodes[1].knowledge_graph_edges().await, 1);

    // The replica holder answers triplet requests with an empty batch.
    nodes[1].set_malicious(true);
    let triplets = nodes[0].search_edges(b"abcdefg").await;
    assert!(triplets.is_empty());
}

// =============================================================================
// DOUBLE REPLICATION
// =============================================================================

const FOUR_NODES: &[(u32, &[u8])] = &[
    (99, &[0, 0, 0, 0]),
    (21, &[1, 0, 0, 0]),
    (33, &[0, 1, 0, 0]),
    (36, &[1, 1, 0, 0]),
];

fn four_node_specs(skip_graphs: usize) -> Vec<(u32, Vec<Vec<u8>>)> {
    FOUR_NODES
        .iter()
        .map(|(key, mv)| (*key, vec![mv.to_vec(); skip_graphs]))
        .collect()
}

async fn assert_double_replication_round_trip(skip_graphs: usize) {
    let nodes = build_dkg_nodes(
        &four_node_specs(skip_graphs),
        config(2, skip_graphs),
        Arc::new(FixedKeying(vec![20, 50])),
    )
    .await;
    join_dkg(&nodes).await;

    let triplet = Triplet::new(b"abcdefg".as_slice(), b"b".as_slice(), b"c".as_slice());
    nodes[0]
        .on_new_triplets_generated(&Content::new(b"abcdefg".to_vec(), Vec::new()), vec![triplet])
        .await;
    settle().await;

    // Keys 20 and 50: node 21 takes the low replica, node 36 the high one.
    let mut holders = 0;
    for node in &nodes {
        if node.knowledge_graph_edges().await == 1 {
            holders += 1;
        }
    }
    assert_eq!(holders, 2);

    let triplets = nodes[0].search_edges(b"abcdefg").await;
    assert_eq!(triplets.len(), 1);
}

#[tokio::test]
async fn store_and_search_two_replicas() {
    assert_double_replication_round_trip(1).await;
}

#[tokio::test]
async fn store_and_search_two_replicas_two_skip_graphs() {
    assert_double_replication_round_trip(2).await;
}

#[tokio::test]
async fn search_survives_replica_holder_leaving() {
    let nodes = build_dkg_nodes(
        &four_node_specs(1),
        config(2, 1),
        Arc::new(FixedKeying(vec![20, 50])),
    )
    .await;
    join_dkg(&nodes).await;

    let triplet = Triplet::new(b"abcdefg".as_slice(), b"b".as_slice(), b"c".as_slice());
    nodes[0]
        .on_new_triplets_generated(&Content::new(b"abcdefg".to_vec(), Vec::new()), vec![triplet])
        .await;
    settle().await;

    // Node 33 holds no replica; its departure must not disturb retrieval.
    let n33 = dkg_node_with_key(&nodes, 33).await;
    assert!(n33.skip_graphs()[0].leave().await.unwrap());

    let n21 = dkg_node_with_key(&nodes, 21).await;
    let n36 = dkg_node_with_key(&nodes, 36).await;
    assert_eq!(
        n21.skip_graphs()[0]
            .neighbour(0, Direction::Right)
            .await
            .unwrap()
            .key,
        36
    );
    assert_eq!(
        n36.skip_graphs()[0]
            .neighbour(0, Direction::Left)
            .await
            .unwrap()
            .key,
        21
    );

    let triplets = nodes[0].search_edges(b"abcdefg").await;
    assert_eq!(triplets.len(), 1);
}

// =============================================================================
// RULE ENGINE PIPELINE
// =============================================================================

#[tokio::test]
async fn rule_engine_output_is_replicated() {
    let nodes = build_dkg_nodes(&two_node_specs(1), config(1, 1), Arc::new(Sha1Keying)).await;
    join_dkg(&nodes).await;

    nodes[0]
        .add_content(Content::new(b"ab".to_vec(), Vec::new()))
        .await;
    nodes[0]
        .start_rule_engine(Some(Duration::from_millis(50)))
        .await;
    tokio::time::sleep(Duration::from_millis(800)).await;

    // The dummy rule produced one triplet; exactly one node holds it.
    let mut total = 0;
    for node in &nodes {
        total += node.knowledge_graph_edges().await;
    }
    assert_eq!(total, 1);
}
