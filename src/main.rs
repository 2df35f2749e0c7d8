//! Lattice node binary: boots one DKG node with its co-resident skip graphs
//! over UDP. Peer discovery is not part of this crate, so the node runs
//! standalone; a harness that knows peer descriptors drives joins.

use clap::Parser;
use lattice::dkg::rules::{EthereumBlockRule, EthereumTransactionRule};
use lattice::dkg::RuleRegistry;
use lattice::{Content, DkgConfig, DkgNode, Sha1Keying, UdpEndpoint};
use serde_json::Value;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "lattice", version, about = "Lattice: decentralized knowledge graph node")]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:9800")]
    listen: SocketAddrV4,

    /// Number of co-resident skip graphs used for parallel lookup
    #[arg(long, default_value_t = 1)]
    skip_graphs: usize,

    /// Replicas per content item
    #[arg(short, long, default_value_t = 2)]
    replication_factor: usize,

    /// Neighbours retained per routing-table side and level
    #[arg(long, default_value_t = lattice::skipgraph::routing_table::DEFAULT_NB_SIZE)]
    nb_size: usize,

    /// Membership-vector length (skip-graph height bound)
    #[arg(long, default_value_t = lattice::skipgraph::membership::DEFAULT_LENGTH)]
    mv_length: usize,

    /// Accept storage requests without checking key derivation
    #[arg(long)]
    no_verify_key: bool,

    /// Newline-delimited JSON file of Ethereum blocks to index
    #[arg(long)]
    blocks_file: Option<PathBuf>,

    /// Fault injection: poison searches with ourselves
    #[arg(long)]
    malicious: bool,

    /// Fault injection: silently drop all incoming messages
    #[arg(long)]
    offline: bool,
}

fn load_blocks(path: &PathBuf) -> Vec<Content> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!("could not read blocks file {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    let mut contents = Vec::new();
    for line in raw.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(block) = serde_json::from_str::<Value>(line) else {
            warn!("skipping malformed block line");
            continue;
        };
        let Some(hash) = block.get("hash").and_then(Value::as_str) else {
            continue;
        };
        let Ok(identifier) = hex::decode(hash.trim_start_matches("0x")) else {
            continue;
        };
        contents.push(Content::new(identifier, line.as_bytes().to_vec()));
    }
    contents
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lattice=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    info!("Lattice v{} starting on {}", VERSION, args.listen);
    info!(
        "skip graphs: {} | replication factor: {} | nb size: {}",
        args.skip_graphs, args.replication_factor, args.nb_size
    );

    let (endpoint, deliveries) = match UdpEndpoint::bind(args.listen).await {
        Ok(bound) => bound,
        Err(e) => {
            error!("failed to bind {}: {}", args.listen, e);
            return;
        }
    };

    let mut registry = RuleRegistry::new();
    registry.add_rule(Arc::new(EthereumBlockRule));
    registry.add_rule(Arc::new(EthereumTransactionRule));

    let config = DkgConfig {
        replication_factor: args.replication_factor,
        skip_graphs: args.skip_graphs,
        nb_size: args.nb_size,
        mv_length: args.mv_length,
        should_verify_key: !args.no_verify_key,
        is_malicious: args.malicious,
        is_offline: args.offline,
    };
    let node = DkgNode::new(endpoint, config, Arc::new(registry), Arc::new(Sha1Keying));
    node.initialize_random().await;
    node.spawn_dispatcher(deliveries);

    if let Some(path) = &args.blocks_file {
        let blocks = load_blocks(path);
        info!("queueing {} blocks from {}", blocks.len(), path.display());
        for content in blocks {
            node.add_content(content).await;
        }
    }

    node.start_rule_engine(None).await;

    // Status printer
    let status_node = node.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let edges = status_node.knowledge_graph_edges().await;
            let key = status_node.sg_key().await;
            info!("status: sg key {:?} | kg edges {}", key, edges);
        }
    });

    info!("lattice node running, waiting for peers...");
    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    node.unload().await;
}
