//! Pending-request bookkeeping for the skip-graph protocol.
//!
//! Each kind resolves its waiting completion with a sentinel when its
//! timeout fires; the forward-search kind instead re-enters the routing
//! decision to steer around the silent hop.

use crate::cache::{Expire, RequestCache};
use crate::skipgraph::node::SgNode;
use crate::skipgraph::payload::SearchPayload;
use crate::skipgraph::protocol::SkipGraphNode;
use std::net::SocketAddrV4;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// An unresolved search gives up after this long.
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(20);

/// A forwarded hop is declared failed after this long, triggering repair.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(1);

/// Bounded default for the remaining request kinds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SgKind {
    Search,
    ForwardSearch,
    Neighbour,
    Link,
    Buddy,
    Delete,
    SetNeighbourNil,
    FindNewNeighbour,
}

impl SgKind {
    pub fn timeout(self) -> Duration {
        match self {
            SgKind::Search => SEARCH_TIMEOUT,
            SgKind::ForwardSearch => FORWARD_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// A hop in flight: enough to re-run the routing decision if the receiver
/// stays silent. `payload` is absent only for the introducer bootstrap hop,
/// which has no local routing decision to re-run.
pub struct ForwardEntry {
    pub node: Weak<SkipGraphNode>,
    pub payload: Option<SearchPayload>,
    pub from: SocketAddrV4,
    pub to_node: SgNode,
}

pub enum SgPending {
    Search {
        tx: oneshot::Sender<Option<SgNode>>,
        started: Instant,
    },
    ForwardSearch(Box<ForwardEntry>),
    Neighbour {
        tx: oneshot::Sender<(bool, SgNode)>,
    },
    Link {
        tx: oneshot::Sender<Option<SgNode>>,
    },
    Buddy {
        tx: oneshot::Sender<Option<SgNode>>,
    },
    Delete {
        tx: oneshot::Sender<bool>,
    },
    SetNeighbourNil {
        tx: oneshot::Sender<bool>,
    },
    FindNewNeighbour {
        tx: oneshot::Sender<Option<SgNode>>,
    },
}

impl Expire for SgPending {
    fn expire(self) {
        match self {
            SgPending::Search { tx, .. } => {
                tx.send(None).ok();
            }
            SgPending::ForwardSearch(entry) => {
                if let Some(node) = entry.node.upgrade() {
                    tokio::spawn(async move {
                        node.on_search_forward_timeout(entry.payload, entry.from, entry.to_node)
                            .await;
                    });
                }
            }
            SgPending::Neighbour { tx } => {
                tx.send((false, SgNode::empty())).ok();
            }
            SgPending::Link { tx }
            | SgPending::Buddy { tx }
            | SgPending::FindNewNeighbour { tx } => {
                tx.send(None).ok();
            }
            SgPending::Delete { tx } | SgPending::SetNeighbourNil { tx } => {
                tx.send(false).ok();
            }
        }
    }
}

pub type SgCache = RequestCache<SgKind, SgPending>;
