//! Pending-request bookkeeping for the DKG overlay.

use crate::cache::{Expire, RequestCache};
use crate::dkg::edge_search::EdgeSearchCache;
use crate::dkg::knowledge_graph::Triplet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// A triplet fetch contributes nothing after this long.
pub const TRIPLETS_TIMEOUT: Duration = Duration::from_secs(5);

/// Hard ceiling on a whole edge search.
pub const EDGE_SEARCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Bounded default for storage round trips.
pub const STORE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DkgKind {
    Store,
    Triplets,
    EdgeSearch,
}

impl DkgKind {
    pub fn timeout(self) -> Duration {
        match self {
            DkgKind::Store => STORE_TIMEOUT,
            DkgKind::Triplets => TRIPLETS_TIMEOUT,
            DkgKind::EdgeSearch => EDGE_SEARCH_TIMEOUT,
        }
    }
}

pub enum DkgPending {
    Store {
        tx: oneshot::Sender<bool>,
    },
    Triplets {
        tx: oneshot::Sender<Option<Vec<Triplet>>>,
    },
    EdgeSearch {
        search: Arc<EdgeSearchCache>,
    },
}

impl Expire for DkgPending {
    fn expire(self) {
        match self {
            DkgPending::Store { tx } => {
                tx.send(false).ok();
            }
            DkgPending::Triplets { tx } => {
                tx.send(None).ok();
            }
            DkgPending::EdgeSearch { search } => search.resolve_empty(),
        }
    }
}

pub type DkgCache = RequestCache<DkgKind, DkgPending>;
