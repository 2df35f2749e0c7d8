//! Coordination state backing one user-level edge search.
//!
//! All `skip graphs x replication keys` searches launch at once; each
//! completed search may trigger one triplet fetch per distinct responding
//! node. The first non-empty triplet list wins; when everything finishes
//! without a winner the result resolves empty.

use crate::dkg::knowledge_graph::Triplet;
use crate::skipgraph::Key;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

pub struct EdgeSearchCache {
    content_hash: Vec<u8>,
    state: Mutex<State>,
}

struct State {
    /// Searches still in flight, keyed by `(skip graph index, key)`.
    sg_searches: HashSet<(usize, Key)>,
    search_started: HashMap<(usize, Key), Instant>,
    search_times: HashMap<(usize, Key), Duration>,
    /// Which search first surfaced a responding node, for latency accounting.
    node_key_to_search: HashMap<Key, (usize, Key)>,
    pending_triplets: HashMap<Key, Instant>,
    completed_triplets: HashSet<Key>,
    /// Winning-path latency: `(search time, fetch time)`.
    latency: Option<(Duration, Duration)>,
    result_tx: Option<oneshot::Sender<Vec<Triplet>>>,
}

impl EdgeSearchCache {
    pub fn new(
        content_hash: Vec<u8>,
        searches: &[(usize, Key)],
        result_tx: oneshot::Sender<Vec<Triplet>>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            content_hash,
            state: Mutex::new(State {
                sg_searches: searches.iter().copied().collect(),
                search_started: searches.iter().map(|&s| (s, now)).collect(),
                search_times: HashMap::new(),
                node_key_to_search: HashMap::new(),
                pending_triplets: HashMap::new(),
                completed_triplets: HashSet::new(),
                latency: None,
                result_tx: Some(result_tx),
            }),
        })
    }

    pub fn content_hash(&self) -> &[u8] {
        &self.content_hash
    }

    /// Record a finished skip-graph search. Returns true when the caller
    /// should fetch triplets from the responding node: the node has not been
    /// queried yet by any sibling search.
    pub fn on_search_complete(&self, sg_ind: usize, key: Key, node_key: Option<Key>) -> bool {
        let mut state = self.state.lock().unwrap();
        state.sg_searches.remove(&(sg_ind, key));
        if let Some(started) = state.search_started.get(&(sg_ind, key)).copied() {
            state.search_times.insert((sg_ind, key), started.elapsed());
        }

        let fetch = match node_key {
            None => false,
            Some(node_key) => {
                state
                    .node_key_to_search
                    .entry(node_key)
                    .or_insert((sg_ind, key));
                if state.pending_triplets.contains_key(&node_key)
                    || state.completed_triplets.contains(&node_key)
                {
                    false
                } else {
                    state.pending_triplets.insert(node_key, Instant::now());
                    true
                }
            }
        };
        if !fetch {
            Self::check_finished(&mut state);
        }
        fetch
    }

    /// Record a finished triplet fetch. A non-empty list resolves the result
    /// if it is still open (first wins) and pins the winning-path latency.
    pub fn on_triplets_complete(&self, node_key: Key, triplets: Option<Vec<Triplet>>) {
        let mut state = self.state.lock().unwrap();
        let fetch_started = state.pending_triplets.remove(&node_key);
        state.completed_triplets.insert(node_key);

        if let Some(triplets) = triplets {
            if !triplets.is_empty() && state.result_tx.is_some() {
                let fetch_time = fetch_started.map(|s| s.elapsed()).unwrap_or_default();
                let search_time = state
                    .node_key_to_search
                    .get(&node_key)
                    .and_then(|search| state.search_times.get(search))
                    .copied()
                    .unwrap_or_default();
                state.latency = Some((search_time, fetch_time));
                if let Some(tx) = state.result_tx.take() {
                    tx.send(triplets).ok();
                }
            }
        }
        Self::check_finished(&mut state);
    }

    /// Backstop for the cache-level timeout: resolve empty, once.
    pub fn resolve_empty(&self) {
        if let Some(tx) = self.state.lock().unwrap().result_tx.take() {
            tx.send(Vec::new()).ok();
        }
    }

    pub fn latency(&self) -> Option<(Duration, Duration)> {
        self.state.lock().unwrap().latency
    }

    fn check_finished(state: &mut State) {
        if state.sg_searches.is_empty() && state.pending_triplets.is_empty() {
            if let Some(tx) = state.result_tx.take() {
                tx.send(Vec::new()).ok();
            }
        }
    }
}
