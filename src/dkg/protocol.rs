//! DKG node: hosts one DKG community and its co-resident skip graphs,
//! replicates freshly derived triplets to content-addressed positions, and
//! answers storage and triplet-fetch requests.

use crate::cache::spawn_timeout;
use crate::dkg::cache::{DkgCache, DkgKind, DkgPending};
use crate::dkg::content::{Content, ContentKeying, ContentStore};
use crate::dkg::edge_search::EdgeSearchCache;
use crate::dkg::engine::{EngineEvent, RuleEngine, DEFAULT_PROCESS_INTERVAL};
use crate::dkg::knowledge_graph::{KnowledgeGraph, Triplet};
use crate::dkg::payload::{encode_triplets, decode_triplets, BulkInfo, DkgMessage};
use crate::dkg::rules::RuleRegistry;
use crate::skipgraph::membership::MembershipVector;
use crate::skipgraph::node::{short_id, SgNode};
use crate::skipgraph::routing_table::DEFAULT_NB_SIZE;
use crate::skipgraph::{Direction, Key, SkipGraphNode};
use crate::transport::{skip_graph_channel, Delivery, Endpoint, CHANNEL_DKG};
use rand::seq::SliceRandom;
use rand::RngCore;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DkgConfig {
    /// Keys per content identifier, hence replica count.
    pub replication_factor: usize,
    /// Co-resident skip graphs used for parallel lookup.
    pub skip_graphs: usize,
    /// Neighbours retained per side per routing-table level.
    pub nb_size: usize,
    /// Membership-vector length, bounding skip-graph height.
    pub mv_length: usize,
    /// Reject storage requests whose key is not content-hash-derived.
    pub should_verify_key: bool,
    pub is_malicious: bool,
    pub is_offline: bool,
}

impl Default for DkgConfig {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            skip_graphs: 1,
            nb_size: DEFAULT_NB_SIZE,
            mv_length: crate::skipgraph::membership::DEFAULT_LENGTH,
            should_verify_key: true,
            is_malicious: false,
            is_offline: false,
        }
    }
}

pub struct DkgNode {
    endpoint: Arc<dyn Endpoint>,
    public_key: Vec<u8>,
    config: DkgConfig,
    keying: Arc<dyn ContentKeying>,
    skip_graphs: Vec<Arc<SkipGraphNode>>,
    knowledge_graph: Mutex<KnowledgeGraph>,
    content_store: Mutex<ContentStore>,
    engine: RuleEngine,
    engine_events: StdMutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    cache: Arc<DkgCache>,
    edge_search_latencies: Mutex<Vec<(Duration, Duration)>>,
    is_malicious: AtomicBool,
    is_offline: AtomicBool,
}

impl DkgNode {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        config: DkgConfig,
        registry: Arc<RuleRegistry>,
        keying: Arc<dyn ContentKeying>,
    ) -> Arc<Self> {
        let mut public_key = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut public_key);

        let skip_graphs = (0..config.skip_graphs.max(1))
            .map(|i| {
                SkipGraphNode::new(
                    endpoint.clone(),
                    skip_graph_channel(i),
                    public_key.clone(),
                    config.nb_size,
                )
            })
            .collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let node = Arc::new(Self {
            endpoint,
            is_malicious: AtomicBool::new(config.is_malicious),
            is_offline: AtomicBool::new(config.is_offline),
            config,
            keying,
            skip_graphs,
            knowledge_graph: Mutex::new(KnowledgeGraph::new()),
            content_store: Mutex::new(ContentStore::new()),
            engine: RuleEngine::new(registry, events_tx),
            engine_events: StdMutex::new(Some(events_rx)),
            cache: Arc::new(DkgCache::new()),
            edge_search_latencies: Mutex::new(Vec::new()),
            public_key,
        });
        info!("dkg node started, short id {}", node.short_id());
        node
    }

    pub fn short_id(&self) -> String {
        short_id(&self.public_key)
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.endpoint.local_addr()
    }

    pub fn skip_graphs(&self) -> &[Arc<SkipGraphNode>] {
        &self.skip_graphs
    }

    pub fn set_offline(&self, offline: bool) {
        self.is_offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_malicious(&self, malicious: bool) {
        self.is_malicious.store(malicious, Ordering::SeqCst);
    }

    /// Give every co-resident skip graph a fresh key and membership vector.
    pub async fn initialize_random(&self) {
        for sg in &self.skip_graphs {
            sg.initialize_routing_table(
                rand::random(),
                MembershipVector::random(self.config.mv_length),
            )
            .await;
        }
    }

    /// Key of the first skip graph; storage decisions are made against it.
    pub async fn sg_key(&self) -> Option<Key> {
        self.skip_graphs[0].key().await
    }

    pub async fn knowledge_graph_edges(&self) -> usize {
        self.knowledge_graph.lock().await.num_edges()
    }

    pub async fn add_local_triplet(&self, triplet: Triplet) {
        self.knowledge_graph.lock().await.add_triplet(triplet);
    }

    pub async fn edge_search_latencies(&self) -> Vec<(Duration, Duration)> {
        self.edge_search_latencies.lock().await.clone()
    }

    /// Store a content item and queue it for rule processing.
    pub async fn add_content(&self, content: Content) {
        self.content_store.lock().await.add_content(content.clone());
        self.engine.enqueue(content).await;
    }

    /// Start the rule engine and consume its events.
    pub async fn start_rule_engine(self: &Arc<Self>, interval: Option<Duration>) {
        let seed = self.content_store.lock().await.all_content();
        self.engine
            .start(seed, interval.unwrap_or(DEFAULT_PROCESS_INTERVAL))
            .await;

        let Some(mut events) = self.engine_events.lock().unwrap().take() else {
            return;
        };
        let node = self.clone();
        tokio::spawn(async move {
            while let Some((content, triplets)) = events.recv().await {
                node.on_new_triplets_generated(&content, triplets).await;
            }
        });
    }

    /// Route deliveries to the DKG handlers and the co-resident skip graphs.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                match delivery {
                    Delivery::Packet { from, data } => {
                        let Some(&channel) = data.first() else { continue };
                        if channel == CHANNEL_DKG {
                            let node = node.clone();
                            tokio::spawn(async move {
                                node.handle_packet(from, &data[1..]).await;
                            });
                        } else if let Some(sg) =
                            node.skip_graphs.get((channel - 1) as usize).cloned()
                        {
                            tokio::spawn(async move {
                                sg.handle_packet(from, &data[1..]).await;
                            });
                        }
                    }
                    Delivery::Bulk { from, info, data } => {
                        let node = node.clone();
                        tokio::spawn(async move {
                            node.on_bulk(from, info, data).await;
                        });
                    }
                }
            }
        })
    }

    fn send_to(&self, to: SocketAddrV4, msg: &DkgMessage) {
        match msg.encode() {
            Ok(encoded) => {
                let mut frame = Vec::with_capacity(1 + encoded.len());
                frame.push(CHANNEL_DKG);
                frame.extend_from_slice(&encoded);
                self.endpoint.send(to, frame);
            }
            Err(e) => warn!("failed to encode {} message: {}", msg.name(), e),
        }
    }

    pub async fn handle_packet(self: &Arc<Self>, from: SocketAddrV4, data: &[u8]) {
        if self.is_offline.load(Ordering::SeqCst) {
            return;
        }
        let msg = match DkgMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("node {} dropping packet from {}: {}", self.short_id(), from, e);
                return;
            }
        };
        match msg {
            DkgMessage::StorageRequest {
                identifier,
                content_identifier,
                key,
            } => {
                self.on_storage_request(from, identifier, content_identifier, key)
                    .await
            }
            DkgMessage::StorageResponse {
                identifier,
                accepted,
            } => self.on_storage_response(identifier, accepted).await,
            DkgMessage::TripletsRequest {
                identifier,
                content,
            } => self.on_triplets_request(from, identifier, content).await,
        }
    }

    // =========================================================================
    // REPLICATED STORAGE
    // =========================================================================

    /// The rule engine produced triplets for `content`: place one replica per
    /// derived key, either locally or through a storage request plus bulk
    /// transfer of the batch.
    pub async fn on_new_triplets_generated(&self, content: &Content, triplets: Vec<Triplet>) {
        if triplets.is_empty() {
            info!("content generated no triplets - not sending storage requests");
            return;
        }

        let keys = self
            .keying
            .keys(&content.identifier, self.config.replication_factor);
        for ind in 0..self.config.replication_factor.min(keys.len()) {
            let mut target_nodes = Vec::new();
            for sg in &self.skip_graphs {
                match sg.search(keys[ind], None).await {
                    Ok(Some(node)) => target_nodes.push(node),
                    Ok(None) => {}
                    Err(e) => warn!("storage search failed: {}", e),
                }
            }
            let Some(target) = target_nodes.into_iter().next() else {
                warn!(
                    "search for node with key {} returned nothing - bailing out",
                    keys[ind]
                );
                return;
            };

            if Some(target.key) == self.sg_key().await {
                // We are responsible for this replica ourselves.
                let mut kg = self.knowledge_graph.lock().await;
                for triplet in &triplets {
                    kg.add_triplet(triplet.clone());
                }
                continue;
            }

            let accepted = self
                .send_storage_request(&target, &content.identifier, keys[ind])
                .await;
            if !accepted {
                warn!(
                    "peer {} refused storage request for key {}",
                    target.short_id(),
                    keys[ind]
                );
                continue;
            }
            match encode_triplets(&triplets) {
                Ok(body) => {
                    let info = BulkInfo::store(&content.identifier).encode();
                    self.endpoint.send_bulk(target.address, info, body);
                }
                Err(e) => warn!("failed to serialize triplet batch: {}", e),
            }
        }
    }

    pub async fn send_storage_request(
        &self,
        target: &SgNode,
        content_identifier: &[u8],
        key: Key,
    ) -> bool {
        let (tx, rx) = oneshot::channel();
        let identifier = self.cache.add(DkgKind::Store, DkgPending::Store { tx }).await;
        spawn_timeout(
            self.cache.clone(),
            DkgKind::Store,
            identifier,
            DkgKind::Store.timeout(),
        );
        self.send_to(
            target.address,
            &DkgMessage::StorageRequest {
                identifier,
                content_identifier: content_identifier.to_vec(),
                key,
            },
        );
        rx.await.unwrap_or(false)
    }

    /// Are we the closest live predecessor for this key? Checked against the
    /// first skip graph's immediate level-0 neighbours.
    pub async fn should_store(&self, content_identifier: &[u8], content_key: Key) -> bool {
        if self.config.should_verify_key
            && !self
                .keying
                .verify_key(content_identifier, content_key, self.config.replication_factor)
        {
            warn!(
                "key {} not derived from content with id {}",
                content_key,
                hex::encode(content_identifier)
            );
            return false;
        }

        let sg = &self.skip_graphs[0];
        if let Some(ln) = sg.neighbour(0, Direction::Left).await {
            if content_key <= ln.key {
                // A neighbour to the left should store this.
                return false;
            }
        }
        if let Some(rn) = sg.neighbour(0, Direction::Right).await {
            if content_key >= rn.key {
                // A neighbour to the right should store this.
                return false;
            }
        }
        true
    }

    async fn on_storage_request(
        &self,
        from: SocketAddrV4,
        identifier: u32,
        content_identifier: Vec<u8>,
        key: Key,
    ) {
        info!(
            "node {} received storage request from {} for key {}",
            self.short_id(),
            from,
            key
        );
        let accepted = self.should_store(&content_identifier, key).await;
        self.send_to(
            from,
            &DkgMessage::StorageResponse {
                identifier,
                accepted,
            },
        );
    }

    async fn on_storage_response(&self, identifier: u32, accepted: bool) {
        info!(
            "node {} received storage response (accepted: {})",
            self.short_id(),
            accepted
        );
        let Some(pending) = self.cache.pop(DkgKind::Store, identifier).await else {
            warn!("store cache with id {} not found", identifier);
            return;
        };
        if let DkgPending::Store { tx } = pending {
            tx.send(accepted).ok();
        }
    }

    // =========================================================================
    // TRIPLET FETCH
    // =========================================================================

    pub async fn request_triplets(
        &self,
        target: &SgNode,
        content_hash: &[u8],
    ) -> Option<Vec<Triplet>> {
        let (tx, rx) = oneshot::channel();
        let identifier = self
            .cache
            .add(DkgKind::Triplets, DkgPending::Triplets { tx })
            .await;
        spawn_timeout(
            self.cache.clone(),
            DkgKind::Triplets,
            identifier,
            DkgKind::Triplets.timeout(),
        );
        self.send_to(
            target.address,
            &DkgMessage::TripletsRequest {
                identifier,
                content: content_hash.to_vec(),
            },
        );
        rx.await.unwrap_or(None)
    }

    async fn on_triplets_request(&self, from: SocketAddrV4, identifier: u32, content: Vec<u8>) {
        let triplets = if self.is_malicious.load(Ordering::SeqCst) {
            warn!("node {} malicious - responding with no triplets", self.short_id());
            Vec::new()
        } else {
            self.knowledge_graph.lock().await.triplets_of_node(&content)
        };
        match encode_triplets(&triplets) {
            Ok(body) => {
                let info = BulkInfo::search_response(identifier, &content).encode();
                self.endpoint.send_bulk(from, info, body);
            }
            Err(e) => warn!("failed to serialize triplet batch: {}", e),
        }
    }

    /// A bulk transfer arrived: either a replica to store or the response to
    /// one of our triplet requests.
    pub async fn on_bulk(&self, from: SocketAddrV4, info: Vec<u8>, data: Vec<u8>) {
        if self.is_offline.load(Ordering::SeqCst) {
            return;
        }
        let Some(info) = BulkInfo::decode(&info) else {
            warn!("node {} dropping bulk transfer from {}: bad info header", self.short_id(), from);
            return;
        };
        debug!(
            "node {} received bulk transfer ({}, cid {})",
            self.short_id(),
            info.kind,
            info.cid
        );
        match info.kind.as_str() {
            "store" => match decode_triplets(&data) {
                Ok(triplets) => {
                    let mut kg = self.knowledge_graph.lock().await;
                    for triplet in triplets {
                        kg.add_triplet(triplet);
                    }
                }
                Err(e) => warn!("dropping malformed triplet batch: {}", e),
            },
            "search_response" => {
                let Some(identifier) = info.id else {
                    warn!("search_response bulk transfer without id");
                    return;
                };
                let Some(pending) = self.cache.pop(DkgKind::Triplets, identifier).await else {
                    warn!("triplets cache with id {} not found", identifier);
                    return;
                };
                if let DkgPending::Triplets { tx } = pending {
                    match decode_triplets(&data) {
                        Ok(triplets) => {
                            tx.send(Some(triplets)).ok();
                        }
                        Err(e) => {
                            warn!("dropping malformed triplet batch: {}", e);
                            tx.send(None).ok();
                        }
                    }
                }
            }
            other => warn!("unknown bulk transfer type {:?}", other),
        }
    }

    // =========================================================================
    // EDGE SEARCH
    // =========================================================================

    /// Fetch the edges around the node labelled `content_hash` from the
    /// network. Always completes: partial failures contribute nothing and a
    /// cache-level timeout backstops the whole call.
    pub async fn search_edges(self: &Arc<Self>, content_hash: &[u8]) -> Vec<Triplet> {
        let mut keys = self
            .keying
            .keys(content_hash, self.config.replication_factor);
        keys.shuffle(&mut rand::thread_rng());

        let mut searches = Vec::new();
        for sg_ind in 0..self.skip_graphs.len() {
            for &key in &keys {
                searches.push((sg_ind, key));
            }
        }

        let (result_tx, result_rx) = oneshot::channel();
        let search_cache = EdgeSearchCache::new(content_hash.to_vec(), &searches, result_tx);
        let number = self
            .cache
            .add(
                DkgKind::EdgeSearch,
                DkgPending::EdgeSearch {
                    search: search_cache.clone(),
                },
            )
            .await;
        spawn_timeout(
            self.cache.clone(),
            DkgKind::EdgeSearch,
            number,
            DkgKind::EdgeSearch.timeout(),
        );

        info!(
            "node {} initiated {} parallel edge searches",
            self.short_id(),
            searches.len()
        );
        for (sg_ind, key) in searches {
            let node = self.clone();
            let search_cache = search_cache.clone();
            tokio::spawn(async move {
                node.drive_edge_search(search_cache, sg_ind, key).await;
            });
        }

        let result = result_rx.await.unwrap_or_default();
        if let Some(latency) = search_cache.latency() {
            self.edge_search_latencies.lock().await.push(latency);
        }
        let _ = self.cache.pop(DkgKind::EdgeSearch, number).await;
        result
    }

    /// One search lane: skip-graph lookup, then a triplet fetch if this lane
    /// was the first to surface the responding node.
    async fn drive_edge_search(
        self: Arc<Self>,
        search_cache: Arc<EdgeSearchCache>,
        sg_ind: usize,
        key: Key,
    ) {
        let found = match self.skip_graphs[sg_ind].search(key, None).await {
            Ok(found) => found,
            Err(e) => {
                warn!("edge search lane failed: {}", e);
                None
            }
        };
        let node_key = found.as_ref().map(|n| n.key);
        let should_fetch = search_cache.on_search_complete(sg_ind, key, node_key);
        let Some(node) = found.filter(|_| should_fetch) else {
            return;
        };
        let triplets = if Some(node.key) == self.sg_key().await {
            // Serve ourselves synchronously from the local graph.
            Some(
                self.knowledge_graph
                    .lock()
                    .await
                    .triplets_of_node(search_cache.content_hash()),
            )
        } else {
            self.request_triplets(&node, search_cache.content_hash()).await
        };
        search_cache.on_triplets_complete(node.key, triplets);
    }

    /// Tear down the skip graphs, the request cache, and the rule engine.
    pub async fn unload(&self) {
        for sg in &self.skip_graphs {
            sg.unload().await;
        }
        self.cache.shutdown().await;
        self.engine.shutdown();
    }
}
