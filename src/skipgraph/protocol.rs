//! Skip-graph protocol engine: search, join, leave, and link repair over a
//! datagram endpoint.
//!
//! One instance owns one routing table and one request cache. Incoming
//! datagrams are decoded and handled in spawned tasks; every shared
//! structure sits behind its own mutex and no lock is held across an await.

use crate::cache::spawn_timeout;
use crate::skipgraph::cache::{ForwardEntry, SgCache, SgKind, SgPending};
use crate::skipgraph::membership::MembershipVector;
use crate::skipgraph::node::{short_id, SgNode};
use crate::skipgraph::payload::{SearchPayload, SgMessage};
use crate::skipgraph::routing_table::RoutingTable;
use crate::skipgraph::{Direction, Key};
use crate::transport::{Delivery, Endpoint};
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SkipGraphError {
    #[error("routing table not initialized")]
    RoutingTableNotInitialized,
}

/// Counters kept by the search originator side.
#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    /// Hop count of each completed search, as a histogram.
    pub hops: HashMap<u32, u32>,
    pub search_latencies: Vec<Duration>,
    pub join_latencies: Vec<Duration>,
    pub leave_latencies: Vec<Duration>,
}

pub struct SkipGraphNode {
    endpoint: Arc<dyn Endpoint>,
    /// Overlay channel stamped on every outgoing datagram.
    channel: u8,
    public_key: Vec<u8>,
    nb_size: usize,
    routing_table: Mutex<Option<RoutingTable>>,
    cache: Arc<SgCache>,
    stats: Mutex<SearchStats>,
    is_leaving: AtomicBool,
    is_offline: AtomicBool,
    is_malicious: AtomicBool,
}

enum RouteDecision {
    RespondSelf,
    Forward { to: SgNode, level: u32 },
}

impl SkipGraphNode {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        channel: u8,
        public_key: Vec<u8>,
        nb_size: usize,
    ) -> Arc<Self> {
        let node = Arc::new(Self {
            endpoint,
            channel,
            public_key,
            nb_size: nb_size.max(1),
            routing_table: Mutex::new(None),
            cache: Arc::new(SgCache::new()),
            stats: Mutex::new(SearchStats::default()),
            is_leaving: AtomicBool::new(false),
            is_offline: AtomicBool::new(false),
            is_malicious: AtomicBool::new(false),
        });
        info!("skip graph node initialized, short id {}", node.short_id());
        node
    }

    pub fn short_id(&self) -> String {
        short_id(&self.public_key)
    }

    pub fn local_addr(&self) -> SocketAddrV4 {
        self.endpoint.local_addr()
    }

    pub fn set_offline(&self, offline: bool) {
        self.is_offline.store(offline, Ordering::SeqCst);
    }

    pub fn set_malicious(&self, malicious: bool) {
        self.is_malicious.store(malicious, Ordering::SeqCst);
    }

    pub async fn initialize_routing_table(&self, key: Key, mv: MembershipVector) {
        info!(
            "node {} initializing routing table with key {} and mv {}",
            self.short_id(),
            key,
            mv
        );
        *self.routing_table.lock().await = Some(RoutingTable::new(key, mv, self.nb_size));
    }

    /// Own descriptor. Fails fast before `initialize_routing_table`.
    pub async fn my_node(&self) -> Result<SgNode, SkipGraphError> {
        let guard = self.routing_table.lock().await;
        let rt = guard
            .as_ref()
            .ok_or(SkipGraphError::RoutingTableNotInitialized)?;
        Ok(SgNode::new(
            self.endpoint.local_addr(),
            self.public_key.clone(),
            rt.key(),
            rt.mv().clone(),
        ))
    }

    pub async fn key(&self) -> Option<Key> {
        self.routing_table.lock().await.as_ref().map(|rt| rt.key())
    }

    /// Clone of the current routing table, for inspection.
    pub async fn routing_table(&self) -> Option<RoutingTable> {
        self.routing_table.lock().await.clone()
    }

    /// The immediate neighbour on a side, if any.
    pub async fn neighbour(&self, level: usize, side: Direction) -> Option<SgNode> {
        self.routing_table
            .lock()
            .await
            .as_ref()
            .and_then(|rt| rt.get(level, side).cloned())
    }

    pub async fn search_stats(&self) -> SearchStats {
        self.stats.lock().await.clone()
    }

    /// Consume deliveries from the endpoint; each packet on our overlay
    /// channel is handled in its own task so multi-step handlers can await
    /// nested replies without stalling the stream.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut deliveries: mpsc::UnboundedReceiver<Delivery>,
    ) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            while let Some(delivery) = deliveries.recv().await {
                if let Delivery::Packet { from, data } = delivery {
                    if data.first() == Some(&node.channel) {
                        let node = node.clone();
                        tokio::spawn(async move {
                            node.handle_packet(from, &data[1..]).await;
                        });
                    }
                }
            }
        })
    }

    fn send_to(&self, to: SocketAddrV4, msg: &SgMessage) {
        match msg.encode() {
            Ok(encoded) => {
                let mut frame = Vec::with_capacity(1 + encoded.len());
                frame.push(self.channel);
                frame.extend_from_slice(&encoded);
                self.endpoint.send(to, frame);
            }
            Err(e) => warn!("failed to encode {} message: {}", msg.name(), e),
        }
    }

    /// Decode and dispatch one datagram (overlay channel already stripped).
    pub async fn handle_packet(self: &Arc<Self>, from: SocketAddrV4, data: &[u8]) {
        if self.is_offline.load(Ordering::SeqCst) {
            return;
        }
        let msg = match SgMessage::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("node {} dropping packet from {}: {}", self.short_id(), from, e);
                return;
            }
        };
        match msg {
            SgMessage::Search(payload) => self.on_search_request(from, payload).await,
            SgMessage::SearchResponse {
                identifier,
                response,
                hops,
            } => self.on_search_response(identifier, response, hops).await,
            SgMessage::SearchIntermediateResponse { identifier, node } => {
                self.on_search_intermediate_response(identifier, node).await
            }
            SgMessage::NeighbourRequest {
                identifier,
                side,
                level,
            } => self.on_neighbour_request(from, identifier, side, level).await,
            SgMessage::NeighbourResponse {
                identifier,
                found,
                neighbour,
            } => self.on_neighbour_response(identifier, found, neighbour).await,
            SgMessage::GetLink {
                identifier,
                originator,
                side,
                level,
            } => self.on_get_link(identifier, originator, side, level).await,
            SgMessage::SetLink {
                identifier,
                new_neighbour,
                ..
            } => self.on_set_link(identifier, new_neighbour).await,
            SgMessage::Buddy {
                identifier,
                originator,
                level,
                val,
                side,
            } => self.on_buddy(identifier, originator, level, val, side).await,
            SgMessage::Delete {
                identifier,
                originator,
                level,
            } => self.on_delete(identifier, originator, level).await,
            SgMessage::NoNeighbour { identifier, level } => {
                self.on_no_neighbour(identifier, level).await
            }
            SgMessage::FindNewNeighbour {
                identifier,
                originator,
                level,
            } => self.on_find_new_neighbour(identifier, originator, level).await,
            SgMessage::FoundNewNeighbour {
                identifier,
                neighbour,
                ..
            } => self.on_found_new_neighbour(identifier, neighbour).await,
            SgMessage::ConfirmDelete { identifier, .. } => self.on_confirm_delete(identifier).await,
            SgMessage::SetNeighbourNil {
                identifier,
                originator,
                level,
            } => self.on_set_neighbour_nil(identifier, originator, level).await,
        }
    }

    // =========================================================================
    // SEARCH
    // =========================================================================

    /// Locate the node owning the greatest key at most `key` (or the smallest
    /// node when `key` precedes the whole order). Resolves `None` when the
    /// search times out. `introducer` bootstraps the first hop during a join.
    pub async fn search(
        self: &Arc<Self>,
        key: Key,
        introducer: Option<&SgNode>,
    ) -> Result<Option<SgNode>, SkipGraphError> {
        let my_node = self.my_node().await?;
        let height = self.routing_table.lock().await.as_ref().map(|rt| rt.height());
        let height = height.ok_or(SkipGraphError::RoutingTableNotInitialized)?;
        info!(
            "node {} (key {}) initiating search for key {}",
            self.short_id(),
            my_node.key,
            key
        );

        let (tx, rx) = oneshot::channel();
        let search_id = self
            .cache
            .add(
                SgKind::Search,
                SgPending::Search {
                    tx,
                    started: Instant::now(),
                },
            )
            .await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::Search,
            search_id,
            SgKind::Search.timeout(),
        );

        let start_level = (height - 1) as u32;
        if let Some(introducer) = introducer {
            let forward_id = self
                .cache
                .add(
                    SgKind::ForwardSearch,
                    SgPending::ForwardSearch(Box::new(ForwardEntry {
                        node: Arc::downgrade(self),
                        payload: None,
                        from: self.local_addr(),
                        to_node: introducer.clone(),
                    })),
                )
                .await;
            spawn_timeout(
                self.cache.clone(),
                SgKind::ForwardSearch,
                forward_id,
                SgKind::ForwardSearch.timeout(),
            );
            self.send_to(
                introducer.address,
                &SgMessage::Search(SearchPayload {
                    identifier: search_id,
                    forward_identifier: forward_id,
                    originator: my_node,
                    search_key: key,
                    level: start_level,
                    hops: 0,
                }),
            );
        } else {
            // A regular search enters the recursive routing through ourselves.
            let mut payload = SearchPayload {
                identifier: search_id,
                forward_identifier: 0,
                originator: my_node.clone(),
                search_key: key,
                level: start_level,
                hops: 0,
            };
            let forward_id = self
                .cache
                .add(
                    SgKind::ForwardSearch,
                    SgPending::ForwardSearch(Box::new(ForwardEntry {
                        node: Arc::downgrade(self),
                        payload: Some(payload.clone()),
                        from: self.local_addr(),
                        to_node: my_node,
                    })),
                )
                .await;
            spawn_timeout(
                self.cache.clone(),
                SgKind::ForwardSearch,
                forward_id,
                SgKind::ForwardSearch.timeout(),
            );
            payload.forward_identifier = forward_id;
            self.send_to(self.local_addr(), &SgMessage::Search(payload));
        }

        Ok(rx.await.unwrap_or(None))
    }

    async fn on_search_request(self: &Arc<Self>, from: SocketAddrV4, payload: SearchPayload) {
        info!(
            "node {} received search request from {} for key {} (level {}, id {}, fw id {})",
            self.short_id(),
            from,
            payload.search_key,
            payload.level,
            payload.identifier,
            payload.forward_identifier
        );
        self.handle_search_request(from, payload).await;
    }

    async fn handle_search_request(self: &Arc<Self>, from: SocketAddrV4, payload: SearchPayload) {
        let my_node = match self.my_node().await {
            Ok(node) => node,
            Err(e) => {
                warn!("node {} cannot route search: {}", self.short_id(), e);
                return;
            }
        };

        let decision = {
            let guard = self.routing_table.lock().await;
            let Some(rt) = guard.as_ref() else { return };
            if rt.key() == payload.search_key {
                RouteDecision::RespondSelf
            } else if rt.key() < payload.search_key {
                // Search to the right.
                let mut decision = RouteDecision::RespondSelf;
                let mut level = payload.level.min((rt.height() - 1) as u32) as i64;
                while level >= 0 {
                    if let Some(nb) =
                        rt.get_best(level as usize, Direction::Right, payload.search_key)
                    {
                        if nb.key <= payload.search_key {
                            decision = RouteDecision::Forward {
                                to: nb.clone(),
                                level: level as u32,
                            };
                            break;
                        }
                    }
                    level -= 1;
                }
                decision
            } else {
                // Search to the left.
                let mut decision = None;
                let mut level = payload.level.min((rt.height() - 1) as u32) as i64;
                while level >= 0 {
                    if let Some(nb) = rt.get_best(level as usize, Direction::Left, payload.search_key)
                    {
                        decision = Some(RouteDecision::Forward {
                            to: nb.clone(),
                            level: level as u32,
                        });
                        break;
                    }
                    level -= 1;
                }
                decision.unwrap_or_else(|| {
                    // Left search exhausted: hand the query to the immediate
                    // level-0 left neighbour when one exists.
                    match rt.get(0, Direction::Left) {
                        Some(ln) => RouteDecision::Forward {
                            to: ln.clone(),
                            level: 0,
                        },
                        None => RouteDecision::RespondSelf,
                    }
                })
            }
        };

        match decision {
            RouteDecision::RespondSelf => {
                // Last resort: we are the closest node this side of the key.
                // Caveat: with a missing right neighbour this may be returned
                // even though the key lies beyond us; callers re-validate
                // proximity where it matters.
                debug!(
                    "node {} (key {}) exhausted search - returning self",
                    self.short_id(),
                    my_node.key
                );
                self.send_to(
                    payload.originator.address,
                    &SgMessage::SearchResponse {
                        identifier: payload.identifier,
                        response: my_node,
                        hops: payload.hops,
                    },
                );
                self.send_to(
                    from,
                    &SgMessage::SearchIntermediateResponse {
                        identifier: payload.forward_identifier,
                        node: payload.originator.clone(),
                    },
                );
            }
            RouteDecision::Forward { to, level } => {
                self.forward_search(from, to, payload, level).await;
            }
        }
    }

    async fn forward_search(
        self: &Arc<Self>,
        from: SocketAddrV4,
        to_node: SgNode,
        received: SearchPayload,
        level: u32,
    ) {
        if self.is_malicious.load(Ordering::SeqCst) {
            // Poison the result with ourselves and stop routing.
            warn!(
                "node {} malicious - ending search with id {}",
                self.short_id(),
                received.identifier
            );
            if let Ok(my_node) = self.my_node().await {
                self.send_to(
                    received.originator.address,
                    &SgMessage::SearchResponse {
                        identifier: received.identifier,
                        response: my_node,
                        hops: received.hops + 1,
                    },
                );
            }
            self.send_to(
                from,
                &SgMessage::SearchIntermediateResponse {
                    identifier: received.forward_identifier,
                    node: to_node,
                },
            );
            return;
        }

        debug!(
            "node {} forwarding search for key {} to {} (key {}, level {})",
            self.short_id(),
            received.search_key,
            to_node.short_id(),
            to_node.key,
            level
        );

        let forward_id = self
            .cache
            .add(
                SgKind::ForwardSearch,
                SgPending::ForwardSearch(Box::new(ForwardEntry {
                    node: Arc::downgrade(self),
                    payload: Some(received.clone()),
                    from,
                    to_node: to_node.clone(),
                })),
            )
            .await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::ForwardSearch,
            forward_id,
            SgKind::ForwardSearch.timeout(),
        );

        self.send_to(
            to_node.address,
            &SgMessage::Search(SearchPayload {
                identifier: received.identifier,
                forward_identifier: forward_id,
                originator: received.originator.clone(),
                search_key: received.search_key,
                level,
                hops: received.hops + 1,
            }),
        );

        // Acknowledge the previous hop so it can drop its forward entry.
        self.send_to(
            from,
            &SgMessage::SearchIntermediateResponse {
                identifier: received.forward_identifier,
                node: to_node,
            },
        );
    }

    async fn on_search_response(&self, identifier: u32, response: SgNode, hops: u32) {
        info!(
            "node {} received search response (resulting key {}, hops {})",
            self.short_id(),
            response.key,
            hops
        );
        let Some(pending) = self.cache.pop(SgKind::Search, identifier).await else {
            warn!("search cache with id {} not found", identifier);
            return;
        };
        if let SgPending::Search { tx, started } = pending {
            let mut stats = self.stats.lock().await;
            *stats.hops.entry(hops).or_insert(0) += 1;
            stats.search_latencies.push(started.elapsed());
            drop(stats);
            tx.send(Some(response)).ok();
        }
    }

    async fn on_search_intermediate_response(&self, identifier: u32, _node: SgNode) {
        debug!(
            "node {} received intermediate search response",
            self.short_id()
        );
        if self.cache.pop(SgKind::ForwardSearch, identifier).await.is_none() {
            warn!("forward-search cache with id {} not found", identifier);
        }
    }

    /// A forwarded hop stayed silent: evict it and re-run the routing
    /// decision from the stashed payload, as if the forward never happened.
    pub(crate) async fn on_search_forward_timeout(
        self: Arc<Self>,
        payload: Option<SearchPayload>,
        from: SocketAddrV4,
        to_node: SgNode,
    ) {
        warn!(
            "search forward timed out - peer {} with key {} failed",
            to_node.short_id(),
            to_node.key
        );
        if let Some(rt) = self.routing_table.lock().await.as_mut() {
            rt.remove_node(to_node.key);
        }
        if let Some(payload) = payload {
            self.handle_search_request(from, payload).await;
        }
    }

    // =========================================================================
    // JOIN
    // =========================================================================

    /// Query the immediate neighbour of a remote peer.
    pub async fn get_neighbour(
        &self,
        peer: SocketAddrV4,
        side: Direction,
        level: u32,
    ) -> (bool, SgNode) {
        info!(
            "node {} querying {} neighbour of {} at level {}",
            self.short_id(),
            side.name(),
            peer,
            level
        );
        let (tx, rx) = oneshot::channel();
        let identifier = self.cache.add(SgKind::Neighbour, SgPending::Neighbour { tx }).await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::Neighbour,
            identifier,
            SgKind::Neighbour.timeout(),
        );
        self.send_to(
            peer,
            &SgMessage::NeighbourRequest {
                identifier,
                side,
                level,
            },
        );
        rx.await.unwrap_or((false, SgNode::empty()))
    }

    async fn on_neighbour_request(
        &self,
        from: SocketAddrV4,
        identifier: u32,
        side: Direction,
        level: u32,
    ) {
        let guard = self.routing_table.lock().await;
        let Some(rt) = guard.as_ref() else {
            warn!("routing table not initialized - ignoring neighbour request");
            return;
        };
        let neighbour = if rt.height() < level as usize + 1 {
            None
        } else {
            rt.get(level as usize, side).cloned()
        };
        drop(guard);
        let response = match neighbour {
            Some(node) => SgMessage::NeighbourResponse {
                identifier,
                found: true,
                neighbour: node,
            },
            None => SgMessage::NeighbourResponse {
                identifier,
                found: false,
                neighbour: SgNode::empty(),
            },
        };
        self.send_to(from, &response);
    }

    async fn on_neighbour_response(&self, identifier: u32, found: bool, neighbour: SgNode) {
        let Some(pending) = self.cache.pop(SgKind::Neighbour, identifier).await else {
            warn!("neighbour cache with id {} not found", identifier);
            return;
        };
        if let SgPending::Neighbour { tx } = pending {
            tx.send((found, neighbour)).ok();
        }
    }

    /// Splice ourselves next to `node` on `side` at `level`; resolves with
    /// the confirmed neighbour once the remote end answers with a set-link.
    async fn get_link(&self, peer: SocketAddrV4, side: Direction, level: u32) -> Option<SgNode> {
        info!(
            "node {} sending get-link to {} ({}, level {})",
            self.short_id(),
            peer,
            side.name(),
            level
        );
        let my_node = self.my_node().await.ok()?;
        let (tx, rx) = oneshot::channel();
        let identifier = self.cache.add(SgKind::Link, SgPending::Link { tx }).await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::Link,
            identifier,
            SgKind::Link.timeout(),
        );
        self.send_to(
            peer,
            &SgMessage::GetLink {
                identifier,
                originator: my_node,
                side,
                level,
            },
        );
        rx.await.unwrap_or(None)
    }

    /// Linked-list insertion step, generalized per level: either hand the
    /// request on to a closer neighbour or accept the originator next to us.
    async fn change_neighbour(&self, identifier: u32, node: SgNode, side: Direction, level: u32) {
        info!(
            "node {} changing {} neighbour at level {} to {}",
            self.short_id(),
            side.name(),
            level,
            node
        );
        let Ok(my_node) = self.my_node().await else {
            return;
        };
        let forward_target = {
            let mut guard = self.routing_table.lock().await;
            let Some(rt) = guard.as_mut() else { return };
            let current = rt.get(level as usize, side).cloned();
            let forward = match (&current, side) {
                (Some(nb), Direction::Right) if nb.key < node.key => Some(nb.clone()),
                (Some(nb), Direction::Left) if nb.key > node.key => Some(nb.clone()),
                _ => None,
            };
            let accepts = match &current {
                None => true,
                Some(nb) => match side {
                    Direction::Right => nb.key > node.key,
                    Direction::Left => nb.key < node.key,
                },
            };
            if accepts {
                rt.set(level as usize, side, Some(node.clone()));
            }
            forward
        };

        match forward_target {
            Some(nb) => self.send_to(
                nb.address,
                &SgMessage::GetLink {
                    identifier,
                    originator: node,
                    side,
                    level,
                },
            ),
            None => self.send_to(
                node.address,
                &SgMessage::SetLink {
                    identifier,
                    new_neighbour: my_node,
                    level,
                },
            ),
        }
    }

    async fn on_get_link(&self, identifier: u32, originator: SgNode, side: Direction, level: u32) {
        self.change_neighbour(identifier, originator, side, level).await;
    }

    async fn on_set_link(&self, identifier: u32, new_neighbour: SgNode) {
        debug!("node {} received set-link response", self.short_id());
        let pending = match self.cache.pop(SgKind::Link, identifier).await {
            Some(p) => Some(p),
            None => self.cache.pop(SgKind::Buddy, identifier).await,
        };
        let Some(pending) = pending else {
            warn!("link/buddy cache with id {} not found", identifier);
            return;
        };
        let node = (!new_neighbour.is_empty()).then_some(new_neighbour);
        match pending {
            SgPending::Link { tx } | SgPending::Buddy { tx } => {
                tx.send(node).ok();
            }
            _ => {}
        }
    }

    /// Walk the level-`level` chain for the first node sharing our symbol,
    /// which becomes our level-`level + 1` neighbour.
    async fn do_buddy_request(
        &self,
        peer: SocketAddrV4,
        originator: &SgNode,
        level: u32,
        val: u32,
        side: Direction,
    ) -> Option<SgNode> {
        info!(
            "node {} sending buddy request to {} (level {}, val {}, {})",
            self.short_id(),
            peer,
            level,
            val,
            side.name()
        );
        let (tx, rx) = oneshot::channel();
        let identifier = self.cache.add(SgKind::Buddy, SgPending::Buddy { tx }).await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::Buddy,
            identifier,
            SgKind::Buddy.timeout(),
        );
        self.send_to(
            peer,
            &SgMessage::Buddy {
                identifier,
                originator: originator.clone(),
                level,
                val,
                side,
            },
        );
        rx.await.unwrap_or(None)
    }

    async fn on_buddy(&self, identifier: u32, originator: SgNode, level: u32, val: u32, side: Direction) {
        debug!(
            "node {} received buddy message (val {}, {}, level {})",
            self.short_id(),
            val,
            side.name(),
            level
        );
        let other_side = side.opposite();
        let (matches, walk_next) = {
            let guard = self.routing_table.lock().await;
            let Some(rt) = guard.as_ref() else { return };
            (
                rt.mv().symbol(level as usize) == Some(val as u8),
                rt.get(level as usize, other_side).cloned(),
            )
        };

        if matches {
            self.change_neighbour(identifier, originator, side, level + 1).await;
        } else if let Some(next) = walk_next {
            debug!(
                "node {} forwarding buddy request to {}",
                self.short_id(),
                next.short_id()
            );
            self.send_to(
                next.address,
                &SgMessage::Buddy {
                    identifier,
                    originator,
                    level,
                    val,
                    side,
                },
            );
        } else {
            // Chain end without a buddy: terminate linking on this side.
            debug!("node {} will not link at level {}", self.short_id(), level);
            self.send_to(
                originator.address,
                &SgMessage::SetLink {
                    identifier,
                    new_neighbour: SgNode::empty(),
                    level,
                },
            );
        }
    }

    /// Join the skip graph through an introducer already in it.
    pub async fn join(self: &Arc<Self>, introducer: &SgNode) -> Result<bool, SkipGraphError> {
        let started = Instant::now();
        let my_node = self.my_node().await?;
        info!(
            "node {} joining the skip graph (key {}, mv {})",
            self.short_id(),
            my_node.key,
            my_node.mv
        );

        let Some(closest) = self.search(my_node.key, Some(introducer)).await? else {
            warn!("join failed - search through introducer returned nothing");
            return Ok(false);
        };
        if closest.key == my_node.key {
            warn!("node with key {} is already registered", closest.key);
            return Ok(false);
        }
        info!(
            "node {} established closest neighbour {} during join",
            self.short_id(),
            closest.key
        );

        // Level 0 splice.
        if closest.key < my_node.key {
            let (found, closest_right) = self.get_neighbour(closest.address, Direction::Right, 0).await;
            if found {
                let _ = self.get_link(closest_right.address, Direction::Left, 0).await;
                self.set_neighbour(0, Direction::Right, closest_right).await;
            }
            let _ = self.get_link(closest.address, Direction::Right, 0).await;
            self.set_neighbour(0, Direction::Left, closest).await;
        } else {
            // We hold the smallest key in the graph.
            let _ = self.get_link(closest.address, Direction::Left, 0).await;
            self.set_neighbour(0, Direction::Right, closest).await;
        }

        // Higher levels via buddy walks on both sides.
        info!("node {} joining phase 2", self.short_id());
        let max_level = my_node.mv.len();
        let mut level = 0usize;
        loop {
            level += 1;
            if level > max_level {
                break;
            }
            let val = my_node.mv.symbol(level - 1).unwrap_or(0) as u32;

            if let Some(right) = self.neighbour(level - 1, Direction::Right).await {
                let buddy = self
                    .do_buddy_request(right.address, &my_node, (level - 1) as u32, val, Direction::Left)
                    .await;
                if let Some(buddy) = buddy {
                    self.set_neighbour(level, Direction::Right, buddy).await;
                }
            }
            if let Some(left) = self.neighbour(level - 1, Direction::Left).await {
                let buddy = self
                    .do_buddy_request(left.address, &my_node, (level - 1) as u32, val, Direction::Right)
                    .await;
                if let Some(buddy) = buddy {
                    self.set_neighbour(level, Direction::Left, buddy).await;
                }
            }

            if self.neighbour(level, Direction::Right).await.is_none()
                && self.neighbour(level, Direction::Left).await.is_none()
            {
                break;
            }
        }

        self.stats.lock().await.join_latencies.push(started.elapsed());
        info!("node {} has joined the skip graph", self.short_id());
        Ok(true)
    }

    async fn set_neighbour(&self, level: usize, side: Direction, node: SgNode) {
        if let Some(rt) = self.routing_table.lock().await.as_mut() {
            rt.set(level, side, Some(node));
        }
    }

    // =========================================================================
    // LEAVE
    // =========================================================================

    /// Gracefully leave by informing the neighbours at each level, top down.
    /// Discards the routing table on completion.
    pub async fn leave(self: &Arc<Self>) -> Result<bool, SkipGraphError> {
        let started = Instant::now();
        let my_node = self.my_node().await?;
        info!("node {} will leave the skip graph", self.short_id());
        self.is_leaving.store(true, Ordering::SeqCst);

        let height = self.routing_table.lock().await.as_ref().map(|rt| rt.height());
        let height = height.ok_or(SkipGraphError::RoutingTableNotInitialized)?;

        for level in (0..=height).rev() {
            if let Some(rn) = self.neighbour(level, Direction::Right).await {
                let confirmed = self.delete_request(rn.address, &my_node, level as u32).await;
                if !confirmed {
                    // The whole right side is leaving too: our left neighbour
                    // has no live successor at this level.
                    if let Some(ln) = self.neighbour(level, Direction::Left).await {
                        self.set_neighbour_nil_request(ln.address, &my_node, level as u32).await;
                    }
                }
            } else if let Some(ln) = self.neighbour(level, Direction::Left).await {
                self.set_neighbour_nil_request(ln.address, &my_node, level as u32).await;
            }
            debug!("node {} left the skip graph at level {}", self.short_id(), level);
        }

        info!("node {} left the skip graph", self.short_id());
        self.is_leaving.store(false, Ordering::SeqCst);
        *self.routing_table.lock().await = None;
        self.stats.lock().await.leave_latencies.push(started.elapsed());
        Ok(true)
    }

    async fn delete_request(&self, peer: SocketAddrV4, my_node: &SgNode, level: u32) -> bool {
        let (tx, rx) = oneshot::channel();
        let identifier = self.cache.add(SgKind::Delete, SgPending::Delete { tx }).await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::Delete,
            identifier,
            SgKind::Delete.timeout(),
        );
        self.send_to(
            peer,
            &SgMessage::Delete {
                identifier,
                originator: my_node.clone(),
                level,
            },
        );
        rx.await.unwrap_or(false)
    }

    async fn set_neighbour_nil_request(&self, peer: SocketAddrV4, my_node: &SgNode, level: u32) -> bool {
        let (tx, rx) = oneshot::channel();
        let identifier = self
            .cache
            .add(SgKind::SetNeighbourNil, SgPending::SetNeighbourNil { tx })
            .await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::SetNeighbourNil,
            identifier,
            SgKind::SetNeighbourNil.timeout(),
        );
        self.send_to(
            peer,
            &SgMessage::SetNeighbourNil {
                identifier,
                originator: my_node.clone(),
                level,
            },
        );
        rx.await.unwrap_or(false)
    }

    /// Walk left through leaving nodes until a live one takes us as its new
    /// right neighbour.
    async fn find_new_neighbour(&self, level: u32) -> Option<SgNode> {
        info!("node {} finding new neighbour at level {}", self.short_id(), level);
        let ln = self.neighbour(level as usize, Direction::Left).await?;
        let my_node = self.my_node().await.ok()?;
        let (tx, rx) = oneshot::channel();
        let identifier = self
            .cache
            .add(SgKind::FindNewNeighbour, SgPending::FindNewNeighbour { tx })
            .await;
        spawn_timeout(
            self.cache.clone(),
            SgKind::FindNewNeighbour,
            identifier,
            SgKind::FindNewNeighbour.timeout(),
        );
        self.send_to(
            ln.address,
            &SgMessage::FindNewNeighbour {
                identifier,
                originator: my_node,
                level,
            },
        );
        rx.await.unwrap_or(None)
    }

    async fn on_delete(&self, identifier: u32, originator: SgNode, level: u32) {
        info!(
            "node {} received delete message from key {} (level {})",
            self.short_id(),
            originator.key,
            level
        );
        if self.is_leaving.load(Ordering::SeqCst) {
            // Pass the delete along our own right chain.
            let rn = self.neighbour(level as usize, Direction::Right).await;
            match rn {
                Some(rn) => self.send_to(
                    rn.address,
                    &SgMessage::Delete {
                        identifier,
                        originator,
                        level,
                    },
                ),
                None => self.send_to(
                    originator.address,
                    &SgMessage::NoNeighbour { identifier, level },
                ),
            }
        } else {
            let new_neighbour = self.find_new_neighbour(level).await;
            if let Some(rt) = self.routing_table.lock().await.as_mut() {
                // Splice out the departed range up to the replacement.
                rt.set_immediate(level as usize, Direction::Left, new_neighbour);
            }
            self.send_to(
                originator.address,
                &SgMessage::ConfirmDelete { identifier, level },
            );
        }
    }

    async fn on_find_new_neighbour(&self, identifier: u32, originator: SgNode, level: u32) {
        info!(
            "node {} received find-new-neighbour from key {} (level {})",
            self.short_id(),
            originator.key,
            level
        );
        if self.is_leaving.load(Ordering::SeqCst) {
            let ln = self.neighbour(level as usize, Direction::Left).await;
            match ln {
                Some(ln) => self.send_to(
                    ln.address,
                    &SgMessage::FindNewNeighbour {
                        identifier,
                        originator,
                        level,
                    },
                ),
                None => self.send_to(
                    originator.address,
                    &SgMessage::FoundNewNeighbour {
                        identifier,
                        neighbour: SgNode::empty(),
                        level,
                    },
                ),
            }
        } else {
            let my_node = match self.my_node().await {
                Ok(node) => node,
                Err(_) => return,
            };
            self.send_to(
                originator.address,
                &SgMessage::FoundNewNeighbour {
                    identifier,
                    neighbour: my_node,
                    level,
                },
            );
            if let Some(rt) = self.routing_table.lock().await.as_mut() {
                // Everyone between us and the originator is on the way out.
                rt.set_immediate(level as usize, Direction::Right, Some(originator));
            }
        }
    }

    async fn on_found_new_neighbour(&self, identifier: u32, neighbour: SgNode) {
        let Some(pending) = self.cache.pop(SgKind::FindNewNeighbour, identifier).await else {
            warn!("find-new-neighbour cache with id {} not found", identifier);
            return;
        };
        if let SgPending::FindNewNeighbour { tx } = pending {
            let node = (!neighbour.is_empty()).then_some(neighbour);
            tx.send(node).ok();
        }
    }

    async fn on_no_neighbour(&self, identifier: u32, level: u32) {
        info!(
            "node {} received no-neighbour message (level {})",
            self.short_id(),
            level
        );
        let Some(pending) = self.cache.pop(SgKind::Delete, identifier).await else {
            warn!("delete cache with id {} not found", identifier);
            return;
        };
        if let SgPending::Delete { tx } = pending {
            tx.send(false).ok();
        }
    }

    async fn on_confirm_delete(&self, identifier: u32) {
        debug!("node {} received confirm-delete", self.short_id());
        if let Some(SgPending::Delete { tx }) = self.cache.pop(SgKind::Delete, identifier).await {
            tx.send(true).ok();
            return;
        }
        if let Some(SgPending::SetNeighbourNil { tx }) =
            self.cache.pop(SgKind::SetNeighbourNil, identifier).await
        {
            tx.send(true).ok();
        }
    }

    async fn on_set_neighbour_nil(&self, identifier: u32, originator: SgNode, level: u32) {
        info!(
            "node {} received set-neighbour-nil from key {} (level {})",
            self.short_id(),
            originator.key,
            level
        );
        if self.is_leaving.load(Ordering::SeqCst) {
            let ln = self.neighbour(level as usize, Direction::Left).await;
            match ln {
                Some(ln) => self.send_to(
                    ln.address,
                    &SgMessage::SetNeighbourNil {
                        identifier,
                        originator,
                        level,
                    },
                ),
                None => self.send_to(
                    originator.address,
                    &SgMessage::ConfirmDelete { identifier, level },
                ),
            }
        } else {
            self.send_to(
                originator.address,
                &SgMessage::ConfirmDelete { identifier, level },
            );
            if let Some(rt) = self.routing_table.lock().await.as_mut() {
                // No live right neighbour remains at this level.
                rt.set_immediate(level as usize, Direction::Right, None);
            }
        }
    }

    /// Resolve every outstanding request and stop accepting new ones.
    pub async fn unload(&self) {
        self.cache.shutdown().await;
    }
}
