//! Datagram transport interface and implementations.
//!
//! The overlay only requires a fire-and-forget datagram send plus a bulk
//! channel for large triplet batches. Every datagram starts with a one-byte
//! overlay channel (`CHANNEL_DKG` or a skip-graph channel) that the hosting
//! node uses to demultiplex co-resident overlays; the protocol message
//! formats start after that byte.
//!
//! `MemoryNetwork` wires nodes together in-process and backs the multi-node
//! tests. `UdpEndpoint` is the thin real-socket implementation used by the
//! binary; peer discovery and NAT traversal are outside this crate.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::warn;

/// Overlay channel of the DKG community.
pub const CHANNEL_DKG: u8 = 0;

/// Overlay channel of the co-resident skip graph with the given index.
pub fn skip_graph_channel(index: usize) -> u8 {
    1 + index as u8
}

/// A unit delivered to a node's dispatch loop.
#[derive(Debug)]
pub enum Delivery {
    /// Protocol datagram: overlay channel byte followed by `msg_id` + body.
    Packet { from: SocketAddrV4, data: Vec<u8> },
    /// Large-binary transfer: JSON info header plus serialized body.
    Bulk {
        from: SocketAddrV4,
        info: Vec<u8>,
        data: Vec<u8>,
    },
}

pub trait Endpoint: Send + Sync + 'static {
    fn local_addr(&self) -> SocketAddrV4;

    /// Fire-and-forget datagram send. Loss and reordering are the caller's
    /// problem; correlation happens at the request-cache layer.
    fn send(&self, to: SocketAddrV4, data: Vec<u8>);

    /// Fire-and-forget large-binary transfer.
    fn send_bulk(&self, to: SocketAddrV4, info: Vec<u8>, data: Vec<u8>);
}

// =============================================================================
// IN-PROCESS MESH
// =============================================================================

type Mailbox = mpsc::UnboundedSender<Delivery>;

/// In-process mesh connecting endpoints by address.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<Mutex<HashMap<SocketAddrV4, Mailbox>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach an endpoint at `addr`, returning it with its delivery stream.
    pub fn register(
        &self,
        addr: SocketAddrV4,
    ) -> (Arc<MemoryEndpoint>, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().unwrap().insert(addr, tx);
        (
            Arc::new(MemoryEndpoint {
                addr,
                net: self.clone(),
            }),
            rx,
        )
    }

    pub fn unregister(&self, addr: &SocketAddrV4) {
        self.peers.lock().unwrap().remove(addr);
    }

    fn route(&self, to: SocketAddrV4, delivery: Delivery) {
        // Datagram semantics: unknown or gone destinations drop silently.
        if let Some(tx) = self.peers.lock().unwrap().get(&to) {
            tx.send(delivery).ok();
        }
    }
}

pub struct MemoryEndpoint {
    addr: SocketAddrV4,
    net: MemoryNetwork,
}

impl Endpoint for MemoryEndpoint {
    fn local_addr(&self) -> SocketAddrV4 {
        self.addr
    }

    fn send(&self, to: SocketAddrV4, data: Vec<u8>) {
        self.net.route(
            to,
            Delivery::Packet {
                from: self.addr,
                data,
            },
        );
    }

    fn send_bulk(&self, to: SocketAddrV4, info: Vec<u8>, data: Vec<u8>) {
        self.net.route(
            to,
            Delivery::Bulk {
                from: self.addr,
                info,
                data,
            },
        );
    }
}

// =============================================================================
// UDP
// =============================================================================

// Frame tags ahead of the overlay datagram on the socket.
const FRAME_PACKET: u8 = 0;
const FRAME_BULK: u8 = 1;

const MAX_DATAGRAM: usize = 65_507;

/// Datagram endpoint over a UDP socket. Bulk transfers ride a single framed
/// datagram; batches beyond the UDP payload limit are dropped with a warning.
pub struct UdpEndpoint {
    socket: Arc<UdpSocket>,
    addr: SocketAddrV4,
}

impl UdpEndpoint {
    pub async fn bind(
        addr: SocketAddrV4,
    ) -> io::Result<(Arc<Self>, mpsc::UnboundedReceiver<Delivery>)> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = match socket.local_addr()? {
            SocketAddr::V4(a) => a,
            SocketAddr::V6(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "overlay addresses are IPv4",
                ));
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let recv_socket = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = match recv_socket.recv_from(&mut buf).await {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("udp receive failed: {}", e);
                        break;
                    }
                };
                let from = match from {
                    SocketAddr::V4(a) => a,
                    SocketAddr::V6(_) => continue,
                };
                let Some(delivery) = decode_frame(from, &buf[..len]) else {
                    warn!("dropping malformed frame from {}", from);
                    continue;
                };
                if tx.send(delivery).is_err() {
                    break;
                }
            }
        });

        Ok((Arc::new(Self { socket, addr: local }), rx))
    }

    fn send_frame(&self, to: SocketAddrV4, frame: Vec<u8>) {
        if frame.len() > MAX_DATAGRAM {
            warn!("dropping {}-byte frame to {}: over datagram limit", frame.len(), to);
            return;
        }
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = socket.send_to(&frame, SocketAddr::V4(to)).await {
                warn!("udp send to {} failed: {}", to, e);
            }
        });
    }
}

fn decode_frame(from: SocketAddrV4, raw: &[u8]) -> Option<Delivery> {
    let (&tag, rest) = raw.split_first()?;
    match tag {
        FRAME_PACKET => Some(Delivery::Packet {
            from,
            data: rest.to_vec(),
        }),
        FRAME_BULK => {
            if rest.len() < 4 {
                return None;
            }
            let info_len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            let rest = &rest[4..];
            if rest.len() < info_len {
                return None;
            }
            Some(Delivery::Bulk {
                from,
                info: rest[..info_len].to_vec(),
                data: rest[info_len..].to_vec(),
            })
        }
        _ => None,
    }
}

impl Endpoint for UdpEndpoint {
    fn local_addr(&self) -> SocketAddrV4 {
        self.addr
    }

    fn send(&self, to: SocketAddrV4, data: Vec<u8>) {
        let mut frame = Vec::with_capacity(1 + data.len());
        frame.push(FRAME_PACKET);
        frame.extend_from_slice(&data);
        self.send_frame(to, frame);
    }

    fn send_bulk(&self, to: SocketAddrV4, info: Vec<u8>, data: Vec<u8>) {
        let mut frame = Vec::with_capacity(5 + info.len() + data.len());
        frame.push(FRAME_BULK);
        frame.extend_from_slice(&(info.len() as u32).to_be_bytes());
        frame.extend_from_slice(&info);
        frame.extend_from_slice(&data);
        self.send_frame(to, frame);
    }
}
