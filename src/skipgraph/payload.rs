//! Skip-graph wire messages.
//!
//! Every payload is a fixed-layout byte sequence: a leading message-id byte
//! followed by the fields in declared order. `identifier` correlates a
//! response with a request-cache entry at the receiver. Node descriptors
//! embed inline.

use crate::skipgraph::node::SgNode;
use crate::skipgraph::{Direction, Key};
use crate::wire::{self, Reader, WireError};

pub const MSG_NODE_INFO: u8 = 1;
pub const MSG_SEARCH: u8 = 2;
pub const MSG_SEARCH_RESPONSE: u8 = 3;
pub const MSG_SEARCH_INTERMEDIATE_RESPONSE: u8 = 4;
pub const MSG_NEIGHBOUR_REQUEST: u8 = 6;
pub const MSG_NEIGHBOUR_RESPONSE: u8 = 7;
pub const MSG_GET_LINK: u8 = 8;
pub const MSG_SET_LINK: u8 = 9;
pub const MSG_BUDDY: u8 = 10;
pub const MSG_DELETE: u8 = 11;
pub const MSG_NO_NEIGHBOUR: u8 = 12;
pub const MSG_FIND_NEW_NEIGHBOUR: u8 = 13;
pub const MSG_FOUND_NEW_NEIGHBOUR: u8 = 14;
pub const MSG_CONFIRM_DELETE: u8 = 15;
pub const MSG_SET_NEIGHBOUR_NIL: u8 = 16;

/// A search in flight. Kept whole because forwarders stash the received
/// payload for timeout-driven rerouting.
#[derive(Debug, Clone)]
pub struct SearchPayload {
    pub identifier: u32,
    pub forward_identifier: u32,
    pub originator: SgNode,
    pub search_key: Key,
    pub level: u32,
    pub hops: u32,
}

#[derive(Debug, Clone)]
pub enum SgMessage {
    Search(SearchPayload),
    SearchResponse {
        identifier: u32,
        response: SgNode,
        hops: u32,
    },
    SearchIntermediateResponse {
        identifier: u32,
        node: SgNode,
    },
    NeighbourRequest {
        identifier: u32,
        side: Direction,
        level: u32,
    },
    NeighbourResponse {
        identifier: u32,
        found: bool,
        neighbour: SgNode,
    },
    GetLink {
        identifier: u32,
        originator: SgNode,
        side: Direction,
        level: u32,
    },
    SetLink {
        identifier: u32,
        new_neighbour: SgNode,
        level: u32,
    },
    Buddy {
        identifier: u32,
        originator: SgNode,
        level: u32,
        val: u32,
        side: Direction,
    },
    Delete {
        identifier: u32,
        originator: SgNode,
        level: u32,
    },
    NoNeighbour {
        identifier: u32,
        level: u32,
    },
    FindNewNeighbour {
        identifier: u32,
        originator: SgNode,
        level: u32,
    },
    FoundNewNeighbour {
        identifier: u32,
        neighbour: SgNode,
        level: u32,
    },
    ConfirmDelete {
        identifier: u32,
        level: u32,
    },
    SetNeighbourNil {
        identifier: u32,
        originator: SgNode,
        level: u32,
    },
}

impl SgMessage {
    pub fn msg_id(&self) -> u8 {
        match self {
            SgMessage::Search(_) => MSG_SEARCH,
            SgMessage::SearchResponse { .. } => MSG_SEARCH_RESPONSE,
            SgMessage::SearchIntermediateResponse { .. } => MSG_SEARCH_INTERMEDIATE_RESPONSE,
            SgMessage::NeighbourRequest { .. } => MSG_NEIGHBOUR_REQUEST,
            SgMessage::NeighbourResponse { .. } => MSG_NEIGHBOUR_RESPONSE,
            SgMessage::GetLink { .. } => MSG_GET_LINK,
            SgMessage::SetLink { .. } => MSG_SET_LINK,
            SgMessage::Buddy { .. } => MSG_BUDDY,
            SgMessage::Delete { .. } => MSG_DELETE,
            SgMessage::NoNeighbour { .. } => MSG_NO_NEIGHBOUR,
            SgMessage::FindNewNeighbour { .. } => MSG_FIND_NEW_NEIGHBOUR,
            SgMessage::FoundNewNeighbour { .. } => MSG_FOUND_NEW_NEIGHBOUR,
            SgMessage::ConfirmDelete { .. } => MSG_CONFIRM_DELETE,
            SgMessage::SetNeighbourNil { .. } => MSG_SET_NEIGHBOUR_NIL,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SgMessage::Search(_) => "search",
            SgMessage::SearchResponse { .. } => "search-response",
            SgMessage::SearchIntermediateResponse { .. } => "search-intermediate-response",
            SgMessage::NeighbourRequest { .. } => "neighbour-request",
            SgMessage::NeighbourResponse { .. } => "neighbour-response",
            SgMessage::GetLink { .. } => "get-link",
            SgMessage::SetLink { .. } => "set-link",
            SgMessage::Buddy { .. } => "buddy",
            SgMessage::Delete { .. } => "delete",
            SgMessage::NoNeighbour { .. } => "no-neighbour",
            SgMessage::FindNewNeighbour { .. } => "find-new-neighbour",
            SgMessage::FoundNewNeighbour { .. } => "found-new-neighbour",
            SgMessage::ConfirmDelete { .. } => "confirm-delete",
            SgMessage::SetNeighbourNil { .. } => "set-neighbour-nil",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, self.msg_id());
        match self {
            SgMessage::Search(p) => {
                wire::put_u32(&mut buf, p.identifier);
                wire::put_u32(&mut buf, p.forward_identifier);
                p.originator.encode(&mut buf)?;
                wire::put_u32(&mut buf, p.search_key);
                wire::put_u32(&mut buf, p.level);
                wire::put_u32(&mut buf, p.hops);
            }
            SgMessage::SearchResponse {
                identifier,
                response,
                hops,
            } => {
                wire::put_u32(&mut buf, *identifier);
                response.encode(&mut buf)?;
                wire::put_u32(&mut buf, *hops);
            }
            SgMessage::SearchIntermediateResponse { identifier, node } => {
                wire::put_u32(&mut buf, *identifier);
                node.encode(&mut buf)?;
            }
            SgMessage::NeighbourRequest {
                identifier,
                side,
                level,
            } => {
                wire::put_u32(&mut buf, *identifier);
                wire::put_bool(&mut buf, side.as_bit());
                wire::put_u32(&mut buf, *level);
            }
            SgMessage::NeighbourResponse {
                identifier,
                found,
                neighbour,
            } => {
                wire::put_u32(&mut buf, *identifier);
                wire::put_bool(&mut buf, *found);
                neighbour.encode(&mut buf)?;
            }
            SgMessage::GetLink {
                identifier,
                originator,
                side,
                level,
            } => {
                wire::put_u32(&mut buf, *identifier);
                originator.encode(&mut buf)?;
                wire::put_bool(&mut buf, side.as_bit());
                wire::put_u32(&mut buf, *level);
            }
            SgMessage::SetLink {
                identifier,
                new_neighbour,
                level,
            } => {
                wire::put_u32(&mut buf, *identifier);
                new_neighbour.encode(&mut buf)?;
                wire::put_u32(&mut buf, *level);
            }
            SgMessage::Buddy {
                identifier,
                originator,
                level,
                val,
                side,
            } => {
                wire::put_u32(&mut buf, *identifier);
                originator.encode(&mut buf)?;
                wire::put_u32(&mut buf, *level);
                wire::put_u32(&mut buf, *val);
                wire::put_u32(&mut buf, side.as_u32());
            }
            SgMessage::Delete {
                identifier,
                originator,
                level,
            }
            | SgMessage::FindNewNeighbour {
                identifier,
                originator,
                level,
            }
            | SgMessage::SetNeighbourNil {
                identifier,
                originator,
                level,
            } => {
                wire::put_u32(&mut buf, *identifier);
                originator.encode(&mut buf)?;
                wire::put_u32(&mut buf, *level);
            }
            SgMessage::FoundNewNeighbour {
                identifier,
                neighbour,
                level,
            } => {
                wire::put_u32(&mut buf, *identifier);
                neighbour.encode(&mut buf)?;
                wire::put_u32(&mut buf, *level);
            }
            SgMessage::NoNeighbour { identifier, level }
            | SgMessage::ConfirmDelete { identifier, level } => {
                wire::put_u32(&mut buf, *identifier);
                wire::put_u32(&mut buf, *level);
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let msg_id = r.get_u8()?;
        let msg = match msg_id {
            MSG_SEARCH => SgMessage::Search(SearchPayload {
                identifier: r.get_u32()?,
                forward_identifier: r.get_u32()?,
                originator: SgNode::decode(&mut r)?,
                search_key: r.get_u32()?,
                level: r.get_u32()?,
                hops: r.get_u32()?,
            }),
            MSG_SEARCH_RESPONSE => SgMessage::SearchResponse {
                identifier: r.get_u32()?,
                response: SgNode::decode(&mut r)?,
                hops: r.get_u32()?,
            },
            MSG_SEARCH_INTERMEDIATE_RESPONSE => SgMessage::SearchIntermediateResponse {
                identifier: r.get_u32()?,
                node: SgNode::decode(&mut r)?,
            },
            MSG_NEIGHBOUR_REQUEST => SgMessage::NeighbourRequest {
                identifier: r.get_u32()?,
                side: Direction::from_bit(r.get_bool()?),
                level: r.get_u32()?,
            },
            MSG_NEIGHBOUR_RESPONSE => SgMessage::NeighbourResponse {
                identifier: r.get_u32()?,
                found: r.get_bool()?,
                neighbour: SgNode::decode(&mut r)?,
            },
            MSG_GET_LINK => SgMessage::GetLink {
                identifier: r.get_u32()?,
                originator: SgNode::decode(&mut r)?,
                side: Direction::from_bit(r.get_bool()?),
                level: r.get_u32()?,
            },
            MSG_SET_LINK => SgMessage::SetLink {
                identifier: r.get_u32()?,
                new_neighbour: SgNode::decode(&mut r)?,
                level: r.get_u32()?,
            },
            MSG_BUDDY => SgMessage::Buddy {
                identifier: r.get_u32()?,
                originator: SgNode::decode(&mut r)?,
                level: r.get_u32()?,
                val: r.get_u32()?,
                side: Direction::from_u32(r.get_u32()?).ok_or(WireError::InvalidValue)?,
            },
            MSG_DELETE => SgMessage::Delete {
                identifier: r.get_u32()?,
                originator: SgNode::decode(&mut r)?,
                level: r.get_u32()?,
            },
            MSG_NO_NEIGHBOUR => SgMessage::NoNeighbour {
                identifier: r.get_u32()?,
                level: r.get_u32()?,
            },
            MSG_FIND_NEW_NEIGHBOUR => SgMessage::FindNewNeighbour {
                identifier: r.get_u32()?,
                originator: SgNode::decode(&mut r)?,
                level: r.get_u32()?,
            },
            MSG_FOUND_NEW_NEIGHBOUR => SgMessage::FoundNewNeighbour {
                identifier: r.get_u32()?,
                neighbour: SgNode::decode(&mut r)?,
                level: r.get_u32()?,
            },
            MSG_CONFIRM_DELETE => SgMessage::ConfirmDelete {
                identifier: r.get_u32()?,
                level: r.get_u32()?,
            },
            MSG_SET_NEIGHBOUR_NIL => SgMessage::SetNeighbourNil {
                identifier: r.get_u32()?,
                originator: SgNode::decode(&mut r)?,
                level: r.get_u32()?,
            },
            other => return Err(WireError::UnknownMsgId(other)),
        };
        Ok(msg)
    }
}
