//! DKG wire messages, the serialized triplet batch format, and the JSON
//! info header carried by bulk transfers.

use crate::dkg::knowledge_graph::Triplet;
use crate::skipgraph::Key;
use crate::wire::{self, Reader, WireError};
use serde::{Deserialize, Serialize};

pub const MSG_STORAGE_REQUEST: u8 = 21;
pub const MSG_STORAGE_RESPONSE: u8 = 22;
pub const MSG_TRIPLETS_REQUEST: u8 = 23;

#[derive(Debug, Clone)]
pub enum DkgMessage {
    StorageRequest {
        identifier: u32,
        content_identifier: Vec<u8>,
        key: Key,
    },
    StorageResponse {
        identifier: u32,
        accepted: bool,
    },
    TripletsRequest {
        identifier: u32,
        content: Vec<u8>,
    },
}

impl DkgMessage {
    pub fn msg_id(&self) -> u8 {
        match self {
            DkgMessage::StorageRequest { .. } => MSG_STORAGE_REQUEST,
            DkgMessage::StorageResponse { .. } => MSG_STORAGE_RESPONSE,
            DkgMessage::TripletsRequest { .. } => MSG_TRIPLETS_REQUEST,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DkgMessage::StorageRequest { .. } => "storage-request",
            DkgMessage::StorageResponse { .. } => "storage-response",
            DkgMessage::TripletsRequest { .. } => "triplets-request",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = Vec::new();
        wire::put_u8(&mut buf, self.msg_id());
        match self {
            DkgMessage::StorageRequest {
                identifier,
                content_identifier,
                key,
            } => {
                wire::put_u32(&mut buf, *identifier);
                wire::put_bytes(&mut buf, content_identifier)?;
                wire::put_u32(&mut buf, *key);
            }
            DkgMessage::StorageResponse {
                identifier,
                accepted,
            } => {
                wire::put_u32(&mut buf, *identifier);
                wire::put_bool(&mut buf, *accepted);
            }
            DkgMessage::TripletsRequest {
                identifier,
                content,
            } => {
                wire::put_u32(&mut buf, *identifier);
                wire::put_bytes(&mut buf, content)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut r = Reader::new(data);
        let msg_id = r.get_u8()?;
        let msg = match msg_id {
            MSG_STORAGE_REQUEST => DkgMessage::StorageRequest {
                identifier: r.get_u32()?,
                content_identifier: r.get_bytes()?,
                key: r.get_u32()?,
            },
            MSG_STORAGE_RESPONSE => DkgMessage::StorageResponse {
                identifier: r.get_u32()?,
                accepted: r.get_bool()?,
            },
            MSG_TRIPLETS_REQUEST => DkgMessage::TripletsRequest {
                identifier: r.get_u32()?,
                content: r.get_bytes()?,
            },
            other => return Err(WireError::UnknownMsgId(other)),
        };
        Ok(msg)
    }
}

// =============================================================================
// TRIPLET BATCHES
// =============================================================================

/// Serialize a triplet batch for the bulk channel: a u16 element count, then
/// per triplet the three byte strings and the tagged rule names.
pub fn encode_triplets(triplets: &[Triplet]) -> Result<Vec<u8>, WireError> {
    if triplets.len() > u16::MAX as usize {
        return Err(WireError::Oversized);
    }
    let mut buf = Vec::new();
    wire::put_u16(&mut buf, triplets.len() as u16);
    for triplet in triplets {
        wire::put_bytes(&mut buf, &triplet.head)?;
        wire::put_bytes(&mut buf, &triplet.relation)?;
        wire::put_bytes(&mut buf, &triplet.tail)?;
        if triplet.rules.len() > u16::MAX as usize {
            return Err(WireError::Oversized);
        }
        wire::put_u16(&mut buf, triplet.rules.len() as u16);
        for rule in &triplet.rules {
            wire::put_bytes(&mut buf, rule)?;
        }
    }
    Ok(buf)
}

pub fn decode_triplets(data: &[u8]) -> Result<Vec<Triplet>, WireError> {
    let mut r = Reader::new(data);
    let count = r.get_u16()? as usize;
    let mut triplets = Vec::with_capacity(count);
    for _ in 0..count {
        let head = r.get_bytes()?;
        let relation = r.get_bytes()?;
        let tail = r.get_bytes()?;
        let mut triplet = Triplet::new(head, relation, tail);
        let rule_count = r.get_u16()? as usize;
        for _ in 0..rule_count {
            triplet.add_rule(r.get_bytes()?);
        }
        triplets.push(triplet);
    }
    Ok(triplets)
}

// =============================================================================
// BULK INFO HEADER
// =============================================================================

/// JSON header accompanying a bulk transfer, identifying what the body is.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkInfo {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
    pub cid: String,
}

impl BulkInfo {
    pub fn store(content_identifier: &[u8]) -> Self {
        Self {
            kind: "store".to_string(),
            id: None,
            cid: hex::encode(content_identifier),
        }
    }

    pub fn search_response(id: u32, content_identifier: &[u8]) -> Self {
        Self {
            kind: "search_response".to_string(),
            id: Some(id),
            cid: hex::encode(content_identifier),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
