use serde::{Deserialize, Serialize};

use crate::{contact::Contact, ids::Id, records::{ResourceRecord, TrackTag}};

/// Hard cap on an encoded envelope; anything larger is rejected before
/// decoding the payload.
pub const MAX_ENVELOPE_BYTES: usize = 256 * 1024;

/// Envelope shared by every RPC: who is speaking, where they can be
/// reached, and which conversation the message belongs to. Responses echo
/// the request's conversation id; correlation is strictly by that id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: u16,
    pub sender_id: Id,
    pub sender_endpoint: String,
    pub conversation_id: Id,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn from_typed(
        sender: &Contact,
        conversation_id: Id,
        payload: &WirePayload,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            kind: payload.kind() as u16,
            sender_id: sender.id,
            sender_endpoint: sender.endpoint.clone(),
            conversation_id,
            payload: payload.encode()?,
        })
    }

    pub fn to_typed(&self) -> anyhow::Result<WirePayload> {
        WirePayload::decode(self.kind, &self.payload)
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = serde_cbor::to_vec(self)?;
        if bytes.len() > MAX_ENVELOPE_BYTES {
            anyhow::bail!("envelope exceeds {MAX_ENVELOPE_BYTES} bytes");
        }
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            anyhow::bail!("envelope exceeds {MAX_ENVELOPE_BYTES} bytes");
        }
        Ok(serde_cbor::from_slice(bytes)?)
    }

    pub fn sender_contact(&self) -> Contact {
        Contact::new(self.sender_id, self.sender_endpoint.clone())
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Ping = 100,
    Pong = 101,
    FindNode = 200,
    FindNodeResult = 201,
    FindValue = 210,
    FindValueNodes = 211,
    FindValueHits = 212,
    StoreQuery = 300,
    StoreResult = 301,
    StoreData = 302,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ping {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pong {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindNode {
    pub target: Id,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindNodeResult {
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindValue {
    pub query: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindValueNodes {
    pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FindValueHits {
    pub resources: Vec<ResourceRecord>,
}

/// First phase of a store: only the hash travels; the recipient decides
/// whether it wants the data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreQuery {
    pub tag_hash: Id,
    pub published_unix: u64,
    pub originator_endpoint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreResult {
    pub send_data: bool,
}

/// Second phase: the full tag, sent only after the recipient asked for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreData {
    pub tag: TrackTag,
    pub published_unix: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WirePayload {
    Ping(Ping),
    Pong(Pong),
    FindNode(FindNode),
    FindNodeResult(FindNodeResult),
    FindValue(FindValue),
    FindValueNodes(FindValueNodes),
    FindValueHits(FindValueHits),
    StoreQuery(StoreQuery),
    StoreResult(StoreResult),
    StoreData(StoreData),
}

impl WirePayload {
    pub fn kind(&self) -> MsgKind {
        match self {
            Self::Ping(_) => MsgKind::Ping,
            Self::Pong(_) => MsgKind::Pong,
            Self::FindNode(_) => MsgKind::FindNode,
            Self::FindNodeResult(_) => MsgKind::FindNodeResult,
            Self::FindValue(_) => MsgKind::FindValue,
            Self::FindValueNodes(_) => MsgKind::FindValueNodes,
            Self::FindValueHits(_) => MsgKind::FindValueHits,
            Self::StoreQuery(_) => MsgKind::StoreQuery,
            Self::StoreResult(_) => MsgKind::StoreResult,
            Self::StoreData(_) => MsgKind::StoreData,
        }
    }

    /// Responses are everything a node sends back under a conversation id
    /// it did not originate.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::Pong(_)
                | Self::FindNodeResult(_)
                | Self::FindValueNodes(_)
                | Self::FindValueHits(_)
                | Self::StoreResult(_)
        )
    }

    fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = match self {
            Self::Ping(p) => serde_cbor::to_vec(p)?,
            Self::Pong(p) => serde_cbor::to_vec(p)?,
            Self::FindNode(p) => serde_cbor::to_vec(p)?,
            Self::FindNodeResult(p) => serde_cbor::to_vec(p)?,
            Self::FindValue(p) => serde_cbor::to_vec(p)?,
            Self::FindValueNodes(p) => serde_cbor::to_vec(p)?,
            Self::FindValueHits(p) => serde_cbor::to_vec(p)?,
            Self::StoreQuery(p) => serde_cbor::to_vec(p)?,
            Self::StoreResult(p) => serde_cbor::to_vec(p)?,
            Self::StoreData(p) => serde_cbor::to_vec(p)?,
        };
        Ok(bytes)
    }

    fn decode(kind: u16, payload: &[u8]) -> anyhow::Result<Self> {
        let decoded = match kind {
            k if k == MsgKind::Ping as u16 => Self::Ping(serde_cbor::from_slice(payload)?),
            k if k == MsgKind::Pong as u16 => Self::Pong(serde_cbor::from_slice(payload)?),
            k if k == MsgKind::FindNode as u16 => Self::FindNode(serde_cbor::from_slice(payload)?),
            k if k == MsgKind::FindNodeResult as u16 => {
                Self::FindNodeResult(serde_cbor::from_slice(payload)?)
            }
            k if k == MsgKind::FindValue as u16 => {
                Self::FindValue(serde_cbor::from_slice(payload)?)
            }
            k if k == MsgKind::FindValueNodes as u16 => {
                Self::FindValueNodes(serde_cbor::from_slice(payload)?)
            }
            k if k == MsgKind::FindValueHits as u16 => {
                Self::FindValueHits(serde_cbor::from_slice(payload)?)
            }
            k if k == MsgKind::StoreQuery as u16 => {
                Self::StoreQuery(serde_cbor::from_slice(payload)?)
            }
            k if k == MsgKind::StoreResult as u16 => {
                Self::StoreResult(serde_cbor::from_slice(payload)?)
            }
            k if k == MsgKind::StoreData as u16 => {
                Self::StoreData(serde_cbor::from_slice(payload)?)
            }
            other => anyhow::bail!("unknown message kind {other}"),
        };
        Ok(decoded)
    }
}
