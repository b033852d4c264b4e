//! This module contains types associated with messages traded between
//! the system processes.
//!
//! Every payload is JSON encoded and travels inside a [`SignedEnvelope`]
//! whose tag selects the decoder on the receiving side.

use std::collections::HashMap;

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

use crate::bft::communication::NodeId;
use crate::bft::crypto::hash::{Context, Digest};
use crate::bft::crypto::signature::{KeyPair, PublicKey, Signature};
use crate::bft::error::*;
use crate::bft::ordering::{Orderable, SeqNo, ViewId};

/// A request from a client, ordered by the primary.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub timestamp: i64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub operation: String,
    pub data: String,
    #[serde(rename = "sequenceID")]
    pub sequence_id: SeqNo,
}

impl RequestMessage {
    pub fn new(timestamp: i64, client_id: impl Into<String>, operation: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            timestamp,
            client_id: client_id.into(),
            operation: operation.into(),
            data: data.into(),
            sequence_id: SeqNo::ZERO,
        }
    }

    /// The no-op request proposed for sequence gaps during a view change.
    pub fn null(sequence_id: SeqNo) -> Self {
        Self {
            timestamp: 0,
            client_id: String::new(),
            operation: "NULL".into(),
            data: String::new(),
            sequence_id,
        }
    }

    /// Whether this is the no-op filler request.
    pub fn is_null(&self) -> bool {
        self.operation == "NULL" && self.client_id.is_empty()
    }

    /// Hash of the canonically serialized request. Identifies the
    /// request for quorum matching.
    pub fn digest(&self) -> Result<Digest> {
        let serialized = serde_json::to_vec(self)?;
        let mut ctx = Context::new();
        ctx.update(&serialized);
        Ok(ctx.finish())
    }
}

impl Orderable for RequestMessage {
    fn sequence_number(&self) -> SeqNo {
        self.sequence_id
    }
}

/// The primary's proposal binding a request to a sequence number
/// within a view.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PrePrepareMessage {
    #[serde(rename = "viewID")]
    pub view_id: ViewId,
    #[serde(rename = "sequenceID")]
    pub sequence_id: SeqNo,
    #[serde(rename = "requestMsg")]
    pub request_msg: RequestMessage,
    pub digest: Digest,
    #[serde(rename = "epochID")]
    pub epoch_id: u64,
    #[serde(rename = "originNodeID")]
    pub origin_node_id: NodeId,
}

impl Orderable for PrePrepareMessage {
    fn sequence_number(&self) -> SeqNo {
        self.sequence_id
    }
}

/// Which agreement phase a [`VoteMessage`] belongs to.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VoteKind {
    Prepare,
    Commit,
}

/// A prepare or commit vote. Votes carry only the request digest.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct VoteMessage {
    #[serde(rename = "viewID")]
    pub view_id: ViewId,
    #[serde(rename = "sequenceID")]
    pub sequence_id: SeqNo,
    pub digest: Digest,
    #[serde(rename = "voterNodeID")]
    pub voter_node_id: NodeId,
    pub kind: VoteKind,
}

impl Orderable for VoteMessage {
    fn sequence_number(&self) -> SeqNo {
        self.sequence_id
    }
}

/// The outcome of executing one request, broadcast after execution.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplyMessage {
    #[serde(rename = "viewID")]
    pub view_id: ViewId,
    pub timestamp: i64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "executorNodeID")]
    pub executor_node_id: NodeId,
    pub result: String,
}

/// A vote certifying the executed state at a checkpoint sequence.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CheckPointMessage {
    #[serde(rename = "sequenceID")]
    pub sequence_id: SeqNo,
    pub digest: Digest,
    #[serde(rename = "originNodeID")]
    pub origin_node_id: NodeId,
}

impl Orderable for CheckPointMessage {
    fn sequence_number(&self) -> SeqNo {
        self.sequence_id
    }
}

/// Evidence that a sequence reached `PREPARED`: the accepted pre-prepare
/// plus at least `2f` matching prepare votes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PreparedProof {
    #[serde(rename = "prePrepare")]
    pub pre_prepare: PrePrepareMessage,
    pub prepares: HashMap<NodeId, VoteMessage>,
}

/// A vote to depose the current primary and move to `nextViewID`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ViewChangeMessage {
    #[serde(rename = "originNodeID")]
    pub origin_node_id: NodeId,
    #[serde(rename = "nextViewID")]
    pub next_view_id: ViewId,
    #[serde(rename = "stableCheckPoint")]
    pub stable_checkpoint: SeqNo,
    #[serde(rename = "setP")]
    pub set_p: HashMap<SeqNo, PreparedProof>,
}

/// The new primary's certificate installing `nextViewID`, carrying the
/// view-change set `V` and the re-issued pre-prepares `O`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NewViewMessage {
    #[serde(rename = "originNodeID")]
    pub origin_node_id: NodeId,
    #[serde(rename = "nextViewID")]
    pub next_view_id: ViewId,
    #[serde(rename = "V")]
    pub view_changes: HashMap<NodeId, ViewChangeMessage>,
    #[serde(rename = "O")]
    pub pre_prepares: Vec<PrePrepareMessage>,
    pub min_s: SeqNo,
}

/// The logical endpoint a message is routed to, carried as the
/// `msgType` tag of the signed envelope.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MessageTag {
    /// Client request intake. Exists for exhaustive dispatch and the
    /// co-located client path only; replica-to-replica traffic never
    /// carries this tag.
    Request,
    PrePrepare,
    Prepare,
    Commit,
    Reply,
    CheckPoint,
    ViewChange,
    NewView,
}

impl MessageTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageTag::Request => "/req",
            MessageTag::PrePrepare => "/preprepare",
            MessageTag::Prepare => "/prepare",
            MessageTag::Commit => "/commit",
            MessageTag::Reply => "/reply",
            MessageTag::CheckPoint => "/checkpoint",
            MessageTag::ViewChange => "/viewchange",
            MessageTag::NewView => "/newview",
        }
    }

    pub fn from_str(tag: &str) -> Result<Self> {
        Ok(match tag {
            "/req" => MessageTag::Request,
            "/preprepare" => MessageTag::PrePrepare,
            "/prepare" => MessageTag::Prepare,
            "/commit" => MessageTag::Commit,
            "/reply" => MessageTag::Reply,
            "/checkpoint" => MessageTag::CheckPoint,
            "/viewchange" => MessageTag::ViewChange,
            "/newview" => MessageTag::NewView,
            _ => return Err(Error::Crypto("unknown message tag")),
        })
    }
}

impl Serialize for MessageTag {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageTag {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        MessageTag::from_str(&tag).map_err(serde::de::Error::custom)
    }
}

/// A `SystemMessage` corresponds to a message of one of the replica's
/// sub-protocols, dispatched exhaustively by its envelope tag.
#[derive(Clone, Debug)]
pub enum SystemMessage {
    Request(RequestMessage),
    PrePrepare(PrePrepareMessage),
    Vote(VoteMessage),
    Reply(ReplyMessage),
    CheckPoint(CheckPointMessage),
    ViewChange(ViewChangeMessage),
    NewView(NewViewMessage),
}

impl SystemMessage {
    pub fn tag(&self) -> MessageTag {
        match self {
            SystemMessage::Request(_) => MessageTag::Request,
            SystemMessage::PrePrepare(_) => MessageTag::PrePrepare,
            SystemMessage::Vote(vote) => match vote.kind {
                VoteKind::Prepare => MessageTag::Prepare,
                VoteKind::Commit => MessageTag::Commit,
            },
            SystemMessage::Reply(_) => MessageTag::Reply,
            SystemMessage::CheckPoint(_) => MessageTag::CheckPoint,
            SystemMessage::ViewChange(_) => MessageTag::ViewChange,
            SystemMessage::NewView(_) => MessageTag::NewView,
        }
    }

    /// The node id the payload claims as its origin. Must match the key
    /// that verified the envelope.
    pub fn origin(&self) -> NodeId {
        match self {
            SystemMessage::Request(m) => NodeId::from(m.client_id.as_str()),
            SystemMessage::PrePrepare(m) => m.origin_node_id.clone(),
            SystemMessage::Vote(m) => m.voter_node_id.clone(),
            SystemMessage::Reply(m) => m.executor_node_id.clone(),
            SystemMessage::CheckPoint(m) => m.origin_node_id.clone(),
            SystemMessage::ViewChange(m) => m.origin_node_id.clone(),
            SystemMessage::NewView(m) => m.origin_node_id.clone(),
        }
    }

    pub fn serialize_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            SystemMessage::Request(m) => serde_json::to_vec(m)?,
            SystemMessage::PrePrepare(m) => serde_json::to_vec(m)?,
            SystemMessage::Vote(m) => serde_json::to_vec(m)?,
            SystemMessage::Reply(m) => serde_json::to_vec(m)?,
            SystemMessage::CheckPoint(m) => serde_json::to_vec(m)?,
            SystemMessage::ViewChange(m) => serde_json::to_vec(m)?,
            SystemMessage::NewView(m) => serde_json::to_vec(m)?,
        };
        Ok(bytes)
    }

    pub fn deserialize_payload(tag: MessageTag, payload: &[u8]) -> Result<Self> {
        Ok(match tag {
            MessageTag::Request => SystemMessage::Request(serde_json::from_slice(payload)?),
            MessageTag::PrePrepare => SystemMessage::PrePrepare(serde_json::from_slice(payload)?),
            MessageTag::Prepare | MessageTag::Commit => {
                SystemMessage::Vote(serde_json::from_slice(payload)?)
            }
            MessageTag::Reply => SystemMessage::Reply(serde_json::from_slice(payload)?),
            MessageTag::CheckPoint => SystemMessage::CheckPoint(serde_json::from_slice(payload)?),
            MessageTag::ViewChange => SystemMessage::ViewChange(serde_json::from_slice(payload)?),
            MessageTag::NewView => SystemMessage::NewView(serde_json::from_slice(payload)?),
        })
    }

}

/// The signed envelope every message travels in.
///
/// The signature covers the marshalled payload bytes; `r` and `s` are
/// the scalar components of the same signature, which is what the
/// receiving side actually verifies.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    #[serde(with = "base64_bytes")]
    pub signature: Vec<u8>,
    #[serde(with = "bigint_dec")]
    pub r: BigUint,
    #[serde(with = "bigint_dec")]
    pub s: BigUint,
    #[serde(rename = "msgType")]
    pub msg_type: MessageTag,
    #[serde(rename = "marshalledmsg", with = "base64_bytes")]
    pub marshalled_msg: Vec<u8>,
}

impl SignedEnvelope {
    /// Signs `message` with `keys` and wraps it for the wire.
    pub fn seal(message: &SystemMessage, keys: &KeyPair) -> Result<Self> {
        let marshalled_msg = message.serialize_payload()?;
        let signature = keys.sign(&marshalled_msg)?;
        Ok(SignedEnvelope {
            r: signature.r(),
            s: signature.s(),
            signature: signature.as_ref().to_vec(),
            msg_type: message.tag(),
            marshalled_msg,
        })
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Verifies the `(r, s)` signature over the payload against the
    /// sender's known public key.
    pub fn verify(&self, public_key: &PublicKey) -> Result<()> {
        let signature = Signature::from_parts(&self.r, &self.s)?;
        public_key.verify(&self.marshalled_msg, &signature)
    }

    /// Decodes the inner payload according to the envelope tag.
    pub fn message(&self) -> Result<SystemMessage> {
        SystemMessage::deserialize_payload(self.msg_type, &self.marshalled_msg)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

mod bigint_dec {
    use num_bigint::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let digits = String::deserialize(deserializer)?;
        digits
            .parse::<BigUint>()
            .map_err(serde::de::Error::custom)
    }
}
