//! Maelstrom wire protocol for the broadcast workload.
//!
//! Messages are newline-delimited JSON envelopes. Request/response
//! correlation (`msg_id`, `in_reply_to`) lives inside the body, next to the
//! `type` tag.
//!
//! ## Message Flow
//!
//! ```text
//! client          n1                    n2
//!   |--broadcast-->|                     |
//!   |<-broadcast_ok|                     |
//!   |              |----broadcast------->|   (delivery queue, retried)
//!   |              |<---broadcast_ok-----|
//!   |              |                     |
//!   |              |<---read{hint}-------|   (anti-entropy pull: msg_count + digest)
//!   |              |----read_ok--------->|
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{NodeId, Value};

/// Maelstrom error codes.
///
/// Unknown codes received from peers are kept verbatim in `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum ErrorCode {
    /// 0: the request timed out
    Timeout,
    /// 1: the destination node does not exist
    NodeNotFound,
    /// 10: the request type is not supported
    NotSupported,
    /// 11: the node cannot serve the request right now
    TemporarilyUnavailable,
    /// 12: the request was malformed
    MalformedRequest,
    /// 13: the node crashed while handling the request
    Crash,
    /// 14: the request was aborted
    Abort,
    /// Any other code
    Other(u32),
}

impl ErrorCode {
    /// Whether the same request will be refused again no matter how often it is sent.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ErrorCode::NotSupported | ErrorCode::MalformedRequest)
    }
}

impl From<u32> for ErrorCode {
    fn from(code: u32) -> Self {
        match code {
            0 => ErrorCode::Timeout,
            1 => ErrorCode::NodeNotFound,
            10 => ErrorCode::NotSupported,
            11 => ErrorCode::TemporarilyUnavailable,
            12 => ErrorCode::MalformedRequest,
            13 => ErrorCode::Crash,
            14 => ErrorCode::Abort,
            other => ErrorCode::Other(other),
        }
    }
}

impl From<ErrorCode> for u32 {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Timeout => 0,
            ErrorCode::NodeNotFound => 1,
            ErrorCode::NotSupported => 10,
            ErrorCode::TemporarilyUnavailable => 11,
            ErrorCode::MalformedRequest => 12,
            ErrorCode::Crash => 13,
            ErrorCode::Abort => 14,
            ErrorCode::Other(other) => other,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u32::from(*self))
    }
}

/// Message payloads understood by a broadcast node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// Handshake from the Maelstrom harness
    Init {
        /// Our own id
        node_id: NodeId,
        /// Every cluster member, ourselves included
        node_ids: Vec<NodeId>,
    },
    /// Handshake acknowledgement
    InitOk,

    /// Disseminate one value
    Broadcast {
        /// The value to disseminate
        message: Value,
    },
    /// Value accepted (new or already known)
    BroadcastOk,

    /// Read every value the node knows
    ///
    /// Peers pulling for anti-entropy attach their store size and set digest
    /// as a skip hint; clients never do.
    Read {
        /// Requester's store size
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_count: Option<usize>,
        /// Requester's set hash (see [`crate::SetDigest`])
        #[serde(default, skip_serializing_if = "Option::is_none")]
        digest: Option<u64>,
    },
    /// Values known by the responder
    ReadOk {
        /// Known values; empty when the requester's hint matches the responder's set
        messages: Vec<Value>,
        /// Responder's store size, present only in replies to hinted reads
        #[serde(default, skip_serializing_if = "Option::is_none")]
        msg_count: Option<usize>,
    },

    /// Neighbor assignment
    Topology {
        /// Neighbor list per node
        topology: BTreeMap<NodeId, Vec<NodeId>>,
        /// Coordinator that computed the tree; absent on client-issued topologies
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<NodeId>,
    },
    /// Assignment accepted
    TopologyOk,

    /// Request failed
    Error {
        /// Maelstrom error code
        code: ErrorCode,
        /// Human-readable reason
        text: String,
    },
}

impl Body {
    /// Every `type` tag this node can decode.
    pub const KNOWN_TYPES: &'static [&'static str] = &[
        "init",
        "init_ok",
        "broadcast",
        "broadcast_ok",
        "read",
        "read_ok",
        "topology",
        "topology_ok",
        "error",
    ];

    /// Build an error body.
    pub fn error(code: ErrorCode, text: impl Into<String>) -> Self {
        Body::Error {
            code,
            text: text.into(),
        }
    }

    /// The `type` tag of this body.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Init { .. } => "init",
            Body::InitOk => "init_ok",
            Body::Broadcast { .. } => "broadcast",
            Body::BroadcastOk => "broadcast_ok",
            Body::Read { .. } => "read",
            Body::ReadOk { .. } => "read_ok",
            Body::Topology { .. } => "topology",
            Body::TopologyOk => "topology_ok",
            Body::Error { .. } => "error",
        }
    }
}

/// Body plus correlation ids, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBody {
    /// Sender-unique id of a request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u64>,
    /// The request this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<u64>,
    /// Typed payload
    #[serde(flatten)]
    pub payload: Body,
}

/// One line of Maelstrom traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender
    pub src: NodeId,
    /// Recipient
    pub dest: NodeId,
    /// Payload with correlation ids
    pub body: WireBody,
}

/// An inbound line that could not be decoded into a known body.
#[derive(Debug, Clone)]
pub struct DecodeFailure {
    /// Sender, when the envelope itself parsed
    pub src: Option<NodeId>,
    /// Request id, so the sender can be told what went wrong
    pub msg_id: Option<u64>,
    /// Code to answer with
    pub code: ErrorCode,
    /// Decoder message
    pub reason: String,
}

#[derive(Deserialize)]
struct RawEnvelope {
    src: NodeId,
    dest: NodeId,
    body: serde_json::Value,
}

impl Envelope {
    /// Encode to a single JSON line (no trailing newline).
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decode one JSON line.
    ///
    /// A body with an unknown `type` maps to `not-supported`, a known type
    /// with bad fields to `malformed-request`.
    pub fn decode(line: &str) -> Result<Self, DecodeFailure> {
        let raw: RawEnvelope = serde_json::from_str(line).map_err(|e| DecodeFailure {
            src: None,
            msg_id: None,
            code: ErrorCode::MalformedRequest,
            reason: e.to_string(),
        })?;

        let RawEnvelope { src, dest, body } = raw;
        let msg_id = body.get("msg_id").and_then(|v| v.as_u64());
        let type_tag = body
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();

        let body: WireBody = serde_json::from_value(body).map_err(|e| DecodeFailure {
            src: Some(src.clone()),
            msg_id,
            code: if Body::KNOWN_TYPES.contains(&type_tag.as_str()) {
                ErrorCode::MalformedRequest
            } else {
                ErrorCode::NotSupported
            },
            reason: e.to_string(),
        })?;

        Ok(Envelope { src, dest, body })
    }
}
