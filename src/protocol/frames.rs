//! Frame structs for every protocol in the core
//!
//! Field names match the wire exactly: `p` (protocol/phase), `d`
//! (destination), `s` (sender), `m` (payload), `n` (named handler),
//! `u` (update batch). Optional fields are omitted from the wire when
//! absent.

use super::{Cost, HandlerKind, Neighborhood};
use crate::address::VertexId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Everything that can cross a link after the handshake is one of these.
///
/// The variants are structurally distinct (`u` batch, restricted handshake
/// phases with a sender field, handler tag with a payload), so the frame is
/// self-describing without an outer tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    /// Distance-vector update batch between adjacent internal peers
    Routing(RoutingFrame),
    /// Link handshake / teardown
    Handshake(HandshakeFrame),
    /// A routed packet addressed to a handler
    Packet(RouterPacket),
}

/// One distance-vector table delta: `{id, seq, cost}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteUpdate {
    /// Destination the update describes
    pub id: VertexId,
    /// Destination-owned sequence number
    pub seq: u64,
    /// Advertised cost from the sender to the destination
    pub cost: Cost,
}

/// Batch of distance-vector deltas: `{u: [...]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingFrame {
    /// The update batch
    pub u: Vec<RouteUpdate>,
}

/// Handshake phases of the 3-way greet exchange plus teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakePhase {
    /// Initiator's opening announcement
    Greetings,
    /// Responder's reply carrying its identity
    Hi,
    /// Initiator's confirmation; the channel is usable after this
    Ready,
    /// Graceful teardown
    Goodbye,
}

/// Identity metadata exchanged during the handshake:
/// `{i: instanceId, e: edgeId?}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HelloMeta {
    /// Instance identity the sender presents on this link
    pub i: VertexId,
    /// External-edge identity, present when the link crosses a trust boundary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<VertexId>,
}

/// Handshake frame: `{p, s, d?, m?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeFrame {
    /// Phase
    pub p: HandshakePhase,
    /// Sender's connection token
    pub s: String,
    /// Destination connection token, echoed from the peer once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    /// Identity metadata (greetings/hi only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<HelloMeta>,
}

/// Routed packet: `{p: handler, d?: destination, m: payload}`.
///
/// `d` is omitted when the destination is the receiving peer itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterPacket {
    /// Handler the payload is dispatched to
    pub p: HandlerKind,
    /// Destination instance; absent means "the receiver"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<VertexId>,
    /// Opaque payload for the handler
    pub m: Value,
}

/// Source-routed packet: `{d: [hop,...], n: handler, m: payload}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathVectorPacket {
    /// Remaining hops to traverse, in travel order
    pub d: Vec<VertexId>,
    /// Handler the inner payload is delivered to at the final hop
    pub n: HandlerKind,
    /// Opaque payload
    pub m: Value,
}

/// Flooded bus packet: `{event: [name, ...args], seq, mode, path}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusPacket {
    /// Event name followed by its arguments
    pub event: Vec<Value>,
    /// Per-origin monotonic sequence number
    pub seq: u64,
    /// Neighborhood scope the packet may still propagate within
    pub mode: Neighborhood,
    /// Hops traversed so far; `path[0]` is the origin
    pub path: Vec<VertexId>,
}

/// Affinity chain operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffinityOp {
    /// Establish (or acknowledge) a chain hop
    Add,
    /// Tear down a chain
    Remove,
    /// Reject and unwind a partially established chain
    Error,
}

/// One or many affinity identifiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AffinityIds {
    /// A single affinity
    One(Uuid),
    /// A batch, as produced by route-loss cascades
    Many(Vec<Uuid>),
}

impl AffinityIds {
    /// View as a slice-like vector
    pub fn to_vec(&self) -> Vec<Uuid> {
        match self {
            Self::One(id) => vec![*id],
            Self::Many(ids) => ids.clone(),
        }
    }
}

impl From<Uuid> for AffinityIds {
    fn from(id: Uuid) -> Self {
        Self::One(id)
    }
}

impl From<Vec<Uuid>> for AffinityIds {
    fn from(ids: Vec<Uuid>) -> Self {
        Self::Many(ids)
    }
}

/// Affinity packet: `{id, from, type, path?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AffinityPacket {
    /// Affinity identifier(s) the operation applies to
    pub id: AffinityIds,
    /// The hop that sent this packet
    pub from: VertexId,
    /// Operation
    #[serde(rename = "type")]
    pub op: AffinityOp,
    /// Hops still to visit (add only); absent marks an acknowledgement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<VertexId>>,
}

/// Kind of messenger packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// A message expecting (at most) one response
    Request,
    /// The response to an earlier request
    Response,
}

/// Point-to-point message riding the path vector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePacket {
    /// Correlation id pairing requests with responses
    pub id: Uuid,
    /// Request or response
    pub kind: MessageKind,
    /// Registered handler name (requests only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Return path back to the sender, in the sender's travel order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<VertexId>>,
    /// Message body
    pub m: Value,
}

/// Stream payload mode negotiated at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Structured object frames
    #[default]
    Object,
    /// Raw byte chunks
    Bytes,
}

/// Stream protocol operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MuxOp {
    /// Announce a new stream
    New,
    /// Half-close
    End,
    /// Back-pressure: stop sending
    Pause,
    /// Back-pressure released
    Resume,
}

/// Stream control message: `{p, meta?, mode?, from?}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxControl {
    /// Operation
    pub p: MuxOp,
    /// User metadata (new only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
    /// Payload mode (new only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<StreamKind>,
    /// Return path to the stream's creator (new only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<Vec<VertexId>>,
}

/// Payload of a multiplexer frame: control or data.
///
/// Control is matched first; a data object carrying a literal `p` key with
/// an op name would be indistinguishable on the wire, which is a documented
/// constraint of the frame format (wrap such payloads one level deeper).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MuxPayload {
    /// Stream lifecycle / flow control
    Control(MuxControl),
    /// User data
    Data(Value),
}

/// Multiplexer frame: `{id, local, m}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MuxFrame {
    /// Stream identifier
    pub id: Uuid,
    /// Whether the id was allocated by the frame's sender
    pub local: bool,
    /// Control message or data payload
    pub m: MuxPayload,
}
