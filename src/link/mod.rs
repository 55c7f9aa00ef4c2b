//! Link abstraction and connection plumbing
//!
//! A [`Link`] is one configured transport (in-process, socket, pipe, ...)
//! reduced to connection events carrying a frame-oriented duplex channel.
//! The layers above never see transport specifics:
//!
//! - [`ProtocolLink`](protocol_link::ProtocolLink) runs the 3-way handshake
//!   over every new connection and exchanges instance identity.
//! - [`LinkDirectory`](directory::LinkDirectory) tracks configured links and
//!   owns the identity presented on each.
//! - [`SwitchBoard`](switchboard::SwitchBoard) maintains one logical switch
//!   stream per adjacent peer, failing over between concurrent links by
//!   cost.

pub mod bridge;
pub mod directory;
pub mod memory;
pub mod protocol_link;
pub mod switchboard;

use crate::error::Result;
use crate::protocol::{Cost, Frame};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Identifier of one configured link
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(String);

impl LinkId {
    /// Create a link id from its configured name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The configured name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LinkId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Sending half of a frame channel
pub type FrameSender = mpsc::UnboundedSender<Frame>;
/// Receiving half of a frame channel
pub type FrameReceiver = mpsc::UnboundedReceiver<Frame>;

/// A bidirectional frame channel for one connection
pub struct FrameDuplex {
    /// Frames toward the peer
    pub tx: FrameSender,
    /// Frames from the peer
    pub rx: FrameReceiver,
}

impl FrameDuplex {
    /// Create two connected endpoints
    pub fn pair() -> (FrameDuplex, FrameDuplex) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            FrameDuplex { tx: a_tx, rx: a_rx },
            FrameDuplex { tx: b_tx, rx: b_rx },
        )
    }
}

impl fmt::Debug for FrameDuplex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameDuplex").finish_non_exhaustive()
    }
}

/// Connection lifecycle events reported by a link
#[derive(Debug)]
pub enum LinkEvent {
    /// A new connection was established
    Connection {
        /// The reporting link
        link: LinkId,
        /// Connection counter, unique per link
        conn: u64,
        /// Whether this side opens the handshake
        initiator: bool,
        /// The connection's frame channel
        duplex: FrameDuplex,
    },
    /// A connection went away below the protocol layer
    ConnectionClosed {
        /// The reporting link
        link: LinkId,
        /// The closed connection
        conn: u64,
    },
}

/// Sink for link events
pub type LinkEventSender = mpsc::UnboundedSender<LinkEvent>;

/// One configured transport.
///
/// Implementations report connections through the event sink handed to
/// [`Link::start`]; everything else about the transport stays behind this
/// trait.
pub trait Link: Send + Sync {
    /// Stable identifier of this link
    fn id(&self) -> &LinkId;

    /// Base cost of routes over this link
    fn cost(&self) -> Cost;

    /// Whether the link crosses into an untrusted network
    fn is_external(&self) -> bool;

    /// Transport kind, for diagnostics
    fn link_type(&self) -> &'static str;

    /// Begin reporting connections into `events`
    fn start(&self, events: LinkEventSender) -> Result<()>;

    /// Stop the transport and close its connections
    fn close(&self);
}

/// Shared handle to a link
pub type LinkRef = Arc<dyn Link>;
