//! In-process link transport
//!
//! Connects two instances living in the same process over channel-backed
//! frame duplexes. This is the reference transport used by the tests and
//! demos; real deployments plug their own [`Link`] implementations in
//! beside it.

use super::{FrameDuplex, Link, LinkEvent, LinkEventSender, LinkId};
use crate::error::{Error, Result};
use crate::protocol::Cost;
use parking_lot::Mutex;

/// A channel-backed link endpoint; create both ends with
/// [`MemoryLink::pair`].
pub struct MemoryLink {
    id: LinkId,
    cost: Cost,
    external: bool,
    initiator: bool,
    pending: Mutex<Option<FrameDuplex>>,
    events: Mutex<Option<LinkEventSender>>,
}

impl MemoryLink {
    /// Create two connected endpoints with the given route cost.
    ///
    /// The first endpoint initiates the handshake.
    pub fn pair(name: &str, cost: Cost) -> (MemoryLink, MemoryLink) {
        Self::build_pair(name, cost, false)
    }

    /// Create a connected pair crossing a trust boundary
    pub fn external_pair(name: &str, cost: Cost) -> (MemoryLink, MemoryLink) {
        Self::build_pair(name, cost, true)
    }

    fn build_pair(name: &str, cost: Cost, external: bool) -> (MemoryLink, MemoryLink) {
        let (a, b) = FrameDuplex::pair();
        let left = MemoryLink {
            id: LinkId::new(format!("{name}:a")),
            cost,
            external,
            initiator: true,
            pending: Mutex::new(Some(a)),
            events: Mutex::new(None),
        };
        let right = MemoryLink {
            id: LinkId::new(format!("{name}:b")),
            cost,
            external,
            initiator: false,
            pending: Mutex::new(Some(b)),
            events: Mutex::new(None),
        };
        (left, right)
    }
}

impl Link for MemoryLink {
    fn id(&self) -> &LinkId {
        &self.id
    }

    fn cost(&self) -> Cost {
        self.cost
    }

    fn is_external(&self) -> bool {
        self.external
    }

    fn link_type(&self) -> &'static str {
        "memory"
    }

    fn start(&self, events: LinkEventSender) -> Result<()> {
        let duplex = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| Error::Link(format!("memory link {} already started", self.id)))?;
        events
            .send(LinkEvent::Connection {
                link: self.id.clone(),
                conn: 1,
                initiator: self.initiator,
                duplex,
            })
            .map_err(|_| Error::Link("link event receiver dropped".into()))?;
        *self.events.lock() = Some(events);
        Ok(())
    }

    fn close(&self) {
        if let Some(events) = self.events.lock().take() {
            let _ = events.send(LinkEvent::ConnectionClosed {
                link: self.id.clone(),
                conn: 1,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Frame, RouterPacket};
    use crate::protocol::HandlerKind;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_pair_reports_connections() {
        let (left, right) = MemoryLink::pair("t", Cost::new(1.0).unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        left.start(tx.clone()).unwrap();
        right.start(tx).unwrap();

        let mut initiators = Vec::new();
        for _ in 0..2 {
            match rx.recv().await.unwrap() {
                LinkEvent::Connection { initiator, .. } => initiators.push(initiator),
                other => panic!("unexpected event {other:?}"),
            }
        }
        initiators.sort();
        assert_eq!(initiators, vec![false, true]);
    }

    #[tokio::test]
    async fn test_pair_frames_cross() {
        let (left, right) = MemoryLink::pair("t", Cost::new(1.0).unwrap());
        let (ltx, mut lrx) = mpsc::unbounded_channel();
        let (rtx, mut rrx) = mpsc::unbounded_channel();
        left.start(ltx).unwrap();
        right.start(rtx).unwrap();

        let LinkEvent::Connection { duplex: l, .. } = lrx.recv().await.unwrap() else {
            panic!("expected connection");
        };
        let LinkEvent::Connection { duplex: mut r, .. } = rrx.recv().await.unwrap() else {
            panic!("expected connection");
        };

        l.tx.send(Frame::Packet(RouterPacket {
            p: HandlerKind::Bus,
            d: None,
            m: serde_json::json!(1),
        }))
        .unwrap();
        match r.rx.recv().await.unwrap() {
            Frame::Packet(p) => assert_eq!(p.p, HandlerKind::Bus),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_double_start_fails() {
        let (left, _right) = MemoryLink::pair("t", Cost::ZERO);
        let (tx, _rx) = mpsc::unbounded_channel();
        left.start(tx.clone()).unwrap();
        assert!(left.start(tx).is_err());
    }
}
