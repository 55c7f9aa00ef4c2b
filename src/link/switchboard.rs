//! Per-peer switch streams with link failover
//!
//! The switch board keeps one logical stream per adjacent peer. When the
//! same peer is reachable over several links at once, the cheapest channel
//! carries the traffic and the others stand by; losing the active channel
//! fails over to the next cheapest instead of tearing the adjacency down.

use super::{FrameSender, LinkId};
use crate::address::VertexId;
use crate::error::{Error, Result};
use crate::protocol::{Cost, Frame};
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Adjacency lifecycle events the router consumes
#[derive(Debug)]
pub enum SwitchEvent {
    /// First channel to a peer came up
    LinkAvailable {
        /// The adjacent peer
        peer: VertexId,
        /// Active link
        link: LinkId,
        /// Cost of the active link
        cost: Cost,
        /// Whether the peer sits across a trust boundary
        external: bool,
    },
    /// The active channel for a peer changed
    LinkSwitch {
        /// The adjacent peer
        peer: VertexId,
        /// New active link
        link: LinkId,
        /// Cost of the new active link
        cost: Cost,
    },
    /// The last channel to a peer went away
    LinkUnavailable {
        /// The formerly adjacent peer
        peer: VertexId,
    },
}

struct Channel {
    tx: FrameSender,
    cost: Cost,
}

struct SwitchStream {
    external: bool,
    channels: HashMap<LinkId, Channel>,
    active: LinkId,
}

impl SwitchStream {
    fn cheapest(&self) -> Option<(&LinkId, &Channel)> {
        self.channels
            .iter()
            .min_by(|(_, a), (_, b)| a.cost.partial_cmp(&b.cost).expect("costs are never NaN"))
    }
}

/// One logical switch stream per adjacent peer, failing over by cost
pub struct SwitchBoard {
    streams: RwLock<HashMap<VertexId, SwitchStream>>,
    events: mpsc::UnboundedSender<SwitchEvent>,
}

/// Snapshot of one adjacency
#[derive(Debug, Clone)]
pub struct Adjacency {
    /// The adjacent peer
    pub peer: VertexId,
    /// Active link carrying the traffic
    pub link: LinkId,
    /// Cost of the active link
    pub cost: Cost,
    /// Whether the peer sits across a trust boundary
    pub external: bool,
}

impl SwitchBoard {
    /// Create a switch board reporting adjacency changes into `events`
    pub fn new(events: mpsc::UnboundedSender<SwitchEvent>) -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Offer a new channel to `peer` over `link`.
    ///
    /// The first channel makes the peer adjacent; a cheaper channel than
    /// the active one takes over the stream.
    pub fn add_channel(
        &self,
        peer: VertexId,
        link: LinkId,
        cost: Cost,
        external: bool,
        tx: FrameSender,
    ) {
        let mut streams = self.streams.write();
        match streams.get_mut(&peer) {
            None => {
                streams.insert(
                    peer,
                    SwitchStream {
                        external,
                        channels: HashMap::from([(link.clone(), Channel { tx, cost })]),
                        active: link.clone(),
                    },
                );
                let _ = self.events.send(SwitchEvent::LinkAvailable {
                    peer,
                    link,
                    cost,
                    external,
                });
            }
            Some(stream) => {
                let active_cost = stream.channels[&stream.active].cost;
                stream.channels.insert(link.clone(), Channel { tx, cost });
                if cost < active_cost {
                    debug!(%peer, from = %stream.active, to = %link, "switching to cheaper link");
                    stream.active = link.clone();
                    let _ = self
                        .events
                        .send(SwitchEvent::LinkSwitch { peer, link, cost });
                }
            }
        }
    }

    /// Withdraw the channel to `peer` over `link`.
    ///
    /// Losing the active channel fails over to the next cheapest; losing
    /// the last channel removes the adjacency.
    pub fn remove_channel(&self, peer: &VertexId, link: &LinkId) {
        let mut streams = self.streams.write();
        let Some(stream) = streams.get_mut(peer) else {
            return;
        };
        if stream.channels.remove(link).is_none() {
            return;
        }
        if stream.channels.is_empty() {
            streams.remove(peer);
            let _ = self.events.send(SwitchEvent::LinkUnavailable { peer: *peer });
            return;
        }
        if stream.active == *link {
            let (next, channel) = stream.cheapest().expect("non-empty channel map");
            let (next, cost) = (next.clone(), channel.cost);
            debug!(%peer, from = %link, to = %next, "failing over after channel loss");
            stream.active = next.clone();
            let _ = self.events.send(SwitchEvent::LinkSwitch {
                peer: *peer,
                link: next,
                cost,
            });
        }
    }

    /// Send a frame to an adjacent peer over its active channel
    pub fn send(&self, peer: &VertexId, frame: Frame) -> Result<()> {
        let streams = self.streams.read();
        let stream = streams
            .get(peer)
            .ok_or_else(|| Error::Link(format!("no switch stream for peer {peer}")))?;
        stream.channels[&stream.active]
            .tx
            .send(frame)
            .map_err(|_| Error::Link(format!("channel to {peer} closed")))
    }

    /// Send a frame to an adjacent peer over a specific channel, ignoring
    /// the active-link selection
    pub fn send_via(&self, peer: &VertexId, link: &LinkId, frame: Frame) -> Result<()> {
        let streams = self.streams.read();
        let stream = streams
            .get(peer)
            .ok_or_else(|| Error::Link(format!("no switch stream for peer {peer}")))?;
        let channel = stream
            .channels
            .get(link)
            .ok_or_else(|| Error::Link(format!("no channel to {peer} over {link}")))?;
        channel
            .tx
            .send(frame)
            .map_err(|_| Error::Link(format!("channel to {peer} closed")))
    }

    /// Whether `peer` currently has a switch stream
    pub fn is_adjacent(&self, peer: &VertexId) -> bool {
        self.streams.read().contains_key(peer)
    }

    /// The active link toward `peer`
    pub fn active_link(&self, peer: &VertexId) -> Option<LinkId> {
        self.streams.read().get(peer).map(|s| s.active.clone())
    }

    /// Cost of the active channel toward `peer`
    pub fn cost_to(&self, peer: &VertexId) -> Option<Cost> {
        let streams = self.streams.read();
        let stream = streams.get(peer)?;
        Some(stream.channels[&stream.active].cost)
    }

    /// Snapshot of all adjacencies
    pub fn adjacencies(&self) -> Vec<Adjacency> {
        self.streams
            .read()
            .iter()
            .map(|(peer, stream)| Adjacency {
                peer: *peer,
                link: stream.active.clone(),
                cost: stream.channels[&stream.active].cost,
                external: stream.external,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HandlerKind, RouterPacket};

    fn frame() -> Frame {
        Frame::Packet(RouterPacket {
            p: HandlerKind::Bus,
            d: None,
            m: serde_json::json!(null),
        })
    }

    fn cost(v: f64) -> Cost {
        Cost::new(v).unwrap()
    }

    #[tokio::test]
    async fn test_first_channel_makes_peer_adjacent() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let board = SwitchBoard::new(events);
        let peer = VertexId::random();
        let (tx, _keep) = mpsc::unbounded_channel();

        board.add_channel(peer, LinkId::new("l1"), cost(2.0), false, tx);
        match rx.recv().await.unwrap() {
            SwitchEvent::LinkAvailable { peer: p, link, .. } => {
                assert_eq!(p, peer);
                assert_eq!(link, LinkId::new("l1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(board.is_adjacent(&peer));
        assert_eq!(board.cost_to(&peer), Some(cost(2.0)));
    }

    #[tokio::test]
    async fn test_cheaper_channel_takes_over() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let board = SwitchBoard::new(events);
        let peer = VertexId::random();
        let (tx1, _k1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        board.add_channel(peer, LinkId::new("slow"), cost(5.0), false, tx1);
        board.add_channel(peer, LinkId::new("fast"), cost(1.0), false, tx2);

        let _ = rx.recv().await.unwrap(); // link-available
        match rx.recv().await.unwrap() {
            SwitchEvent::LinkSwitch { link, .. } => assert_eq!(link, LinkId::new("fast")),
            other => panic!("unexpected event {other:?}"),
        }

        // Traffic now rides the cheap channel.
        board.send(&peer, frame()).unwrap();
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_costlier_channel_stands_by() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let board = SwitchBoard::new(events);
        let peer = VertexId::random();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, _k2) = mpsc::unbounded_channel();

        board.add_channel(peer, LinkId::new("fast"), cost(1.0), false, tx1);
        board.add_channel(peer, LinkId::new("slow"), cost(5.0), false, tx2);

        let _ = rx.recv().await.unwrap();
        assert!(rx.try_recv().is_err()); // no switch event
        board.send(&peer, frame()).unwrap();
        assert!(rx1.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_failover_on_active_channel_loss() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let board = SwitchBoard::new(events);
        let peer = VertexId::random();
        let (tx1, _k1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();

        board.add_channel(peer, LinkId::new("fast"), cost(1.0), false, tx1);
        board.add_channel(peer, LinkId::new("slow"), cost(5.0), false, tx2);
        let _ = rx.recv().await.unwrap();

        board.remove_channel(&peer, &LinkId::new("fast"));
        match rx.recv().await.unwrap() {
            SwitchEvent::LinkSwitch { link, cost: c, .. } => {
                assert_eq!(link, LinkId::new("slow"));
                assert_eq!(c, cost(5.0));
            }
            other => panic!("unexpected event {other:?}"),
        }

        board.send(&peer, frame()).unwrap();
        assert!(rx2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_last_channel_loss_removes_adjacency() {
        let (events, mut rx) = mpsc::unbounded_channel();
        let board = SwitchBoard::new(events);
        let peer = VertexId::random();
        let (tx, _k) = mpsc::unbounded_channel();

        board.add_channel(peer, LinkId::new("only"), cost(1.0), false, tx);
        let _ = rx.recv().await.unwrap();

        board.remove_channel(&peer, &LinkId::new("only"));
        match rx.recv().await.unwrap() {
            SwitchEvent::LinkUnavailable { peer: p } => assert_eq!(p, peer),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!board.is_adjacent(&peer));
        assert!(board.send(&peer, frame()).is_err());
    }
}
