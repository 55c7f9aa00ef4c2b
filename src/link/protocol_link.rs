//! Handshake layer over raw links
//!
//! Every new connection performs a 3-way `greetings`/`hi`/`ready` exchange
//! establishing who is on the other end before any routed traffic flows.
//! Identity metadata carries the instance id and, on external links, the
//! edge id presented instead of the internal identity. `goodbye` tears a
//! channel down gracefully; unacknowledged handshakes expire after a fixed
//! window and are force-closed.

use super::{FrameDuplex, FrameReceiver, FrameSender, LinkEvent, LinkId, LinkRef};
use crate::address::VertexId;
use crate::error::{Error, Result};
use crate::protocol::{Cost, Frame, HandshakeFrame, HandshakePhase, HelloMeta};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Peer lifecycle events reported once the handshake settles
#[derive(Debug)]
pub enum PeerEvent {
    /// A peer channel became usable
    PeerUp {
        /// The peer's presented identity
        peer: VertexId,
        /// Link the channel runs over
        link: LinkId,
        /// Route cost of the link
        cost: Cost,
        /// Whether the channel crosses a trust boundary
        external: bool,
        /// Frames toward the peer
        tx: FrameSender,
    },
    /// A peer channel went away (goodbye or transport loss)
    PeerDown {
        /// The peer the channel belonged to
        peer: VertexId,
        /// Link the channel ran over
        link: LinkId,
    },
}

/// A post-handshake frame tagged with its arrival channel
#[derive(Debug)]
pub struct InboundFrame {
    /// Peer the frame arrived from
    pub peer: VertexId,
    /// Link it arrived over
    pub link: LinkId,
    /// The frame itself
    pub frame: Frame,
}

/// Composes a [`Link`](super::Link) with the handshake state machine.
///
/// One `ProtocolLink` wraps one configured link; concrete transports are
/// never subclassed, only wrapped.
pub struct ProtocolLink {
    link: LinkRef,
    presented: HelloMeta,
    timeout: Duration,
    peers: mpsc::UnboundedSender<PeerEvent>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    pending: Arc<DashMap<u64, Instant>>,
    closers: Arc<DashMap<u64, Arc<Notify>>>,
}

impl ProtocolLink {
    /// Wrap `link`, presenting `presented` during handshakes.
    ///
    /// Established channels are reported to `peers`; post-handshake frames
    /// flow into `inbound`.
    pub fn new(
        link: LinkRef,
        presented: HelloMeta,
        timeout: Duration,
        peers: mpsc::UnboundedSender<PeerEvent>,
        inbound: mpsc::UnboundedSender<InboundFrame>,
    ) -> Self {
        Self {
            link,
            presented,
            timeout,
            peers,
            inbound,
            pending: Arc::new(DashMap::new()),
            closers: Arc::new(DashMap::new()),
        }
    }

    /// Start the underlying link and begin handshaking its connections
    pub fn start(&self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.link.start(tx)?;

        let cost = self.link.cost();
        let external = self.link.is_external();
        let presented = self.presented.clone();
        let timeout = self.timeout;
        let peers = self.peers.clone();
        let inbound = self.inbound.clone();
        let pending = Arc::clone(&self.pending);
        let closers = Arc::clone(&self.closers);

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    LinkEvent::Connection {
                        link,
                        conn,
                        initiator,
                        duplex,
                    } => {
                        let closer = Arc::new(Notify::new());
                        closers.insert(conn, Arc::clone(&closer));
                        tokio::spawn(run_connection(ConnectionTask {
                            link,
                            conn,
                            initiator,
                            duplex,
                            cost,
                            external,
                            presented: presented.clone(),
                            timeout,
                            peers: peers.clone(),
                            inbound: inbound.clone(),
                            pending: Arc::clone(&pending),
                            closers: Arc::clone(&closers),
                            closer,
                        }));
                    }
                    LinkEvent::ConnectionClosed { link, conn } => {
                        debug!(%link, conn, "connection closed by transport");
                        if let Some((_, closer)) = closers.remove(&conn) {
                            closer.notify_one();
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// The wrapped link
    pub fn link(&self) -> &LinkRef {
        &self.link
    }

    /// Number of connections still mid-handshake
    pub fn pending_handshakes(&self) -> usize {
        self.pending.len()
    }

    /// Stop the underlying link and tear down its established channels
    pub fn close(&self) {
        self.link.close();
        for entry in self.closers.iter() {
            entry.value().notify_one();
        }
        self.closers.clear();
    }
}

/// Send a graceful teardown on an established channel
pub fn send_goodbye(tx: &FrameSender, sender: &VertexId) {
    let _ = tx.send(Frame::Handshake(HandshakeFrame {
        p: HandshakePhase::Goodbye,
        s: sender.to_string(),
        d: None,
        m: None,
    }));
}

struct ConnectionTask {
    link: LinkId,
    conn: u64,
    initiator: bool,
    duplex: FrameDuplex,
    cost: Cost,
    external: bool,
    presented: HelloMeta,
    timeout: Duration,
    peers: mpsc::UnboundedSender<PeerEvent>,
    inbound: mpsc::UnboundedSender<InboundFrame>,
    pending: Arc<DashMap<u64, Instant>>,
    closers: Arc<DashMap<u64, Arc<Notify>>>,
    closer: Arc<Notify>,
}

async fn run_connection(mut task: ConnectionTask) {
    task.pending.insert(task.conn, Instant::now());
    let token = format!("{}:{}", task.link, task.conn);
    let outcome = handshake(
        task.initiator,
        &mut task.duplex,
        &token,
        &task.presented,
        task.timeout,
    )
    .await;
    task.pending.remove(&task.conn);

    let meta = match outcome {
        Ok(meta) => meta,
        Err(e) => {
            warn!(link = %task.link, conn = task.conn, error = %e, "handshake failed, closing connection");
            task.closers.remove(&task.conn);
            return;
        }
    };
    let peer = resolve_peer_id(task.external, &meta);
    debug!(link = %task.link, %peer, external = task.external, "channel established");

    let _ = task.peers.send(PeerEvent::PeerUp {
        peer,
        link: task.link.clone(),
        cost: task.cost,
        external: task.external,
        tx: task.duplex.tx.clone(),
    });

    tokio::select! {
        _ = pump(peer, &task.link, &mut task.duplex.rx, &task.inbound) => {}
        _ = task.closer.notified() => {
            send_goodbye(&task.duplex.tx, &task.presented.i);
            debug!(link = %task.link, %peer, "connection closed locally");
        }
    }
    task.closers.remove(&task.conn);

    let _ = task.peers.send(PeerEvent::PeerDown {
        peer,
        link: task.link,
    });
}

/// Identity the peer is known by on this side of the link.
///
/// On external links the peer is its presented edge id; a peer that sent
/// no edge id is tracked by its instance id forced external.
fn resolve_peer_id(external: bool, meta: &HelloMeta) -> VertexId {
    if external {
        meta.e.unwrap_or_else(|| meta.i.as_external())
    } else {
        meta.i
    }
}

async fn handshake(
    initiator: bool,
    duplex: &mut FrameDuplex,
    token: &str,
    presented: &HelloMeta,
    timeout: Duration,
) -> Result<HelloMeta> {
    if initiator {
        send_phase(
            &duplex.tx,
            HandshakePhase::Greetings,
            token,
            None,
            Some(presented.clone()),
        )?;
        let hi = expect_phase(&mut duplex.rx, HandshakePhase::Hi, timeout).await?;
        let meta = hi
            .m
            .ok_or_else(|| Error::Protocol("hi frame without identity metadata".into()))?;
        send_phase(&duplex.tx, HandshakePhase::Ready, token, Some(hi.s), None)?;
        Ok(meta)
    } else {
        let greet = expect_phase(&mut duplex.rx, HandshakePhase::Greetings, timeout).await?;
        let meta = greet
            .m
            .ok_or_else(|| Error::Protocol("greetings frame without identity metadata".into()))?;
        send_phase(
            &duplex.tx,
            HandshakePhase::Hi,
            token,
            Some(greet.s),
            Some(presented.clone()),
        )?;
        expect_phase(&mut duplex.rx, HandshakePhase::Ready, timeout).await?;
        Ok(meta)
    }
}

fn send_phase(
    tx: &FrameSender,
    phase: HandshakePhase,
    token: &str,
    dest: Option<String>,
    meta: Option<HelloMeta>,
) -> Result<()> {
    tx.send(Frame::Handshake(HandshakeFrame {
        p: phase,
        s: token.to_string(),
        d: dest,
        m: meta,
    }))
    .map_err(|_| Error::Link("connection closed mid-handshake".into()))
}

async fn expect_phase(
    rx: &mut FrameReceiver,
    phase: HandshakePhase,
    dur: Duration,
) -> Result<HandshakeFrame> {
    match tokio::time::timeout(dur, rx.recv()).await {
        Err(_) => Err(Error::Link(format!("handshake timed out awaiting {phase:?}"))),
        Ok(None) => Err(Error::Link("connection closed during handshake".into())),
        Ok(Some(Frame::Handshake(frame))) if frame.p == phase => Ok(frame),
        Ok(Some(Frame::Handshake(frame))) if frame.p == HandshakePhase::Goodbye => {
            Err(Error::Link("peer said goodbye during handshake".into()))
        }
        Ok(Some(other)) => Err(Error::Protocol(format!(
            "unexpected frame during handshake: {other:?}"
        ))),
    }
}

async fn pump(
    peer: VertexId,
    link: &LinkId,
    rx: &mut FrameReceiver,
    inbound: &mpsc::UnboundedSender<InboundFrame>,
) {
    while let Some(frame) = rx.recv().await {
        match frame {
            Frame::Handshake(h) if h.p == HandshakePhase::Goodbye => {
                debug!(%peer, %link, "peer said goodbye");
                break;
            }
            Frame::Handshake(h) => {
                warn!(%peer, %link, phase = ?h.p, "dropping handshake frame on established channel");
            }
            frame => {
                if inbound
                    .send(InboundFrame {
                        peer,
                        link: link.clone(),
                        frame,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }
    }
}
