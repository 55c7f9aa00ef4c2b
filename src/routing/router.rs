//! Packet routing and handler dispatch
//!
//! The router glues the distance-vector table to the switch board: switch
//! events feed the table, table events become route records, and routed
//! packets are either delivered to a registered handler or forwarded to the
//! next hop. Handlers are registered per tag in a capability registry and
//! held weakly so a dropped protocol never leaks out of the dispatch map.
//!
//! External peers never enter the distance-vector table; they get a direct
//! route record for their own edge identity only.

use super::routing_table::{RoutingTable, TableEvent};
use crate::address::VertexId;
use crate::api::config::FabricConfig;
use crate::api::events::{Event, EventHandlers, RouteFailure};
use crate::error::{Error, Result};
use crate::link::bridge::LinkBridge;
use crate::link::protocol_link::InboundFrame;
use crate::link::switchboard::{SwitchBoard, SwitchEvent};
use crate::link::LinkId;
use crate::protocol::{Cost, Frame, HandlerKind, Neighborhood, RouteUpdate, RouterPacket, RoutingFrame};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Where a delivered packet came from
#[derive(Debug, Clone)]
pub struct PacketContext {
    /// Trust level of the packet's source relative to this instance
    pub level: Neighborhood,
    /// Adjacent peer the packet arrived from; `None` for local sends
    pub source: Option<VertexId>,
    /// Link the packet arrived over; `None` for local sends
    pub link: Option<LinkId>,
}

impl PacketContext {
    /// Context for a packet originated by this instance
    pub fn local() -> Self {
        Self {
            level: Neighborhood::Local,
            source: None,
            link: None,
        }
    }
}

/// A protocol that receives routed packets for its handler tag
pub trait PacketHandler: Send + Sync {
    /// Handle one packet payload addressed to this handler
    fn handle(&self, router: &Router, ctx: PacketContext, payload: Value);
}

#[derive(Debug, Clone)]
struct RouteRecord {
    next_hop: VertexId,
    link: LinkId,
    cost: Cost,
    external: bool,
}

/// Snapshot of the route toward one destination
#[derive(Debug, Clone)]
pub struct RouteInfo {
    /// The destination
    pub dest: VertexId,
    /// Adjacent peer packets are forwarded through
    pub next_hop: VertexId,
    /// Link the next hop is reached over
    pub link: LinkId,
    /// Route cost
    pub cost: Cost,
    /// Whether the destination sits across a trust boundary
    pub external: bool,
}

struct RouterInner {
    local: VertexId,
    config: Arc<FabricConfig>,
    table: Mutex<RoutingTable>,
    routes: RwLock<HashMap<VertexId, RouteRecord>>,
    handlers: DashMap<HandlerKind, Weak<dyn PacketHandler>>,
    switch: Arc<SwitchBoard>,
    bridge: Arc<dyn LinkBridge>,
    events: EventHandlers,
    pending: Mutex<Vec<RouteUpdate>>,
}

/// The packet router for one instance
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Create a router for `local` over the given switch board
    pub fn new(
        local: VertexId,
        config: Arc<FabricConfig>,
        switch: Arc<SwitchBoard>,
        bridge: Arc<dyn LinkBridge>,
        events: EventHandlers,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                local,
                config,
                table: Mutex::new(RoutingTable::new(local)),
                routes: RwLock::new(HashMap::new()),
                handlers: DashMap::new(),
                switch,
                bridge,
                events,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The local identity
    pub fn local_id(&self) -> VertexId {
        self.inner.local
    }

    /// The instance configuration
    pub fn config(&self) -> &FabricConfig {
        &self.inner.config
    }

    /// The event registry this router dispatches into
    pub fn events(&self) -> &EventHandlers {
        &self.inner.events
    }

    /// Register `handler` for packets tagged `kind`.
    ///
    /// The handler is held weakly; dropping the owning `Arc` retires it.
    pub fn register_handler(&self, kind: HandlerKind, handler: Weak<dyn PacketHandler>) {
        self.inner.handlers.insert(kind, handler);
    }

    /// Remove the handler for `kind`
    pub fn unregister_handler(&self, kind: &HandlerKind) {
        self.inner.handlers.remove(kind);
    }

    /// The current route toward `dest`, if any
    pub fn route_to(&self, dest: &VertexId) -> Option<RouteInfo> {
        self.inner.routes.read().get(dest).map(|r| RouteInfo {
            dest: *dest,
            next_hop: r.next_hop,
            link: r.link.clone(),
            cost: r.cost,
            external: r.external,
        })
    }

    /// All destinations with a live route record
    pub fn known_destinations(&self) -> Vec<VertexId> {
        self.inner.routes.read().keys().copied().collect()
    }

    /// Internal adjacent peers (external edges excluded)
    pub fn internal_adjacents(&self) -> Vec<VertexId> {
        self.inner
            .switch
            .adjacencies()
            .into_iter()
            .filter(|a| !a.external)
            .map(|a| a.peer)
            .collect()
    }

    /// All adjacent peers, external edges included
    pub fn adjacent_peers(&self) -> Vec<VertexId> {
        self.inner
            .switch
            .adjacencies()
            .into_iter()
            .map(|a| a.peer)
            .collect()
    }

    /// Send a payload to `dest`, dispatching locally when `dest` is this
    /// instance.
    pub fn send_packet(&self, dest: VertexId, handler: HandlerKind, payload: Value) -> Result<()> {
        if dest == self.inner.local {
            self.deliver(PacketContext::local(), handler, payload);
            return Ok(());
        }
        self.forward(
            None,
            RouterPacket {
                p: handler,
                d: Some(dest),
                m: payload,
            },
            dest,
        )
    }

    /// Send a payload to an adjacent peer over a specific link, bypassing
    /// route selection.
    ///
    /// Used for bridge-scoped traffic that must stay on one link.
    pub fn send_packet_direct(
        &self,
        to: VertexId,
        link: &LinkId,
        handler: HandlerKind,
        payload: Value,
    ) -> Result<()> {
        self.inner.switch.send_via(
            &to,
            link,
            Frame::Packet(RouterPacket {
                p: handler,
                d: None,
                m: payload,
            }),
        )
    }

    /// Consume one switch board event
    pub fn handle_switch_event(&self, event: SwitchEvent) {
        match event {
            SwitchEvent::LinkAvailable {
                peer,
                link,
                cost,
                external,
            } => {
                if external {
                    self.inner.routes.write().insert(
                        peer,
                        RouteRecord {
                            next_hop: peer,
                            link,
                            cost,
                            external: true,
                        },
                    );
                    self.inner
                        .events
                        .dispatch(Event::RouteAvailable { dest: peer, cost });
                } else {
                    let delta = self.inner.table.lock().add_link(peer, cost);
                    self.send_updates(&peer, delta.to_peer);
                    self.queue_broadcast(delta.broadcast);
                    self.absorb(delta.events);
                }
            }
            SwitchEvent::LinkSwitch { peer, link, cost } => {
                if peer.is_external() {
                    let mut routes = self.inner.routes.write();
                    if let Some(record) = routes.get_mut(&peer) {
                        record.link = link;
                        record.cost = cost;
                    }
                    drop(routes);
                    self.inner
                        .events
                        .dispatch(Event::RouteChange { dest: peer, cost });
                } else {
                    let delta = self.inner.table.lock().update_link_cost(peer, cost);
                    self.queue_broadcast(delta.broadcast);
                    self.absorb(delta.events);
                }
            }
            SwitchEvent::LinkUnavailable { peer } => {
                if peer.is_external() {
                    if self.inner.routes.write().remove(&peer).is_some() {
                        self.inner
                            .events
                            .dispatch(Event::RouteUnavailable { dest: peer });
                    }
                } else {
                    let delta = self.inner.table.lock().remove_link(peer);
                    self.queue_broadcast(delta.broadcast);
                    self.absorb(delta.events);
                }
            }
        }
    }

    /// Consume one post-handshake frame from a peer channel
    pub fn handle_frame(&self, inbound: InboundFrame) {
        let InboundFrame { peer, link, frame } = inbound;
        match frame {
            Frame::Routing(routing) => {
                // Distance-vector state is internal-only; external peers
                // get direct records, never table entries.
                if peer.is_external() {
                    warn!(%peer, %link, "dropping routing frame from external peer");
                    return;
                }
                let delta = self.inner.table.lock().apply_updates(peer, &routing.u);
                self.queue_broadcast(delta.broadcast);
                self.absorb(delta.events);
            }
            Frame::Packet(packet) => self.handle_packet(peer, link, packet),
            Frame::Handshake(h) => {
                debug!(%peer, %link, phase = ?h.p, "stray handshake frame ignored");
            }
        }
    }

    fn handle_packet(&self, peer: VertexId, link: LinkId, packet: RouterPacket) {
        match packet.d {
            None => self.deliver_from(peer, link, packet.p, packet.m),
            Some(dest) if dest == self.inner.local => {
                self.deliver_from(peer, link, packet.p, packet.m)
            }
            Some(dest) => {
                if let Err(e) = self.forward(Some((peer, link)), packet, dest) {
                    trace!(%dest, error = %e, "packet not forwarded");
                }
            }
        }
    }

    fn deliver_from(&self, peer: VertexId, link: LinkId, handler: HandlerKind, payload: Value) {
        let level = if peer.is_external() {
            Neighborhood::Universal
        } else {
            Neighborhood::Group
        };
        if level > self.inner.config.accept_level {
            warn!(%peer, %level, "packet above accept level dropped");
            return;
        }
        self.deliver(
            PacketContext {
                level,
                source: Some(peer),
                link: Some(link),
            },
            handler,
            payload,
        );
    }

    fn deliver(&self, ctx: PacketContext, handler: HandlerKind, payload: Value) {
        let target = match self.inner.handlers.get(&handler) {
            Some(entry) => entry.value().upgrade(),
            None => None,
        };
        match target {
            Some(target) => target.handle(self, ctx, payload),
            None => {
                // Either never registered or the owning Arc was dropped.
                self.inner.handlers.remove(&handler);
                warn!(%handler, "no handler for packet, dropped");
            }
        }
    }

    fn forward(
        &self,
        arrival: Option<(VertexId, LinkId)>,
        packet: RouterPacket,
        dest: VertexId,
    ) -> Result<()> {
        let record = match self.inner.routes.read().get(&dest) {
            Some(record) => record.clone(),
            None => {
                self.inner.events.dispatch(Event::RouterError {
                    dest: Some(dest),
                    reason: RouteFailure::NoRoute,
                });
                return Err(Error::Routing(format!("no route to {dest}")));
            }
        };

        if let Some((from_peer, from_link)) = &arrival {
            if record.next_hop == *from_peer {
                self.inner.events.dispatch(Event::RouterError {
                    dest: Some(dest),
                    reason: RouteFailure::Bounce,
                });
                return Err(Error::Routing(format!(
                    "route to {dest} points back at its sender"
                )));
            }
            if !self.inner.bridge.is_associated(from_link, &record.link) {
                self.inner.events.dispatch(Event::RouterError {
                    dest: Some(dest),
                    reason: RouteFailure::NotBridged,
                });
                return Err(Error::Routing(format!(
                    "links {from_link} and {} not associated",
                    record.link
                )));
            }
        }

        let wire = RouterPacket {
            p: packet.p,
            // The destination field is dropped when the next hop is the
            // destination itself.
            d: (record.next_hop != dest).then_some(dest),
            m: packet.m,
        };
        self.inner.switch.send(&record.next_hop, Frame::Packet(wire))
    }

    fn send_updates(&self, peer: &VertexId, updates: Vec<RouteUpdate>) {
        if updates.is_empty() {
            return;
        }
        if let Err(e) = self
            .inner
            .switch
            .send(peer, Frame::Routing(RoutingFrame { u: updates }))
        {
            warn!(%peer, error = %e, "failed to send routing updates");
        }
    }

    fn queue_broadcast(&self, updates: Vec<RouteUpdate>) {
        if updates.is_empty() {
            return;
        }
        self.inner.pending.lock().extend(updates);
    }

    /// Send all queued table deltas to every internal adjacent peer.
    ///
    /// Deltas queued for the same destination are coalesced to the newest.
    pub fn flush_broadcasts(&self) {
        let queued = std::mem::take(&mut *self.inner.pending.lock());
        if queued.is_empty() {
            return;
        }
        let mut latest: Vec<RouteUpdate> = Vec::with_capacity(queued.len());
        for update in queued {
            if let Some(slot) = latest.iter_mut().find(|u| u.id == update.id) {
                *slot = update;
            } else {
                latest.push(update);
            }
        }
        for peer in self.internal_adjacents() {
            self.send_updates(&peer, latest.clone());
        }
    }

    /// Periodic upkeep: expire settled routes and flush queued deltas
    pub fn run_maintenance(&self) {
        let events = self.inner.table.lock().sweep();
        self.absorb(events);
        self.flush_broadcasts();
    }

    /// Fold table events into route records and application events
    fn absorb(&self, events: Vec<TableEvent>) {
        for event in events {
            match event {
                TableEvent::RouteUpdate { dest, cost, next } => {
                    if dest == self.inner.local {
                        continue;
                    }
                    if cost.is_infinite() {
                        if self.inner.routes.write().remove(&dest).is_some() {
                            self.inner
                                .events
                                .dispatch(Event::RouteUnavailable { dest });
                        }
                        continue;
                    }
                    // The record needs the channel toward the next hop, so
                    // the next hop's own adjacency must already exist.
                    let Some(link) = self.inner.switch.active_link(&next) else {
                        warn!(%dest, %next, "next hop not adjacent, route record deferred");
                        continue;
                    };
                    let mut routes = self.inner.routes.write();
                    let previous = routes.insert(
                        dest,
                        RouteRecord {
                            next_hop: next,
                            link,
                            cost,
                            external: false,
                        },
                    );
                    drop(routes);
                    match previous {
                        None => self
                            .inner
                            .events
                            .dispatch(Event::RouteAvailable { dest, cost }),
                        Some(old) if old.cost != cost || old.next_hop != next => self
                            .inner
                            .events
                            .dispatch(Event::RouteChange { dest, cost }),
                        Some(_) => {}
                    }
                }
                TableEvent::RouteExpired { dest } => {
                    if self.inner.routes.write().remove(&dest).is_some() {
                        self.inner
                            .events
                            .dispatch(Event::RouteUnavailable { dest });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::bridge::{AssociationTable, OpenBridge};
    use crate::link::FrameReceiver;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct TestHandler {
        seen: Mutex<Vec<(PacketContext, Value)>>,
    }

    impl TestHandler {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
            })
        }

        fn count(&self) -> usize {
            self.seen.lock().len()
        }
    }

    impl PacketHandler for TestHandler {
        fn handle(&self, _router: &Router, ctx: PacketContext, payload: Value) {
            self.seen.lock().push((ctx, payload));
        }
    }

    struct Rig {
        router: Router,
        switch: Arc<SwitchBoard>,
        switch_rx: mpsc::UnboundedReceiver<SwitchEvent>,
        events: Arc<Mutex<Vec<Event>>>,
        link_counter: u32,
    }

    impl Rig {
        fn new(config: FabricConfig) -> Self {
            Self::with_bridge(config, Arc::new(OpenBridge))
        }

        fn with_bridge(config: FabricConfig, bridge: Arc<dyn LinkBridge>) -> Self {
            let (tx, switch_rx) = mpsc::unbounded_channel();
            let switch = Arc::new(SwitchBoard::new(tx));
            let handlers = EventHandlers::new();
            let events = Arc::new(Mutex::new(Vec::new()));
            let sink = Arc::clone(&events);
            handlers.subscribe(move |e| sink.lock().push(e));
            let router = Router::new(
                VertexId::random(),
                Arc::new(config),
                Arc::clone(&switch),
                bridge,
                handlers,
            );
            Self {
                router,
                switch,
                switch_rx,
                events,
                link_counter: 0,
            }
        }

        fn add_peer(&mut self, peer: VertexId, cost: f64, external: bool) -> FrameReceiver {
            self.link_counter += 1;
            let link = LinkId::new(format!("link-{}", self.link_counter));
            let (tx, rx) = mpsc::unbounded_channel();
            self.switch
                .add_channel(peer, link, Cost::new(cost).unwrap(), external, tx);
            self.pump_switch();
            rx
        }

        fn drop_peer(&mut self, peer: &VertexId) {
            if let Some(link) = self.switch.active_link(peer) {
                self.switch.remove_channel(peer, &link);
            }
            self.pump_switch();
        }

        fn pump_switch(&mut self) {
            while let Ok(event) = self.switch_rx.try_recv() {
                self.router.handle_switch_event(event);
            }
        }

        fn inject_routing(&self, from: VertexId, updates: Vec<RouteUpdate>) {
            self.router.handle_frame(InboundFrame {
                peer: from,
                link: self.switch.active_link(&from).unwrap(),
                frame: Frame::Routing(RoutingFrame { u: updates }),
            });
        }

        fn has_event(&self, pred: impl Fn(&Event) -> bool) -> bool {
            self.events.lock().iter().any(pred)
        }
    }

    fn drain(rx: &mut FrameReceiver) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn test_local_send_dispatches_at_local_level() {
        let rig = Rig::new(FabricConfig::default());
        let handler = TestHandler::new();
        let kind = HandlerKind::Custom("test".into());
        rig.router.register_handler(
            kind.clone(),
            Arc::downgrade(&handler) as Weak<dyn PacketHandler>,
        );

        rig.router
            .send_packet(rig.router.local_id(), kind, json!({"n": 1}))
            .unwrap();

        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.level, Neighborhood::Local);
        assert!(seen[0].0.source.is_none());
    }

    #[tokio::test]
    async fn test_send_to_adjacent_peer_omits_destination() {
        let mut rig = Rig::new(FabricConfig::default());
        let peer = VertexId::random();
        let mut rx = rig.add_peer(peer, 1.0, false);
        drain(&mut rx); // initial table dump

        rig.router
            .send_packet(peer, HandlerKind::Bus, json!("hello"))
            .unwrap();

        let frames = drain(&mut rx);
        let packet = frames
            .iter()
            .find_map(|f| match f {
                Frame::Packet(p) => Some(p),
                _ => None,
            })
            .expect("packet frame");
        assert!(packet.d.is_none());
        assert_eq!(packet.m, json!("hello"));
    }

    #[tokio::test]
    async fn test_multi_hop_send_keeps_destination() {
        let mut rig = Rig::new(FabricConfig::default());
        let peer = VertexId::random();
        let far = VertexId::random();
        let mut rx = rig.add_peer(peer, 1.0, false);
        rig.inject_routing(
            peer,
            vec![RouteUpdate {
                id: far,
                seq: 2,
                cost: Cost::new(1.0).unwrap(),
            }],
        );
        drain(&mut rx);

        rig.router
            .send_packet(far, HandlerKind::Bus, json!("onward"))
            .unwrap();

        let frames = drain(&mut rx);
        let packet = frames
            .iter()
            .find_map(|f| match f {
                Frame::Packet(p) => Some(p),
                _ => None,
            })
            .expect("packet frame");
        assert_eq!(packet.d, Some(far));
    }

    #[tokio::test]
    async fn test_no_route_raises_router_error() {
        let rig = Rig::new(FabricConfig::default());
        let nowhere = VertexId::random();
        assert!(rig
            .router
            .send_packet(nowhere, HandlerKind::Bus, json!(1))
            .is_err());
        assert!(rig.has_event(|e| matches!(
            e,
            Event::RouterError {
                reason: RouteFailure::NoRoute,
                ..
            }
        )));
    }

    #[tokio::test]
    async fn test_bounce_guard() {
        let mut rig = Rig::new(FabricConfig::default());
        let peer = VertexId::random();
        let far = VertexId::random();
        let mut rx = rig.add_peer(peer, 1.0, false);
        rig.inject_routing(
            peer,
            vec![RouteUpdate {
                id: far,
                seq: 2,
                cost: Cost::new(1.0).unwrap(),
            }],
        );
        drain(&mut rx);

        // A packet from the peer destined to a vertex whose next hop is
        // that same peer would loop; it must be dropped instead.
        rig.router.handle_frame(InboundFrame {
            peer,
            link: rig.switch.active_link(&peer).unwrap(),
            frame: Frame::Packet(RouterPacket {
                p: HandlerKind::Bus,
                d: Some(far),
                m: json!(1),
            }),
        });

        assert!(rig.has_event(|e| matches!(
            e,
            Event::RouterError {
                reason: RouteFailure::Bounce,
                ..
            }
        )));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_unassociated_links_block_forwarding() {
        let mut rig = Rig::with_bridge(FabricConfig::default(), Arc::new(AssociationTable::new()));
        let a = VertexId::random();
        let b = VertexId::random();
        let mut rx_a = rig.add_peer(a, 1.0, false);
        let mut rx_b = rig.add_peer(b, 1.0, false);
        drain(&mut rx_a);
        drain(&mut rx_b);

        rig.router.handle_frame(InboundFrame {
            peer: a,
            link: rig.switch.active_link(&a).unwrap(),
            frame: Frame::Packet(RouterPacket {
                p: HandlerKind::Bus,
                d: Some(b),
                m: json!(1),
            }),
        });

        assert!(rig.has_event(|e| matches!(
            e,
            Event::RouterError {
                reason: RouteFailure::NotBridged,
                ..
            }
        )));
        assert!(drain(&mut rx_b)
            .iter()
            .all(|f| !matches!(f, Frame::Packet(_))));
    }

    #[tokio::test]
    async fn test_accept_level_rejects_external_sources() {
        let mut rig = Rig::new(FabricConfig {
            accept_level: Neighborhood::Group,
            ..Default::default()
        });
        let edge = VertexId::random_external();
        let _rx = rig.add_peer(edge, 1.0, true);

        let handler = TestHandler::new();
        let kind = HandlerKind::Custom("test".into());
        rig.router.register_handler(
            kind.clone(),
            Arc::downgrade(&handler) as Weak<dyn PacketHandler>,
        );

        rig.router.handle_frame(InboundFrame {
            peer: edge,
            link: rig.switch.active_link(&edge).unwrap(),
            frame: Frame::Packet(RouterPacket {
                p: kind,
                d: None,
                m: json!(1),
            }),
        });
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_external_source_delivered_at_universal_level() {
        let mut rig = Rig::new(FabricConfig::default());
        let edge = VertexId::random_external();
        let _rx = rig.add_peer(edge, 1.0, true);

        let handler = TestHandler::new();
        let kind = HandlerKind::Custom("test".into());
        rig.router.register_handler(
            kind.clone(),
            Arc::downgrade(&handler) as Weak<dyn PacketHandler>,
        );

        rig.router.handle_frame(InboundFrame {
            peer: edge,
            link: rig.switch.active_link(&edge).unwrap(),
            frame: Frame::Packet(RouterPacket {
                p: kind,
                d: None,
                m: json!(1),
            }),
        });
        let seen = handler.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.level, Neighborhood::Universal);
    }

    #[tokio::test]
    async fn test_external_peer_gets_direct_record_not_table_entry() {
        let mut rig = Rig::new(FabricConfig::default());
        let edge = VertexId::random_external();
        let _rx = rig.add_peer(edge, 2.0, true);

        let route = rig.router.route_to(&edge).unwrap();
        assert!(route.external);
        assert_eq!(route.next_hop, edge);
        assert!(rig.has_event(|e| matches!(e, Event::RouteAvailable { dest, .. } if *dest == edge)));

        // Routing frames from the edge are ignored entirely.
        let ghost = VertexId::random();
        rig.inject_routing(
            edge,
            vec![RouteUpdate {
                id: ghost,
                seq: 2,
                cost: Cost::new(1.0).unwrap(),
            }],
        );
        assert!(rig.router.route_to(&ghost).is_none());
    }

    #[tokio::test]
    async fn test_flush_coalesces_to_newest_delta() {
        let mut rig = Rig::new(FabricConfig::default());
        let peer = VertexId::random();
        let far = VertexId::random();
        let mut rx = rig.add_peer(peer, 1.0, false);
        rig.inject_routing(
            peer,
            vec![RouteUpdate {
                id: far,
                seq: 2,
                cost: Cost::new(3.0).unwrap(),
            }],
        );
        rig.inject_routing(
            peer,
            vec![RouteUpdate {
                id: far,
                seq: 4,
                cost: Cost::new(1.0).unwrap(),
            }],
        );
        drain(&mut rx);

        rig.router.flush_broadcasts();
        let frames = drain(&mut rx);
        let routing = frames
            .iter()
            .find_map(|f| match f {
                Frame::Routing(r) => Some(r),
                _ => None,
            })
            .expect("routing frame");
        let for_far: Vec<_> = routing.u.iter().filter(|u| u.id == far).collect();
        assert_eq!(for_far.len(), 1);
        assert_eq!(for_far[0].seq, 4);
    }

    #[tokio::test]
    async fn test_peer_loss_expires_routes_through_it() {
        let mut rig = Rig::new(FabricConfig::default());
        let peer = VertexId::random();
        let far = VertexId::random();
        let _rx = rig.add_peer(peer, 1.0, false);
        rig.inject_routing(
            peer,
            vec![RouteUpdate {
                id: far,
                seq: 2,
                cost: Cost::new(1.0).unwrap(),
            }],
        );
        assert!(rig.router.route_to(&far).is_some());

        rig.drop_peer(&peer);
        assert!(rig.router.route_to(&peer).is_none());
        assert!(rig.router.route_to(&far).is_none());
        assert!(rig.has_event(
            |e| matches!(e, Event::RouteUnavailable { dest } if *dest == peer)
        ));
        assert!(
            rig.has_event(|e| matches!(e, Event::RouteUnavailable { dest } if *dest == far))
        );
    }
}
