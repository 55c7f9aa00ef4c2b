//! Controlled-flooding event bus
//!
//! Events flood hop by hop to every adjacent peer instead of being routed.
//! Each packet carries the path it has traversed, a per-origin sequence
//! number for duplicate suppression, and the neighborhood mode bounding how
//! far it may still spread. Crossing an external edge consumes the one
//! boundary crossing a `global` event is allowed; `universal` events cross
//! freely.

use crate::address::VertexId;
use crate::api::events::SubscriptionHandle;
use crate::error::Result;
use crate::link::LinkId;
use crate::protocol::{BusPacket, HandlerKind, Neighborhood};
use crate::routing::{PacketContext, PacketHandler, Router};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

/// Callback receiving the arguments of a bus event
pub type BusCallback = Arc<dyn Fn(&[Value]) + Send + Sync + 'static>;

/// Handle for one named-event subscription
#[derive(Debug, Clone)]
pub struct BusSubscription {
    name: String,
    handle: SubscriptionHandle,
}

/// The flooding bus for one instance
pub struct Bus {
    router: Router,
    seq: Mutex<u64>,
    seen: Mutex<HashMap<VertexId, u64>>,
    subs: DashMap<String, Vec<(SubscriptionHandle, BusCallback)>>,
    next_sub: Mutex<u64>,
}

impl Bus {
    /// Create the bus over `router`
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Self {
            router,
            seq: Mutex::new(0),
            seen: Mutex::new(HashMap::new()),
            subs: DashMap::new(),
            next_sub: Mutex::new(0),
        })
    }

    /// Subscribe to events named `name`
    pub fn subscribe<F>(&self, name: impl Into<String>, callback: F) -> BusSubscription
    where
        F: Fn(&[Value]) + Send + Sync + 'static,
    {
        let name = name.into();
        let handle = {
            let mut next = self.next_sub.lock();
            let id = *next;
            *next += 1;
            SubscriptionHandle::new(id)
        };
        self.subs
            .entry(name.clone())
            .or_default()
            .push((handle, Arc::new(callback)));
        BusSubscription { name, handle }
    }

    /// Remove a subscription; unknown handles are a no-op
    pub fn unsubscribe(&self, sub: &BusSubscription) {
        if let Some(mut entry) = self.subs.get_mut(&sub.name) {
            entry.retain(|(h, _)| *h != sub.handle);
        }
    }

    /// Emit an event visible up to `level`.
    ///
    /// Local subscribers always see the event; `Local` events never leave
    /// this instance.
    pub fn emit(&self, level: Neighborhood, name: &str, args: Vec<Value>) -> Result<()> {
        self.deliver(name, &args);
        if level == Neighborhood::Local {
            return Ok(());
        }

        let packet = self.originate(level, name, args);
        self.flood(&packet, None);
        Ok(())
    }

    /// Emit an event to one adjacent host over a specific bridge link.
    ///
    /// Restricted flooding: the packet leaves only through `bridge`, with
    /// the caller-chosen `level` bounding how far the receiver may spread
    /// it. A `Local` level makes it a pure point delivery.
    pub fn emit_direct(
        &self,
        bridge: &LinkId,
        host: VertexId,
        level: Neighborhood,
        name: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let packet = self.originate(level, name, args);
        self.router.send_packet_direct(
            host,
            bridge,
            HandlerKind::Bus,
            serde_json::to_value(&packet)?,
        )
    }

    fn originate(&self, mode: Neighborhood, name: &str, args: Vec<Value>) -> BusPacket {
        let seq = {
            let mut seq = self.seq.lock();
            *seq += 1;
            *seq
        };
        let mut event = Vec::with_capacity(args.len() + 1);
        event.push(Value::String(name.to_string()));
        event.extend(args);
        BusPacket {
            event,
            seq,
            mode,
            path: vec![self.router.local_id()],
        }
    }

    /// Forward `packet` to every adjacent peer not yet on its path.
    ///
    /// `arrived_from` names the peer the packet came from; it is already on
    /// the path by construction but skipped anyway.
    fn flood(&self, packet: &BusPacket, arrived_from: Option<VertexId>) {
        for adjacency in self.router.adjacent_peers() {
            if packet.path.contains(&adjacency) || Some(adjacency) == arrived_from {
                continue;
            }
            let mode = if adjacency.is_external() {
                match packet.mode {
                    // Internal-only scopes never cross the boundary.
                    Neighborhood::Local | Neighborhood::Group => continue,
                    // The one allowed crossing is spent here.
                    Neighborhood::Global => Neighborhood::Group,
                    Neighborhood::Universal => Neighborhood::Universal,
                }
            } else {
                packet.mode
            };
            let hop = BusPacket {
                event: packet.event.clone(),
                seq: packet.seq,
                mode,
                path: packet.path.clone(),
            };
            let wire = match serde_json::to_value(&hop) {
                Ok(wire) => wire,
                Err(e) => {
                    warn!(error = %e, "bus packet serialization failed");
                    return;
                }
            };
            if let Err(e) = self.router.send_packet(adjacency, HandlerKind::Bus, wire) {
                trace!(peer = %adjacency, error = %e, "bus flood hop failed");
            }
        }
    }

    fn deliver(&self, name: &str, args: &[Value]) {
        let Some(entry) = self.subs.get(name) else {
            return;
        };
        let callbacks: Vec<BusCallback> = entry.iter().map(|(_, cb)| Arc::clone(cb)).collect();
        drop(entry);
        for callback in callbacks {
            if std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(args))).is_err() {
                tracing::error!(event = name, "bus subscriber panicked");
            }
        }
    }

    fn accept(&self, origin: VertexId, seq: u64) -> bool {
        let mut seen = self.seen.lock();
        match seen.get(&origin) {
            Some(last) if *last >= seq => false,
            _ => {
                seen.insert(origin, seq);
                true
            }
        }
    }
}

impl PacketHandler for Bus {
    fn handle(&self, _router: &Router, ctx: PacketContext, payload: Value) {
        let mut packet: BusPacket = match serde_json::from_value(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "malformed bus packet dropped");
                return;
            }
        };
        let Some(origin) = packet.path.first().copied() else {
            warn!("bus packet with empty path dropped");
            return;
        };
        let local = self.router.local_id();
        if packet.path.contains(&local) {
            trace!(%origin, "bus packet already visited this instance");
            return;
        }
        // A path revisiting its origin is a loop even when this instance
        // has not seen the packet yet.
        if packet.path.iter().filter(|hop| **hop == origin).count() >= 2 {
            trace!(%origin, "bus packet looped through its origin, dropped");
            return;
        }
        if !self.accept(origin, packet.seq) {
            trace!(%origin, seq = packet.seq, "duplicate bus packet dropped");
            return;
        }

        let Some(Value::String(name)) = packet.event.first() else {
            warn!("bus packet without event name dropped");
            return;
        };
        let name = name.clone();
        self.deliver(&name, &packet.event[1..]);

        if packet.mode == Neighborhood::Local {
            return;
        }
        packet.path.push(local);
        self.flood(&packet, ctx.source);
    }
}
