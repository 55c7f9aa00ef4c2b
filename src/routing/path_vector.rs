//! Source routing along explicit path vectors
//!
//! A path-vector packet carries the remaining hops it still has to visit.
//! Each instance pops itself off the front, shortcuts over hops it can
//! already reach directly through the internal mesh, and hands the rest to
//! the router. Protocols that ride on explicit paths (messenger, streamer)
//! register here rather than with the router.

use super::router::{PacketContext, PacketHandler, Router};
use crate::address::Address;
use crate::error::{Error, Result};
use crate::protocol::{HandlerKind, Neighborhood, PathVectorPacket};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

/// A protocol delivered at the end of an explicit path
pub trait PathHandler: Send + Sync {
    /// Handle one payload that completed its path at this instance
    fn handle(&self, level: Neighborhood, payload: Value);
}

/// The path-vector protocol for one instance.
///
/// Registered with the router under the `path-vector` tag; hop forwarding
/// reuses the router's next-hop machinery.
pub struct PathVector {
    router: Router,
    handlers: DashMap<HandlerKind, Weak<dyn PathHandler>>,
}

impl PathVector {
    /// Create the path-vector protocol over `router`
    pub fn new(router: Router) -> Arc<Self> {
        Arc::new(Self {
            router,
            handlers: DashMap::new(),
        })
    }

    /// Register `handler` for payloads tagged `kind`; held weakly
    pub fn register_handler(&self, kind: HandlerKind, handler: Weak<dyn PathHandler>) {
        self.handlers.insert(kind, handler);
    }

    /// Remove the handler for `kind`
    pub fn unregister_handler(&self, kind: &HandlerKind) {
        self.handlers.remove(kind);
    }

    /// Send `payload` along `path`, delivering to `handler` at the final
    /// hop.
    ///
    /// The path may begin with this instance; leading self hops are
    /// stripped before forwarding.
    pub fn send(&self, path: &Address, handler: HandlerKind, payload: Value) -> Result<()> {
        let max_hops = self.router.config().max_hops;
        if !path.is_valid(max_hops) {
            return Err(Error::Address(format!("invalid path vector: {path}")));
        }
        self.process(
            Neighborhood::Local,
            PathVectorPacket {
                d: path.to_vec(),
                n: handler,
                m: payload,
            },
        )
    }

    fn process(&self, level: Neighborhood, mut packet: PathVectorPacket) -> Result<()> {
        let local = self.router.local_id();
        while packet.d.first() == Some(&local) {
            packet.d.remove(0);
        }
        if packet.d.len() > self.router.config().max_hops {
            warn!(hops = packet.d.len(), "over-length path vector dropped");
            return Err(Error::Address("path vector exceeds hop budget".into()));
        }
        if packet.d.is_empty() {
            self.deliver(level, packet.n, packet.m);
            return Ok(());
        }

        // Shortcut: when a later hop is already reachable through the
        // internal mesh, the intermediate hops need not be visited.
        while packet.d.len() >= 2 {
            let upcoming = packet.d[1];
            let direct = !upcoming.is_external()
                && self
                    .router
                    .route_to(&upcoming)
                    .is_some_and(|r| !r.external);
            if !direct {
                break;
            }
            trace!(skipped = %packet.d[0], "shortcutting over intermediate hop");
            packet.d.remove(0);
        }

        let next = packet.d.remove(0);
        let wire = serde_json::to_value(&packet)?;
        self.router
            .send_packet(next, HandlerKind::PathVector, wire)
    }

    fn deliver(&self, level: Neighborhood, kind: HandlerKind, payload: Value) {
        let target = match self.handlers.get(&kind) {
            Some(entry) => entry.value().upgrade(),
            None => None,
        };
        match target {
            Some(target) => target.handle(level, payload),
            None => {
                self.handlers.remove(&kind);
                warn!(%kind, "no path handler for payload, dropped");
            }
        }
    }
}

impl PacketHandler for PathVector {
    fn handle(&self, _router: &Router, ctx: PacketContext, payload: Value) {
        let packet: PathVectorPacket = match serde_json::from_value(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "malformed path-vector packet dropped");
                return;
            }
        };
        if let Err(e) = self.process(ctx.level, packet) {
            trace!(error = %e, "path-vector packet not forwarded");
        }
    }
}
