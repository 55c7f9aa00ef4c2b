//! Host-affinity chains
//!
//! Long-lived associations (streams, sessions) register an affinity chain
//! along the hops they traverse. Every hop on the chain remembers its
//! upstream and downstream neighbor for the chain id; when a hop loses its
//! route to either neighbor, removal cascades along the surviving side so
//! both ends learn about the failure without waiting for a timeout of their
//! own. Each added hop is acknowledged pairwise by its downstream neighbor;
//! hops that never get acknowledged are expired and unwound.
//!
//! External hosts may anchor only a bounded number of chains here; an add
//! beyond the cap is rejected with an error that unwinds the partial chain.

use crate::address::{Address, VertexId};
use crate::api::config::FabricConfig;
use crate::api::events::Event;
use crate::error::{Error, Result};
use crate::protocol::{AffinityIds, AffinityOp, AffinityPacket, HandlerKind};
use crate::routing::{PacketContext, PacketHandler, Router};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::hash_map::Entry as MapEntry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Why and how an affinity this instance participated in went away
#[derive(Debug, Clone, Copy)]
pub struct AffinityRemoval {
    /// The affinity
    pub id: Uuid,
    /// True for failure paths (route loss, expiry, rejection)
    pub forced: bool,
}

/// One-shot callback invoked when a chain is removed
pub type RemovalHook = Box<dyn FnOnce(AffinityRemoval) + Send>;

struct ChainLink {
    /// Neighbor toward the origin; `None` at the origin itself
    prev: Option<VertexId>,
    /// Neighbor toward the far end; `None` at the terminus
    next: Option<VertexId>,
    /// Whether the downstream neighbor acknowledged this hop
    confirmed: bool,
    /// Local references; only the last `remove` tears the chain down
    refs: usize,
    started: Instant,
}

/// The affinity protocol for one instance
pub struct Affinity {
    router: Router,
    config: Arc<FabricConfig>,
    chains: Mutex<HashMap<Uuid, ChainLink>>,
    /// Chains anchored by an external host, for the per-host cap
    anchored: Mutex<HashMap<VertexId, HashSet<Uuid>>>,
    hooks: Mutex<HashMap<Uuid, Vec<RemovalHook>>>,
}

impl Affinity {
    /// Create the affinity protocol over `router`
    pub fn new(router: Router, config: Arc<FabricConfig>) -> Arc<Self> {
        Arc::new(Self {
            router,
            config,
            chains: Mutex::new(HashMap::new()),
            anchored: Mutex::new(HashMap::new()),
            hooks: Mutex::new(HashMap::new()),
        })
    }

    /// Establish a chain along `path` (hops after this instance).
    ///
    /// Returns the chain id. The chain is unconfirmed until the first hop
    /// acknowledges; unacknowledged chains are expired by [`Affinity::expire`].
    pub fn establish(&self, path: &Address) -> Result<Uuid> {
        let hops = path.to_vec();
        let Some(first) = hops.first().copied() else {
            return Err(Error::Affinity("cannot anchor a chain on an empty path".into()));
        };
        let id = Uuid::new_v4();
        self.chains.lock().insert(
            id,
            ChainLink {
                prev: None,
                next: Some(first),
                confirmed: false,
                refs: 1,
                started: Instant::now(),
            },
        );
        self.send_op(first, vec![id], AffinityOp::Add, Some(hops[1..].to_vec()))?;
        debug!(%id, hops = hops.len(), "affinity chain anchored");
        Ok(id)
    }

    /// Take another reference on chain `id`.
    ///
    /// Each reference needs its own [`Affinity::remove`].
    pub fn retain(&self, id: Uuid) -> Result<()> {
        match self.chains.lock().get_mut(&id) {
            Some(link) => {
                link.refs += 1;
                Ok(())
            }
            None => Err(Error::Affinity(format!("unknown affinity {id}"))),
        }
    }

    /// Drop one reference; the last one tears the chain down in both
    /// directions.
    pub fn remove(&self, id: Uuid) -> Result<()> {
        let link = {
            let mut chains = self.chains.lock();
            match chains.entry(id) {
                MapEntry::Vacant(_) => {
                    return Err(Error::Affinity(format!("unknown affinity {id}")))
                }
                MapEntry::Occupied(mut slot) => {
                    if slot.get().refs > 1 {
                        slot.get_mut().refs -= 1;
                        trace!(%id, refs = slot.get().refs, "affinity still referenced");
                        return Ok(());
                    }
                    slot.remove()
                }
            }
        };
        self.release_anchor(&link, id);
        if let Some(prev) = link.prev {
            let _ = self.send_op(prev, vec![id], AffinityOp::Remove, None);
        }
        if let Some(next) = link.next {
            let _ = self.send_op(next, vec![id], AffinityOp::Remove, None);
        }
        self.notify_removed(id, false);
        Ok(())
    }

    /// Register a one-shot callback for the removal of `id`
    pub fn on_removed<F>(&self, id: Uuid, hook: F)
    where
        F: FnOnce(AffinityRemoval) + Send + 'static,
    {
        self.hooks.lock().entry(id).or_default().push(Box::new(hook));
    }

    /// Whether this instance participates in chain `id`
    pub fn contains(&self, id: &Uuid) -> bool {
        self.chains.lock().contains_key(id)
    }

    /// Number of chains this instance participates in
    pub fn len(&self) -> usize {
        self.chains.lock().len()
    }

    /// Whether no chains run through this instance
    pub fn is_empty(&self) -> bool {
        self.chains.lock().is_empty()
    }

    /// React to the loss of the route toward `dead`.
    ///
    /// Every chain with the dead host as a neighbor is removed; removal
    /// batches cascade along the surviving direction.
    pub fn handle_route_loss(&self, dead: VertexId) {
        let mut victims = Vec::new();
        {
            let mut chains = self.chains.lock();
            let ids: Vec<Uuid> = chains
                .iter()
                .filter(|(_, link)| link.prev == Some(dead) || link.next == Some(dead))
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(link) = chains.remove(&id) {
                    victims.push((id, link));
                }
            }
        }
        if victims.is_empty() {
            return;
        }

        // Batch the cascades per surviving neighbor.
        let mut batches: HashMap<VertexId, Vec<Uuid>> = HashMap::new();
        for (id, link) in &victims {
            let survivor = if link.prev == Some(dead) {
                link.next
            } else {
                link.prev
            };
            if let Some(peer) = survivor {
                batches.entry(peer).or_default().push(*id);
            }
        }
        for (peer, ids) in batches {
            let _ = self.send_op(peer, ids, AffinityOp::Remove, None);
        }
        for (id, link) in victims {
            self.release_anchor(&link, id);
            self.notify_removed(id, true);
        }
    }

    /// Expire chains whose downstream acknowledgement never arrived.
    ///
    /// Called on the instance sweep cadence.
    pub fn expire(&self) {
        let staleness = self.config.affinity_staleness;
        let mut expired = Vec::new();
        {
            let mut chains = self.chains.lock();
            let ids: Vec<Uuid> = chains
                .iter()
                .filter(|(_, link)| !link.confirmed && link.started.elapsed() > staleness)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(link) = chains.remove(&id) {
                    expired.push((id, link));
                }
            }
        }
        for (id, link) in expired {
            warn!(%id, "affinity hop never acknowledged, unwinding");
            self.release_anchor(&link, id);
            if let Some(prev) = link.prev {
                let _ = self.send_op(prev, vec![id], AffinityOp::Error, None);
            }
            self.notify_removed(id, true);
        }
    }

    fn handle_add(&self, from: VertexId, ids: Vec<Uuid>, path: Option<Vec<VertexId>>) {
        let Some(rest) = path else {
            // No path marks the pairwise acknowledgement from downstream.
            let mut chains = self.chains.lock();
            for id in ids {
                match chains.get_mut(&id) {
                    Some(link) if link.next == Some(from) => link.confirmed = true,
                    _ => trace!(%id, %from, "acknowledgement for unknown chain hop"),
                }
            }
            return;
        };

        for id in ids {
            let known = {
                let mut chains = self.chains.lock();
                match chains.get_mut(&id) {
                    Some(link) if link.prev == Some(from) => {
                        // Re-add from the same upstream: one more reference
                        // on an already-walked chain.
                        link.refs += 1;
                        Some(true)
                    }
                    Some(_) => Some(false),
                    None => None,
                }
            };
            match known {
                Some(true) => {
                    let _ = self.send_op(from, vec![id], AffinityOp::Add, None);
                    continue;
                }
                Some(false) => {
                    warn!(%id, "duplicate affinity add rejected");
                    let _ = self.send_op(from, vec![id], AffinityOp::Error, None);
                    continue;
                }
                None => {}
            }
            // External hosts may only anchor a bounded number of chains.
            if from.is_external() && !self.reserve_anchor(from, id) {
                warn!(%from, %id, "external host over affinity cap, rejecting");
                let _ = self.send_op(from, vec![id], AffinityOp::Error, None);
                continue;
            }

            let next = rest.first().copied();
            self.chains.lock().insert(
                id,
                ChainLink {
                    prev: Some(from),
                    next,
                    // The terminus has nothing downstream to wait for.
                    confirmed: next.is_none(),
                    refs: 1,
                    started: Instant::now(),
                },
            );
            // Pairwise acknowledgement of this hop to the upstream side.
            let _ = self.send_op(from, vec![id], AffinityOp::Add, None);
            if let Some(next) = next {
                let _ = self.send_op(next, vec![id], AffinityOp::Add, Some(rest[1..].to_vec()));
            }
        }
    }

    fn handle_remove(&self, from: VertexId, ids: Vec<Uuid>) {
        for id in ids {
            let Some(link) = self.chains.lock().remove(&id) else {
                trace!(%id, "remove for unknown chain");
                continue;
            };
            self.release_anchor(&link, id);
            // Cascade away from the sender.
            let onward = if link.prev == Some(from) {
                link.next
            } else {
                link.prev
            };
            if let Some(peer) = onward {
                let _ = self.send_op(peer, vec![id], AffinityOp::Remove, None);
            }
            self.notify_removed(id, false);
        }
    }

    fn handle_error(&self, from: VertexId, ids: Vec<Uuid>) {
        for id in ids {
            let Some(link) = self.chains.lock().remove(&id) else {
                trace!(%id, "error for unknown chain");
                continue;
            };
            self.release_anchor(&link, id);
            // Errors unwind toward the origin only.
            if link.prev.is_some() && link.prev != Some(from) {
                if let Some(prev) = link.prev {
                    let _ = self.send_op(prev, vec![id], AffinityOp::Error, None);
                }
            }
            self.notify_removed(id, true);
        }
    }

    fn reserve_anchor(&self, host: VertexId, id: Uuid) -> bool {
        let mut anchored = self.anchored.lock();
        let ids = anchored.entry(host).or_default();
        if ids.len() >= self.config.max_host_affinities {
            return false;
        }
        ids.insert(id);
        true
    }

    fn release_anchor(&self, link: &ChainLink, id: Uuid) {
        let Some(prev) = link.prev else {
            return;
        };
        if !prev.is_external() {
            return;
        }
        let mut anchored = self.anchored.lock();
        if let Some(ids) = anchored.get_mut(&prev) {
            ids.remove(&id);
            if ids.is_empty() {
                anchored.remove(&prev);
            }
        }
    }

    fn notify_removed(&self, id: Uuid, forced: bool) {
        let removal = AffinityRemoval { id, forced };
        if let Some(hooks) = self.hooks.lock().remove(&id) {
            for hook in hooks {
                hook(removal);
            }
        }
        self.router
            .events()
            .dispatch(Event::AffinityRemoved { id, forced });
    }

    fn send_op(
        &self,
        to: VertexId,
        ids: Vec<Uuid>,
        op: AffinityOp,
        path: Option<Vec<VertexId>>,
    ) -> Result<()> {
        let ids = if ids.len() == 1 {
            AffinityIds::One(ids[0])
        } else {
            AffinityIds::Many(ids)
        };
        let packet = AffinityPacket {
            id: ids,
            from: self.router.local_id(),
            op,
            path,
        };
        self.router
            .send_packet(to, HandlerKind::Affinity, serde_json::to_value(&packet)?)
    }
}

impl PacketHandler for Affinity {
    fn handle(&self, _router: &Router, _ctx: PacketContext, payload: Value) {
        let packet: AffinityPacket = match serde_json::from_value(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "malformed affinity packet dropped");
                return;
            }
        };
        let ids = packet.id.to_vec();
        match packet.op {
            AffinityOp::Add => self.handle_add(packet.from, ids, packet.path),
            AffinityOp::Remove => self.handle_remove(packet.from, ids),
            AffinityOp::Error => self.handle_error(packet.from, ids),
        }
    }
}
