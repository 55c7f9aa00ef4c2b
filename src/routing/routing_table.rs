//! Destination-sequenced distance-vector routing table
//!
//! The table keeps one entry per known destination: the best cost, the
//! adjacent peer to forward through, and the destination-owned sequence
//! number ordering updates. Updates are adopted when strictly newer
//! (greater sequence) or equally new and strictly cheaper; everything else
//! is dropped. The local instance owns its own sequence number, kept even
//! and bumped by two on every local link event; unreachability is marked by
//! an odd bump of the victim's sequence plus an infinite cost.
//!
//! Recovery after a link loss needs no extra machinery: the infinite-cost
//! advertisement eventually reaches the destination itself, which sees a
//! sequence number ahead of its own, jumps past it, and re-advertises —
//! resurrecting the route along whatever paths remain. Entries that stay at
//! infinite cost are swept out after a full settling period so transient
//! flaps do not delete state that is about to resurrect.
//!
//! The table is a pure single-writer structure: every operation returns the
//! update batches to transmit and the events to surface, and never touches
//! a socket or a clock.

use crate::address::VertexId;
use crate::protocol::{Cost, RouteUpdate};
use std::collections::HashMap;
use tracing::trace;

/// A view of one routing entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouteEntry {
    /// Destination-owned sequence number
    pub seq: u64,
    /// Best known cost
    pub cost: Cost,
    /// Adjacent peer to forward through
    pub next: VertexId,
}

/// Events surfaced by table mutations
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    /// A destination's best route changed (including going infinite)
    RouteUpdate {
        /// The destination
        dest: VertexId,
        /// New best cost
        cost: Cost,
        /// New next hop
        next: VertexId,
    },
    /// A destination's entry was deleted
    RouteExpired {
        /// The destination
        dest: VertexId,
    },
}

/// Result of a table mutation: what to transmit, and what happened
#[derive(Debug, Default)]
pub struct TableDelta {
    /// Batch for one specific peer (the full dump handed to a new neighbor)
    pub to_peer: Vec<RouteUpdate>,
    /// Deltas to broadcast to every internal adjacent peer
    pub broadcast: Vec<RouteUpdate>,
    /// State changes for the router to absorb
    pub events: Vec<TableEvent>,
}

struct Entry {
    seq: u64,
    cost: Cost,
    next: VertexId,
    /// Sweep ticks this entry has sat at infinite cost
    settling: u8,
}

/// The DSDV table for one instance
pub struct RoutingTable {
    local: VertexId,
    local_seq: u64,
    entries: HashMap<VertexId, Entry>,
    neighbors: HashMap<VertexId, Cost>,
}

impl RoutingTable {
    /// Create a table for the instance identified by `local`.
    ///
    /// The local instance always has an entry at cost zero through itself.
    pub fn new(local: VertexId) -> Self {
        let mut entries = HashMap::new();
        entries.insert(
            local,
            Entry {
                seq: 0,
                cost: Cost::ZERO,
                next: local,
                settling: 0,
            },
        );
        Self {
            local,
            local_seq: 0,
            entries,
            neighbors: HashMap::new(),
        }
    }

    /// The local identity
    pub fn local_id(&self) -> VertexId {
        self.local
    }

    /// The local sequence number (always even)
    pub fn local_seq(&self) -> u64 {
        self.local_seq
    }

    /// The entry for `dest`, if known
    pub fn route(&self, dest: &VertexId) -> Option<RouteEntry> {
        self.entries.get(dest).map(|e| RouteEntry {
            seq: e.seq,
            cost: e.cost,
            next: e.next,
        })
    }

    /// All known destinations
    pub fn destinations(&self) -> Vec<VertexId> {
        self.entries.keys().copied().collect()
    }

    /// Direct neighbors with a registered link
    pub fn neighbors(&self) -> Vec<VertexId> {
        self.neighbors.keys().copied().collect()
    }

    /// Whether `peer` is a direct neighbor
    pub fn is_neighbor(&self, peer: &VertexId) -> bool {
        self.neighbors.contains_key(peer)
    }

    /// Number of entries (including self)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false: the self entry never leaves
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The update advertising the local instance
    fn self_update(&self) -> RouteUpdate {
        RouteUpdate {
            id: self.local,
            seq: self.local_seq,
            cost: Cost::ZERO,
        }
    }

    fn update_for(&self, dest: &VertexId) -> Option<RouteUpdate> {
        self.entries.get(dest).map(|e| RouteUpdate {
            id: *dest,
            seq: e.seq,
            cost: e.cost,
        })
    }

    /// Bump the local sequence number, keeping it even
    fn bump_seq(&mut self) {
        self.local_seq += 2;
        if let Some(entry) = self.entries.get_mut(&self.local) {
            entry.seq = self.local_seq;
        }
    }

    /// The full table as an update batch
    pub fn full_dump(&self) -> Vec<RouteUpdate> {
        self.entries
            .iter()
            .map(|(id, e)| RouteUpdate {
                id: *id,
                seq: e.seq,
                cost: e.cost,
            })
            .collect()
    }

    /// Register a direct neighbor.
    ///
    /// Returns the full table to hand to the new neighbor plus the deltas
    /// (the neighbor's entry and the refreshed self-announcement) to
    /// broadcast everywhere else.
    pub fn add_link(&mut self, peer: VertexId, cost: Cost) -> TableDelta {
        self.neighbors.insert(peer, cost);
        self.bump_seq();

        let mut events = Vec::new();
        match self.entries.get_mut(&peer) {
            None => {
                self.entries.insert(
                    peer,
                    Entry {
                        seq: 0,
                        cost,
                        next: peer,
                        settling: 0,
                    },
                );
                events.push(TableEvent::RouteUpdate {
                    dest: peer,
                    cost,
                    next: peer,
                });
            }
            Some(entry) => {
                // Prefer the direct link when it beats (or replaces a dead)
                // multi-hop path; the peer-owned seq is left untouched.
                if cost < entry.cost || entry.cost.is_infinite() {
                    entry.cost = cost;
                    entry.next = peer;
                    entry.settling = 0;
                    events.push(TableEvent::RouteUpdate {
                        dest: peer,
                        cost,
                        next: peer,
                    });
                }
            }
        }

        let mut broadcast = Vec::new();
        if let Some(update) = self.update_for(&peer) {
            broadcast.push(update);
        }
        broadcast.push(self.self_update());

        TableDelta {
            to_peer: self.full_dump(),
            broadcast,
            events,
        }
    }

    /// Change the cost of an existing neighbor link.
    ///
    /// Returns deltas for the affected destination and for self.
    pub fn update_link_cost(&mut self, peer: VertexId, cost: Cost) -> TableDelta {
        if !self.neighbors.contains_key(&peer) {
            trace!(%peer, "cost update for unknown neighbor dropped");
            return TableDelta::default();
        }
        self.neighbors.insert(peer, cost);
        self.bump_seq();

        let mut events = Vec::new();
        if let Some(entry) = self.entries.get_mut(&peer) {
            if entry.next == peer && entry.cost != cost {
                entry.cost = cost;
                events.push(TableEvent::RouteUpdate {
                    dest: peer,
                    cost,
                    next: peer,
                });
            }
        }

        let mut broadcast = Vec::new();
        if let Some(update) = self.update_for(&peer) {
            broadcast.push(update);
        }
        broadcast.push(self.self_update());

        TableDelta {
            to_peer: Vec::new(),
            broadcast,
            events,
        }
    }

    /// Remove a neighbor link.
    ///
    /// Every destination routed through the peer is marked unreachable with
    /// an odd sequence bump; the peer's own row is deleted outright. The
    /// infinite-cost deltas propagate until they reach each victim
    /// destination, which then re-advertises itself past the bumped
    /// sequence number.
    pub fn remove_link(&mut self, peer: VertexId) -> TableDelta {
        if self.neighbors.remove(&peer).is_none() {
            return TableDelta::default();
        }
        self.bump_seq();

        let mut broadcast = Vec::new();
        let mut events = Vec::new();

        let local = self.local;
        for (id, entry) in self.entries.iter_mut() {
            if entry.next != peer || *id == peer || *id == local {
                continue;
            }
            entry.cost = Cost::INFINITE;
            entry.seq += 1;
            entry.settling = 0;
            broadcast.push(RouteUpdate {
                id: *id,
                seq: entry.seq,
                cost: Cost::INFINITE,
            });
            events.push(TableEvent::RouteUpdate {
                dest: *id,
                cost: Cost::INFINITE,
                next: entry.next,
            });
        }

        if let Some(entry) = self.entries.remove(&peer) {
            broadcast.push(RouteUpdate {
                id: peer,
                seq: entry.seq + 1,
                cost: Cost::INFINITE,
            });
            events.push(TableEvent::RouteExpired { dest: peer });
        }

        broadcast.push(self.self_update());
        TableDelta {
            to_peer: Vec::new(),
            broadcast,
            events,
        }
    }

    /// Apply an update batch received from the adjacent peer `from`.
    ///
    /// Adopted updates are returned (with the link cost folded in) for
    /// relaying to every internal adjacent peer; non-adopted updates are
    /// dropped at trace level.
    pub fn apply_updates(&mut self, from: VertexId, updates: &[RouteUpdate]) -> TableDelta {
        let Some(link_cost) = self.neighbors.get(&from).copied() else {
            trace!(%from, "update batch from non-neighbor dropped");
            return TableDelta::default();
        };

        let mut broadcast = Vec::new();
        let mut events = Vec::new();

        for update in updates {
            if update.id == self.local {
                // Someone advertises us with a sequence ahead of our own:
                // a stale echo of a past incarnation, or our own
                // unreachability announcement coming back around. Jump
                // past it and re-advertise.
                if update.seq > self.local_seq {
                    while self.local_seq <= update.seq {
                        self.local_seq += 2;
                    }
                    if let Some(entry) = self.entries.get_mut(&self.local) {
                        entry.seq = self.local_seq;
                    }
                    broadcast.push(self.self_update());
                }
                continue;
            }

            let adjusted = update.cost.saturating_add(link_cost);
            match self.entries.get_mut(&update.id) {
                None => {
                    if update.cost.is_infinite() {
                        trace!(dest = %update.id, "infinite update for unknown destination dropped");
                        continue;
                    }
                    self.entries.insert(
                        update.id,
                        Entry {
                            seq: update.seq,
                            cost: adjusted,
                            next: from,
                            settling: 0,
                        },
                    );
                    events.push(TableEvent::RouteUpdate {
                        dest: update.id,
                        cost: adjusted,
                        next: from,
                    });
                    broadcast.push(RouteUpdate {
                        id: update.id,
                        seq: update.seq,
                        cost: adjusted,
                    });
                }
                Some(entry) => {
                    let newer = update.seq > entry.seq;
                    let cheaper = update.seq == entry.seq && adjusted < entry.cost;
                    if !(newer || cheaper) {
                        trace!(
                            dest = %update.id,
                            seq = update.seq,
                            have_seq = entry.seq,
                            "update not adopted"
                        );
                        continue;
                    }
                    if adjusted.is_infinite() && entry.next == from {
                        // Our own next hop lost the destination: fast
                        // removal, no settling.
                        self.entries.remove(&update.id);
                        events.push(TableEvent::RouteExpired { dest: update.id });
                    } else {
                        entry.seq = update.seq;
                        entry.cost = adjusted;
                        entry.next = from;
                        entry.settling = 0;
                        events.push(TableEvent::RouteUpdate {
                            dest: update.id,
                            cost: adjusted,
                            next: from,
                        });
                    }
                    broadcast.push(RouteUpdate {
                        id: update.id,
                        seq: update.seq,
                        cost: adjusted,
                    });
                }
            }
        }

        TableDelta {
            to_peer: Vec::new(),
            broadcast,
            events,
        }
    }

    /// Periodic sweep of settled infinite-cost entries.
    ///
    /// An entry must sit at infinite cost for more than one full period
    /// before deletion, so a route mid-resurrection is not torn down.
    pub fn sweep(&mut self) -> Vec<TableEvent> {
        let mut expired = Vec::new();
        for (id, entry) in self.entries.iter_mut() {
            if !entry.cost.is_infinite() {
                continue;
            }
            if entry.settling >= 1 {
                expired.push(*id);
            } else {
                entry.settling += 1;
            }
        }
        for id in &expired {
            self.entries.remove(id);
        }
        expired
            .into_iter()
            .map(|dest| TableEvent::RouteExpired { dest })
            .collect()
    }
}
