//! Registry of configured links and the identity presented on each
//!
//! The directory owns the local internal vertex identity, assigns a fresh
//! external edge identity per external link, and de-duplicates external
//! peer ids seen across links (the same presented edge id cannot arrive
//! over two different links).

use super::{LinkId, LinkRef};
use crate::address::VertexId;
use crate::error::{Error, Result};
use crate::protocol::HelloMeta;
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::warn;
use uuid::Uuid;

struct RegisteredLink {
    link: LinkRef,
    edge: Option<VertexId>,
}

/// Tracks all configured links and their vertex identities
pub struct LinkDirectory {
    local: VertexId,
    links: RwLock<HashMap<LinkId, RegisteredLink>>,
    external_peers: RwLock<HashMap<Uuid, LinkId>>,
}

impl LinkDirectory {
    /// Create a directory for the instance identified by `local`
    pub fn new(local: VertexId) -> Self {
        Self {
            local,
            links: RwLock::new(HashMap::new()),
            external_peers: RwLock::new(HashMap::new()),
        }
    }

    /// The local internal identity
    pub fn local_id(&self) -> VertexId {
        self.local
    }

    /// Register a link; external links are assigned a fresh edge identity
    pub fn register(&self, link: LinkRef) -> Result<()> {
        let id = link.id().clone();
        let mut links = self.links.write();
        if links.contains_key(&id) {
            return Err(Error::Link(format!("link {id} already registered")));
        }
        let edge = link.is_external().then(VertexId::random_external);
        links.insert(id, RegisteredLink { link, edge });
        Ok(())
    }

    /// Remove a link and any external peers learned over it
    pub fn unregister(&self, id: &LinkId) -> Option<LinkRef> {
        let removed = self.links.write().remove(id)?;
        self.external_peers.write().retain(|_, via| via != id);
        Some(removed.link)
    }

    /// The registered link, if any
    pub fn get(&self, id: &LinkId) -> Option<LinkRef> {
        self.links.read().get(id).map(|r| r.link.clone())
    }

    /// Identity metadata to present during handshakes on `link`.
    ///
    /// Internal links present the local instance id; external links also
    /// carry the per-link edge id.
    pub fn identity_for(&self, link: &LinkId) -> HelloMeta {
        let edge = self.links.read().get(link).and_then(|r| r.edge);
        HelloMeta {
            i: self.local,
            e: edge,
        }
    }

    /// Record an external peer id learned over `link`.
    ///
    /// Returns false when the same id was already learned over a different
    /// link (a duplicate presentation, which the caller must reject).
    pub fn note_external_peer(&self, peer: VertexId, link: &LinkId) -> bool {
        let mut peers = self.external_peers.write();
        match peers.get(&peer.uuid()) {
            Some(via) if via != link => {
                warn!(%peer, seen_via = %via, duplicate_via = %link, "duplicate external peer id");
                false
            }
            _ => {
                peers.insert(peer.uuid(), link.clone());
                true
            }
        }
    }

    /// Drop the record of an external peer
    pub fn forget_external_peer(&self, peer: &VertexId) {
        self.external_peers.write().remove(&peer.uuid());
    }

    /// All registered links
    pub fn links(&self) -> Vec<LinkRef> {
        self.links.read().values().map(|r| r.link.clone()).collect()
    }

    /// Number of registered links
    pub fn len(&self) -> usize {
        self.links.read().len()
    }

    /// Whether no links are registered
    pub fn is_empty(&self) -> bool {
        self.links.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::memory::MemoryLink;
    use crate::link::Link;
    use crate::protocol::Cost;
    use std::sync::Arc;

    #[test]
    fn test_register_assigns_edge_identity_to_external_links() {
        let dir = LinkDirectory::new(VertexId::random());
        let (internal, _) = MemoryLink::pair("int", Cost::ZERO);
        let (external, _) = MemoryLink::external_pair("ext", Cost::ZERO);
        let internal_id = internal.id().clone();
        let external_id = external.id().clone();
        dir.register(Arc::new(internal)).unwrap();
        dir.register(Arc::new(external)).unwrap();

        let meta = dir.identity_for(&internal_id);
        assert_eq!(meta.i, dir.local_id());
        assert!(meta.e.is_none());

        let meta = dir.identity_for(&external_id);
        assert!(meta.e.unwrap().is_external());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let dir = LinkDirectory::new(VertexId::random());
        let (a, _) = MemoryLink::pair("dup", Cost::ZERO);
        let (b, _) = MemoryLink::pair("dup", Cost::ZERO);
        dir.register(Arc::new(a)).unwrap();
        assert!(dir.register(Arc::new(b)).is_err());
    }

    #[test]
    fn test_external_peer_dedup() {
        let dir = LinkDirectory::new(VertexId::random());
        let peer = VertexId::random_external();
        let via_a = LinkId::new("a");
        let via_b = LinkId::new("b");

        assert!(dir.note_external_peer(peer, &via_a));
        // Same id over the same link is a re-announce, not a duplicate.
        assert!(dir.note_external_peer(peer, &via_a));
        // Same id over another link is rejected.
        assert!(!dir.note_external_peer(peer, &via_b));

        dir.forget_external_peer(&peer);
        assert!(dir.note_external_peer(peer, &via_b));
    }
}
