//! Link association gating
//!
//! Forwarding a packet from one link onto another is only allowed when the
//! two links are associated. The default bridge associates everything;
//! deployments that partition their links (for example keeping an external
//! federation link away from a local worker link) install an
//! [`AssociationTable`].

use super::LinkId;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Answers whether traffic may be forwarded between two links
pub trait LinkBridge: Send + Sync {
    /// Whether `a` and `b` are associated (symmetric)
    fn is_associated(&self, a: &LinkId, b: &LinkId) -> bool;
}

/// Bridge that associates every pair of links (the default)
#[derive(Debug, Default)]
pub struct OpenBridge;

impl LinkBridge for OpenBridge {
    fn is_associated(&self, _a: &LinkId, _b: &LinkId) -> bool {
        true
    }
}

/// Explicit symmetric association table.
///
/// A link is always associated with itself.
#[derive(Debug, Default)]
pub struct AssociationTable {
    pairs: RwLock<HashSet<(LinkId, LinkId)>>,
}

impl AssociationTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Associate two links in both directions
    pub fn associate(&self, a: LinkId, b: LinkId) {
        let mut pairs = self.pairs.write();
        pairs.insert((a.clone(), b.clone()));
        pairs.insert((b, a));
    }

    /// Remove an association
    pub fn dissociate(&self, a: &LinkId, b: &LinkId) {
        let mut pairs = self.pairs.write();
        pairs.remove(&(a.clone(), b.clone()));
        pairs.remove(&(b.clone(), a.clone()));
    }
}

impl LinkBridge for AssociationTable {
    fn is_associated(&self, a: &LinkId, b: &LinkId) -> bool {
        a == b || self.pairs.read().contains(&(a.clone(), b.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_bridge_associates_everything() {
        let bridge = OpenBridge;
        assert!(bridge.is_associated(&LinkId::new("a"), &LinkId::new("b")));
    }

    #[test]
    fn test_association_table_symmetric() {
        let table = AssociationTable::new();
        let a = LinkId::new("a");
        let b = LinkId::new("b");
        let c = LinkId::new("c");

        assert!(!table.is_associated(&a, &b));
        table.associate(a.clone(), b.clone());
        assert!(table.is_associated(&a, &b));
        assert!(table.is_associated(&b, &a));
        assert!(!table.is_associated(&a, &c));

        // Self-association always holds.
        assert!(table.is_associated(&c, &c));

        table.dissociate(&b, &a);
        assert!(!table.is_associated(&a, &b));
    }
}
