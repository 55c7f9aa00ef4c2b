//! Vertex identity and path-vector addressing
//!
//! A `VertexId` names one runtime instance in the fabric. An `Address` is an
//! ordered vector of vertex identifiers describing how to reach a remote
//! instance hop by hop. Addresses carry a lazy `reversed` flag so that
//! building a return path never copies the hop vector eagerly; normalization
//! happens once and is memoized.

use crate::error::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Suffix marking an identifier that crossed into an untrusted network
const EXTERNAL_SUFFIX: &str = "-ext";

/// Identity of one fabric instance.
///
/// External vertices mark a trust boundary: they are displayed and
/// serialized with an `-ext` suffix and are never fed into the internal
/// distance-vector table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId {
    uuid: Uuid,
    external: bool,
}

impl VertexId {
    /// Create an identifier from a raw UUID
    pub fn new(uuid: Uuid, external: bool) -> Self {
        Self { uuid, external }
    }

    /// Generate a fresh internal identifier
    pub fn random() -> Self {
        Self::new(Uuid::new_v4(), false)
    }

    /// Generate a fresh external-edge identifier
    pub fn random_external() -> Self {
        Self::new(Uuid::new_v4(), true)
    }

    /// The underlying UUID
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Whether this identifier crosses a trust boundary
    pub fn is_external(&self) -> bool {
        self.external
    }

    /// The same identity viewed as an external edge
    pub fn as_external(self) -> Self {
        Self {
            external: true,
            ..self
        }
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.external {
            write!(f, "{}{}", self.uuid, EXTERNAL_SUFFIX)
        } else {
            write!(f, "{}", self.uuid)
        }
    }
}

impl FromStr for VertexId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (raw, external) = match s.strip_suffix(EXTERNAL_SUFFIX) {
            Some(stripped) => (stripped, true),
            None => (s, false),
        };
        let uuid = Uuid::parse_str(raw)
            .map_err(|e| Error::Address(format!("invalid vertex id {s:?}: {e}")))?;
        Ok(Self { uuid, external })
    }
}

impl Serialize for VertexId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VertexId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A path vector: the ordered hops used to reach a remote instance.
///
/// The hop vector may be stored in reverse order with the `reversed` flag
/// set; all logical accessors account for the flag, and [`Address::normalize`]
/// rewrites the storage once so repeated access stays cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    hops: Vec<VertexId>,
    reversed: bool,
}

impl Address {
    /// Create an address from hops in forward (travel) order
    pub fn new(hops: Vec<VertexId>) -> Self {
        Self {
            hops,
            reversed: false,
        }
    }

    /// Create an address whose storage is the reverse of the travel order
    pub fn from_reversed(hops: Vec<VertexId>) -> Self {
        Self {
            hops,
            reversed: true,
        }
    }

    /// Address of a directly named destination (single hop)
    pub fn direct(dest: VertexId) -> Self {
        Self::new(vec![dest])
    }

    /// Number of hops
    pub fn len(&self) -> usize {
        self.hops.len()
    }

    /// Whether the vector is empty
    pub fn is_empty(&self) -> bool {
        self.hops.is_empty()
    }

    /// First hop in travel order
    pub fn first(&self) -> Option<VertexId> {
        if self.reversed {
            self.hops.last().copied()
        } else {
            self.hops.first().copied()
        }
    }

    /// Final hop (the destination) in travel order
    pub fn last(&self) -> Option<VertexId> {
        if self.reversed {
            self.hops.first().copied()
        } else {
            self.hops.last().copied()
        }
    }

    /// Rewrite storage into travel order and clear the reversed flag
    pub fn normalize(&mut self) {
        if self.reversed {
            self.hops.reverse();
            self.reversed = false;
        }
    }

    /// The hops in travel order
    pub fn to_vec(&self) -> Vec<VertexId> {
        if self.reversed {
            self.hops.iter().rev().copied().collect()
        } else {
            self.hops.clone()
        }
    }

    /// The return path: same hops, opposite travel direction.
    ///
    /// Reversal is lazy; only the flag flips.
    pub fn reverse(mut self) -> Self {
        self.reversed = !self.reversed;
        self
    }

    /// Validity: non-empty, within the hop budget, and loop free
    /// (no repeated identifier).
    pub fn is_valid(&self, max_hops: usize) -> bool {
        if self.hops.is_empty() || self.hops.len() > max_hops {
            return false;
        }
        let mut seen = HashSet::with_capacity(self.hops.len());
        self.hops.iter().all(|hop| seen.insert(*hop))
    }

    /// Drop leading hops equal to `id` (self references at the head of the
    /// vector once a packet has arrived at `id`).
    pub fn strip_leading(&mut self, id: VertexId) {
        self.normalize();
        let skip = self.hops.iter().take_while(|h| **h == id).count();
        if skip > 0 {
            self.hops.drain(..skip);
        }
    }

    /// The hops a reply must travel: this path mirrored, with the final
    /// hop replaced by `local` (the instance composing the reply path).
    pub fn return_hops(&self, local: VertexId) -> Vec<VertexId> {
        let mut back = self.to_vec();
        back.pop();
        back.reverse();
        back.push(local);
        back
    }

    /// Merge this path with a continuation that starts where this one ends.
    ///
    /// Common ground is collapsed: `A→B→C→D` routed through `D→C→E→F`
    /// yields `A→B→C→E→F`. Fully disjoint continuations concatenate.
    /// A continuation that does not start at this path's destination is an
    /// error.
    pub fn route_through(&self, continuation: &Address) -> Result<Address> {
        let base = self.to_vec();
        let cont = continuation.to_vec();
        let (Some(end), Some(start)) = (base.last(), cont.first()) else {
            return Err(Error::Address("cannot merge an empty address".into()));
        };
        if end != start {
            return Err(Error::Address(format!(
                "addresses do not meet: {end} != {start}"
            )));
        }

        let mut merged = base;
        for hop in cont.into_iter().skip(1) {
            if let Some(pos) = merged.iter().position(|h| *h == hop) {
                // Backtracking over shared ground: cut the tail past the
                // common hop instead of walking it twice.
                merged.truncate(pos + 1);
            } else {
                merged.push(hop);
            }
        }
        Ok(Address::new(merged))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops = self.to_vec();
        let mut first = true;
        for hop in hops {
            if !first {
                write!(f, " > ")?;
            }
            write!(f, "{hop}")?;
            first = false;
        }
        Ok(())
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_vec().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hops = Vec::<VertexId>::deserialize(deserializer)?;
        Ok(Address::new(hops))
    }
}
