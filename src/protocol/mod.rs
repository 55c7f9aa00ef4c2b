//! Wire protocol for the fabric
//!
//! Everything that crosses a link is a structured frame, not raw bytes.
//! Frames are self-describing records with short field names and dynamic
//! payloads, serialized with serde. This module defines the shared scalar
//! types (neighborhood levels, route costs, handler tags) and re-exports
//! the frame structs from [`frames`].

mod frames;

pub use frames::{
    AffinityIds, AffinityOp, AffinityPacket, BusPacket, Frame, HandshakeFrame, HandshakePhase,
    HelloMeta, MessageKind, MessagePacket, MuxControl, MuxFrame, MuxOp, MuxPayload,
    PathVectorPacket, RouteUpdate, RouterPacket, RoutingFrame, StreamKind,
};

use crate::error::{Error, Result};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::ops::Add;

/// Ordinal trust/scope level bounding how far a message may propagate and
/// which sources a receiver accepts.
///
/// Strictly increasing: `LOCAL < GROUP < GLOBAL < UNIVERSAL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Neighborhood {
    /// This instance only; never forwarded
    Local = 0,
    /// The trusted internal network
    #[default]
    Group = 1,
    /// Internal plus one external boundary crossing
    Global = 2,
    /// Unrestricted, including federated external networks
    Universal = 3,
}

impl Neighborhood {
    /// Decode from the wire ordinal
    pub fn from_ordinal(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Local),
            1 => Ok(Self::Group),
            2 => Ok(Self::Global),
            3 => Ok(Self::Universal),
            other => Err(Error::Protocol(format!(
                "invalid neighborhood level {other}"
            ))),
        }
    }
}

impl fmt::Display for Neighborhood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Group => "group",
            Self::Global => "global",
            Self::Universal => "universal",
        };
        f.write_str(name)
    }
}

impl Serialize for Neighborhood {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for Neighborhood {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = u8::deserialize(deserializer)?;
        Neighborhood::from_ordinal(value).map_err(D::Error::custom)
    }
}

/// Additive route cost.
///
/// Costs are non-negative reals; infinity marks an unreachable destination
/// and saturates under addition. On the wire, infinity serializes to the
/// sentinel token `"inf"` so it can never collide with a numeric cost.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Cost(f64);

impl Cost {
    /// Zero cost (the route to self)
    pub const ZERO: Cost = Cost(0.0);
    /// Unreachable
    pub const INFINITE: Cost = Cost(f64::INFINITY);

    /// Construct a finite cost; negative and NaN values are rejected
    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() || value < 0.0 {
            return Err(Error::Protocol(format!("invalid cost {value}")));
        }
        Ok(Cost(value))
    }

    /// Raw value
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Whether this cost marks an unreachable destination
    pub fn is_infinite(&self) -> bool {
        self.0.is_infinite()
    }

    /// Addition with saturation at infinity
    pub fn saturating_add(self, other: Cost) -> Cost {
        Cost(self.0 + other.0)
    }
}

impl Add for Cost {
    type Output = Cost;

    fn add(self, other: Cost) -> Cost {
        self.saturating_add(other)
    }
}

impl fmt::Display for Cost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            f.write_str("inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Serialize for Cost {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        if self.is_infinite() {
            serializer.serialize_str("inf")
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Cost {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(f64),
            Token(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Cost::new(n).map_err(D::Error::custom),
            Repr::Token(t) if t == "inf" => Ok(Cost::INFINITE),
            Repr::Token(t) => Err(D::Error::custom(format!("invalid cost token {t:?}"))),
        }
    }
}

/// Tag naming the handler a routed packet is dispatched to.
///
/// The well-known protocols have fixed tags; embedders may register
/// additional handlers under custom names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HandlerKind {
    /// Source-routed path-vector packets
    PathVector,
    /// Controlled-flooding event bus
    Bus,
    /// Host-affinity chain protocol
    Affinity,
    /// Point-to-point messenger (rides path-vector)
    Messenger,
    /// Stream multiplexer (rides path-vector)
    Streamer,
    /// Embedder-registered handler
    Custom(String),
}

impl HandlerKind {
    /// The wire name of this handler
    pub fn name(&self) -> &str {
        match self {
            Self::PathVector => "path-vector",
            Self::Bus => "bus",
            Self::Affinity => "affinity",
            Self::Messenger => "messenger",
            Self::Streamer => "streamer",
            Self::Custom(name) => name,
        }
    }
}

impl From<&str> for HandlerKind {
    fn from(name: &str) -> Self {
        match name {
            "path-vector" => Self::PathVector,
            "bus" => Self::Bus,
            "affinity" => Self::Affinity,
            "messenger" => Self::Messenger,
            "streamer" => Self::Streamer,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for HandlerKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for HandlerKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(HandlerKind::from(s.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_neighborhood_ordering() {
        assert!(Neighborhood::Local < Neighborhood::Group);
        assert!(Neighborhood::Group < Neighborhood::Global);
        assert!(Neighborhood::Global < Neighborhood::Universal);
    }

    #[test]
    fn test_neighborhood_wire_ordinal() {
        let json = serde_json::to_value(Neighborhood::Global).unwrap();
        assert_eq!(json, serde_json::json!(2));
        let back: Neighborhood = serde_json::from_value(json).unwrap();
        assert_eq!(back, Neighborhood::Global);

        assert!(serde_json::from_value::<Neighborhood>(serde_json::json!(9)).is_err());
    }

    #[test]
    fn test_cost_rejects_negative_and_nan() {
        assert!(Cost::new(-1.0).is_err());
        assert!(Cost::new(f64::NAN).is_err());
        assert!(Cost::new(0.0).is_ok());
    }

    #[test]
    fn test_cost_saturates_at_infinity() {
        let c = Cost::INFINITE.saturating_add(Cost::new(5.0).unwrap());
        assert!(c.is_infinite());
        let c = Cost::new(1.0).unwrap() + Cost::INFINITE;
        assert!(c.is_infinite());
    }

    #[test]
    fn test_cost_infinity_serializes_to_sentinel() {
        let json = serde_json::to_value(Cost::INFINITE).unwrap();
        assert_eq!(json, serde_json::json!("inf"));
        let back: Cost = serde_json::from_value(json).unwrap();
        assert!(back.is_infinite());

        let json = serde_json::to_value(Cost::new(2.5).unwrap()).unwrap();
        assert_eq!(json, serde_json::json!(2.5));

        assert!(serde_json::from_value::<Cost>(serde_json::json!("infinity")).is_err());
    }

    #[test]
    fn test_handler_kind_wire_names() {
        let json = serde_json::to_value(HandlerKind::PathVector).unwrap();
        assert_eq!(json, serde_json::json!("path-vector"));

        let back: HandlerKind = serde_json::from_value(serde_json::json!("bus")).unwrap();
        assert_eq!(back, HandlerKind::Bus);

        let custom: HandlerKind = serde_json::from_value(serde_json::json!("rpc")).unwrap();
        assert_eq!(custom, HandlerKind::Custom("rpc".into()));
    }
}
