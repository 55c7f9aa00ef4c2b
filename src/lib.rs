//! # Weftmesh
//!
//! A peer-to-peer message-routing fabric for meshes of cooperating
//! processes. Instances connect over pluggable links, converge on routes
//! with a distance-vector protocol, and talk through protocol surfaces
//! layered on the router: a flooding event bus, point-to-point messaging,
//! multiplexed streams with back-pressure, and host-affinity failure
//! chains.
//!
//! ## Quick Start
//!
//! ```no_run
//! use weftmesh::{InstanceBuilder, MemoryLink};
//! use weftmesh::protocol::Cost;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> weftmesh::Result<()> {
//!     let a = InstanceBuilder::new().build()?;
//!     let b = InstanceBuilder::new().build()?;
//!
//!     let (left, right) = MemoryLink::pair("a-b", Cost::new(1.0)?);
//!     a.add_link(Arc::new(left))?;
//!     b.add_link(Arc::new(right))?;
//!
//!     a.start()?;
//!     b.start()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod address;
pub mod affinity;
pub mod api;
pub mod bus;
pub mod error;
pub mod link;
pub mod messenger;
pub mod protocol;
pub mod routing;
pub mod stream;

// Re-export main types
pub use address::{Address, VertexId};
pub use affinity::Affinity;
pub use api::{
    Event, FabricConfig, Instance, InstanceBuilder, InstanceState, RouteFailure,
    SubscriptionHandle,
};
pub use bus::{Bus, BusSubscription};
pub use error::{Error, Result};
pub use link::memory::MemoryLink;
pub use link::{Link, LinkId, LinkRef};
pub use messenger::Messenger;
pub use protocol::{Cost, Neighborhood};
pub use routing::{RouteInfo, Router};
pub use stream::{MuxStream, Streamer};
