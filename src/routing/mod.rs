//! Routing: distance-vector tables, packet dispatch, and source routing
//!
//! [`RoutingTable`] is the pure DSDV state machine; [`Router`] wires it to
//! the switch board and dispatches routed packets to registered handlers;
//! [`PathVector`] adds source routing along explicit hop vectors for the
//! protocols that need to pin their path.

pub mod path_vector;
pub mod router;
pub mod routing_table;

pub use path_vector::{PathHandler, PathVector};
pub use router::{PacketContext, PacketHandler, RouteInfo, Router};
pub use routing_table::{RouteEntry, RoutingTable, TableDelta, TableEvent};
