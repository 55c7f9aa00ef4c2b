//! High-level API of the fabric
//!
//! This module provides the public-facing surface embedders use: the
//! [`Instance`] and its builder, the configuration structure, and the
//! event types delivered to subscribers.

pub mod config;
pub mod events;
pub mod instance;

pub use config::FabricConfig;
pub use events::{Event, RouteFailure, SubscriptionHandle};
pub use instance::{Instance, InstanceBuilder, InstanceState};
