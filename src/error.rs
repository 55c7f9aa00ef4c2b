//! Error types for weftmesh

use thiserror::Error;

/// Main error type for weftmesh operations
#[derive(Error, Debug)]
pub enum Error {
    /// Address/path-vector errors (loops, over-length vectors, bad merges)
    #[error("Address error: {0}")]
    Address(String),

    /// Routing errors (no route, forwarding blocked)
    #[error("Routing error: {0}")]
    Routing(String),

    /// Link and switch-board errors
    #[error("Link error: {0}")]
    Link(String),

    /// Wire protocol errors (malformed frames, bad field values)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Multiplexed stream errors
    #[error("Stream error: {0}")]
    Stream(String),

    /// Host-affinity errors (capacity exceeded, broken chains)
    #[error("Affinity error: {0}")]
    Affinity(String),

    /// Messenger errors (undeliverable messages, exhausted retries)
    #[error("Message error: {0}")]
    Message(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Frame serialization failed
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
