//! Multiplexed streams over the path vector

mod mux;

pub use mux::{Multiplexer, MuxStream};

use crate::address::Address;
use crate::error::Result;
use crate::protocol::StreamKind;
use serde_json::Value;
use std::sync::Arc;

/// The stream protocol surface of one instance.
///
/// Thin wrapper over the multiplexer; exists so the instance API exposes
/// streams without leaking multiplexer internals.
pub struct Streamer {
    mux: Arc<Multiplexer>,
}

impl Streamer {
    pub(crate) fn new(mux: Arc<Multiplexer>) -> Self {
        Self { mux }
    }

    /// Open a stream along `path` carrying structured object frames
    pub fn create_stream(&self, path: &Address, meta: Option<Value>) -> Result<MuxStream> {
        self.mux.create_stream(path, meta, StreamKind::Object)
    }

    /// Open a stream along `path` carrying raw byte chunks
    pub fn create_byte_stream(&self, path: &Address, meta: Option<Value>) -> Result<MuxStream> {
        self.mux.create_stream(path, meta, StreamKind::Bytes)
    }

    /// Await the next stream opened toward this instance
    pub async fn accept(&self) -> Option<MuxStream> {
        self.mux.accept().await
    }

    /// Number of live streams
    pub fn len(&self) -> usize {
        self.mux.len()
    }

    /// Whether no streams are live
    pub fn is_empty(&self) -> bool {
        self.mux.is_empty()
    }
}
