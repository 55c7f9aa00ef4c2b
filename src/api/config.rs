//! Configuration for a fabric instance
//!
//! All tunables live in one structure with sensible defaults; instances are
//! created through the builder and validated before use.

use crate::error::{Error, Result};
use crate::protocol::Neighborhood;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete configuration for one fabric instance.
///
/// The defaults suit an internal mesh of a few dozen peers; embedders
/// mostly touch `accept_level` and `max_host_affinities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FabricConfig {
    /// Maximum hops a path vector may carry; longer addresses are invalid
    pub max_hops: usize,

    /// Period of the routing sweep that expires settled infinite-cost
    /// entries (also the affinity expiry cadence)
    pub sweep_period: Duration,

    /// How long a connection may sit mid-handshake before being closed
    pub handshake_timeout: Duration,

    /// How long an unconfirmed affinity hop may wait for its pairwise
    /// acknowledgement before being force-closed
    pub affinity_staleness: Duration,

    /// Upper bound on affinity chains an external peer may anchor here
    pub max_host_affinities: usize,

    /// Most distant source level this instance accepts packets from
    pub accept_level: Neighborhood,

    /// Per-stream consumer buffer before back-pressure pauses the sender
    pub stream_buffer: usize,

    /// Interval between messenger request retries
    pub request_retry_period: Duration,

    /// Retries before an unanswered request fails
    pub request_retry_attempts: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            max_hops: 32,
            sweep_period: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(15),
            affinity_staleness: Duration::from_secs(5),
            max_host_affinities: 128,
            accept_level: Neighborhood::Universal,
            stream_buffer: 64,
            request_retry_period: Duration::from_secs(2),
            request_retry_attempts: 3,
        }
    }
}

impl FabricConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_hops == 0 {
            return Err(Error::Config("max_hops must be positive".into()));
        }
        if self.stream_buffer == 0 {
            return Err(Error::Config("stream_buffer must be positive".into()));
        }
        if self.max_host_affinities == 0 {
            return Err(Error::Config("max_host_affinities must be positive".into()));
        }
        if self.sweep_period.is_zero() || self.handshake_timeout.is_zero() {
            return Err(Error::Config("periods must be non-zero".into()));
        }
        if self.request_retry_attempts == 0 {
            return Err(Error::Config(
                "request_retry_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
