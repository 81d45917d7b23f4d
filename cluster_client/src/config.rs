//! Client configuration.
//!
//! One struct in place of a handful of bare constructor arguments, with
//! defaults of 4 max redirects, a 30s circuit breaker duration, and a
//! 30s topology refresh interval.

use std::time::Duration;

/// Which RESP protocol version to negotiate via `HELLO` on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespVersion {
    Resp2,
    Resp3,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Protocol version requested during the connection handshake.
    pub resp_version: RespVersion,
    /// Maximum MOVED/ASK redirects followed before giving up on a
    /// single command, surfaced as `WaitedForDiscoveryAfterMovedTooManyTimes`.
    pub max_redirects: u32,
    /// How long the circuit breaker stays open after discovery fails to
    /// reach consensus.
    pub circuit_breaker_duration: Duration,
    /// Interval between proactive topology refreshes while Healthy.
    pub default_refresh_interval: Duration,
    /// Size of the worker pool used to fan discovery and cross-shard
    /// pipeline requests out across nodes concurrently.
    pub worker_pool_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            resp_version: RespVersion::Resp3,
            max_redirects: 4,
            circuit_breaker_duration: Duration::from_secs(30),
            default_refresh_interval: Duration::from_secs(30),
            worker_pool_size: 8,
        }
    }
}
