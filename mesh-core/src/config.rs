//! Protocol tunables. Every field has a default; hosts override a subset from their config file.

use std::time::Duration;

use serde::Deserialize;

/// Tunables for the mesh, gossip, presence and transfer layers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Dial must reach open within this many milliseconds.
    pub handshake_timeout_ms: u64,
    /// Non-rendezvous connections silent for longer are reaped.
    pub pong_timeout_ms: u64,
    /// Connection ceiling for ordinary nodes.
    pub max_peers: usize,
    /// Connection ceiling while holding a rendezvous identity.
    pub max_peers_hub: usize,
    /// Inbound connections accepted above the ceiling before refusing.
    pub peer_grace: usize,
    /// Peer ids per PEER_EX packet, self included.
    pub gossip_fanout: usize,
    pub default_ttl: u32,
    pub seen_capacity: usize,
    pub seen_evict: usize,
    /// Broadcast messages per REP_PUB reply.
    pub catch_up_limit: usize,
    pub chunk_size: u64,
    /// Concurrent chunk requests per transfer.
    pub window: usize,
    pub chunk_timeout_ms: u64,
    /// Heartbeat period over the primary presence endpoint.
    pub pulse_interval_ms: u64,
    /// Heartbeat period over the fallback relay.
    pub pulse_interval_fallback_ms: u64,
    pub presence_timeout_ms: u64,
    pub presence_timeout_fallback_ms: u64,
    pub presence_retry_ms: u64,
    /// Opportunistic hub dials allowed in flight.
    pub max_pending_dials: usize,
    /// A rendezvous slot silent this long is considered vacant.
    pub hub_stale_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 5_000,
            pong_timeout_ms: 8_000,
            max_peers: 350,
            max_peers_hub: 500,
            peer_grace: 50,
            gossip_fanout: 20,
            default_ttl: crate::protocol::DEFAULT_TTL,
            seen_capacity: 2_000,
            seen_evict: 500,
            catch_up_limit: 100,
            chunk_size: 512 * 1024,
            window: 8,
            chunk_timeout_ms: 5_000,
            pulse_interval_ms: 4_000,
            pulse_interval_fallback_ms: 10_000,
            presence_timeout_ms: 5_000,
            presence_timeout_fallback_ms: 10_000,
            presence_retry_ms: 3_000,
            max_pending_dials: 5,
            hub_stale_ms: 30_000,
        }
    }
}

impl MeshConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn hub_stale(&self) -> Duration {
        Duration::from_millis(self.hub_stale_ms)
    }

    pub fn presence_retry(&self) -> Duration {
        Duration::from_millis(self.presence_retry_ms)
    }
}
