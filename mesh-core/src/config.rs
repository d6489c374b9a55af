//! Core tunables. Embedded by hosts as a `[mesh]` table; every field has a default.

use serde::Deserialize;

use crate::identity::PeerId;
use crate::protocol::Millis;

/// Default chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: u64 = 64 * 1024;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // Transfer
    pub chunk_size: u64,
    /// Max chunk requests in flight per task.
    pub parallel_window: usize,
    pub chunk_timeout_ms: Millis,
    /// Timeouts on one offset before a holder is dropped from the task.
    pub chunk_max_attempts: u32,
    /// Content of at most this many chunks prefetches its whole tail once the head lands.
    pub small_content_chunks: u64,
    pub prefetch_ahead_chunks: u64,
    /// A range opening further than this many chunks from the sequential cursor is a seek.
    pub seek_distance_chunks: u64,
    pub reconnect_throttle_ms: Millis,

    // Overlay
    pub connect_timeout_ms: Millis,
    pub ping_timeout_ms: Millis,
    pub gossip_delay_ms: Millis,
    pub gossip_fanout: usize,
    pub max_peers: usize,
    pub hub_max_peers: usize,

    // Hub election
    pub hub_count: usize,
    pub hub_prefix: String,
    pub hub_decision_ms: Millis,
    pub hub_retry_ms: Millis,
    pub hub_resign_grace_ms: Millis,

    // Dissemination
    pub default_ttl: u8,
    pub send_burst: usize,
    pub send_window_ms: Millis,
    pub sync_limit: usize,

    // Metadata reliability
    pub ack_retry_ms: Millis,
    pub ack_max_attempts: u32,
    pub ack_max_age_ms: Millis,
    pub ack_discovery_ms: Millis,

    // Responder
    pub buffered_high_water: u64,

    // Presence
    pub presence_interval_ms: Millis,
    pub presence_timeout_ms: Millis,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            parallel_window: 8,
            chunk_timeout_ms: 3_000,
            chunk_max_attempts: 5,
            small_content_chunks: 4,
            prefetch_ahead_chunks: 16,
            seek_distance_chunks: 2,
            reconnect_throttle_ms: 5_000,
            connect_timeout_ms: 15_000,
            ping_timeout_ms: 45_000,
            gossip_delay_ms: 500,
            gossip_fanout: 64,
            max_peers: 350,
            hub_max_peers: 500,
            hub_count: 3,
            hub_prefix: "mesh-hub-".to_string(),
            hub_decision_ms: 2_500,
            hub_retry_ms: 10_000,
            hub_resign_grace_ms: 3_000,
            default_ttl: 6,
            send_burst: 5,
            send_window_ms: 1_000,
            sync_limit: 200,
            ack_retry_ms: 1_500,
            ack_max_attempts: 10,
            ack_max_age_ms: 20_000,
            ack_discovery_ms: 1_000,
            buffered_high_water: 1024 * 1024,
            presence_interval_ms: 5_000,
            presence_timeout_ms: 15_000,
        }
    }
}

impl Config {
    /// Well-known hub identities, index == slot.
    pub fn hub_ids(&self) -> Vec<PeerId> {
        (0..self.hub_count)
            .map(|i| PeerId::hub(&self.hub_prefix, i))
            .collect()
    }

    pub fn is_hub_id(&self, peer: &PeerId) -> bool {
        peer.hub_slot(&self.hub_prefix)
            .map_or(false, |slot| slot < self.hub_count)
    }
}
