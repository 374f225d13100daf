use std::time::Duration;

use islands_common::{ChunkExtent, WorldInfo};
use serde::{Deserialize, Serialize};

/// Streaming configuration: chunk geometry, which world to stream, and driver pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Size of every chunk in tiles. Must match the extent the storage was written with.
    pub chunk_extent: ChunkExtent,
    /// World handed to the storage backend on every call.
    pub world: WorldInfo,
    /// Period of the background driver that triggers queue drains.
    pub drain_interval_ms: u64,
    /// Number of recent drains whose statistics are kept.
    pub drain_history: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_extent: ChunkExtent::default(),
            world: WorldInfo::default(),
            drain_interval_ms: 50,
            drain_history: 64,
        }
    }
}

impl StreamConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_config_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.chunk_extent, ChunkExtent::flat(16, 16).unwrap());
        assert_eq!(config.world.id(), "world");
        assert_eq!(config.drain_interval(), Duration::from_millis(50));
        assert_eq!(config.drain_history, 64);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let config = StreamConfig {
            drain_interval_ms: 0,
            ..StreamConfig::default()
        };
        assert_eq!(config.drain_interval(), Duration::from_millis(1));
    }
}
