use serde::{Deserialize, Serialize};

/// Freshness, capacity and persistence bounds of the chart data cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_ms: i64,
    pub max_entries: usize,
    /// Quiet period after the last write before a snapshot is written.
    pub persist_debounce_ms: i64,
    pub persist_max_entries: usize,
    pub persist_max_bytes: usize,
    pub schema_version: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            max_entries: 40,
            persist_debounce_ms: 1_500,
            persist_max_entries: 12,
            persist_max_bytes: 2 * 1024 * 1024,
            schema_version: 1,
        }
    }
}

impl CacheConfig {
    pub fn with_ttl_ms(mut self, ttl_ms: i64) -> Self {
        self.ttl_ms = ttl_ms;
        self
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn with_persist_limits(mut self, max_entries: usize, max_bytes: usize) -> Self {
        self.persist_max_entries = max_entries;
        self.persist_max_bytes = max_bytes;
        self
    }
}
