use data_feed::CacheConfig;
use serde::{Deserialize, Serialize};

use crate::annotation::AnnotationConfig;
use crate::error::SessionError;

/// Host-tunable knobs. Every field has a default so partial JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    pub cache: CacheConfig,
    pub refresh_interval_ms: i64,
    /// Logical-range equality tolerance, in bars.
    pub range_tolerance: f64,
    pub candidate_display_cap: usize,
    pub future_horizon_bars: usize,
    pub max_step_secs: i64,
    pub inspection_half_window: usize,
    /// Prefix for every persisted key.
    pub storage_root: String,
    pub prefetch: bool,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            refresh_interval_ms: 15_000,
            range_tolerance: 1e-3,
            candidate_display_cap: 200,
            future_horizon_bars: 500,
            max_step_secs: 8 * 3_600,
            inspection_half_window: 5,
            storage_root: "chartcore".to_string(),
            prefetch: true,
        }
    }
}

impl ChartConfig {
    pub fn from_json(json: &str) -> Result<Self, SessionError> {
        serde_json::from_str(json).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_refresh_interval_ms(mut self, ms: i64) -> Self {
        self.refresh_interval_ms = ms;
        self
    }

    pub fn with_prefetch(mut self, enabled: bool) -> Self {
        self.prefetch = enabled;
        self
    }

    pub fn annotation(&self) -> AnnotationConfig {
        AnnotationConfig {
            candidate_cap: self.candidate_display_cap,
            horizon_bars: self.future_horizon_bars,
            max_step_secs: self.max_step_secs,
            inspection_half_window: self.inspection_half_window,
        }
    }
}
