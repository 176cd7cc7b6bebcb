use std::fmt;

use serde::{Deserialize, Serialize};
use ta_engine::IndicatorParams;
use ts_core::Interval;

pub mod cache;
pub mod config;
pub mod error;
pub mod memory;
pub mod payload;
pub mod policy;
pub mod prefetch;
pub mod source;

pub use cache::DataCache;
pub use config::CacheConfig;
pub use error::FetchError;
pub use memory::MemoryCache;
pub use payload::{
    parse_chart_payload, parse_latest_payload, ChartPayload, LatestPayload, PayloadError,
    RawChartPayload, RawLatestPayload,
};
pub use policy::{resolve_failure, FailureResolution};
pub use prefetch::{neighbor_tickers, plan_prefetch, related_intervals, Prefetcher};
pub use source::{ChartDataSource, StaticDataSource};

#[cfg(target_arch = "wasm32")]
pub use source::HttpDataSource;

/// One chart load: what to fetch and how to derive it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChartRequest {
    pub ticker: String,
    pub interval: Interval,
    pub params: IndicatorParams,
    /// Bypass the cache read (the result is still written back).
    #[serde(default)]
    pub refresh: bool,
}

impl ChartRequest {
    pub fn new(ticker: impl AsRef<str>, interval: Interval, params: IndicatorParams) -> Self {
        Self {
            ticker: normalize_ticker(ticker.as_ref()),
            interval,
            params,
            refresh: false,
        }
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey {
            ticker: self.ticker.clone(),
            interval: self.interval,
            param_hash: self.params.param_hash(),
        }
    }
}

pub fn normalize_ticker(ticker: &str) -> String {
    ticker.trim().to_uppercase()
}

/// Cache identity: (ticker, interval, parameter hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub ticker: String,
    pub interval: Interval,
    pub param_hash: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.ticker, self.interval, self.param_hash)
    }
}
