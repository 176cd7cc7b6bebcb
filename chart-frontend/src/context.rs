use std::rc::Rc;

use app_shell::{KeyValueStorage, StorageKeys};
use data_feed::{normalize_ticker, ChartRequest};
use ta_engine::IndicatorParams;
use ts_core::{Clock, Interval};

use crate::config::ChartConfig;
use crate::refresh::{LiveRefreshScheduler, RequestGeneration};
use crate::sync::SyncLock;
use crate::token::SuppressFlags;
use crate::PaneRole;

/// State shared by one chart widget's components.
///
/// Owned by the widget instance; each component receives the pieces it
/// needs at construction. Nothing here is process-global.
pub struct ChartSessionContext {
    pub config: ChartConfig,
    pub keys: StorageKeys,
    pub clock: Rc<dyn Clock>,
    pub storage: Rc<dyn KeyValueStorage>,
    pub generation: RequestGeneration,
    pub sync_lock: SyncLock,
    pub suppress: SuppressFlags<PaneRole>,
    pub refresh: LiveRefreshScheduler,
    ticker: Option<String>,
    interval: Interval,
    params: IndicatorParams,
    crosshair_hidden: bool,
}

impl ChartSessionContext {
    pub fn new(config: ChartConfig, storage: Rc<dyn KeyValueStorage>, clock: Rc<dyn Clock>) -> Self {
        let keys = StorageKeys::new(config.storage_root.clone());
        let refresh = LiveRefreshScheduler::new(config.refresh_interval_ms);
        Self {
            config,
            keys,
            clock,
            storage,
            generation: RequestGeneration::new(),
            sync_lock: SyncLock::new(),
            suppress: SuppressFlags::new(),
            refresh,
            ticker: None,
            interval: Interval::Days(1),
            params: IndicatorParams::default(),
            crosshair_hidden: false,
        }
    }

    pub fn ticker(&self) -> Option<&str> {
        self.ticker.as_deref()
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn params(&self) -> &IndicatorParams {
        &self.params
    }

    pub fn set_params(&mut self, params: IndicatorParams) {
        self.params = params;
    }

    pub fn crosshair_hidden(&self) -> bool {
        self.crosshair_hidden
    }

    pub fn set_crosshair_hidden(&mut self, hidden: bool) {
        self.crosshair_hidden = hidden;
    }

    /// Point the context at a ticker/interval. Returns whether it changed.
    pub fn switch_to(&mut self, ticker: &str, interval: Interval) -> bool {
        let ticker = normalize_ticker(ticker);
        let changed = self.ticker.as_deref() != Some(ticker.as_str()) || self.interval != interval;
        self.ticker = Some(ticker);
        self.interval = interval;
        changed
    }

    pub fn current_request(&self) -> Option<ChartRequest> {
        let ticker = self.ticker.as_ref()?;
        Some(ChartRequest::new(ticker, self.interval, self.params.clone()))
    }
}
