//! Top-level chart widget: loads, renders, refreshes and annotates the four panes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use app_shell::{KeyValueStorage, PaneWeights, SettingsStore, TrendlineStore};
use data_feed::{
    plan_prefetch, resolve_failure, CacheKey, ChartDataSource, ChartPayload, ChartRequest,
    DataCache, FailureResolution, FetchError, LatestPayload, Prefetcher,
};
use futures::future::{abortable, AbortHandle};
use futures::task::LocalSpawn;
use ta_engine::{ChartSeries, PatchReport, SeriesSlot};
use tracing::{debug, info, warn};
use ts_core::{Clock, IndicatorPoint, Interval, TimeKey};

use crate::annotation::{project_ray, AnnotationController, AnnotationInput, ClickOutcome, TrendRay};
use crate::config::ChartConfig;
use crate::context::ChartSessionContext;
use crate::error::SessionError;
use crate::events::EventQueue;
use crate::refresh::{decide, RefreshDecision};
use crate::registry::{SurfaceBinding, SurfaceRegistry};
use crate::surface::{Marker, SeriesData, SeriesDatum, SeriesKind, SeriesOptions, SurfaceFactory};
use crate::sync::{SyncCoordinator, SyncReport};
use crate::PaneRole;

const TRENDLINE_COLOR: &str = "#ffd54f";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewStatus {
    Empty,
    Loading,
    Ready,
    InvalidSymbol,
    RetryAvailable { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    Rendered,
    /// A newer request superseded this one; nothing was touched.
    Discarded,
    Failed(FailureResolution),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RefreshOutcome {
    Skipped,
    Discarded,
    Patched(PatchReport),
    Reloaded(LoadOutcome),
    Failed(FetchError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameReport {
    pub batches: usize,
    pub lock_released: bool,
    pub persisted: bool,
}

struct Rendered {
    request: ChartRequest,
    key: CacheKey,
    payload: ChartPayload,
    series: ChartSeries,
}

struct SessionInner {
    ctx: RefCell<ChartSessionContext>,
    cache: DataCache,
    source: Rc<dyn ChartDataSource>,
    prefetcher: Prefetcher,
    queue: EventQueue,
    registry: RefCell<SurfaceRegistry>,
    sync: RefCell<SyncCoordinator>,
    annotations: RefCell<AnnotationController>,
    trendlines: TrendlineStore,
    settings: SettingsStore,
    pane_weights: Cell<PaneWeights>,
    watchlist: RefCell<Vec<String>>,
    rendered: RefCell<Option<Rendered>>,
    status: RefCell<ViewStatus>,
    primary: RefCell<Option<AbortHandle>>,
    last_request: RefCell<Option<ChartRequest>>,
    torn_down: Cell<bool>,
}

impl SessionInner {
    fn set_status(&self, status: ViewStatus) {
        *self.status.borrow_mut() = status;
    }
}

/// Cheap-to-clone handle; async operations never hold a borrow across an await.
#[derive(Clone)]
pub struct ChartSession {
    inner: Rc<SessionInner>,
}

fn series_data(series: &ChartSeries, slot: SeriesSlot) -> SeriesData {
    match slot {
        SeriesSlot::Bars => SeriesData::Bars(series.bars.clone()),
        other => SeriesData::Points(series.slot(other).to_vec()),
    }
}

fn close_points(series: &ChartSeries) -> Vec<IndicatorPoint> {
    series
        .bars
        .iter()
        .map(|b| IndicatorPoint::new(b.time, b.close))
        .collect()
}

fn add_rays(binding: &mut SurfaceBinding, rays: Vec<TrendRay>) -> Result<usize, SessionError> {
    let mut drawn = 0;
    for ray in rays {
        let handle = binding.surface.add_series(
            SeriesKind::Line,
            SeriesOptions::line("Trendline", TRENDLINE_COLOR).dashed(),
        )?;
        binding.surface.set_data(handle, SeriesData::Points(ray.points));
        if let Some(label) = ray.midline {
            binding.surface.set_markers(
                handle,
                vec![Marker {
                    time: label.time,
                    value: Some(label.value),
                    text: label.text,
                }],
            );
        }
        binding.push_trendline_series(handle);
        drawn += 1;
    }
    Ok(drawn)
}

impl ChartSession {
    pub fn new(
        config: ChartConfig,
        source: Rc<dyn ChartDataSource>,
        factory: Rc<dyn SurfaceFactory>,
        spawner: Rc<dyn LocalSpawn>,
        storage: Rc<dyn KeyValueStorage>,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let mut ctx = ChartSessionContext::new(config, storage.clone(), clock.clone());
        let settings = SettingsStore::new(storage.clone(), ctx.keys.clone(), clock.clone());
        let layout = settings.load();
        ctx.set_params(layout.params.clone());
        ctx.set_crosshair_hidden(layout.crosshair_hidden);

        let cache = DataCache::new(ctx.config.cache.clone(), storage.clone(), &ctx.keys, clock.clone());
        let restored = cache.restore();
        let prefetcher = Prefetcher::new(cache.clone(), source.clone(), spawner);
        let queue = EventQueue::new();
        let registry = SurfaceRegistry::new(factory, queue.clone(), ctx.suppress.clone());
        let sync = SyncCoordinator::new(
            ctx.sync_lock.clone(),
            ctx.suppress.clone(),
            ctx.config.range_tolerance,
        );
        let annotations = AnnotationController::new(ctx.config.annotation());
        let trendlines = TrendlineStore::new(storage, ctx.keys.clone(), clock);
        info!(restored, "chart session created");

        Self {
            inner: Rc::new(SessionInner {
                ctx: RefCell::new(ctx),
                cache,
                source,
                prefetcher,
                queue,
                registry: RefCell::new(registry),
                sync: RefCell::new(sync),
                annotations: RefCell::new(annotations),
                trendlines,
                settings,
                pane_weights: Cell::new(layout.pane_weights),
                watchlist: RefCell::new(layout.watchlist),
                rendered: RefCell::new(None),
                status: RefCell::new(ViewStatus::Empty),
                primary: RefCell::new(None),
                last_request: RefCell::new(None),
                torn_down: Cell::new(false),
            }),
        }
    }

    pub fn status(&self) -> ViewStatus {
        self.inner.status.borrow().clone()
    }

    pub fn cache(&self) -> &DataCache {
        &self.inner.cache
    }

    pub fn generation(&self) -> u64 {
        self.inner.ctx.borrow().generation.current()
    }

    pub fn prefetch_pending(&self) -> usize {
        self.inner.prefetcher.pending()
    }

    /// Run `f` against the rendered series, if any.
    pub fn with_series<R>(&self, f: impl FnOnce(&ChartSeries) -> R) -> Option<R> {
        self.inner.rendered.borrow().as_ref().map(|v| f(&v.series))
    }

    pub fn rendered_request(&self) -> Option<ChartRequest> {
        self.inner.rendered.borrow().as_ref().map(|v| v.request.clone())
    }

    fn ensure_live(&self) -> Result<(), SessionError> {
        if self.inner.torn_down.get() {
            Err(SessionError::Destroyed)
        } else {
            Ok(())
        }
    }

    fn ensure_bound(&self) -> Result<(), SessionError> {
        let params = self.inner.ctx.borrow().params().clone();
        let mut registry = self.inner.registry.borrow_mut();
        let first = registry.bindings().next().is_none();
        registry.bind_all(&self.inner.pane_weights.get(), &params)?;
        if first && self.inner.ctx.borrow().crosshair_hidden() {
            self.inner.sync.borrow_mut().set_crosshair_hidden(true, &registry);
        }
        Ok(())
    }

    // ---------- loading -----------------------------------------------------

    /// Switch to `ticker`/`interval` and load it.
    pub async fn load(&self, ticker: &str, interval: Interval) -> Result<LoadOutcome, SessionError> {
        self.ensure_live()?;
        let (request, switched) = {
            let mut ctx = self.inner.ctx.borrow_mut();
            let switched = ctx.switch_to(ticker, interval);
            let request = ctx
                .current_request()
                .ok_or_else(|| SessionError::Config("no ticker selected".into()))?;
            (request, switched)
        };
        if switched {
            info!(ticker = %request.ticker, %interval, "chart context switched");
            self.clear_annotations();
        }
        self.run_load(request).await
    }

    /// Re-issue the last primary request.
    pub async fn retry(&self) -> Result<LoadOutcome, SessionError> {
        self.ensure_live()?;
        let request = self
            .inner
            .last_request
            .borrow()
            .clone()
            .ok_or_else(|| SessionError::Config("nothing to retry".into()))?;
        self.run_load(request).await
    }

    async fn run_load(&self, request: ChartRequest) -> Result<LoadOutcome, SessionError> {
        self.ensure_live()?;
        self.ensure_bound()?;
        let inner = &self.inner;

        if let Some(previous) = inner.primary.borrow_mut().take() {
            previous.abort();
        }
        inner.prefetcher.abort_all();
        let generation = {
            let mut ctx = inner.ctx.borrow_mut();
            ctx.refresh.gate_mut().manual_load_in_flight = true;
            ctx.generation.bump()
        };
        *inner.last_request.borrow_mut() = Some(request.clone());
        inner.set_status(ViewStatus::Loading);

        let key = request.cache_key();
        let (task, handle) = {
            let cache = inner.cache.clone();
            let source = inner.source.clone();
            let fetch_request = request.clone();
            let fetch_key = key.clone();
            let refresh = request.refresh;
            abortable(async move {
                cache
                    .get_or_fetch(fetch_key, refresh, move || async move {
                        source.fetch_chart_data(&fetch_request).await
                    })
                    .await
            })
        };
        *inner.primary.borrow_mut() = Some(handle);
        debug!(%key, generation, refresh = request.refresh, "primary load started");

        let result = task.await.unwrap_or_else(|aborted| Err(aborted.into()));

        if !inner.ctx.borrow().generation.is_current(generation) {
            debug!(%key, generation, "stale response discarded");
            return Ok(LoadOutcome::Discarded);
        }
        inner.primary.borrow_mut().take();
        inner.ctx.borrow_mut().refresh.gate_mut().manual_load_in_flight = false;

        match result {
            Ok(payload) => {
                self.render(request, key, payload.as_ref().clone())?;
                Ok(LoadOutcome::Rendered)
            }
            Err(err) => self.handle_failure(request, key, err),
        }
    }

    fn handle_failure(
        &self,
        request: ChartRequest,
        key: CacheKey,
        err: FetchError,
    ) -> Result<LoadOutcome, SessionError> {
        let on_screen = self
            .inner
            .rendered
            .borrow()
            .as_ref()
            .is_some_and(|v| v.key == key);
        let has_cached = on_screen || self.inner.cache.has_cached(&key);
        let resolution = resolve_failure(&err, has_cached);

        match &resolution {
            FailureResolution::Ignore => {
                let status = if self.inner.rendered.borrow().is_some() {
                    ViewStatus::Ready
                } else {
                    ViewStatus::Empty
                };
                self.inner.set_status(status);
            }
            FailureResolution::KeepStale => {
                debug!(%key, error = %err, "network error suppressed, keeping cached chart");
                if !on_screen {
                    if let Some(cached) = self.inner.cache.get(&key) {
                        self.render(request, key, cached.as_ref().clone())?;
                    }
                }
                self.inner.set_status(ViewStatus::Ready);
            }
            FailureResolution::InvalidSymbol => {
                info!(%key, "no data for symbol");
                self.blank();
                self.inner.set_status(ViewStatus::InvalidSymbol);
            }
            FailureResolution::OfferRetry { message } => {
                warn!(%key, error = %message, "chart load failed");
                self.inner.set_status(ViewStatus::RetryAvailable {
                    message: message.clone(),
                });
            }
        }
        Ok(LoadOutcome::Failed(resolution))
    }

    fn render(&self, request: ChartRequest, key: CacheKey, payload: ChartPayload) -> Result<(), SessionError> {
        let series = ChartSeries::build(
            payload.bars.clone(),
            payload.indicator_a.clone(),
            payload.indicator_b.clone(),
            payload.histogram.clone(),
            &request.params,
        );
        {
            let registry = self.inner.registry.borrow();
            for binding in registry.bindings() {
                for (slot, _, handle) in binding.series() {
                    binding.surface.set_data(handle, series_data(&series, slot));
                }
            }
        }
        self.refresh_value_tables(&series);
        info!(%key, bars = series.bars.len(), "chart rendered");

        let ticker = request.ticker.clone();
        let interval = request.interval;
        *self.inner.rendered.borrow_mut() = Some(Rendered {
            request: request.clone(),
            key,
            payload,
            series,
        });
        self.inner.set_status(ViewStatus::Ready);

        self.restore_trendlines(&ticker, interval)?;
        self.schedule_prefetch(&request);
        self.inner.settings.update(|s| {
            s.last_ticker = Some(ticker);
            s.last_interval = Some(interval);
        });
        Ok(())
    }

    /// Empty every series; the invalid-symbol path only.
    fn blank(&self) {
        self.inner.rendered.borrow_mut().take();
        self.clear_annotations();
        let registry = self.inner.registry.borrow();
        for binding in registry.bindings() {
            for (_, kind, handle) in binding.series() {
                binding.surface.set_data(handle, SeriesData::empty_like(kind));
            }
        }
        self.inner.sync.borrow_mut().clear_value_tables();
    }

    fn refresh_value_tables(&self, series: &ChartSeries) {
        let mut sync = self.inner.sync.borrow_mut();
        sync.set_value_table(PaneRole::Price, close_points(series));
        sync.set_value_table(PaneRole::OscillatorA, series.osc_a.clone());
        sync.set_value_table(PaneRole::OscillatorB, series.osc_b.clone());
        sync.set_value_table(PaneRole::Histogram, series.histogram.clone());
    }

    fn schedule_prefetch(&self, request: &ChartRequest) {
        if !self.inner.ctx.borrow().config.prefetch {
            return;
        }
        let base = request.clone().with_refresh(false);
        let plan = plan_prefetch(&base, &self.inner.watchlist.borrow());
        let spawned = self.inner.prefetcher.schedule(plan);
        debug!(spawned, "prefetch scheduled");
    }

    pub fn set_watchlist(&self, tickers: Vec<String>) {
        *self.inner.watchlist.borrow_mut() = tickers.clone();
        self.inner.settings.update(|s| s.watchlist = tickers);
    }

    // ---------- live refresh ------------------------------------------------

    pub fn set_tab_visible(&self, visible: bool) {
        self.inner.ctx.borrow_mut().refresh.gate_mut().tab_visible = visible;
    }

    pub fn set_chart_active(&self, active: bool) {
        self.inner.ctx.borrow_mut().refresh.gate_mut().chart_active = active;
    }

    /// Run a refresh tick when the scheduler says one is due.
    pub async fn poll_refresh(&self) -> Result<RefreshOutcome, SessionError> {
        let due = {
            let mut ctx = self.inner.ctx.borrow_mut();
            let now = ctx.clock.now_ms();
            ctx.refresh.due(now)
        };
        if !due {
            return Ok(RefreshOutcome::Skipped);
        }
        self.refresh_tick().await
    }

    /// Fetch the newest sample and patch it in, or reload when a new bar formed.
    pub async fn refresh_tick(&self) -> Result<RefreshOutcome, SessionError> {
        self.ensure_live()?;
        if *self.inner.status.borrow() != ViewStatus::Ready {
            return Ok(RefreshOutcome::Skipped);
        }
        let (request, generation) = {
            let ctx = self.inner.ctx.borrow();
            if !ctx.refresh.gate().allows() {
                return Ok(RefreshOutcome::Skipped);
            }
            let Some(request) = ctx.current_request() else {
                return Ok(RefreshOutcome::Skipped);
            };
            (request, ctx.generation.current())
        };
        let rendered_last = self
            .inner
            .rendered
            .borrow()
            .as_ref()
            .filter(|v| v.key == request.cache_key())
            .and_then(|v| v.series.last_bar().map(|b| b.time));

        let latest = self.inner.source.fetch_latest_chart_data(&request).await;
        if !self.inner.ctx.borrow().generation.is_current(generation) {
            debug!("stale live refresh discarded");
            return Ok(RefreshOutcome::Discarded);
        }
        let latest = match latest {
            Ok(latest) => latest,
            Err(err) => {
                debug!(error = %err, "live refresh failed");
                return Ok(RefreshOutcome::Failed(err));
            }
        };

        match decide(rendered_last, &latest) {
            RefreshDecision::Patch => Ok(match self.apply_patch(&latest) {
                Some(report) => RefreshOutcome::Patched(report),
                None => RefreshOutcome::Skipped,
            }),
            RefreshDecision::FullReload => {
                info!(ticker = %request.ticker, "new bar formed, reloading");
                let outcome = self.run_load(request.with_refresh(true)).await?;
                Ok(RefreshOutcome::Reloaded(outcome))
            }
        }
    }

    fn apply_patch(&self, latest: &LatestPayload) -> Option<PatchReport> {
        let mut rendered = self.inner.rendered.borrow_mut();
        let view = rendered.as_mut()?;
        let report = view.series.patch_last(&latest.to_sample())?;
        view.payload.apply_latest(latest);
        self.inner
            .cache
            .set(view.key.clone(), Rc::new(view.payload.clone()));

        {
            let registry = self.inner.registry.borrow();
            for slot in &report.updated {
                let Some(binding) = registry.binding(PaneRole::for_slot(*slot)) else {
                    continue;
                };
                let Some(handle) = binding.handle_for(*slot) else {
                    continue;
                };
                let datum = match slot {
                    SeriesSlot::Bars => view.series.last_bar().map(|b| SeriesDatum::Bar(*b)),
                    other => view.series.slot(*other).last().map(|p| SeriesDatum::Point(*p)),
                };
                if let Some(datum) = datum {
                    binding.surface.update(handle, datum);
                }
            }
            for slot in &report.rebuilt {
                let Some(binding) = registry.binding(PaneRole::for_slot(*slot)) else {
                    continue;
                };
                if let Some(handle) = binding.handle_for(*slot) {
                    binding.surface.set_data(handle, series_data(&view.series, *slot));
                }
            }
        }
        self.refresh_value_tables(&view.series);
        debug!(
            updated = report.updated.len(),
            rebuilt = report.rebuilt.len(),
            "live patch applied"
        );
        Some(report)
    }

    // ---------- sync --------------------------------------------------------

    /// Drain surface events until the queue settles.
    pub fn pump_events(&self) -> Vec<SyncReport> {
        let mut reports = Vec::new();
        loop {
            let batch = self.inner.queue.drain();
            if batch.is_empty() {
                break;
            }
            let registry = self.inner.registry.borrow();
            reports.push(self.inner.sync.borrow_mut().handle_events(batch, &registry));
        }
        reports
    }

    pub fn animation_frame(&self) -> FrameReport {
        let batches = self.pump_events().len();
        let lock_released = self.inner.sync.borrow_mut().frame();
        let persisted = self.inner.cache.poll_persist();
        FrameReport {
            batches,
            lock_released,
            persisted,
        }
    }

    pub fn set_crosshair_hidden(&self, hidden: bool) {
        self.inner.ctx.borrow_mut().set_crosshair_hidden(hidden);
        {
            let registry = self.inner.registry.borrow();
            self.inner.sync.borrow_mut().set_crosshair_hidden(hidden, &registry);
        }
        self.inner.settings.update(|s| s.crosshair_hidden = hidden);
    }

    // ---------- annotations -------------------------------------------------

    pub fn arm_trendline(&self, role: PaneRole) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.inner.annotations.borrow_mut().arm_trendline(role)?;
        self.clear_highlights();
        Ok(())
    }

    pub fn arm_inspection(&self) -> Result<(), SessionError> {
        self.ensure_live()?;
        self.inner.annotations.borrow_mut().arm_inspection();
        self.clear_highlights();
        Ok(())
    }

    pub fn disarm(&self) {
        self.inner.annotations.borrow_mut().disarm_all();
        self.clear_highlights();
    }

    pub fn click(&self, role: PaneRole, time: TimeKey) -> Result<ClickOutcome, SessionError> {
        self.ensure_live()?;
        let outcome = {
            let rendered = self.inner.rendered.borrow();
            let Some(view) = rendered.as_ref() else {
                return Ok(ClickOutcome::Ignored);
            };
            let ctx = self.inner.ctx.borrow();
            if ctx.ticker() != Some(view.request.ticker.as_str()) || ctx.interval() != view.request.interval {
                return Ok(ClickOutcome::Ignored);
            }
            let input = AnnotationInput {
                bars: &view.series.bars,
                osc_a: &view.series.osc_a,
                osc_b: &view.series.osc_b,
                interval: view.request.interval,
            };
            self.inner.annotations.borrow_mut().click(role, time, &input)
        };

        match &outcome {
            ClickOutcome::AnchorSet { displayed, .. } => self.highlight(role, displayed)?,
            ClickOutcome::Completed(def) => {
                self.highlight(role, &[])?;
                self.inner.annotations.borrow_mut().push_line(role, *def)?;
                self.draw_trendlines(role)?;
                self.persist_trendlines();
            }
            _ => {}
        }
        Ok(outcome)
    }

    /// Remove every trendline on `role`, keeping the viewport.
    pub fn erase_trendlines(&self, role: PaneRole) -> Result<usize, SessionError> {
        self.ensure_live()?;
        self.inner.annotations.borrow_mut().erase_lines(role)?;
        let removed = {
            let suppress = self.inner.ctx.borrow().suppress.clone();
            let mut registry = self.inner.registry.borrow_mut();
            let binding = registry.binding_mut(role).ok_or(SessionError::NotBound(role))?;
            let _quiet = suppress.suppress(role);
            let saved = binding.surface.visible_logical_range();
            let removed = binding.clear_trendline_series();
            if let Some(range) = saved {
                binding.surface.set_visible_logical_range(range);
            }
            removed
        };
        self.persist_trendlines();
        Ok(removed)
    }

    fn highlight(&self, role: PaneRole, points: &[IndicatorPoint]) -> Result<(), SessionError> {
        let registry = self.inner.registry.borrow();
        let binding = registry.binding(role).ok_or(SessionError::NotBound(role))?;
        let markers = points
            .iter()
            .map(|p| Marker {
                time: p.time,
                value: Some(p.value),
                text: String::new(),
            })
            .collect();
        binding.surface.set_markers(binding.primary, markers);
        Ok(())
    }

    fn clear_highlights(&self) {
        let registry = self.inner.registry.borrow();
        for role in [PaneRole::OscillatorA, PaneRole::OscillatorB] {
            if let Some(binding) = registry.binding(role) {
                binding.surface.set_markers(binding.primary, Vec::new());
            }
        }
    }

    /// Drop trendline render and tool state; the viewport is left alone.
    fn clear_annotations(&self) {
        {
            let mut annotations = self.inner.annotations.borrow_mut();
            annotations.disarm_all();
            annotations.set_lines(Default::default());
        }
        self.clear_highlights();
        let mut registry = self.inner.registry.borrow_mut();
        for role in [PaneRole::OscillatorA, PaneRole::OscillatorB] {
            if let Some(binding) = registry.binding_mut(role) {
                binding.clear_trendline_series();
            }
        }
    }

    fn restore_trendlines(&self, ticker: &str, interval: Interval) -> Result<(), SessionError> {
        let lines = self.inner.trendlines.load(ticker, interval);
        self.inner.annotations.borrow_mut().set_lines(lines);
        for role in [PaneRole::OscillatorA, PaneRole::OscillatorB] {
            self.draw_trendlines(role)?;
        }
        Ok(())
    }

    /// Redraw `role`'s trendlines with range sync suppressed and the viewport restored.
    fn draw_trendlines(&self, role: PaneRole) -> Result<usize, SessionError> {
        let pane = role
            .trendline_pane()
            .ok_or(SessionError::NotAnOscillator(role))?;
        let rays: Vec<TrendRay> = {
            let rendered = self.inner.rendered.borrow();
            let Some(view) = rendered.as_ref() else {
                return Ok(0);
            };
            let annotations = self.inner.annotations.borrow();
            let slot = role.oscillator_slot();
            let series = slot.map(|s| view.series.slot(s)).unwrap_or_default();
            let bounds = slot.and_then(|s| view.series.params.value_bounds(s));
            annotations
                .lines()
                .pane(pane)
                .iter()
                .filter_map(|def| {
                    let ray = project_ray(def, series, bounds, view.request.interval, annotations.config());
                    if ray.is_none() {
                        debug!(?role, "trendline anchors missing from data, skipped");
                    }
                    ray
                })
                .collect()
        };

        let suppress = self.inner.ctx.borrow().suppress.clone();
        let mut registry = self.inner.registry.borrow_mut();
        let binding = registry.binding_mut(role).ok_or(SessionError::NotBound(role))?;
        let _quiet = suppress.suppress(role);
        let saved = binding.surface.visible_logical_range();
        binding.clear_trendline_series();
        let drawn = add_rays(binding, rays);
        if let Some(range) = saved {
            binding.surface.set_visible_logical_range(range);
        }
        drawn
    }

    fn persist_trendlines(&self) {
        let rendered = self.inner.rendered.borrow();
        let Some(view) = rendered.as_ref() else {
            return;
        };
        let annotations = self.inner.annotations.borrow();
        self.inner
            .trendlines
            .save(&view.request.ticker, view.request.interval, annotations.lines());
    }

    // ---------- teardown ----------------------------------------------------

    pub fn is_torn_down(&self) -> bool {
        self.inner.torn_down.get()
    }

    /// Abort outstanding work, dispose every surface and flush the cache snapshot.
    pub fn teardown(&self) {
        if self.inner.torn_down.replace(true) {
            return;
        }
        if let Some(handle) = self.inner.primary.borrow_mut().take() {
            handle.abort();
        }
        self.inner.prefetcher.abort_all();
        self.inner.ctx.borrow().generation.bump();
        self.inner.registry.borrow_mut().destroy();
        self.inner.sync.borrow_mut().clear_value_tables();
        self.inner.rendered.borrow_mut().take();
        self.inner.set_status(ViewStatus::Empty);
        let persisted = self.inner.cache.persist_now();
        info!(persisted, "chart session torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingFactory;
    use app_shell::{LayoutSettings, MemoryStorage, PaneTrendlines, StorageKeys};
    use async_trait::async_trait;
    use futures::channel::oneshot;
    use futures::executor::LocalPool;
    use futures::future::{FutureExt, Shared};
    use data_feed::StaticDataSource;
    use ta_engine::{IndicatorParams, ValueBounds};
    use ts_core::{Bar, LogicalRange, ManualClock, TrendlineDefinition};

    const DAY: i64 = 86_400;

    fn payload(n: usize, shift: f64) -> ChartPayload {
        let bars: Vec<Bar> = (0..n)
            .map(|i| {
                let close = 100.0 + i as f64 + shift;
                Bar {
                    time: TimeKey(i as i64 * DAY),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1_000.0,
                }
            })
            .collect();
        let osc = |f: fn(usize) -> f64| -> Vec<IndicatorPoint> {
            bars.iter()
                .enumerate()
                .map(|(i, b)| IndicatorPoint::new(b.time, f(i)))
                .collect()
        };
        ChartPayload {
            indicator_a: osc(|i| 80.0 - i as f64 * 0.5),
            indicator_b: osc(|i| 40.0 + (i % 7) as f64),
            histogram: osc(|i| (i % 5) as f64 - 2.0),
            bars,
        }
    }

    /// Source whose chart fetches wait on a gate.
    struct GatedSource {
        inner: StaticDataSource,
        gate: RefCell<Option<Shared<oneshot::Receiver<()>>>>,
    }

    #[async_trait(?Send)]
    impl ChartDataSource for GatedSource {
        async fn fetch_chart_data(&self, request: &ChartRequest) -> Result<ChartPayload, FetchError> {
            let gate = self.gate.borrow().clone();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            self.inner.fetch_chart_data(request).await
        }

        async fn fetch_latest_chart_data(
            &self,
            request: &ChartRequest,
        ) -> Result<LatestPayload, FetchError> {
            self.inner.fetch_latest_chart_data(request).await
        }
    }

    struct Rig {
        session: ChartSession,
        source: Rc<StaticDataSource>,
        factory: Rc<RecordingFactory>,
        storage: Rc<MemoryStorage>,
        clock: ManualClock,
        pool: LocalPool,
    }

    fn rig_with(config: ChartConfig, storage: Rc<MemoryStorage>) -> Rig {
        let source = Rc::new(StaticDataSource::new());
        source.insert_chart("AAPL", Interval::Days(1), payload(60, 0.0));
        source.insert_chart("MSFT", Interval::Days(1), payload(40, 50.0));
        let factory = Rc::new(RecordingFactory::default());
        let clock = ManualClock::new(1_000_000);
        let pool = LocalPool::new();
        let session = ChartSession::new(
            config,
            source.clone(),
            factory.clone(),
            Rc::new(pool.spawner()),
            storage.clone(),
            Rc::new(clock.clone()),
        );
        Rig {
            session,
            source,
            factory,
            storage,
            clock,
            pool,
        }
    }

    fn rig() -> Rig {
        rig_with(
            ChartConfig::default().with_prefetch(false),
            Rc::new(MemoryStorage::new()),
        )
    }

    impl Rig {
        fn price_bars(&self) -> Vec<Bar> {
            let price = self.factory.surface(PaneRole::Price).unwrap();
            match &price.records_titled("Price")[0].data {
                SeriesData::Bars(bars) => bars.clone(),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn load_renders_every_pane() {
        let rig = rig();
        let outcome = rig.session.load("aapl", Interval::Days(1)).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Rendered);
        assert_eq!(rig.session.status(), ViewStatus::Ready);
        assert_eq!(rig.factory.created(), 4);
        assert_eq!(rig.price_bars().len(), 60);
        let osc_a = rig.factory.surface(PaneRole::OscillatorA).unwrap();
        assert_eq!(osc_a.records_titled("Oscillator A")[0].data.len(), 60);
        let hist = rig.factory.surface(PaneRole::Histogram).unwrap();
        assert_eq!(hist.records_titled("Histogram")[0].data.len(), 60);
        assert_eq!(rig.session.rendered_request().unwrap().ticker, "AAPL");
        assert_eq!(rig.source.chart_calls(), 1);

        // second load of the same chart is served from cache
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        assert_eq!(rig.source.chart_calls(), 1);
    }

    #[tokio::test]
    async fn unknown_symbol_blanks_panes() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        let outcome = rig.session.load("NOPE", Interval::Days(1)).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Failed(FailureResolution::InvalidSymbol));
        assert_eq!(rig.session.status(), ViewStatus::InvalidSymbol);
        assert!(rig.price_bars().is_empty());
        assert!(rig.session.rendered_request().is_none());
    }

    #[tokio::test]
    async fn network_error_keeps_stale_render() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        rig.clock.advance(rig.session.cache().config().ttl_ms + 1);
        rig.source
            .set_failure(Some(FetchError::Network("offline".into())));

        let outcome = rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Failed(FailureResolution::KeepStale));
        assert_eq!(rig.session.status(), ViewStatus::Ready);
        assert_eq!(rig.price_bars().len(), 60);
    }

    #[tokio::test]
    async fn network_error_without_cache_offers_retry() {
        let rig = rig();
        rig.source
            .set_failure(Some(FetchError::Network("offline".into())));
        let outcome = rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        assert!(matches!(
            outcome,
            LoadOutcome::Failed(FailureResolution::OfferRetry { .. })
        ));
        assert_eq!(
            rig.session.status(),
            ViewStatus::RetryAvailable {
                message: "offline".into()
            }
        );

        rig.source.set_failure(None);
        assert_eq!(rig.session.retry().await.unwrap(), LoadOutcome::Rendered);
        assert_eq!(rig.source.chart_calls(), 2);
        assert_eq!(rig.session.status(), ViewStatus::Ready);
    }

    #[tokio::test]
    async fn superseded_load_is_discarded() {
        let inner = StaticDataSource::new();
        inner.insert_chart("AAPL", Interval::Days(1), payload(60, 0.0));
        inner.insert_chart("MSFT", Interval::Days(1), payload(40, 50.0));
        let (tx, rx) = oneshot::channel::<()>();
        let source = Rc::new(GatedSource {
            inner,
            gate: RefCell::new(Some(rx.shared())),
        });
        let pool = LocalPool::new();
        let session = ChartSession::new(
            ChartConfig::default().with_prefetch(false),
            source,
            Rc::new(RecordingFactory::default()),
            Rc::new(pool.spawner()),
            Rc::new(MemoryStorage::new()),
            Rc::new(ManualClock::new(0)),
        );

        let (first, second, _) = futures::join!(
            session.load("AAPL", Interval::Days(1)),
            session.load("MSFT", Interval::Days(1)),
            async move {
                let _ = tx.send(());
            }
        );
        assert_eq!(first.unwrap(), LoadOutcome::Discarded);
        assert_eq!(second.unwrap(), LoadOutcome::Rendered);
        assert_eq!(session.rendered_request().unwrap().ticker, "MSFT");
        assert_eq!(session.status(), ViewStatus::Ready);
        assert_eq!(session.cache().in_flight_count(), 0);
    }

    #[tokio::test]
    async fn live_refresh_patches_open_bar() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        let mut fetched = payload(60, 0.0);
        let last = *fetched.bars.last().unwrap();
        let latest = LatestPayload {
            bar: Bar {
                close: last.close + 3.0,
                high: last.high + 3.0,
                ..last
            },
            indicator_a: Some(IndicatorPoint::new(last.time, 21.0)),
            indicator_b: Some(IndicatorPoint::new(last.time, 44.0)),
            histogram: Some(IndicatorPoint::new(last.time, 1.5)),
        };
        rig.source.insert_latest("AAPL", Interval::Days(1), latest);

        let outcome = rig.session.refresh_tick().await.unwrap();
        let RefreshOutcome::Patched(report) = outcome else {
            panic!("expected patch, got {outcome:?}");
        };
        assert!(report.updated.contains(&SeriesSlot::Bars));
        assert_eq!(rig.source.chart_calls(), 1);

        let bars = rig.price_bars();
        assert_eq!(bars.len(), 60);
        assert_eq!(bars.last().unwrap().close, last.close + 3.0);

        // same state as a full rebuild from the patched payload
        assert!(fetched.apply_latest(&latest));
        let full = ChartSeries::build(
            fetched.bars.clone(),
            fetched.indicator_a.clone(),
            fetched.indicator_b.clone(),
            fetched.histogram.clone(),
            &Default::default(),
        );
        rig.session
            .with_series(|patched| {
                assert_eq!(patched.bars, full.bars);
                assert_eq!(patched.osc_a, full.osc_a);
                assert_eq!(patched.histogram, full.histogram);
                for slot in [SeriesSlot::PriceSma, SeriesSlot::PriceEma, SeriesSlot::OscASignal] {
                    let a = patched.slot(slot);
                    let b = full.slot(slot);
                    assert_eq!(a.len(), b.len());
                    for (x, y) in a.iter().rev().zip(b.iter().rev()).take(5) {
                        assert_eq!(x.time, y.time);
                        assert!((x.value - y.value).abs() < 1e-9);
                    }
                }
            })
            .unwrap();

        let key = rig.session.rendered_request().unwrap().cache_key();
        let cached = rig.session.cache().get(&key).unwrap();
        assert_eq!(cached.bars.last().unwrap().close, last.close + 3.0);
    }

    #[tokio::test]
    async fn new_bar_triggers_full_reload() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        let next = Bar {
            time: TimeKey(60 * DAY),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0.0,
        };
        rig.source.insert_latest(
            "AAPL",
            Interval::Days(1),
            LatestPayload {
                bar: next,
                indicator_a: None,
                indicator_b: None,
                histogram: None,
            },
        );
        let outcome = rig.session.refresh_tick().await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Reloaded(LoadOutcome::Rendered));
        // forced refresh bypasses the cache
        assert_eq!(rig.source.chart_calls(), 2);
    }

    #[tokio::test]
    async fn refresh_is_gated() {
        let rig = rig();
        assert_eq!(rig.session.refresh_tick().await.unwrap(), RefreshOutcome::Skipped);
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        rig.session.set_tab_visible(false);
        assert_eq!(rig.session.refresh_tick().await.unwrap(), RefreshOutcome::Skipped);
        rig.session.set_tab_visible(true);
        rig.session.set_chart_active(false);
        assert_eq!(rig.session.refresh_tick().await.unwrap(), RefreshOutcome::Skipped);
        assert_eq!(rig.source.latest_calls(), 0);

        rig.session.set_chart_active(true);
        // no latest sample registered for AAPL
        assert_eq!(
            rig.session.refresh_tick().await.unwrap(),
            RefreshOutcome::Failed(FetchError::NoData)
        );
        assert_eq!(rig.price_bars().len(), 60);
    }

    #[tokio::test]
    async fn poll_refresh_follows_interval() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        assert_eq!(rig.session.poll_refresh().await.unwrap(), RefreshOutcome::Skipped);
        rig.clock.advance(15_000);
        assert!(matches!(
            rig.session.poll_refresh().await.unwrap(),
            RefreshOutcome::Failed(_)
        ));
        assert_eq!(rig.source.latest_calls(), 1);
    }

    #[tokio::test]
    async fn trendline_gesture_draws_persists_and_restores() {
        let mut rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        let osc_a = rig.factory.surface(PaneRole::OscillatorA).unwrap();
        osc_a.user_scroll(LogicalRange::new(10.0, 40.0));
        rig.session.animation_frame();
        let viewport = osc_a.range();

        rig.session.arm_trendline(PaneRole::OscillatorA).unwrap();
        let first = rig.session.click(PaneRole::OscillatorA, TimeKey(0)).unwrap();
        let ClickOutcome::AnchorSet { total, displayed, .. } = first else {
            panic!("anchor expected, got {first:?}");
        };
        // oscillator falls while price rises on every later bar
        assert_eq!(total, 59);
        assert_eq!(displayed.len(), 59);
        let primary = rig
            .session
            .inner
            .registry
            .borrow()
            .binding(PaneRole::OscillatorA)
            .unwrap()
            .primary;
        assert_eq!(osc_a.record(primary).unwrap().markers.len(), 59);

        let done = rig.session.click(PaneRole::OscillatorA, TimeKey(10 * DAY)).unwrap();
        assert_eq!(
            done,
            ClickOutcome::Completed(TrendlineDefinition {
                time1: TimeKey(0),
                value1: 80.0,
                time2: TimeKey(10 * DAY),
                value2: 75.0,
            })
        );
        assert!(osc_a.record(primary).unwrap().markers.is_empty());
        let lines = osc_a.records_titled("Trendline");
        assert_eq!(lines.len(), 1);
        // 80 -> 50 at -0.5/bar crosses at index 60, one 8h step past the last bar
        assert_eq!(lines[0].markers[0].text, "1970-03-01");
        assert_eq!(osc_a.range(), viewport);
        assert!(rig.session.pump_events().is_empty());

        let store = TrendlineStore::new(
            rig.storage.clone(),
            StorageKeys::new("chartcore"),
            Rc::new(rig.clock.clone()),
        );
        assert_eq!(store.load("AAPL", Interval::Days(1)).oscillator_a.len(), 1);

        rig.session.load("MSFT", Interval::Days(1)).await.unwrap();
        assert!(osc_a.records_titled("Trendline").is_empty());
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        let restored = osc_a.records_titled("Trendline");
        assert_eq!(restored.len(), 1);
        assert_eq!(restored[0].data, lines[0].data);
        assert_eq!(restored[0].markers, lines[0].markers);

        assert_eq!(rig.session.erase_trendlines(PaneRole::OscillatorA).unwrap(), 1);
        assert!(osc_a.records_titled("Trendline").is_empty());
        assert!(store.load("AAPL", Interval::Days(1)).is_empty());
        rig.pool.run_until_stalled();
    }

    #[tokio::test]
    async fn raw_oscillator_b_trendline_runs_past_one_hundred() {
        let rig = rig();
        let mut data = payload(30, 0.0);
        data.indicator_b = data
            .bars
            .iter()
            .enumerate()
            .map(|(i, b)| IndicatorPoint::new(b.time, 150.0 + 15.0 * i as f64))
            .collect();
        rig.source.insert_chart("RAWB", Interval::Days(1), data);
        let store = TrendlineStore::new(
            rig.storage.clone(),
            StorageKeys::new("chartcore"),
            Rc::new(rig.clock.clone()),
        );
        let lines = PaneTrendlines {
            oscillator_a: Vec::new(),
            oscillator_b: vec![TrendlineDefinition {
                time1: TimeKey(0),
                value1: 150.0,
                time2: TimeKey(2 * DAY),
                value2: 180.0,
            }],
        };
        store.save("RAWB", Interval::Days(1), &lines);

        rig.session.load("RAWB", Interval::Days(1)).await.unwrap();
        assert_eq!(rig.factory.bounds(PaneRole::OscillatorA), Some(ValueBounds::OSCILLATOR));
        assert_eq!(rig.factory.bounds(PaneRole::OscillatorB), None);

        let osc_b = rig.factory.surface(PaneRole::OscillatorB).unwrap();
        let drawn = osc_b.records_titled("Trendline");
        assert_eq!(drawn.len(), 1);
        assert!(drawn[0].markers.is_empty());
        let SeriesData::Points(points) = &drawn[0].data else {
            panic!("line data expected, got {:?}", drawn[0].data);
        };
        // 30 bars plus the 500-bar horizon, starting at the first anchor
        assert_eq!(points.len(), 530);
        assert_eq!(points[0].value, 150.0);
        assert_eq!(points[2].value, 180.0);
        assert_eq!(points[529].value, 150.0 + 15.0 * 529.0);
    }

    #[tokio::test]
    async fn normalized_oscillator_b_gets_a_fixed_scale() {
        let storage = Rc::new(MemoryStorage::new());
        let clock = ManualClock::new(1_000_000);
        let settings = SettingsStore::new(storage.clone(), StorageKeys::new("chartcore"), Rc::new(clock));
        settings.save(&LayoutSettings {
            params: IndicatorParams {
                normalize_lookback: 20,
                ..IndicatorParams::default()
            },
            ..LayoutSettings::default()
        });
        let rig = rig_with(ChartConfig::default().with_prefetch(false), storage);
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        assert_eq!(rig.factory.bounds(PaneRole::OscillatorB), Some(ValueBounds::OSCILLATOR));
    }

    #[tokio::test]
    async fn inspection_and_price_pane_trendlines() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        assert_eq!(
            rig.session.arm_trendline(PaneRole::Price),
            Err(SessionError::NotAnOscillator(PaneRole::Price))
        );
        rig.session.arm_inspection().unwrap();
        let outcome = rig.session.click(PaneRole::Price, TimeKey(20 * DAY)).unwrap();
        let ClickOutcome::Inspected(report) = outcome else {
            panic!("inspection expected");
        };
        let a = report.osc_a.unwrap();
        assert_eq!(a.value, 70.0);
        assert_eq!((a.min, a.max), (67.5, 72.5));
        rig.session.disarm();
        assert_eq!(
            rig.session.click(PaneRole::Price, TimeKey(20 * DAY)).unwrap(),
            ClickOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn panes_stay_in_sync_after_load() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        let target = LogicalRange::new(5.0, 25.0);
        rig.factory.surface(PaneRole::Price).unwrap().user_scroll(target);
        let frame = rig.session.animation_frame();
        assert!(frame.lock_released);
        for role in PaneRole::ALL {
            assert_eq!(rig.factory.surface(role).unwrap().range(), Some(target));
        }

        rig.factory
            .surface(PaneRole::Histogram)
            .unwrap()
            .user_hover(Some(TimeKey(12 * DAY)));
        rig.session.pump_events();
        let (value, time, _) = rig
            .factory
            .surface(PaneRole::OscillatorA)
            .unwrap()
            .crosshair()
            .unwrap();
        assert_eq!((value, time), (74.0, TimeKey(12 * DAY)));
    }

    #[tokio::test]
    async fn crosshair_toggle_persists() {
        let storage = Rc::new(MemoryStorage::new());
        let rig = rig_with(ChartConfig::default().with_prefetch(false), storage.clone());
        rig.session.set_crosshair_hidden(true);
        drop(rig);

        let rig = rig_with(ChartConfig::default().with_prefetch(false), storage);
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        rig.factory
            .surface(PaneRole::Price)
            .unwrap()
            .user_hover(Some(TimeKey(3 * DAY)));
        rig.session.pump_events();
        for role in PaneRole::ALL {
            assert!(rig.factory.surface(role).unwrap().crosshair().is_none());
        }
    }

    #[tokio::test]
    async fn switching_aborts_prefetches() {
        let mut rig = rig_with(ChartConfig::default(), Rc::new(MemoryStorage::new()));
        rig.source
            .insert_chart("AAPL", Interval::Hours(4), payload(30, 0.0));
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        // 1d warms 4h and 1w
        assert_eq!(rig.session.prefetch_pending(), 2);

        rig.session.load("MSFT", Interval::Days(1)).await.unwrap();
        rig.pool.run_until_stalled();
        let aapl_4h = ChartRequest::new("AAPL", Interval::Hours(4), Default::default()).cache_key();
        assert!(!rig.session.cache().has_cached(&aapl_4h));
        // AAPL 1d, MSFT 1d, MSFT 4h, MSFT 1w
        assert_eq!(rig.source.chart_calls(), 4);

        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        rig.pool.run_until_stalled();
        assert!(rig.session.cache().has_cached(&aapl_4h));
    }

    #[tokio::test]
    async fn teardown_disposes_everything() {
        let rig = rig();
        rig.session.load("AAPL", Interval::Days(1)).await.unwrap();
        let price = rig.factory.surface(PaneRole::Price).unwrap();
        rig.session.teardown();
        assert!(price.is_destroyed());
        assert_eq!(price.subscriber_count(), 0);
        assert_eq!(rig.session.status(), ViewStatus::Empty);
        assert_eq!(
            rig.session.load("AAPL", Interval::Days(1)).await,
            Err(SessionError::Destroyed)
        );
        // the cache snapshot was flushed
        assert!(rig.storage.get_item("chartcore:cache").unwrap().is_some());
    }
}
