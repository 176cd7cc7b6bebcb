//! Browser glue: JS-backed surfaces, spawner, frame and refresh loops, and the
//! `ChartHandle` exported to JS.

use std::cell::RefCell;
use std::rc::Rc;

use app_shell::{KeyValueStorage, LocalStorage, MemoryStorage};
use data_feed::HttpDataSource;
use futures::task::{LocalFutureObj, LocalSpawn, SpawnError};
use gloo_timers::callback::Interval as TimerInterval;
use js_sys::{Array, Function, Reflect};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};
use ts_core::{Interval, LogicalRange, SystemClock, TimeKey};
use wasm_bindgen::closure::Closure;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::{future_to_promise, spawn_local};

use crate::annotation::ClickOutcome;
use crate::config::ChartConfig;
use crate::session::{ChartSession, ViewStatus};
use crate::surface::{
    CrosshairCallback, CrosshairEvent, Marker, RangeCallback, RenderSurface, SeriesData,
    SeriesDatum, SeriesHandle, SeriesKind, SeriesOptions, Subscription, SurfaceConfig,
    SurfaceError, SurfaceFactory,
};
use crate::PaneRole;

const CONFIG_GLOBAL: &str = "CHARTCORE_CONFIG";
const REFRESH_POLL_MS: u32 = 1_000;

fn js_err(err: JsValue) -> String {
    err.as_string().unwrap_or_else(|| format!("{err:?}"))
}

fn read_global(key: &str) -> Option<String> {
    Reflect::get(&js_sys::global(), &JsValue::from_str(key))
        .ok()
        .and_then(|v| v.as_string())
}

fn to_js<T: Serialize>(value: &T) -> Result<JsValue, SurfaceError> {
    let text = serde_json::to_string(value).map_err(|e| SurfaceError::Call(e.to_string()))?;
    js_sys::JSON::parse(&text).map_err(|e| SurfaceError::Call(js_err(e)))
}

fn tab_visible() -> bool {
    web_sys::window()
        .and_then(|w| w.document())
        .map(|d| d.visibility_state() == web_sys::VisibilityState::Visible)
        .unwrap_or(true)
}

fn load_config() -> ChartConfig {
    match read_global(CONFIG_GLOBAL) {
        Some(text) => ChartConfig::from_json(&text).unwrap_or_else(|err| {
            warn!(error = %err, "ignoring {CONFIG_GLOBAL}");
            ChartConfig::default()
        }),
        None => ChartConfig::default(),
    }
}

// ---------- surfaces ------------------------------------------------------

/// Adapter over a JS chart object exposing the surface methods by name.
pub struct JsSurface {
    obj: JsValue,
}

impl JsSurface {
    fn call(&self, name: &str, args: &[JsValue]) -> Result<JsValue, SurfaceError> {
        let method = Reflect::get(&self.obj, &JsValue::from_str(name))
            .map_err(|e| SurfaceError::Call(js_err(e)))?
            .dyn_into::<Function>()
            .map_err(|_| SurfaceError::Call(format!("{name} is not a function")))?;
        let args: Array = args.iter().collect();
        method
            .apply(&self.obj, &args)
            .map_err(|e| SurfaceError::Call(js_err(e)))
    }

    fn call_logged(&self, name: &str, args: &[JsValue]) {
        if let Err(err) = self.call(name, args) {
            warn!(method = name, error = %err, "surface call failed");
        }
    }

    fn send<T: Serialize>(&self, name: &str, series: SeriesHandle, value: &T) {
        match to_js(value) {
            Ok(js) => self.call_logged(name, &[JsValue::from(series.0), js]),
            Err(err) => warn!(method = name, error = %err, "surface payload not encodable"),
        }
    }

    fn subscribe(&self, name: &str, callback: Closure<dyn FnMut(JsValue)>) -> Subscription {
        match self.call(name, &[callback.as_ref().clone()]) {
            Ok(unsubscribe) => {
                let unsubscribe = unsubscribe.dyn_into::<Function>().ok();
                Subscription::new(move || {
                    if let Some(f) = unsubscribe {
                        let _ = f.call0(&JsValue::NULL);
                    }
                    drop(callback);
                })
            }
            Err(err) => {
                warn!(method = name, error = %err, "subscription failed");
                Subscription::noop()
            }
        }
    }
}

fn number_field(obj: &JsValue, name: &str) -> Option<f64> {
    Reflect::get(obj, &JsValue::from_str(name))
        .ok()
        .and_then(|v| v.as_f64())
}

impl RenderSurface for JsSurface {
    fn add_series(&self, kind: SeriesKind, options: SeriesOptions) -> Result<SeriesHandle, SurfaceError> {
        let id = self.call("addSeries", &[to_js(&kind)?, to_js(&options)?])?;
        id.as_f64()
            .map(|v| SeriesHandle(v as u32))
            .ok_or_else(|| SurfaceError::Call("addSeries returned no id".into()))
    }

    fn remove_series(&self, series: SeriesHandle) {
        self.call_logged("removeSeries", &[JsValue::from(series.0)]);
    }

    fn set_data(&self, series: SeriesHandle, data: SeriesData) {
        self.send("setData", series, &data);
    }

    fn update(&self, series: SeriesHandle, datum: SeriesDatum) {
        self.send("update", series, &datum);
    }

    fn set_markers(&self, series: SeriesHandle, markers: Vec<Marker>) {
        self.send("setMarkers", series, &markers);
    }

    fn visible_logical_range(&self) -> Option<LogicalRange> {
        let range = self.call("getVisibleLogicalRange", &[]).ok()?;
        if range.is_null() || range.is_undefined() {
            return None;
        }
        Some(LogicalRange::new(
            number_field(&range, "from")?,
            number_field(&range, "to")?,
        ))
    }

    fn set_visible_logical_range(&self, range: LogicalRange) {
        match to_js(&range) {
            Ok(js) => self.call_logged("setVisibleLogicalRange", &[js]),
            Err(err) => warn!(error = %err, "range not encodable"),
        }
    }

    fn set_crosshair_position(&self, value: f64, time: TimeKey, series: SeriesHandle) {
        self.call_logged(
            "setCrosshairPosition",
            &[
                JsValue::from_f64(value),
                JsValue::from_f64(time.secs() as f64),
                JsValue::from(series.0),
            ],
        );
    }

    fn clear_crosshair_position(&self) {
        self.call_logged("clearCrosshairPosition", &[]);
    }

    fn subscribe_visible_logical_range_change(&self, callback: RangeCallback) -> Subscription {
        let closure = Closure::<dyn FnMut(JsValue)>::wrap(Box::new(move |range: JsValue| {
            if let (Some(from), Some(to)) = (number_field(&range, "from"), number_field(&range, "to")) {
                callback(LogicalRange::new(from, to));
            }
        }));
        self.subscribe("subscribeVisibleLogicalRangeChange", closure)
    }

    fn subscribe_crosshair_move(&self, callback: CrosshairCallback) -> Subscription {
        let closure = Closure::<dyn FnMut(JsValue)>::wrap(Box::new(move |event: JsValue| {
            let time = number_field(&event, "time").map(|t| TimeKey(t as i64));
            let from_pointer = Reflect::get(&event, &JsValue::from_str("fromPointer"))
                .ok()
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            callback(CrosshairEvent { time, from_pointer });
        }));
        self.subscribe("subscribeCrosshairMove", closure)
    }

    fn price_to_coordinate(&self, series: SeriesHandle, value: f64) -> Option<f64> {
        self.call("priceToCoordinate", &[JsValue::from(series.0), JsValue::from_f64(value)])
            .ok()?
            .as_f64()
    }

    fn coordinate_to_price(&self, series: SeriesHandle, y: f64) -> Option<f64> {
        self.call("coordinateToPrice", &[JsValue::from(series.0), JsValue::from_f64(y)])
            .ok()?
            .as_f64()
    }

    fn destroy(&self) {
        self.call_logged("destroy", &[]);
    }
}

/// Creates panes by calling a JS factory `(config) => surface`.
pub struct JsSurfaceFactory {
    create: Function,
}

impl SurfaceFactory for JsSurfaceFactory {
    fn create_surface(&self, config: &SurfaceConfig) -> Result<Rc<dyn RenderSurface>, SurfaceError> {
        let cfg = json!({
            "role": config.role,
            "weight": config.weight,
            "bounds": config.bounds,
        });
        let obj = self
            .create
            .call1(&JsValue::NULL, &to_js(&cfg)?)
            .map_err(|e| SurfaceError::Create(js_err(e)))?;
        if obj.is_null() || obj.is_undefined() {
            return Err(SurfaceError::Create(format!("no surface for {:?}", config.role)));
        }
        Ok(Rc::new(JsSurface { obj }))
    }
}

// ---------- scheduling ----------------------------------------------------

/// `LocalSpawn` over `wasm_bindgen_futures::spawn_local`.
pub struct WasmSpawner;

impl LocalSpawn for WasmSpawner {
    fn spawn_local_obj(&self, future: LocalFutureObj<'static, ()>) -> Result<(), SpawnError> {
        spawn_local(future);
        Ok(())
    }
}

fn request_frame(callback: &Closure<dyn FnMut(f64)>) {
    if let Some(window) = web_sys::window() {
        if let Err(err) = window.request_animation_frame(callback.as_ref().unchecked_ref()) {
            warn!(error = %js_err(err), "requestAnimationFrame failed");
        }
    }
}

fn start_frame_loop(session: ChartSession) {
    let f = Rc::new(RefCell::new(None::<Closure<dyn FnMut(f64)>>));
    let g = f.clone();

    *g.borrow_mut() = Some(Closure::wrap(Box::new(move |_timestamp: f64| {
        if session.is_torn_down() {
            return;
        }
        session.set_tab_visible(tab_visible());
        session.animation_frame();
        if let Some(callback) = f.borrow().as_ref() {
            request_frame(callback);
        }
    }) as Box<dyn FnMut(f64)>));

    if let Some(callback) = g.borrow().as_ref() {
        request_frame(callback);
    }
}

fn start_refresh_loop(session: ChartSession) -> TimerInterval {
    TimerInterval::new(REFRESH_POLL_MS, move || {
        let session = session.clone();
        spawn_local(async move {
            match session.poll_refresh().await {
                Ok(outcome) => debug!(?outcome, "refresh poll"),
                Err(err) => debug!(error = %err, "refresh poll skipped"),
            }
        });
    })
}

// ---------- JS handle -----------------------------------------------------

fn parse_pane(name: &str) -> Result<PaneRole, JsValue> {
    PaneRole::parse(name).ok_or_else(|| JsValue::from_str(&format!("unknown pane {name}")))
}

fn status_json(status: &ViewStatus) -> String {
    let value = match status {
        ViewStatus::Empty => json!({ "status": "empty" }),
        ViewStatus::Loading => json!({ "status": "loading" }),
        ViewStatus::Ready => json!({ "status": "ready" }),
        ViewStatus::InvalidSymbol => json!({ "status": "invalidSymbol" }),
        ViewStatus::RetryAvailable { message } => json!({ "status": "retry", "message": message }),
    };
    value.to_string()
}

fn click_json(outcome: &ClickOutcome) -> String {
    let value = match outcome {
        ClickOutcome::Ignored => json!({ "kind": "ignored" }),
        ClickOutcome::AnchorSet { total, displayed, .. } => {
            json!({ "kind": "anchor", "candidates": total, "shown": displayed.len() })
        }
        ClickOutcome::Rejected => json!({ "kind": "rejected" }),
        ClickOutcome::Completed(def) => json!({ "kind": "completed", "line": def }),
        ClickOutcome::Inspected(report) => json!({ "kind": "inspected", "report": report }),
    };
    value.to_string()
}

#[wasm_bindgen]
pub struct ChartHandle {
    session: ChartSession,
    _refresh: TimerInterval,
}

#[wasm_bindgen]
impl ChartHandle {
    /// `create_surface(config)` must return an object implementing the surface methods.
    #[wasm_bindgen(constructor)]
    pub fn new(create_surface: Function, http_base: &str) -> ChartHandle {
        let config = load_config();
        let storage: Rc<dyn KeyValueStorage> = match LocalStorage::open() {
            Ok(storage) => Rc::new(storage),
            Err(err) => {
                warn!(error = %err, "localStorage unavailable, state will not persist");
                Rc::new(MemoryStorage::new())
            }
        };
        let session = ChartSession::new(
            config,
            Rc::new(HttpDataSource::new(http_base)),
            Rc::new(JsSurfaceFactory {
                create: create_surface,
            }),
            Rc::new(WasmSpawner),
            storage,
            Rc::new(SystemClock),
        );
        start_frame_loop(session.clone());
        let refresh = start_refresh_loop(session.clone());
        ChartHandle {
            session,
            _refresh: refresh,
        }
    }

    /// Resolves to the view status as JSON.
    pub fn load(&self, ticker: String, interval: String) -> Result<js_sys::Promise, JsValue> {
        let interval = Interval::parse(&interval)
            .ok_or_else(|| JsValue::from_str(&format!("unknown interval {interval}")))?;
        let session = self.session.clone();
        Ok(future_to_promise(async move {
            session
                .load(&ticker, interval)
                .await
                .map_err(|e| JsValue::from_str(&e.to_string()))?;
            Ok(JsValue::from_str(&status_json(&session.status())))
        }))
    }

    pub fn retry(&self) -> js_sys::Promise {
        let session = self.session.clone();
        future_to_promise(async move {
            session
                .retry()
                .await
                .map_err(|e| JsValue::from_str(&e.to_string()))?;
            Ok(JsValue::from_str(&status_json(&session.status())))
        })
    }

    pub fn status(&self) -> String {
        status_json(&self.session.status())
    }

    #[wasm_bindgen(js_name = armTrendline)]
    pub fn arm_trendline(&self, pane: &str) -> Result<(), JsValue> {
        self.session
            .arm_trendline(parse_pane(pane)?)
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    #[wasm_bindgen(js_name = armInspection)]
    pub fn arm_inspection(&self) -> Result<(), JsValue> {
        self.session
            .arm_inspection()
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    pub fn disarm(&self) {
        self.session.disarm();
    }

    /// `time` is epoch seconds of the clicked bar.
    pub fn click(&self, pane: &str, time: f64) -> Result<String, JsValue> {
        let outcome = self
            .session
            .click(parse_pane(pane)?, TimeKey(time as i64))
            .map_err(|e| JsValue::from_str(&e.to_string()))?;
        Ok(click_json(&outcome))
    }

    #[wasm_bindgen(js_name = eraseTrendlines)]
    pub fn erase_trendlines(&self, pane: &str) -> Result<u32, JsValue> {
        self.session
            .erase_trendlines(parse_pane(pane)?)
            .map(|n| n as u32)
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    #[wasm_bindgen(js_name = setCrosshairHidden)]
    pub fn set_crosshair_hidden(&self, hidden: bool) {
        self.session.set_crosshair_hidden(hidden);
    }

    #[wasm_bindgen(js_name = setChartActive)]
    pub fn set_chart_active(&self, active: bool) {
        self.session.set_chart_active(active);
    }

    /// Comma-separated tickers used for neighbor prefetch.
    #[wasm_bindgen(js_name = setWatchlist)]
    pub fn set_watchlist(&self, tickers: &str) {
        let list = tickers
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
        self.session.set_watchlist(list);
    }

    pub fn teardown(&self) {
        self.session.teardown();
    }
}
