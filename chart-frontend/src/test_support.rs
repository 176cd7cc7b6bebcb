//! In-memory surfaces that record every call, for tests.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::rc::{Rc, Weak};

use ta_engine::ValueBounds;
use ts_core::{LogicalRange, TimeKey};

use crate::surface::{
    CrosshairCallback, CrosshairEvent, Marker, RangeCallback, RenderSurface, SeriesData,
    SeriesDatum, SeriesHandle, SeriesKind, SeriesOptions, Subscription, SurfaceConfig,
    SurfaceError, SurfaceFactory,
};
use crate::PaneRole;

#[derive(Debug, Clone)]
pub struct SeriesRecord {
    pub kind: SeriesKind,
    pub options: SeriesOptions,
    pub data: SeriesData,
    pub markers: Vec<Marker>,
    pub updates: usize,
}

#[derive(Default)]
struct SurfaceState {
    next_series: u32,
    next_sub: u64,
    series: BTreeMap<SeriesHandle, SeriesRecord>,
    range: Option<LogicalRange>,
    crosshair: Option<(f64, TimeKey, SeriesHandle)>,
    range_subs: Vec<(u64, Rc<dyn Fn(LogicalRange)>)>,
    crosshair_subs: Vec<(u64, Rc<dyn Fn(CrosshairEvent)>)>,
    set_range_calls: usize,
    crosshair_clears: usize,
    destroyed: bool,
}

pub struct RecordingSurface {
    state: Rc<RefCell<SurfaceState>>,
}

impl RecordingSurface {
    fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(SurfaceState::default())),
        }
    }

    fn fire_range(&self, range: LogicalRange) {
        let subs: Vec<_> = self
            .state
            .borrow()
            .range_subs
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in subs {
            f(range);
        }
    }

    fn fire_crosshair(&self, ev: CrosshairEvent) {
        let subs: Vec<_> = self
            .state
            .borrow()
            .crosshair_subs
            .iter()
            .map(|(_, f)| f.clone())
            .collect();
        for f in subs {
            f(ev);
        }
    }

    /// Pan/zoom by the user.
    pub fn user_scroll(&self, range: LogicalRange) {
        self.state.borrow_mut().range = Some(range);
        self.fire_range(range);
    }

    /// Pointer hover at `time` (`None` = pointer left).
    pub fn user_hover(&self, time: Option<TimeKey>) {
        self.fire_crosshair(CrosshairEvent {
            time,
            from_pointer: true,
        });
    }

    pub fn range(&self) -> Option<LogicalRange> {
        self.state.borrow().range
    }

    pub fn crosshair(&self) -> Option<(f64, TimeKey, SeriesHandle)> {
        self.state.borrow().crosshair
    }

    pub fn set_range_calls(&self) -> usize {
        self.state.borrow().set_range_calls
    }

    pub fn crosshair_clears(&self) -> usize {
        self.state.borrow().crosshair_clears
    }

    pub fn subscriber_count(&self) -> usize {
        let s = self.state.borrow();
        s.range_subs.len() + s.crosshair_subs.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().destroyed
    }

    pub fn series_count(&self) -> usize {
        self.state.borrow().series.len()
    }

    pub fn record(&self, series: SeriesHandle) -> Option<SeriesRecord> {
        self.state.borrow().series.get(&series).cloned()
    }

    /// Records of series created with the given title.
    pub fn records_titled(&self, title: &str) -> Vec<SeriesRecord> {
        self.state
            .borrow()
            .series
            .values()
            .filter(|r| r.options.title == title)
            .cloned()
            .collect()
    }
}

impl RenderSurface for RecordingSurface {
    fn add_series(&self, kind: SeriesKind, options: SeriesOptions) -> Result<SeriesHandle, SurfaceError> {
        let mut s = self.state.borrow_mut();
        if s.destroyed {
            return Err(SurfaceError::Call("destroyed".into()));
        }
        s.next_series += 1;
        let handle = SeriesHandle(s.next_series);
        s.series.insert(
            handle,
            SeriesRecord {
                kind,
                options,
                data: SeriesData::empty_like(kind),
                markers: Vec::new(),
                updates: 0,
            },
        );
        Ok(handle)
    }

    fn remove_series(&self, series: SeriesHandle) {
        self.state.borrow_mut().series.remove(&series);
    }

    fn set_data(&self, series: SeriesHandle, data: SeriesData) {
        if let Some(r) = self.state.borrow_mut().series.get_mut(&series) {
            r.data = data;
        }
    }

    fn update(&self, series: SeriesHandle, datum: SeriesDatum) {
        let mut s = self.state.borrow_mut();
        let Some(r) = s.series.get_mut(&series) else {
            return;
        };
        r.updates += 1;
        match (&mut r.data, datum) {
            (SeriesData::Bars(bars), SeriesDatum::Bar(bar)) => match bars.last_mut() {
                Some(last) if last.time == bar.time => *last = bar,
                _ => bars.push(bar),
            },
            (SeriesData::Points(points), SeriesDatum::Point(p)) => match points.last_mut() {
                Some(last) if last.time == p.time => *last = p,
                _ => points.push(p),
            },
            _ => {}
        }
    }

    fn set_markers(&self, series: SeriesHandle, markers: Vec<Marker>) {
        if let Some(r) = self.state.borrow_mut().series.get_mut(&series) {
            r.markers = markers;
        }
    }

    fn visible_logical_range(&self) -> Option<LogicalRange> {
        self.state.borrow().range
    }

    fn set_visible_logical_range(&self, range: LogicalRange) {
        let changed = {
            let mut s = self.state.borrow_mut();
            s.set_range_calls += 1;
            let changed = s.range != Some(range);
            s.range = Some(range);
            changed
        };
        if changed {
            self.fire_range(range);
        }
    }

    fn set_crosshair_position(&self, value: f64, time: TimeKey, series: SeriesHandle) {
        self.state.borrow_mut().crosshair = Some((value, time, series));
        self.fire_crosshair(CrosshairEvent {
            time: Some(time),
            from_pointer: false,
        });
    }

    fn clear_crosshair_position(&self) {
        {
            let mut s = self.state.borrow_mut();
            s.crosshair = None;
            s.crosshair_clears += 1;
        }
        self.fire_crosshair(CrosshairEvent {
            time: None,
            from_pointer: false,
        });
    }

    fn subscribe_visible_logical_range_change(&self, callback: RangeCallback) -> Subscription {
        let id = {
            let mut s = self.state.borrow_mut();
            s.next_sub += 1;
            let id = s.next_sub;
            s.range_subs.push((id, Rc::from(callback)));
            id
        };
        let weak: Weak<RefCell<SurfaceState>> = Rc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.borrow_mut().range_subs.retain(|(i, _)| *i != id);
            }
        })
    }

    fn subscribe_crosshair_move(&self, callback: CrosshairCallback) -> Subscription {
        let id = {
            let mut s = self.state.borrow_mut();
            s.next_sub += 1;
            let id = s.next_sub;
            s.crosshair_subs.push((id, Rc::from(callback)));
            id
        };
        let weak: Weak<RefCell<SurfaceState>> = Rc::downgrade(&self.state);
        Subscription::new(move || {
            if let Some(state) = weak.upgrade() {
                state.borrow_mut().crosshair_subs.retain(|(i, _)| *i != id);
            }
        })
    }

    fn price_to_coordinate(&self, _series: SeriesHandle, value: f64) -> Option<f64> {
        Some(100.0 - value)
    }

    fn coordinate_to_price(&self, _series: SeriesHandle, y: f64) -> Option<f64> {
        Some(100.0 - y)
    }

    fn destroy(&self) {
        self.state.borrow_mut().destroyed = true;
    }
}

#[derive(Default)]
pub struct RecordingFactory {
    surfaces: RefCell<HashMap<PaneRole, Rc<RecordingSurface>>>,
    bounds: RefCell<HashMap<PaneRole, Option<ValueBounds>>>,
    created: Cell<usize>,
    fail_for: Cell<Option<PaneRole>>,
}

impl RecordingFactory {
    pub fn created(&self) -> usize {
        self.created.get()
    }

    pub fn surface(&self, role: PaneRole) -> Option<Rc<RecordingSurface>> {
        self.surfaces.borrow().get(&role).cloned()
    }

    /// Value scale the latest surface for `role` was created with.
    pub fn bounds(&self, role: PaneRole) -> Option<ValueBounds> {
        self.bounds.borrow().get(&role).copied().flatten()
    }

    pub fn fail_for(&self, role: Option<PaneRole>) {
        self.fail_for.set(role);
    }
}

impl SurfaceFactory for RecordingFactory {
    fn create_surface(&self, config: &SurfaceConfig) -> Result<Rc<dyn RenderSurface>, SurfaceError> {
        if self.fail_for.get() == Some(config.role) {
            return Err(SurfaceError::Create(format!("{:?}", config.role)));
        }
        self.created.set(self.created.get() + 1);
        let surface = Rc::new(RecordingSurface::new());
        self.bounds.borrow_mut().insert(config.role, config.bounds);
        self.surfaces
            .borrow_mut()
            .insert(config.role, surface.clone());
        Ok(surface)
    }
}
