//! Contract of the external chart-drawing surface.

use serde::{Deserialize, Serialize};
use ta_engine::ValueBounds;
use thiserror::Error;
use ts_core::{Bar, IndicatorPoint, LogicalRange, TimeKey};

use crate::PaneRole;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SurfaceError {
    #[error("surface creation failed: {0}")]
    Create(String),
    #[error("surface call failed: {0}")]
    Call(String),
}

/// Opaque series id issued by a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeriesKind {
    Candlestick,
    Line,
    Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesOptions {
    pub title: String,
    pub color: String,
    pub line_width: f32,
    #[serde(default)]
    pub dashed: bool,
}

impl SeriesOptions {
    pub fn line(title: &str, color: &str) -> Self {
        Self {
            title: title.to_string(),
            color: color.to_string(),
            line_width: 1.5,
            dashed: false,
        }
    }

    pub fn dashed(mut self) -> Self {
        self.dashed = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "points")]
pub enum SeriesData {
    Bars(Vec<Bar>),
    Points(Vec<IndicatorPoint>),
}

impl SeriesData {
    pub fn len(&self) -> usize {
        match self {
            SeriesData::Bars(b) => b.len(),
            SeriesData::Points(p) => p.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn empty_like(kind: SeriesKind) -> Self {
        match kind {
            SeriesKind::Candlestick => SeriesData::Bars(Vec::new()),
            _ => SeriesData::Points(Vec::new()),
        }
    }
}

/// One append-or-patch sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "point")]
pub enum SeriesDatum {
    Bar(Bar),
    Point(IndicatorPoint),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Marker {
    pub time: TimeKey,
    pub value: Option<f64>,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceConfig {
    pub role: PaneRole,
    pub weight: f64,
    pub bounds: Option<ValueBounds>,
}

/// Crosshair notification from a surface.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrosshairEvent {
    /// `None` when the pointer left the pane.
    pub time: Option<TimeKey>,
    /// `false` when caused by `set_crosshair_position`.
    pub from_pointer: bool,
}

pub type RangeCallback = Box<dyn Fn(LogicalRange)>;
pub type CrosshairCallback = Box<dyn Fn(CrosshairEvent)>;

/// Disposable event subscription; unsubscribes on drop.
pub struct Subscription {
    dispose: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    pub fn new(dispose: impl FnOnce() + 'static) -> Self {
        Self {
            dispose: Some(Box::new(dispose)),
        }
    }

    pub fn noop() -> Self {
        Self { dispose: None }
    }

    pub fn dispose(mut self) {
        if let Some(f) = self.dispose.take() {
            f();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.dispose.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.dispose.is_some())
            .finish()
    }
}

/// A chart pane: series management, viewport and crosshair.
pub trait RenderSurface {
    fn add_series(&self, kind: SeriesKind, options: SeriesOptions) -> Result<SeriesHandle, SurfaceError>;
    fn remove_series(&self, series: SeriesHandle);
    fn set_data(&self, series: SeriesHandle, data: SeriesData);
    /// Append a newer sample or replace the sample with the same time.
    fn update(&self, series: SeriesHandle, datum: SeriesDatum);
    fn set_markers(&self, series: SeriesHandle, markers: Vec<Marker>);

    fn visible_logical_range(&self) -> Option<LogicalRange>;
    fn set_visible_logical_range(&self, range: LogicalRange);

    fn set_crosshair_position(&self, value: f64, time: TimeKey, series: SeriesHandle);
    fn clear_crosshair_position(&self);

    fn subscribe_visible_logical_range_change(&self, callback: RangeCallback) -> Subscription;
    fn subscribe_crosshair_move(&self, callback: CrosshairCallback) -> Subscription;

    fn price_to_coordinate(&self, series: SeriesHandle, value: f64) -> Option<f64>;
    fn coordinate_to_price(&self, series: SeriesHandle, y: f64) -> Option<f64>;

    /// Release the surface; no calls follow.
    fn destroy(&self) {}
}

pub trait SurfaceFactory {
    fn create_surface(&self, config: &SurfaceConfig) -> Result<std::rc::Rc<dyn RenderSurface>, SurfaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn subscription_disposes_once() {
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let sub = Subscription::new(move || h.set(h.get() + 1));
        drop(sub);
        assert_eq!(hits.get(), 1);

        let h = hits.clone();
        Subscription::new(move || h.set(h.get() + 1)).dispose();
        assert_eq!(hits.get(), 2);
    }
}
