//! Multi-pane chart controller.
//!
//! Four stacked panes (price, two oscillators, histogram) are drawn by an
//! external [`RenderSurface`]; this crate owns loading, caching, live refresh,
//! viewport/crosshair sync and the annotation tools.

pub mod annotation;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod refresh;
pub mod registry;
pub mod session;
pub mod surface;
pub mod sync;
pub mod token;

#[cfg(test)]
pub(crate) mod test_support;

#[cfg(target_arch = "wasm32")]
mod wasm;

use app_shell::TrendlinePane;
use serde::{Deserialize, Serialize};
use ta_engine::SeriesSlot;

pub use annotation::{AnnotationConfig, AnnotationController, ClickOutcome, InspectionReport};
pub use config::ChartConfig;
pub use context::ChartSessionContext;
pub use error::SessionError;
pub use refresh::{LiveRefreshScheduler, RefreshDecision, RefreshGate, RequestGeneration};
pub use registry::{PaneState, SurfaceRegistry};
pub use session::{ChartSession, FrameReport, LoadOutcome, RefreshOutcome, ViewStatus};
pub use surface::{RenderSurface, SurfaceConfig, SurfaceError, SurfaceFactory};
pub use sync::{SyncCoordinator, SyncLock, SyncReport};

#[cfg(target_arch = "wasm32")]
pub use wasm::ChartHandle;

/// One of the four stacked panes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaneRole {
    Price,
    OscillatorA,
    OscillatorB,
    Histogram,
}

impl PaneRole {
    /// Top-to-bottom layout order.
    pub const ALL: [PaneRole; 4] = [
        PaneRole::Price,
        PaneRole::OscillatorA,
        PaneRole::OscillatorB,
        PaneRole::Histogram,
    ];

    /// Source preference when several panes report a range in one batch.
    pub const PRIORITY: [PaneRole; 4] = Self::ALL;

    /// Oscillator panes accept trendlines; the others do not.
    pub fn trendline_pane(self) -> Option<TrendlinePane> {
        match self {
            PaneRole::OscillatorA => Some(TrendlinePane::OscillatorA),
            PaneRole::OscillatorB => Some(TrendlinePane::OscillatorB),
            PaneRole::Price | PaneRole::Histogram => None,
        }
    }

    /// Main line of an oscillator pane.
    pub fn oscillator_slot(self) -> Option<SeriesSlot> {
        match self {
            PaneRole::OscillatorA => Some(SeriesSlot::OscA),
            PaneRole::OscillatorB => Some(SeriesSlot::OscB),
            PaneRole::Price | PaneRole::Histogram => None,
        }
    }

    pub fn for_slot(slot: SeriesSlot) -> PaneRole {
        match slot {
            SeriesSlot::Bars | SeriesSlot::PriceSma | SeriesSlot::PriceEma => PaneRole::Price,
            SeriesSlot::OscA | SeriesSlot::OscASignal => PaneRole::OscillatorA,
            SeriesSlot::OscB | SeriesSlot::OscBSignal => PaneRole::OscillatorB,
            SeriesSlot::Histogram => PaneRole::Histogram,
        }
    }

    /// Accepts the names used by the JS host (`price`, `oscA`, `oscB`, `histogram`).
    pub fn parse(s: &str) -> Option<PaneRole> {
        match s.trim().to_ascii_lowercase().as_str() {
            "price" => Some(PaneRole::Price),
            "osca" | "oscillator_a" | "oscillatora" => Some(PaneRole::OscillatorA),
            "oscb" | "oscillator_b" | "oscillatorb" => Some(PaneRole::OscillatorB),
            "histogram" | "hist" => Some(PaneRole::Histogram),
            _ => None,
        }
    }
}
