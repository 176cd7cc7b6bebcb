use std::collections::HashMap;
use std::rc::Rc;

use app_shell::PaneWeights;
use ta_engine::{IndicatorParams, SeriesSlot};
use tracing::debug;

use crate::error::SessionError;
use crate::events::{EventQueue, SurfaceEvent};
use crate::surface::{
    RenderSurface, SeriesHandle, SeriesKind, SeriesOptions, Subscription, SurfaceConfig,
    SurfaceFactory,
};
use crate::token::SuppressFlags;
use crate::PaneRole;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaneState {
    Unbound,
    Bound,
    Destroyed,
}

struct SeriesSpec {
    slot: SeriesSlot,
    kind: SeriesKind,
    options: SeriesOptions,
}

fn spec(slot: SeriesSlot, kind: SeriesKind, title: &str, color: &str) -> SeriesSpec {
    SeriesSpec {
        slot,
        kind,
        options: SeriesOptions::line(title, color),
    }
}

/// Primary series first, then overlays.
fn series_layout(role: PaneRole) -> Vec<SeriesSpec> {
    use SeriesKind::*;
    match role {
        PaneRole::Price => vec![
            spec(SeriesSlot::Bars, Candlestick, "Price", "#26a69a"),
            spec(SeriesSlot::PriceSma, Line, "SMA", "#f5a623"),
            spec(SeriesSlot::PriceEma, Line, "EMA", "#4a90e2"),
        ],
        PaneRole::OscillatorA => vec![
            spec(SeriesSlot::OscA, Line, "Oscillator A", "#b388ff"),
            spec(SeriesSlot::OscASignal, Line, "Signal", "#ff8a65"),
        ],
        PaneRole::OscillatorB => vec![
            spec(SeriesSlot::OscB, Line, "Oscillator B", "#4dd0e1"),
            spec(SeriesSlot::OscBSignal, Line, "Signal", "#ff8a65"),
        ],
        PaneRole::Histogram => vec![spec(SeriesSlot::Histogram, Histogram, "Histogram", "#90a4ae")],
    }
}

/// Bound pane: surface, its series and its event subscriptions.
pub struct SurfaceBinding {
    pub role: PaneRole,
    pub surface: Rc<dyn RenderSurface>,
    pub primary: SeriesHandle,
    series: Vec<(SeriesSlot, SeriesKind, SeriesHandle)>,
    trendline_series: Vec<SeriesHandle>,
    subscriptions: Vec<Subscription>,
}

impl SurfaceBinding {
    pub fn handle_for(&self, slot: SeriesSlot) -> Option<SeriesHandle> {
        self.series
            .iter()
            .find(|(s, _, _)| *s == slot)
            .map(|(_, _, h)| *h)
    }

    pub fn series(&self) -> impl Iterator<Item = (SeriesSlot, SeriesKind, SeriesHandle)> + '_ {
        self.series.iter().copied()
    }

    pub fn trendline_series(&self) -> &[SeriesHandle] {
        &self.trendline_series
    }

    pub fn push_trendline_series(&mut self, handle: SeriesHandle) {
        self.trendline_series.push(handle);
    }

    /// Remove every trendline series from the surface.
    pub fn clear_trendline_series(&mut self) -> usize {
        let handles = std::mem::take(&mut self.trendline_series);
        for h in &handles {
            self.surface.remove_series(*h);
        }
        handles.len()
    }
}

/// Owns the four panes. `Unbound → Bound → Destroyed`; never rebinds after destroy.
pub struct SurfaceRegistry {
    factory: Rc<dyn SurfaceFactory>,
    queue: EventQueue,
    suppress: SuppressFlags<PaneRole>,
    bindings: HashMap<PaneRole, SurfaceBinding>,
    destroyed: bool,
}

impl SurfaceRegistry {
    pub fn new(
        factory: Rc<dyn SurfaceFactory>,
        queue: EventQueue,
        suppress: SuppressFlags<PaneRole>,
    ) -> Self {
        Self {
            factory,
            queue,
            suppress,
            bindings: HashMap::new(),
            destroyed: false,
        }
    }

    pub fn state(&self, role: PaneRole) -> PaneState {
        if self.destroyed {
            PaneState::Destroyed
        } else if self.bindings.contains_key(&role) {
            PaneState::Bound
        } else {
            PaneState::Unbound
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn binding(&self, role: PaneRole) -> Option<&SurfaceBinding> {
        self.bindings.get(&role)
    }

    pub fn binding_mut(&mut self, role: PaneRole) -> Option<&mut SurfaceBinding> {
        self.bindings.get_mut(&role)
    }

    pub fn bindings(&self) -> impl Iterator<Item = &SurfaceBinding> + '_ {
        PaneRole::ALL.iter().filter_map(|r| self.bindings.get(r))
    }

    /// Create the pane's surface and series; no-op when already bound.
    /// Oscillator panes get a fixed value scale only when their series has one.
    pub fn bind(&mut self, role: PaneRole, weight: f64, params: &IndicatorParams) -> Result<(), SessionError> {
        if self.destroyed {
            return Err(SessionError::Destroyed);
        }
        if self.bindings.contains_key(&role) {
            return Ok(());
        }
        let bounds = role.oscillator_slot().and_then(|slot| params.value_bounds(slot));
        let surface = self.factory.create_surface(&SurfaceConfig {
            role,
            weight,
            bounds,
        })?;

        let mut series = Vec::new();
        for s in series_layout(role) {
            let handle = surface.add_series(s.kind, s.options)?;
            series.push((s.slot, s.kind, handle));
        }
        let primary = series
            .first()
            .map(|(_, _, h)| *h)
            .ok_or_else(|| SessionError::Config(format!("{role:?} has no series")))?;

        let range_sub = {
            let queue = self.queue.clone();
            let flags = self.suppress.clone();
            surface.subscribe_visible_logical_range_change(Box::new(move |range| {
                if !flags.is_suppressed(role) {
                    queue.push(SurfaceEvent::RangeChanged { role, range });
                }
            }))
        };
        let crosshair_sub = {
            let queue = self.queue.clone();
            surface.subscribe_crosshair_move(Box::new(move |ev| {
                queue.push(SurfaceEvent::CrosshairMoved {
                    role,
                    time: ev.time,
                    from_pointer: ev.from_pointer,
                });
            }))
        };

        debug!(?role, series = series.len(), "pane bound");
        self.bindings.insert(
            role,
            SurfaceBinding {
                role,
                surface,
                primary,
                series,
                trendline_series: Vec::new(),
                subscriptions: vec![range_sub, crosshair_sub],
            },
        );
        Ok(())
    }

    pub fn bind_all(&mut self, weights: &PaneWeights, params: &IndicatorParams) -> Result<(), SessionError> {
        let w = weights.normalized();
        self.bind(PaneRole::Price, w.price, params)?;
        self.bind(PaneRole::OscillatorA, w.oscillator_a, params)?;
        self.bind(PaneRole::OscillatorB, w.oscillator_b, params)?;
        self.bind(PaneRole::Histogram, w.histogram, params)?;
        Ok(())
    }

    /// Dispose every subscription and surface.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        for role in PaneRole::ALL {
            if let Some(mut binding) = self.bindings.remove(&role) {
                binding.subscriptions.clear();
                binding.clear_trendline_series();
                binding.surface.destroy();
            }
        }
        self.destroyed = true;
        debug!("surface registry destroyed");
    }
}

impl Drop for SurfaceRegistry {
    fn drop(&mut self) {
        self.destroy();
    }
}
