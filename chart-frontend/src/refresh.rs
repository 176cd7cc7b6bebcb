use std::cell::Cell;
use std::rc::Rc;

use data_feed::LatestPayload;
use ts_core::TimeKey;

/// Bumped on every ticker/interval switch; responses tagged with an older
/// value are discarded on arrival.
#[derive(Debug, Clone, Default)]
pub struct RequestGeneration {
    value: Rc<Cell<u64>>,
}

impl RequestGeneration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.value.get()
    }

    pub fn bump(&self) -> u64 {
        let next = self.value.get().wrapping_add(1);
        self.value.set(next);
        next
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.value.get() == generation
    }
}

/// Conditions under which the live-refresh timer is allowed to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshGate {
    pub manual_load_in_flight: bool,
    pub tab_visible: bool,
    pub chart_active: bool,
}

impl Default for RefreshGate {
    fn default() -> Self {
        Self {
            manual_load_in_flight: false,
            tab_visible: true,
            chart_active: true,
        }
    }
}

impl RefreshGate {
    pub fn allows(&self) -> bool {
        !self.manual_load_in_flight && self.tab_visible && self.chart_active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshDecision {
    /// The sample updates the open bar: patch every series in place.
    Patch,
    /// A new bar formed or nothing is rendered yet.
    FullReload,
}

pub fn decide(rendered_last: Option<TimeKey>, latest: &LatestPayload) -> RefreshDecision {
    match rendered_last {
        Some(t) if t == latest.bar.time => RefreshDecision::Patch,
        _ => RefreshDecision::FullReload,
    }
}

/// Fixed-interval tick bookkeeping for the live-refresh loop.
#[derive(Debug, Clone)]
pub struct LiveRefreshScheduler {
    interval_ms: i64,
    last_tick_ms: Option<i64>,
    gate: RefreshGate,
}

impl LiveRefreshScheduler {
    pub fn new(interval_ms: i64) -> Self {
        Self {
            interval_ms: interval_ms.max(1),
            last_tick_ms: None,
            gate: RefreshGate::default(),
        }
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_ms
    }

    pub fn gate(&self) -> RefreshGate {
        self.gate
    }

    pub fn gate_mut(&mut self) -> &mut RefreshGate {
        &mut self.gate
    }

    /// Whether a tick should fire at `now_ms`. The first call only arms the timer.
    pub fn due(&mut self, now_ms: i64) -> bool {
        let Some(last) = self.last_tick_ms else {
            self.last_tick_ms = Some(now_ms);
            return false;
        };
        if now_ms - last < self.interval_ms {
            return false;
        }
        self.last_tick_ms = Some(now_ms);
        self.gate.allows()
    }

    pub fn reset(&mut self) {
        self.last_tick_ms = None;
    }
}
