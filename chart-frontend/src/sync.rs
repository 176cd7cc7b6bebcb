use std::collections::HashMap;

use tracing::debug;
use ts_core::{IndicatorPoint, LogicalRange, TimeKey, TimeSeries};

use crate::events::SurfaceEvent;
use crate::registry::SurfaceRegistry;
use crate::token::{OwnerGuard, OwnerToken, SuppressFlags};
use crate::PaneRole;

/// Names the pane currently propagating a viewport change.
pub type SyncLock = OwnerToken<PaneRole>;

/// What one drained batch did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Pane whose range was propagated.
    pub range_source: Option<PaneRole>,
    /// Panes that received `set_visible_logical_range`.
    pub ranges_set: Vec<PaneRole>,
    /// Range events dropped (lock held elsewhere, suppressed, or outranked).
    pub ignored: usize,
    pub crosshair_source: Option<PaneRole>,
}

/// Keeps the four panes' viewports and crosshairs in lockstep.
///
/// The lock is taken by the pane whose change is being propagated and is
/// released by [`SyncCoordinator::frame`], so echoes fired by the other panes
/// before the next animation frame are ignored.
pub struct SyncCoordinator {
    lock: SyncLock,
    held: Option<OwnerGuard<PaneRole>>,
    suppress: SuppressFlags<PaneRole>,
    tolerance: f64,
    crosshair_hidden: bool,
    tables: HashMap<PaneRole, TimeSeries<IndicatorPoint>>,
}

impl SyncCoordinator {
    pub fn new(lock: SyncLock, suppress: SuppressFlags<PaneRole>, tolerance: f64) -> Self {
        Self {
            lock,
            held: None,
            suppress,
            tolerance,
            crosshair_hidden: false,
            tables: HashMap::new(),
        }
    }

    pub fn lock(&self) -> &SyncLock {
        &self.lock
    }

    pub fn crosshair_hidden(&self) -> bool {
        self.crosshair_hidden
    }

    /// Replace the pane's value-by-time table used for crosshair mapping.
    pub fn set_value_table(&mut self, role: PaneRole, points: Vec<IndicatorPoint>) {
        self.tables.insert(role, TimeSeries::from_unsorted(points));
    }

    pub fn clear_value_tables(&mut self) {
        self.tables.clear();
    }

    /// Nearest sample at or before `time` in the pane's table.
    pub fn value_at(&self, role: PaneRole, time: TimeKey) -> Option<IndicatorPoint> {
        self.tables.get(&role)?.at_or_before(time).copied()
    }

    pub fn handle_events(&mut self, events: Vec<SurfaceEvent>, registry: &SurfaceRegistry) -> SyncReport {
        let mut report = SyncReport::default();
        let mut ranges: HashMap<PaneRole, LogicalRange> = HashMap::new();
        let mut crosshair: Option<(PaneRole, Option<TimeKey>)> = None;

        for event in events {
            match event {
                SurfaceEvent::RangeChanged { role, range } => {
                    if self.lock.is_held_by_other(role) || self.suppress.is_suppressed(role) {
                        report.ignored += 1;
                        continue;
                    }
                    if !range.is_valid() {
                        report.ignored += 1;
                        continue;
                    }
                    if ranges.insert(role, range).is_some() {
                        // superseded by a later event from the same pane
                        report.ignored += 1;
                    }
                }
                SurfaceEvent::CrosshairMoved {
                    role,
                    time,
                    from_pointer,
                } => {
                    if from_pointer {
                        crosshair = Some((role, time));
                    }
                }
            }
        }

        // Same-batch conflicts: highest-priority pane wins.
        if let Some(&source) = PaneRole::PRIORITY.iter().find(|r| ranges.contains_key(r)) {
            report.ignored += ranges.len() - 1;
            if let Some(range) = ranges.get(&source).copied() {
                report.ranges_set = self.propagate_range(source, range, registry);
                report.range_source = Some(source);
            }
        }

        if let Some((source, time)) = crosshair {
            self.sync_crosshair(source, time, registry);
            report.crosshair_source = Some(source);
        }
        report
    }

    fn propagate_range(
        &mut self,
        source: PaneRole,
        range: LogicalRange,
        registry: &SurfaceRegistry,
    ) -> Vec<PaneRole> {
        if self.held.is_none() {
            self.held = self.lock.try_acquire(source);
        }
        let mut updated = Vec::new();
        for binding in registry.bindings() {
            if binding.role == source {
                continue;
            }
            let differs = binding
                .surface
                .visible_logical_range()
                .map_or(true, |current| !current.approx_eq(&range, self.tolerance));
            if differs {
                binding.surface.set_visible_logical_range(range);
                updated.push(binding.role);
            }
        }
        debug!(?source, from = range.from, to = range.to, updated = updated.len(), "range propagated");
        updated
    }

    fn sync_crosshair(&self, source: PaneRole, time: Option<TimeKey>, registry: &SurfaceRegistry) {
        if self.crosshair_hidden {
            for binding in registry.bindings() {
                binding.surface.clear_crosshair_position();
            }
            return;
        }
        for binding in registry.bindings() {
            if binding.role == source {
                continue;
            }
            match time.and_then(|t| self.value_at(binding.role, t)) {
                Some(p) => binding
                    .surface
                    .set_crosshair_position(p.value, p.time, binding.primary),
                None => binding.surface.clear_crosshair_position(),
            }
        }
    }

    pub fn set_crosshair_hidden(&mut self, hidden: bool, registry: &SurfaceRegistry) {
        self.crosshair_hidden = hidden;
        if hidden {
            for binding in registry.bindings() {
                binding.surface.clear_crosshair_position();
            }
        }
    }

    /// Animation-frame tick: release the sync lock. Returns whether it was held.
    pub fn frame(&mut self) -> bool {
        self.held.take().is_some()
    }
}
