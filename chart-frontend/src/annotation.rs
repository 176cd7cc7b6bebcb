//! Trendline / divergence drawing and point inspection.

use app_shell::PaneTrendlines;
use serde::{Deserialize, Serialize};
use ta_engine::ValueBounds;
use tracing::debug;
use ts_core::{Bar, IndicatorPoint, Interval, TimeKey, TrendlineDefinition};

use crate::error::SessionError;
use crate::PaneRole;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnotationConfig {
    /// Most candidate points highlighted at once.
    pub candidate_cap: usize,
    /// Synthetic bars a ray may extend past the last real one.
    pub horizon_bars: usize,
    pub max_step_secs: i64,
    pub inspection_half_window: usize,
}

impl Default for AnnotationConfig {
    fn default() -> Self {
        Self {
            candidate_cap: 200,
            horizon_bars: 500,
            max_step_secs: 8 * 3_600,
            inspection_half_window: 5,
        }
    }
}

/// First point of a trendline gesture plus its divergence candidates.
#[derive(Debug, Clone, PartialEq)]
pub struct Anchor {
    pub point: IndicatorPoint,
    pub price: f64,
    /// Every qualifying point.
    pub candidates: Vec<IndicatorPoint>,
    /// The highlighted subset; the second click must hit one of these.
    pub displayed: Vec<IndicatorPoint>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolState {
    Idle,
    AwaitingFirst,
    AwaitingSecond(Anchor),
}

#[derive(Debug, Clone)]
pub struct TrendlineTool {
    role: PaneRole,
    state: ToolState,
}

impl TrendlineTool {
    pub fn new(role: PaneRole) -> Self {
        Self {
            role,
            state: ToolState::Idle,
        }
    }

    pub fn role(&self) -> PaneRole {
        self.role
    }

    pub fn state(&self) -> &ToolState {
        &self.state
    }

    pub fn is_armed(&self) -> bool {
        !matches!(self.state, ToolState::Idle)
    }

    fn arm(&mut self) {
        self.state = ToolState::AwaitingFirst;
    }

    fn disarm(&mut self) {
        self.state = ToolState::Idle;
    }
}

#[derive(Debug, Clone, Default)]
pub struct InspectionTool {
    armed: bool,
}

impl InspectionTool {
    pub fn is_armed(&self) -> bool {
        self.armed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArmedTool {
    Trendline(PaneRole),
    Inspection,
}

/// Read-only view of the rendered series the tools work against.
#[derive(Debug, Clone, Copy)]
pub struct AnnotationInput<'a> {
    pub bars: &'a [Bar],
    pub osc_a: &'a [IndicatorPoint],
    pub osc_b: &'a [IndicatorPoint],
    pub interval: Interval,
}

impl<'a> AnnotationInput<'a> {
    pub fn series(&self, role: PaneRole) -> &'a [IndicatorPoint] {
        match role {
            PaneRole::OscillatorA => self.osc_a,
            PaneRole::OscillatorB => self.osc_b,
            _ => &[],
        }
    }

    pub fn close_at(&self, time: TimeKey) -> Option<f64> {
        self.bars
            .binary_search_by_key(&time, |b| b.time)
            .ok()
            .map(|i| self.bars[i].close)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    /// Value at or before the inspected time.
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub from: TimeKey,
    pub to: TimeKey,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InspectionReport {
    pub time: TimeKey,
    pub price: Option<f64>,
    pub osc_a: Option<WindowStats>,
    pub osc_b: Option<WindowStats>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClickOutcome {
    /// No armed tool applies to this click.
    Ignored,
    /// First point recorded; `displayed` are the highlighted candidates.
    AnchorSet {
        anchor: IndicatorPoint,
        displayed: Vec<IndicatorPoint>,
        total: usize,
    },
    /// Second click missed every highlighted candidate.
    Rejected,
    Completed(TrendlineDefinition),
    Inspected(InspectionReport),
}

/// Date label where a ray crosses the midline.
#[derive(Debug, Clone, PartialEq)]
pub struct MidlineLabel {
    pub time: TimeKey,
    pub value: f64,
    pub text: String,
}

/// A trendline ready to draw.
#[derive(Debug, Clone, PartialEq)]
pub struct TrendRay {
    pub definition: TrendlineDefinition,
    /// Slope per bar index.
    pub slope: f64,
    pub points: Vec<IndicatorPoint>,
    pub midline: Option<MidlineLabel>,
}

/// Points after `anchor` whose oscillator and price moved in opposite directions.
pub fn find_divergence_candidates(
    anchor: IndicatorPoint,
    anchor_price: f64,
    series: &[IndicatorPoint],
    input: &AnnotationInput<'_>,
) -> Vec<IndicatorPoint> {
    let start = series.partition_point(|p| p.time <= anchor.time);
    series[start..]
        .iter()
        .filter(|p| {
            let Some(price) = input.close_at(p.time) else {
                return false;
            };
            let bearish = p.value < anchor.value && price > anchor_price;
            let bullish = p.value > anchor.value && price < anchor_price;
            bearish || bullish
        })
        .copied()
        .collect()
}

/// Fixed-stride thinning down to at most `cap` points.
pub fn thin_candidates(candidates: &[IndicatorPoint], cap: usize) -> Vec<IndicatorPoint> {
    let cap = cap.max(1);
    if candidates.len() <= cap {
        return candidates.to_vec();
    }
    let stride = candidates.len().div_ceil(cap);
    candidates.iter().step_by(stride).copied().collect()
}

/// Median positive gap between consecutive times, capped.
pub fn infer_bar_step(times: &[TimeKey], max_step_secs: i64) -> Option<i64> {
    let mut gaps: Vec<i64> = times
        .windows(2)
        .map(|w| w[1].secs() - w[0].secs())
        .filter(|g| *g > 0)
        .collect();
    if gaps.is_empty() {
        return None;
    }
    gaps.sort_unstable();
    let mid = gaps.len() / 2;
    let median = if gaps.len() % 2 == 0 {
        (gaps[mid - 1] + gaps[mid]) / 2
    } else {
        gaps[mid]
    };
    Some(median.min(max_step_secs))
}

/// Extrapolate `def` across `series` and a synthetic future timeline.
///
/// With `bounds`, the ray stops where it leaves the range and the midline
/// crossing is labelled; an unbounded series runs the full horizon unlabelled.
/// Returns `None` when either anchor is missing from `series` or the anchors
/// are not in time order.
pub fn project_ray(
    def: &TrendlineDefinition,
    series: &[IndicatorPoint],
    bounds: Option<ValueBounds>,
    interval: Interval,
    config: &AnnotationConfig,
) -> Option<TrendRay> {
    let index_of = |t: TimeKey| series.binary_search_by_key(&t, |p| p.time).ok();
    let i1 = index_of(def.time1)?;
    let i2 = index_of(def.time2)?;
    if i2 <= i1 {
        return None;
    }
    let slope = (def.value2 - def.value1) / (i2 - i1) as f64;

    let times: Vec<TimeKey> = series.iter().map(|p| p.time).collect();
    let last_index = times.len() - 1;
    let last_time = times[last_index];
    let step = infer_bar_step(&times, config.max_step_secs)
        .unwrap_or_else(|| interval.duration_secs().min(config.max_step_secs))
        .max(1);
    let time_at = |k: usize| -> TimeKey {
        if k <= last_index {
            times[k]
        } else {
            last_time.offset((k - last_index) as i64 * step)
        }
    };

    let end = last_index + config.horizon_bars;
    let mut points = Vec::new();
    for k in i1..=end {
        let value = def.value1 + slope * (k - i1) as f64;
        let in_range = match bounds {
            Some(b) => b.contains(value),
            None => value.is_finite(),
        };
        if !in_range {
            break;
        }
        points.push(IndicatorPoint::new(time_at(k), value));
    }

    let midline = match bounds {
        Some(b) if slope != 0.0 => {
            let mid = b.midline;
            let k_star = i1 as f64 + (mid - def.value1) / slope;
            if k_star.is_finite() && k_star >= i1 as f64 && k_star <= end as f64 {
                let time = time_at(k_star.round() as usize);
                Some(MidlineLabel {
                    time,
                    value: mid,
                    text: time.label(interval.is_intraday()),
                })
            } else {
                None
            }
        }
        _ => None,
    };

    Some(TrendRay {
        definition: *def,
        slope,
        points,
        midline,
    })
}

/// Window statistics around `time`.
pub fn inspect_window(series: &[IndicatorPoint], time: TimeKey, half: usize) -> Option<WindowStats> {
    let idx = series.partition_point(|p| p.time <= time).checked_sub(1)?;
    let lo = idx.saturating_sub(half);
    let hi = (idx + half).min(series.len() - 1);
    let window = &series[lo..=hi];
    let (min, max) = window.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(a, b), p| {
        (a.min(p.value), b.max(p.value))
    });
    Some(WindowStats {
        value: series[idx].value,
        min,
        max,
        from: series[lo].time,
        to: series[hi].time,
    })
}

/// Owns every tool and enforces that at most one is armed.
#[derive(Debug, Clone)]
pub struct AnnotationController {
    osc_a: TrendlineTool,
    osc_b: TrendlineTool,
    inspection: InspectionTool,
    lines: PaneTrendlines,
    config: AnnotationConfig,
}

impl AnnotationController {
    pub fn new(config: AnnotationConfig) -> Self {
        Self {
            osc_a: TrendlineTool::new(PaneRole::OscillatorA),
            osc_b: TrendlineTool::new(PaneRole::OscillatorB),
            inspection: InspectionTool::default(),
            lines: PaneTrendlines::default(),
            config,
        }
    }

    pub fn config(&self) -> &AnnotationConfig {
        &self.config
    }

    fn tool_mut(&mut self, role: PaneRole) -> Result<&mut TrendlineTool, SessionError> {
        match role {
            PaneRole::OscillatorA => Ok(&mut self.osc_a),
            PaneRole::OscillatorB => Ok(&mut self.osc_b),
            other => Err(SessionError::NotAnOscillator(other)),
        }
    }

    pub fn tool(&self, role: PaneRole) -> Option<&TrendlineTool> {
        match role {
            PaneRole::OscillatorA => Some(&self.osc_a),
            PaneRole::OscillatorB => Some(&self.osc_b),
            _ => None,
        }
    }

    pub fn armed(&self) -> Option<ArmedTool> {
        if self.inspection.armed {
            Some(ArmedTool::Inspection)
        } else if self.osc_a.is_armed() {
            Some(ArmedTool::Trendline(PaneRole::OscillatorA))
        } else if self.osc_b.is_armed() {
            Some(ArmedTool::Trendline(PaneRole::OscillatorB))
        } else {
            None
        }
    }

    pub fn disarm_all(&mut self) {
        self.osc_a.disarm();
        self.osc_b.disarm();
        self.inspection.armed = false;
    }

    pub fn arm_trendline(&mut self, role: PaneRole) -> Result<(), SessionError> {
        self.tool_mut(role)?;
        self.disarm_all();
        self.tool_mut(role)?.arm();
        debug!(?role, "trendline tool armed");
        Ok(())
    }

    pub fn arm_inspection(&mut self) {
        self.disarm_all();
        self.inspection.armed = true;
    }

    pub fn lines(&self) -> &PaneTrendlines {
        &self.lines
    }

    pub fn set_lines(&mut self, lines: PaneTrendlines) {
        self.lines = lines;
    }

    pub fn push_line(&mut self, role: PaneRole, def: TrendlineDefinition) -> Result<(), SessionError> {
        let pane = role
            .trendline_pane()
            .ok_or(SessionError::NotAnOscillator(role))?;
        self.lines.pane_mut(pane).push(def);
        Ok(())
    }

    pub fn erase_lines(&mut self, role: PaneRole) -> Result<(), SessionError> {
        let pane = role
            .trendline_pane()
            .ok_or(SessionError::NotAnOscillator(role))?;
        self.lines.pane_mut(pane).clear();
        Ok(())
    }

    pub fn click(&mut self, role: PaneRole, time: TimeKey, input: &AnnotationInput<'_>) -> ClickOutcome {
        if self.inspection.armed {
            let half = self.config.inspection_half_window;
            return ClickOutcome::Inspected(InspectionReport {
                time,
                price: input.close_at(time),
                osc_a: inspect_window(input.osc_a, time, half),
                osc_b: inspect_window(input.osc_b, time, half),
            });
        }

        let cap = self.config.candidate_cap;
        let Ok(tool) = self.tool_mut(role) else {
            return ClickOutcome::Ignored;
        };
        let series = input.series(role);
        match &tool.state {
            ToolState::Idle => ClickOutcome::Ignored,
            ToolState::AwaitingFirst => {
                let Ok(idx) = series.binary_search_by_key(&time, |p| p.time) else {
                    return ClickOutcome::Ignored;
                };
                let point = series[idx];
                let Some(price) = input.close_at(time) else {
                    return ClickOutcome::Ignored;
                };
                let candidates = find_divergence_candidates(point, price, series, input);
                let displayed = thin_candidates(&candidates, cap);
                debug!(?role, total = candidates.len(), shown = displayed.len(), "trendline anchor set");
                let outcome = ClickOutcome::AnchorSet {
                    anchor: point,
                    displayed: displayed.clone(),
                    total: candidates.len(),
                };
                tool.state = ToolState::AwaitingSecond(Anchor {
                    point,
                    price,
                    candidates,
                    displayed,
                });
                outcome
            }
            ToolState::AwaitingSecond(anchor) => {
                let Some(hit) = anchor.displayed.iter().find(|p| p.time == time).copied() else {
                    return ClickOutcome::Rejected;
                };
                let def = TrendlineDefinition {
                    time1: anchor.point.time,
                    value1: anchor.point.value,
                    time2: hit.time,
                    value2: hit.value,
                };
                tool.disarm();
                ClickOutcome::Completed(def)
            }
        }
    }
}
