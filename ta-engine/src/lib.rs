use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use ts_core::{Bar, IndicatorPoint, TimeKey};

/// Parameters that shape the derived series; part of every cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct IndicatorParams {
    /// Wilder RSI period used when the source supplies no oscillator A.
    pub rsi_period: usize,
    /// Simple moving average over closes (price overlay).
    pub price_sma: usize,
    /// Exponential moving average over closes (price overlay).
    pub price_ema: usize,
    /// Signal line length on both oscillator panes.
    pub signal_length: usize,
    /// Rolling min-max window for oscillator B; 0 keeps the raw values.
    pub normalize_lookback: usize,
}

impl Default for IndicatorParams {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            price_sma: 20,
            price_ema: 50,
            signal_length: 9,
            normalize_lookback: 0,
        }
    }
}

impl IndicatorParams {
    /// Stable short hash, safe to persist across sessions.
    pub fn param_hash(&self) -> String {
        let canonical = format!(
            "rsi={};sma={};ema={};signal={};norm={}",
            self.rsi_period,
            self.price_sma,
            self.price_ema,
            self.signal_length,
            self.normalize_lookback
        );
        let digest = Sha256::digest(canonical.as_bytes());
        digest[..8].iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Value range of the series drawn in `slot`, when it has a fixed one.
    ///
    /// Oscillator A is an RSI. Oscillator B is only bounded once normalized;
    /// with `normalize_lookback == 0` it carries raw source values.
    pub fn value_bounds(&self, slot: SeriesSlot) -> Option<ValueBounds> {
        match slot {
            SeriesSlot::OscA | SeriesSlot::OscASignal => Some(ValueBounds::OSCILLATOR),
            SeriesSlot::OscB | SeriesSlot::OscBSignal if self.normalize_lookback > 0 => {
                Some(ValueBounds::OSCILLATOR)
            }
            _ => None,
        }
    }
}

/// Valid value range of an oscillator pane.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueBounds {
    pub min: f64,
    pub max: f64,
    pub midline: f64,
}

impl ValueBounds {
    pub const OSCILLATOR: ValueBounds = ValueBounds {
        min: 0.0,
        max: 100.0,
        midline: 50.0,
    };

    pub fn contains(&self, v: f64) -> bool {
        v.is_finite() && v >= self.min && v <= self.max
    }
}

impl Default for ValueBounds {
    fn default() -> Self {
        Self::OSCILLATOR
    }
}

// ---------- Wilder RSI -------------------------------------------------------

/// Incremental Wilder RSI.
///
/// Until `period` changes have been seen the averages are plain means of the
/// changes so far; at `period` they are the full-period mean; afterwards
/// `avg = (avg * (period - 1) + sample) / period`.
#[derive(Debug, Clone, PartialEq)]
pub struct WilderRsi {
    period: usize,
    prev_price: Option<f64>,
    gain_sum: f64,
    loss_sum: f64,
    count: usize,
    avg_gain: f64,
    avg_loss: f64,
}

impl WilderRsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_price: None,
            gain_sum: 0.0,
            loss_sum: 0.0,
            count: 0,
            avg_gain: 0.0,
            avg_loss: 0.0,
        }
    }

    /// Feed one finite price; returns RSI once a change has been observed.
    pub fn next(&mut self, price: f64) -> Option<f64> {
        if !price.is_finite() {
            return None;
        }
        let prev = self.prev_price.replace(price)?;
        let delta = price - prev;
        let gain = delta.max(0.0);
        let loss = (-delta).max(0.0);

        self.count += 1;
        if self.count <= self.period {
            self.gain_sum += gain;
            self.loss_sum += loss;
            let n = self.count as f64;
            self.avg_gain = self.gain_sum / n;
            self.avg_loss = self.loss_sum / n;
        } else {
            let p = self.period as f64;
            self.avg_gain = (self.avg_gain * (p - 1.0) + gain) / p;
            self.avg_loss = (self.avg_loss * (p - 1.0) + loss) / p;
        }
        Some(rsi_from_averages(self.avg_gain, self.avg_loss))
    }
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    let rs = avg_gain / avg_loss;
    (100.0 - 100.0 / (1.0 + rs)).clamp(0.0, 100.0)
}

/// RSI aligned 1:1 with `closes`.
///
/// Positions before the first computable value take that first value; a
/// non-finite close repeats the previous output. With fewer than two finite
/// closes every position reports the neutral 50.
pub fn compute_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let mut engine = WilderRsi::new(period);
    let mut out = Vec::with_capacity(closes.len());
    let mut last: Option<f64> = None;
    let mut leading = 0usize;

    for &close in closes {
        if let Some(v) = engine.next(close) {
            last = Some(v);
        }
        match last {
            Some(v) => out.push(v),
            None => {
                out.push(f64::NAN);
                leading += 1;
            }
        }
    }

    let seed = out.get(leading).copied().unwrap_or(50.0);
    for slot in out.iter_mut().take(leading) {
        *slot = seed;
    }
    out
}

// ---------- moving averages -------------------------------------------------

/// Replace non-finite samples with the last finite one; leading gaps stay `None`.
pub fn forward_fill(values: &[f64]) -> Vec<Option<f64>> {
    let mut last = None;
    values
        .iter()
        .map(|&v| {
            if v.is_finite() {
                last = Some(v);
            }
            last
        })
        .collect()
}

fn window_mean(window: &[f64]) -> f64 {
    window.iter().sum::<f64>() / window.len() as f64
}

/// Simple moving average over forward-filled values.
pub fn compute_sma(values: &[f64], length: usize) -> Vec<Option<f64>> {
    let length = length.max(1);
    let filled = forward_fill(values);
    let mut available: Vec<f64> = Vec::with_capacity(values.len());
    filled
        .iter()
        .map(|slot| {
            let v = (*slot)?;
            available.push(v);
            if available.len() < length {
                return None;
            }
            Some(window_mean(&available[available.len() - length..]))
        })
        .collect()
}

/// The newest `n` forward-filled values, oldest first.
///
/// Walks back from the end only as far as the window (plus any trailing gap)
/// needs; `None` when fewer than `n` positions have a value.
fn filled_tail(values: &[f64], n: usize) -> Option<Vec<f64>> {
    let mut tail = Vec::with_capacity(n);
    let mut pending = 0usize;
    for &v in values.iter().rev() {
        pending += 1;
        if v.is_finite() {
            let take = pending.min(n - tail.len());
            tail.extend(std::iter::repeat(v).take(take));
            pending = 0;
            if tail.len() == n {
                break;
            }
        }
    }
    if tail.len() < n {
        return None;
    }
    tail.reverse();
    Some(tail)
}

/// Newest SMA value; equals the last element of [`compute_sma`].
pub fn sma_last(values: &[f64], length: usize) -> Option<f64> {
    filled_tail(values, length.max(1)).map(|w| window_mean(&w))
}

fn ema_alpha(length: usize) -> f64 {
    2.0 / (length.max(1) as f64 + 1.0)
}

/// One EMA step from the previous value.
pub fn ema_next(prev: f64, value: f64, length: usize) -> f64 {
    let alpha = ema_alpha(length);
    alpha * value + (1.0 - alpha) * prev
}

/// Exponential moving average over forward-filled values.
///
/// Seeded with the mean of the first `length` available samples (or all of
/// them when fewer exist), then every available sample is folded in.
pub fn compute_ema(values: &[f64], length: usize) -> Vec<Option<f64>> {
    let length = length.max(1);
    let filled = forward_fill(values);
    let seed_window: Vec<f64> = filled.iter().flatten().take(length).copied().collect();
    if seed_window.is_empty() {
        return vec![None; values.len()];
    }
    let mut prev = window_mean(&seed_window);
    filled
        .iter()
        .map(|slot| {
            let v = (*slot)?;
            prev = ema_next(prev, v, length);
            Some(prev)
        })
        .collect()
}

// ---------- oscillator helpers ----------------------------------------------

/// Rolling min-max normalization to [0, 100]. A flat window maps to 50.
pub fn normalize_oscillator(values: &[f64], lookback: usize) -> Vec<Option<f64>> {
    let filled = forward_fill(values);
    if lookback == 0 {
        return filled;
    }
    let mut available: Vec<f64> = Vec::with_capacity(values.len());
    filled
        .iter()
        .map(|slot| {
            let v = (*slot)?;
            available.push(v);
            if available.len() < lookback {
                return None;
            }
            Some(normalize_window(&available[available.len() - lookback..], v))
        })
        .collect()
}

/// Newest normalized value; equals the last element of [`normalize_oscillator`].
pub fn normalize_last(values: &[f64], lookback: usize) -> Option<f64> {
    let window = filled_tail(values, lookback.max(1))?;
    let newest = *window.last()?;
    if lookback == 0 {
        return Some(newest);
    }
    Some(normalize_window(&window, newest))
}

fn normalize_window(window: &[f64], v: f64) -> f64 {
    let (min, max) = window
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| {
            (lo.min(x), hi.max(x))
        });
    let span = max - min;
    if span <= f64::EPSILON {
        50.0
    } else {
        ((v - min) / span * 100.0).clamp(0.0, 100.0)
    }
}

/// Pointwise `a - b` where both sides are defined.
pub fn histogram(a: &[Option<f64>], b: &[Option<f64>]) -> Vec<Option<f64>> {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| match (x, y) {
            (Some(x), Some(y)) => Some(x - y),
            _ => None,
        })
        .collect()
}

/// Pair values with their bar times, omitting undefined samples.
pub fn to_points(times: &[TimeKey], values: &[Option<f64>]) -> Vec<IndicatorPoint> {
    times
        .iter()
        .zip(values.iter())
        .filter_map(|(t, v)| v.map(|v| IndicatorPoint::new(*t, v)))
        .collect()
}

fn values_of(points: &[IndicatorPoint]) -> Vec<f64> {
    points.iter().map(|p| p.value).collect()
}

fn times_of(points: &[IndicatorPoint]) -> Vec<TimeKey> {
    points.iter().map(|p| p.time).collect()
}

/// Replace the newest point when the key matches, append when newer.
/// Returns `false` for an older point, which is ignored.
pub fn upsert_last(series: &mut Vec<IndicatorPoint>, point: IndicatorPoint) -> bool {
    match series.last_mut() {
        Some(last) if last.time == point.time => {
            *last = point;
            true
        }
        Some(last) if last.time > point.time => false,
        _ => {
            series.push(point);
            true
        }
    }
}

// ---------- per-pane series -------------------------------------------------

/// Identifies one rendered series across the four panes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesSlot {
    Bars,
    PriceSma,
    PriceEma,
    OscA,
    OscASignal,
    OscB,
    OscBSignal,
    Histogram,
}

/// Newest-sample update applied on the live-refresh fast path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestSample {
    pub bar: Bar,
    pub indicator_a: Option<IndicatorPoint>,
    pub indicator_b: Option<IndicatorPoint>,
    pub histogram: Option<IndicatorPoint>,
}

/// Outcome of [`ChartSeries::patch_last`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    /// Series whose newest point changed in place or was appended.
    pub updated: Vec<SeriesSlot>,
    /// Series that had to be recomputed from scratch (seed window touched).
    pub rebuilt: Vec<SeriesSlot>,
}

/// Every series shown across the four panes, plus the raw source inputs
/// needed to patch them in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartSeries {
    pub params: IndicatorParams,
    pub bars: Vec<Bar>,
    pub price_sma: Vec<IndicatorPoint>,
    pub price_ema: Vec<IndicatorPoint>,
    /// True when oscillator A is the locally computed RSI of closes.
    pub osc_a_local: bool,
    pub osc_a: Vec<IndicatorPoint>,
    pub osc_a_signal: Vec<IndicatorPoint>,
    pub osc_b_raw: Vec<IndicatorPoint>,
    pub osc_b: Vec<IndicatorPoint>,
    pub osc_b_signal: Vec<IndicatorPoint>,
    pub histogram: Vec<IndicatorPoint>,
    rsi_checkpoint: Option<WilderRsi>,
}

impl ChartSeries {
    pub fn build(
        bars: Vec<Bar>,
        indicator_a: Vec<IndicatorPoint>,
        indicator_b: Vec<IndicatorPoint>,
        histogram: Vec<IndicatorPoint>,
        params: &IndicatorParams,
    ) -> Self {
        let times: Vec<TimeKey> = bars.iter().map(|b| b.time).collect();
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();

        let price_sma = to_points(&times, &compute_sma(&closes, params.price_sma));
        let price_ema = to_points(&times, &compute_ema(&closes, params.price_ema));

        let osc_a_local = indicator_a.is_empty();
        let (osc_a, rsi_checkpoint) = if osc_a_local {
            let rsi = compute_rsi(&closes, params.rsi_period);
            let points = times
                .iter()
                .zip(rsi)
                .map(|(t, v)| IndicatorPoint::new(*t, v))
                .collect();
            (points, Some(rsi_checkpoint(&closes, params.rsi_period)))
        } else {
            (indicator_a, None)
        };
        let osc_a_signal = signal_sma(&osc_a, params.signal_length);

        let osc_b = normalized_points(&indicator_b, params.normalize_lookback);
        let osc_b_signal = signal_ema(&osc_b, params.signal_length);

        Self {
            params: params.clone(),
            bars,
            price_sma,
            price_ema,
            osc_a_local,
            osc_a,
            osc_a_signal,
            osc_b_raw: indicator_b,
            osc_b,
            osc_b_signal,
            histogram,
            rsi_checkpoint,
        }
    }

    pub fn last_bar(&self) -> Option<&Bar> {
        self.bars.last()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn slot(&self, slot: SeriesSlot) -> &[IndicatorPoint] {
        match slot {
            SeriesSlot::Bars => &[],
            SeriesSlot::PriceSma => &self.price_sma,
            SeriesSlot::PriceEma => &self.price_ema,
            SeriesSlot::OscA => &self.osc_a,
            SeriesSlot::OscASignal => &self.osc_a_signal,
            SeriesSlot::OscB => &self.osc_b,
            SeriesSlot::OscBSignal => &self.osc_b_signal,
            SeriesSlot::Histogram => &self.histogram,
        }
    }

    /// Patch the newest bar (same time key) and the newest indicator samples.
    ///
    /// Callers check the time-key precondition; a sample for a different bar
    /// is rejected with `None` and nothing is modified.
    pub fn patch_last(&mut self, latest: &LatestSample) -> Option<PatchReport> {
        let last = self.bars.last_mut()?;
        if last.time != latest.bar.time {
            return None;
        }
        *last = latest.bar;

        let mut report = PatchReport::default();
        report.updated.push(SeriesSlot::Bars);
        let closes = self.closes();
        let n = closes.len();

        if let Some(v) = sma_last(&closes, self.params.price_sma) {
            upsert_last(&mut self.price_sma, IndicatorPoint::new(latest.bar.time, v));
            report.updated.push(SeriesSlot::PriceSma);
        }

        let ema_len = self.params.price_ema.max(1);
        match (n > ema_len, self.price_ema.len() >= 2) {
            (true, true) => {
                let prev = self.price_ema[self.price_ema.len() - 2].value;
                let v = ema_next(prev, latest.bar.close, ema_len);
                upsert_last(&mut self.price_ema, IndicatorPoint::new(latest.bar.time, v));
                report.updated.push(SeriesSlot::PriceEma);
            }
            _ => {
                let times: Vec<TimeKey> = self.bars.iter().map(|b| b.time).collect();
                self.price_ema = to_points(&times, &compute_ema(&closes, ema_len));
                report.rebuilt.push(SeriesSlot::PriceEma);
            }
        }

        let osc_a_changed = if self.osc_a_local {
            self.patch_local_rsi(&closes, &mut report)
        } else if let Some(p) = latest.indicator_a {
            let changed = upsert_last(&mut self.osc_a, p);
            if changed {
                report.updated.push(SeriesSlot::OscA);
            }
            changed
        } else {
            false
        };
        if osc_a_changed {
            let values = values_of(&self.osc_a);
            if let (Some(v), Some(last)) = (
                sma_last(&values, self.params.signal_length),
                self.osc_a.last(),
            ) {
                upsert_last(&mut self.osc_a_signal, IndicatorPoint::new(last.time, v));
                report.updated.push(SeriesSlot::OscASignal);
            }
        }

        if let Some(p) = latest.indicator_b {
            if upsert_last(&mut self.osc_b_raw, p) {
                self.patch_osc_b(p.time, &mut report);
            }
        }

        if let Some(p) = latest.histogram {
            if upsert_last(&mut self.histogram, p) {
                report.updated.push(SeriesSlot::Histogram);
            }
        }

        Some(report)
    }

    fn patch_local_rsi(&mut self, closes: &[f64], report: &mut PatchReport) -> bool {
        let n = closes.len();
        let checkpoint = match (&self.rsi_checkpoint, n >= 3) {
            (Some(c), true) => c.clone(),
            _ => {
                self.rebuild_local_rsi(closes);
                report.rebuilt.push(SeriesSlot::OscA);
                return true;
            }
        };
        let mut engine = checkpoint;
        let prev = self.osc_a.get(n.saturating_sub(2)).map(|p| p.value);
        let value = engine.next(closes[n - 1]).or(prev).unwrap_or(50.0);
        let time = self.bars[n - 1].time;
        upsert_last(&mut self.osc_a, IndicatorPoint::new(time, value));
        report.updated.push(SeriesSlot::OscA);
        true
    }

    fn rebuild_local_rsi(&mut self, closes: &[f64]) {
        let rsi = compute_rsi(closes, self.params.rsi_period);
        self.osc_a = self
            .bars
            .iter()
            .zip(rsi)
            .map(|(b, v)| IndicatorPoint::new(b.time, v))
            .collect();
        self.rsi_checkpoint = Some(rsi_checkpoint(closes, self.params.rsi_period));
    }

    fn patch_osc_b(&mut self, time: TimeKey, report: &mut PatchReport) {
        let raw = values_of(&self.osc_b_raw);
        let Some(v) = normalize_last(&raw, self.params.normalize_lookback) else {
            return;
        };
        let before = self.osc_b.len();
        upsert_last(&mut self.osc_b, IndicatorPoint::new(time, v));
        report.updated.push(SeriesSlot::OscB);

        let len = self.params.signal_length.max(1);
        let appended = self.osc_b.len() > before;
        let signal_ready = self.osc_b.len() > len
            && self.osc_b_signal.len() == self.osc_b.len() - usize::from(appended);
        if signal_ready {
            let prev_idx = self.osc_b.len() - 2;
            let prev = self.osc_b_signal[prev_idx].value;
            let next = ema_next(prev, v, len);
            upsert_last(&mut self.osc_b_signal, IndicatorPoint::new(time, next));
            report.updated.push(SeriesSlot::OscBSignal);
        } else {
            self.osc_b_signal = signal_ema(&self.osc_b, len);
            report.rebuilt.push(SeriesSlot::OscBSignal);
        }
    }
}

fn rsi_checkpoint(closes: &[f64], period: usize) -> WilderRsi {
    let mut engine = WilderRsi::new(period);
    let head = closes.len().saturating_sub(1);
    for &c in &closes[..head] {
        engine.next(c);
    }
    engine
}

fn signal_sma(source: &[IndicatorPoint], length: usize) -> Vec<IndicatorPoint> {
    to_points(&times_of(source), &compute_sma(&values_of(source), length))
}

fn signal_ema(source: &[IndicatorPoint], length: usize) -> Vec<IndicatorPoint> {
    to_points(&times_of(source), &compute_ema(&values_of(source), length))
}

fn normalized_points(raw: &[IndicatorPoint], lookback: usize) -> Vec<IndicatorPoint> {
    to_points(&times_of(raw), &normalize_oscillator(&values_of(raw), lookback))
}
