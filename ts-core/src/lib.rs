use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::cmp::Ordering;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use thiserror::Error;

/// Number of seconds in common units.
pub const MINUTE_SECS: i64 = 60;
pub const HOUR_SECS: i64 = 60 * MINUTE_SECS;
pub const DAY_SECS: i64 = 24 * HOUR_SECS;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeKeyError {
    #[error("unrecognized calendar time: {0}")]
    InvalidCalendar(String),
    #[error("time {0} is outside the representable range")]
    OutOfRange(i64),
    #[error("sample at {next} is older than the last sample at {last}")]
    OutOfOrder { last: i64, next: i64 },
}

/// Normalized ordering key: seconds since the Unix epoch.
///
/// Bars arrive either with integer epoch seconds (intraday feeds) or with an
/// ISO calendar day (daily and slower feeds); both collapse to a `TimeKey` so
/// every comparison in the engine uses one ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimeKey(pub i64);

impl TimeKey {
    pub fn from_secs(secs: i64) -> Self {
        TimeKey(secs)
    }

    pub fn secs(self) -> i64 {
        self.0
    }

    pub fn offset(self, secs: i64) -> Self {
        TimeKey(self.0.saturating_add(secs))
    }

    /// Parse an ISO calendar day (`2024-03-01`) or a full RFC 3339 timestamp.
    pub fn parse_calendar(s: &str) -> Result<Self, TimeKeyError> {
        let trimmed = s.trim();
        if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            let dt = day
                .and_hms_opt(0, 0, 0)
                .ok_or_else(|| TimeKeyError::InvalidCalendar(s.to_string()))?;
            return Ok(TimeKey(dt.and_utc().timestamp()));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
            return Ok(TimeKey(dt.timestamp()));
        }
        Err(TimeKeyError::InvalidCalendar(s.to_string()))
    }

    pub fn to_datetime(self) -> Result<DateTime<Utc>, TimeKeyError> {
        Utc.timestamp_opt(self.0, 0)
            .single()
            .ok_or(TimeKeyError::OutOfRange(self.0))
    }

    /// Short human label: calendar day for daily-or-slower charts, day + minute otherwise.
    pub fn label(self, intraday: bool) -> String {
        match self.to_datetime() {
            Ok(dt) if intraday => dt.format("%Y-%m-%d %H:%M").to_string(),
            Ok(dt) => dt.format("%Y-%m-%d").to_string(),
            Err(_) => self.0.to_string(),
        }
    }
}

impl fmt::Display for TimeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bar time as delivered by the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BarTime {
    Epoch(i64),
    Calendar(String),
}

impl BarTime {
    pub fn key(&self) -> Result<TimeKey, TimeKeyError> {
        match self {
            BarTime::Epoch(secs) => Ok(TimeKey(*secs)),
            BarTime::Calendar(s) => TimeKey::parse_calendar(s),
        }
    }
}

impl From<TimeKey> for BarTime {
    fn from(key: TimeKey) -> Self {
        BarTime::Epoch(key.0)
    }
}

/// Chart interval enum covering the granularities the dashboard offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    Minutes(u32),
    Hours(u32),
    Days(u32),
    Weeks(u32),
    Months(u32),
}

impl Interval {
    /// Duration in seconds (months approximated as 30 days).
    pub fn duration_secs(&self) -> i64 {
        match *self {
            Interval::Minutes(m) => m as i64 * MINUTE_SECS,
            Interval::Hours(h) => h as i64 * HOUR_SECS,
            Interval::Days(d) => d as i64 * DAY_SECS,
            Interval::Weeks(w) => w as i64 * 7 * DAY_SECS,
            Interval::Months(m) => m as i64 * 30 * DAY_SECS,
        }
    }

    pub fn is_intraday(&self) -> bool {
        self.duration_secs() < DAY_SECS
    }

    /// Name used in URLs, cache keys and storage keys.
    pub fn name(&self) -> String {
        match *self {
            Interval::Minutes(m) => format!("{m}m"),
            Interval::Hours(h) => format!("{h}h"),
            Interval::Days(d) => format!("{d}d"),
            Interval::Weeks(w) => format!("{w}w"),
            Interval::Months(m) => format!("{m}M"),
        }
    }

    /// Parse e.g. "1m", "5m", "15m", "30m", "1h", "4h", "1d", "1w", "1M".
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "1m" | "1min" => Some(Interval::Minutes(1)),
            "5m" | "5min" => Some(Interval::Minutes(5)),
            "15m" | "15min" => Some(Interval::Minutes(15)),
            "30m" | "30min" => Some(Interval::Minutes(30)),
            "1h" | "60m" | "60min" => Some(Interval::Hours(1)),
            "4h" => Some(Interval::Hours(4)),
            "1d" | "D" | "daily" => Some(Interval::Days(1)),
            "1w" | "W" | "weekly" => Some(Interval::Weeks(1)),
            "1M" | "1mo" | "monthly" => Some(Interval::Months(1)),
            _ => None,
        }
    }

    /// All intervals offered by the interval picker, fastest first.
    pub fn all() -> &'static [Interval] {
        &[
            Interval::Minutes(1),
            Interval::Minutes(5),
            Interval::Minutes(15),
            Interval::Minutes(30),
            Interval::Hours(1),
            Interval::Hours(4),
            Interval::Days(1),
            Interval::Weeks(1),
            Interval::Months(1),
        ]
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::parse(s).ok_or_else(|| format!("invalid interval: {s}"))
    }
}

impl TryFrom<String> for Interval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: TimeKey,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// One indicator sample. Samples without a defined value are omitted, never zero-filled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IndicatorPoint {
    pub time: TimeKey,
    pub value: f64,
}

impl IndicatorPoint {
    pub fn new(time: TimeKey, value: f64) -> Self {
        Self { time, value }
    }
}

pub trait HasTimeKey {
    fn time_key(&self) -> TimeKey;
}

impl HasTimeKey for Bar {
    fn time_key(&self) -> TimeKey {
        self.time
    }
}

impl HasTimeKey for IndicatorPoint {
    fn time_key(&self) -> TimeKey {
        self.time
    }
}

/// Append-only time-series with binary-searchable keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeries<T> {
    data: Vec<T>,
}

impl<T> Default for TimeSeries<T> {
    fn default() -> Self {
        Self { data: Vec::new() }
    }
}

impl<T: HasTimeKey> TimeSeries<T> {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Build from an arbitrary batch; samples are stably sorted by key.
    pub fn from_unsorted(mut batch: Vec<T>) -> Self {
        batch.sort_by_key(|s| s.time_key());
        Self { data: batch }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn first(&self) -> Option<&T> {
        self.data.first()
    }

    pub fn last(&self) -> Option<&T> {
        self.data.last()
    }

    pub fn get(&self, idx: usize) -> Option<&T> {
        self.data.get(idx)
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.data.iter()
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    pub fn append(&mut self, sample: T) -> Result<(), TimeKeyError> {
        if let Some(last) = self.data.last() {
            let (last, next) = (last.time_key(), sample.time_key());
            if next < last {
                return Err(TimeKeyError::OutOfOrder {
                    last: last.0,
                    next: next.0,
                });
            }
        }
        self.data.push(sample);
        Ok(())
    }

    /// Swap the newest sample in place, returning the previous one.
    pub fn replace_last(&mut self, sample: T) -> Option<T> {
        let slot = self.data.last_mut()?;
        Some(std::mem::replace(slot, sample))
    }

    /// Index of the sample whose key equals `key` exactly.
    pub fn position_of(&self, key: TimeKey) -> Option<usize> {
        let idx = self.lower_bound(key);
        match self.data.get(idx) {
            Some(s) if s.time_key() == key => Some(idx),
            _ => None,
        }
    }

    /// Index of the newest sample at or before `key`.
    pub fn index_at_or_before(&self, key: TimeKey) -> Option<usize> {
        let upper = self.upper_bound(key);
        upper.checked_sub(1)
    }

    pub fn at_or_before(&self, key: TimeKey) -> Option<&T> {
        self.index_at_or_before(key).and_then(|i| self.data.get(i))
    }

    /// Samples whose keys are in [start, end).
    pub fn range(&self, start: TimeKey, end: TimeKey) -> &[T] {
        let start_idx = self.lower_bound(start);
        let end_idx = self.lower_bound(end).max(start_idx);
        &self.data[start_idx..end_idx]
    }

    fn lower_bound(&self, key: TimeKey) -> usize {
        let mut left = 0usize;
        let mut right = self.data.len();
        while left < right {
            let mid = (left + right) / 2;
            match self.data[mid].time_key().cmp(&key) {
                Ordering::Less => left = mid + 1,
                Ordering::Equal | Ordering::Greater => right = mid,
            }
        }
        left
    }

    fn upper_bound(&self, key: TimeKey) -> usize {
        let mut left = 0usize;
        let mut right = self.data.len();
        while left < right {
            let mid = (left + right) / 2;
            match self.data[mid].time_key().cmp(&key) {
                Ordering::Less | Ordering::Equal => left = mid + 1,
                Ordering::Greater => right = mid,
            }
        }
        left
    }
}

impl<T: HasTimeKey> FromIterator<T> for TimeSeries<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from_unsorted(iter.into_iter().collect())
    }
}

/// A pane's visible window in bar-index space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogicalRange {
    pub from: f64,
    pub to: f64,
}

impl LogicalRange {
    pub fn new(from: f64, to: f64) -> Self {
        Self { from, to }
    }

    pub fn span(&self) -> f64 {
        self.to - self.from
    }

    pub fn is_valid(&self) -> bool {
        self.from.is_finite() && self.to.is_finite() && self.to >= self.from
    }

    pub fn approx_eq(&self, other: &LogicalRange, tolerance: f64) -> bool {
        (self.from - other.from).abs() <= tolerance && (self.to - other.to).abs() <= tolerance
    }
}

/// Two-point oscillator trendline, anchored on indicator samples.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendlineDefinition {
    pub time1: TimeKey,
    pub value1: f64,
    pub time2: TimeKey,
    pub value2: f64,
}

/// Wall-clock source in milliseconds.
pub trait Clock {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Settable clock shared between its clones.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<i64>>,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: Rc::new(Cell::new(start_ms)),
        }
    }

    pub fn set(&self, ms: i64) {
        self.now.set(ms);
    }

    pub fn advance(&self, ms: i64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.get()
    }
}
