//! Network boundary: raw JSON shapes and their validated forms.

use serde::{Deserialize, Serialize};
use ta_engine::{upsert_last, LatestSample};
use thiserror::Error;
use ts_core::{Bar, BarTime, IndicatorPoint, TimeKey, TimeKeyError};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PayloadError {
    #[error("response contains no bars")]
    NoBars,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("invalid time in {series}[{index}]: {source}")]
    BadTime {
        series: &'static str,
        index: usize,
        source: TimeKeyError,
    },
    #[error("non-finite OHLC values in bar {index}")]
    NonFiniteBar { index: usize },
    #[error("{series} not strictly increasing at index {index}")]
    Unordered { series: &'static str, index: usize },
    #[error("{series} point at {time} has no matching bar")]
    UnknownTime { series: &'static str, time: i64 },
    #[error("invalid JSON: {0}")]
    Json(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawBar {
    pub time: Option<BarTime>,
    pub open: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub close: Option<f64>,
    pub volume: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPoint {
    pub time: Option<BarTime>,
    /// `null` marks an undefined sample; it is dropped.
    pub value: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawChartPayload {
    pub bars: Option<Vec<RawBar>>,
    #[serde(alias = "indicatorSeriesA")]
    pub indicator_a: Option<Vec<RawPoint>>,
    #[serde(alias = "indicatorSeriesB")]
    pub indicator_b: Option<Vec<RawPoint>>,
    #[serde(alias = "histogramSeries")]
    pub histogram: Option<Vec<RawPoint>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLatestPayload {
    pub latest_bar: Option<RawBar>,
    pub latest_indicator_a: Option<RawPoint>,
    pub latest_indicator_b: Option<RawPoint>,
    pub latest_histogram: Option<RawPoint>,
}

/// Validated full chart response. Bars are strictly increasing and every
/// indicator point sits on a bar time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartPayload {
    pub bars: Vec<Bar>,
    #[serde(default)]
    pub indicator_a: Vec<IndicatorPoint>,
    #[serde(default)]
    pub indicator_b: Vec<IndicatorPoint>,
    #[serde(default)]
    pub histogram: Vec<IndicatorPoint>,
}

/// Validated latest-sample response used by live refresh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatestPayload {
    pub bar: Bar,
    pub indicator_a: Option<IndicatorPoint>,
    pub indicator_b: Option<IndicatorPoint>,
    pub histogram: Option<IndicatorPoint>,
}

fn convert_time(
    time: Option<&BarTime>,
    series: &'static str,
    index: usize,
) -> Result<TimeKey, PayloadError> {
    let time = time.ok_or(PayloadError::MissingField("time"))?;
    time.key()
        .map_err(|source| PayloadError::BadTime {
            series,
            index,
            source,
        })
}

fn convert_bar(raw: &RawBar, index: usize) -> Result<Bar, PayloadError> {
    let time = convert_time(raw.time.as_ref(), "bars", index)?;
    let field = |v: Option<f64>, name: &'static str| v.ok_or(PayloadError::MissingField(name));
    let bar = Bar {
        time,
        open: field(raw.open, "open")?,
        high: field(raw.high, "high")?,
        low: field(raw.low, "low")?,
        close: field(raw.close, "close")?,
        volume: raw.volume.unwrap_or(0.0),
    };
    if ![bar.open, bar.high, bar.low, bar.close]
        .iter()
        .all(|v| v.is_finite())
    {
        return Err(PayloadError::NonFiniteBar { index });
    }
    Ok(bar)
}

fn convert_point(
    raw: &RawPoint,
    series: &'static str,
    index: usize,
) -> Result<Option<IndicatorPoint>, PayloadError> {
    let time = convert_time(raw.time.as_ref(), series, index)?;
    Ok(raw
        .value
        .filter(|v| v.is_finite())
        .map(|v| IndicatorPoint::new(time, v)))
}

fn convert_points(
    raw: Option<&Vec<RawPoint>>,
    series: &'static str,
) -> Result<Vec<IndicatorPoint>, PayloadError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(raw.len());
    for (index, p) in raw.iter().enumerate() {
        if let Some(point) = convert_point(p, series, index)? {
            out.push(point);
        }
    }
    Ok(out)
}

impl TryFrom<RawChartPayload> for ChartPayload {
    type Error = PayloadError;

    fn try_from(raw: RawChartPayload) -> Result<Self, Self::Error> {
        let raw_bars = raw.bars.as_ref().ok_or(PayloadError::MissingField("bars"))?;
        let bars = raw_bars
            .iter()
            .enumerate()
            .map(|(i, b)| convert_bar(b, i))
            .collect::<Result<Vec<_>, _>>()?;
        let payload = ChartPayload {
            bars,
            indicator_a: convert_points(raw.indicator_a.as_ref(), "indicator_a")?,
            indicator_b: convert_points(raw.indicator_b.as_ref(), "indicator_b")?,
            histogram: convert_points(raw.histogram.as_ref(), "histogram")?,
        };
        payload.validate()?;
        Ok(payload)
    }
}

impl TryFrom<RawLatestPayload> for LatestPayload {
    type Error = PayloadError;

    fn try_from(raw: RawLatestPayload) -> Result<Self, Self::Error> {
        let bar = raw.latest_bar.as_ref().ok_or(PayloadError::MissingField("latestBar"))?;
        let bar = convert_bar(bar, 0)?;
        let point = |p: Option<&RawPoint>, series| match p {
            Some(p) => convert_point(p, series, 0),
            None => Ok(None),
        };
        Ok(LatestPayload {
            bar,
            indicator_a: point(raw.latest_indicator_a.as_ref(), "latest_indicator_a")?,
            indicator_b: point(raw.latest_indicator_b.as_ref(), "latest_indicator_b")?,
            histogram: point(raw.latest_histogram.as_ref(), "latest_histogram")?,
        })
    }
}

pub fn parse_chart_payload(json: &str) -> Result<ChartPayload, PayloadError> {
    let raw: RawChartPayload =
        serde_json::from_str(json).map_err(|e| PayloadError::Json(e.to_string()))?;
    raw.try_into()
}

pub fn parse_latest_payload(json: &str) -> Result<LatestPayload, PayloadError> {
    let raw: RawLatestPayload =
        serde_json::from_str(json).map_err(|e| PayloadError::Json(e.to_string()))?;
    raw.try_into()
}

fn check_points(
    bars: &[Bar],
    points: &[IndicatorPoint],
    series: &'static str,
) -> Result<(), PayloadError> {
    for (index, pair) in points.windows(2).enumerate() {
        if pair[1].time <= pair[0].time {
            return Err(PayloadError::Unordered {
                series,
                index: index + 1,
            });
        }
    }
    for p in points {
        if !p.value.is_finite() {
            return Err(PayloadError::MissingField("value"));
        }
        if bars.binary_search_by_key(&p.time, |b| b.time).is_err() {
            return Err(PayloadError::UnknownTime {
                series,
                time: p.time.secs(),
            });
        }
    }
    Ok(())
}

impl ChartPayload {
    /// Shape check shared by the network boundary and snapshot restore.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.bars.is_empty() {
            return Err(PayloadError::NoBars);
        }
        for (index, b) in self.bars.iter().enumerate() {
            if ![b.open, b.high, b.low, b.close].iter().all(|v| v.is_finite()) {
                return Err(PayloadError::NonFiniteBar { index });
            }
        }
        for (index, pair) in self.bars.windows(2).enumerate() {
            if pair[1].time <= pair[0].time {
                return Err(PayloadError::Unordered {
                    series: "bars",
                    index: index + 1,
                });
            }
        }
        check_points(&self.bars, &self.indicator_a, "indicator_a")?;
        check_points(&self.bars, &self.indicator_b, "indicator_b")?;
        check_points(&self.bars, &self.histogram, "histogram")?;
        Ok(())
    }

    pub fn last_time(&self) -> Option<TimeKey> {
        self.bars.last().map(|b| b.time)
    }

    /// Fold a latest sample for the open bar into this payload.
    /// Returns `false` (and changes nothing) when the sample is for another bar.
    pub fn apply_latest(&mut self, latest: &LatestPayload) -> bool {
        match self.bars.last_mut() {
            Some(last) if last.time == latest.bar.time => *last = latest.bar,
            _ => return false,
        }
        let series = [
            (&mut self.indicator_a, latest.indicator_a),
            (&mut self.indicator_b, latest.indicator_b),
            (&mut self.histogram, latest.histogram),
        ];
        for (points, point) in series {
            if let Some(p) = point {
                upsert_last(points, p);
            }
        }
        true
    }
}

impl LatestPayload {
    pub fn to_sample(&self) -> LatestSample {
        LatestSample {
            bar: self.bar,
            indicator_a: self.indicator_a,
            indicator_b: self.indicator_b,
            histogram: self.histogram,
        }
    }
}
