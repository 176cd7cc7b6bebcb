use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use async_trait::async_trait;
use ts_core::Interval;

use crate::error::FetchError;
use crate::payload::{ChartPayload, LatestPayload};
use crate::ChartRequest;

/// Remote chart data provider.
#[async_trait(?Send)]
pub trait ChartDataSource {
    async fn fetch_chart_data(&self, request: &ChartRequest) -> Result<ChartPayload, FetchError>;

    async fn fetch_latest_chart_data(
        &self,
        request: &ChartRequest,
    ) -> Result<LatestPayload, FetchError>;
}

/// In-memory provider for offline hosts and tests. Unknown series report `NoData`.
#[derive(Default)]
pub struct StaticDataSource {
    charts: RefCell<HashMap<(String, Interval), ChartPayload>>,
    latest: RefCell<HashMap<(String, Interval), LatestPayload>>,
    failure: RefCell<Option<FetchError>>,
    chart_calls: Cell<usize>,
    latest_calls: Cell<usize>,
}

impl StaticDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_chart(&self, ticker: &str, interval: Interval, payload: ChartPayload) {
        self.charts
            .borrow_mut()
            .insert((crate::normalize_ticker(ticker), interval), payload);
    }

    pub fn insert_latest(&self, ticker: &str, interval: Interval, latest: LatestPayload) {
        self.latest
            .borrow_mut()
            .insert((crate::normalize_ticker(ticker), interval), latest);
    }

    /// Make every following call fail with `err` until cleared with `None`.
    pub fn set_failure(&self, err: Option<FetchError>) {
        *self.failure.borrow_mut() = err;
    }

    pub fn chart_calls(&self) -> usize {
        self.chart_calls.get()
    }

    pub fn latest_calls(&self) -> usize {
        self.latest_calls.get()
    }
}

#[async_trait(?Send)]
impl ChartDataSource for StaticDataSource {
    async fn fetch_chart_data(&self, request: &ChartRequest) -> Result<ChartPayload, FetchError> {
        self.chart_calls.set(self.chart_calls.get() + 1);
        if let Some(err) = self.failure.borrow().clone() {
            return Err(err);
        }
        self.charts
            .borrow()
            .get(&(request.ticker.clone(), request.interval))
            .cloned()
            .ok_or(FetchError::NoData)
    }

    async fn fetch_latest_chart_data(
        &self,
        request: &ChartRequest,
    ) -> Result<LatestPayload, FetchError> {
        self.latest_calls.set(self.latest_calls.get() + 1);
        if let Some(err) = self.failure.borrow().clone() {
            return Err(err);
        }
        self.latest
            .borrow()
            .get(&(request.ticker.clone(), request.interval))
            .copied()
            .ok_or(FetchError::NoData)
    }
}

#[cfg(target_arch = "wasm32")]
mod http {
    use gloo_net::http::{Request, Response};

    use super::*;
    use crate::payload::{parse_chart_payload, parse_latest_payload};

    /// Fetch-based provider for `<base>/chart` and `<base>/chart/latest`.
    #[derive(Debug, Clone)]
    pub struct HttpDataSource {
        base_url: String,
    }

    impl HttpDataSource {
        pub fn new(base_url: impl Into<String>) -> Self {
            let base_url: String = base_url.into();
            Self {
                base_url: base_url.trim_end_matches('/').to_string(),
            }
        }

        fn query(request: &ChartRequest) -> Vec<(&'static str, String)> {
            let p = &request.params;
            let mut query = vec![
                ("ticker", request.ticker.clone()),
                ("interval", request.interval.name()),
                ("rsi_period", p.rsi_period.to_string()),
                ("signal_length", p.signal_length.to_string()),
                ("normalize_lookback", p.normalize_lookback.to_string()),
            ];
            if request.refresh {
                query.push(("refresh", "1".to_string()));
            }
            query
        }

        async fn get_text(&self, path: &str, request: &ChartRequest) -> Result<String, FetchError> {
            let url = format!("{}{}", self.base_url, path);
            let query = Self::query(request);
            let resp: Response = Request::get(&url)
                .query(query.iter().map(|(k, v)| (*k, v.as_str())))
                .send()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            match resp.status() {
                200..=299 => resp
                    .text()
                    .await
                    .map_err(|e| FetchError::Network(e.to_string())),
                404 => Err(FetchError::NoData),
                status => Err(FetchError::Network(format!("HTTP {status} from {url}"))),
            }
        }
    }

    #[async_trait(?Send)]
    impl ChartDataSource for HttpDataSource {
        async fn fetch_chart_data(
            &self,
            request: &ChartRequest,
        ) -> Result<ChartPayload, FetchError> {
            let body = self.get_text("/chart", request).await?;
            Ok(parse_chart_payload(&body)?)
        }

        async fn fetch_latest_chart_data(
            &self,
            request: &ChartRequest,
        ) -> Result<LatestPayload, FetchError> {
            let body = self.get_text("/chart/latest", request).await?;
            Ok(parse_latest_payload(&body)?)
        }
    }
}

#[cfg(target_arch = "wasm32")]
pub use http::HttpDataSource;
