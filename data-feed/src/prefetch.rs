use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::{abortable, AbortHandle};
use futures::task::{LocalSpawn, LocalSpawnExt};
use tracing::{debug, warn};
use ts_core::Interval;

use crate::cache::DataCache;
use crate::source::ChartDataSource;
use crate::ChartRequest;

const M1: Interval = Interval::Minutes(1);
const M5: Interval = Interval::Minutes(5);
const M15: Interval = Interval::Minutes(15);
const H1: Interval = Interval::Hours(1);
const H4: Interval = Interval::Hours(4);
const D1: Interval = Interval::Days(1);
const W1: Interval = Interval::Weeks(1);
const MO1: Interval = Interval::Months(1);

/// Intervals worth warming when `interval` is on screen.
pub fn related_intervals(interval: Interval) -> &'static [Interval] {
    match interval {
        Interval::Minutes(1) => &[M5],
        Interval::Minutes(5) => &[M1, M15],
        Interval::Minutes(15) => &[M5, H1],
        Interval::Minutes(30) => &[M15, H1],
        Interval::Hours(1) => &[M15, H4],
        Interval::Hours(4) => &[H1, D1],
        Interval::Days(1) => &[H4, W1],
        Interval::Weeks(1) => &[D1, MO1],
        Interval::Months(1) => &[W1],
        _ => &[],
    }
}

/// Previous and next watchlist entries around `ticker`.
pub fn neighbor_tickers(watchlist: &[String], ticker: &str) -> Vec<String> {
    let ticker = crate::normalize_ticker(ticker);
    let Some(pos) = watchlist
        .iter()
        .position(|t| crate::normalize_ticker(t) == ticker)
    else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(2);
    if pos > 0 {
        out.push(crate::normalize_ticker(&watchlist[pos - 1]));
    }
    if let Some(next) = watchlist.get(pos + 1) {
        out.push(crate::normalize_ticker(next));
    }
    out.retain(|t| *t != ticker);
    out.dedup();
    out
}

/// Requests to warm after `current` has loaded.
pub fn plan_prefetch(current: &ChartRequest, watchlist: &[String]) -> Vec<ChartRequest> {
    let related = related_intervals(current.interval)
        .iter()
        .map(|iv| ChartRequest::new(&current.ticker, *iv, current.params.clone()));
    let neighbors = neighbor_tickers(watchlist, &current.ticker)
        .into_iter()
        .map(|t| ChartRequest::new(t, current.interval, current.params.clone()));
    related.chain(neighbors).collect()
}

/// Best-effort background fetches that only populate the cache.
pub struct Prefetcher {
    cache: DataCache,
    source: Rc<dyn ChartDataSource>,
    spawner: Rc<dyn LocalSpawn>,
    tasks: Rc<RefCell<HashMap<u64, AbortHandle>>>,
    next_id: Cell<u64>,
}

impl Prefetcher {
    pub fn new(
        cache: DataCache,
        source: Rc<dyn ChartDataSource>,
        spawner: Rc<dyn LocalSpawn>,
    ) -> Self {
        Self {
            cache,
            source,
            spawner,
            tasks: Rc::new(RefCell::new(HashMap::new())),
            next_id: Cell::new(0),
        }
    }

    /// Number of prefetches not yet finished or aborted.
    pub fn pending(&self) -> usize {
        self.tasks.borrow().len()
    }

    /// Spawn a fetch for every request not already cached or in flight.
    pub fn schedule(&self, requests: Vec<ChartRequest>) -> usize {
        let mut spawned = 0;
        for request in requests {
            let key = request.cache_key();
            if self.cache.has_cached(&key) || self.cache.is_in_flight(&key) {
                continue;
            }
            let id = self.next_id.get();
            self.next_id.set(id + 1);

            let cache = self.cache.clone();
            let source = self.source.clone();
            let (task, handle) = abortable(async move {
                let label = key.to_string();
                let result = cache
                    .get_or_fetch(key, false, move || async move {
                        source.fetch_chart_data(&request).await
                    })
                    .await;
                match result {
                    Ok(_) => debug!(key = %label, "prefetch stored"),
                    Err(err) => debug!(key = %label, error = %err, "prefetch failed"),
                }
            });

            let tasks = Rc::downgrade(&self.tasks);
            let wrapped = async move {
                let _ = task.await;
                if let Some(tasks) = tasks.upgrade() {
                    tasks.borrow_mut().remove(&id);
                }
            };
            self.tasks.borrow_mut().insert(id, handle);
            match self.spawner.spawn_local(wrapped) {
                Ok(()) => spawned += 1,
                Err(err) => {
                    warn!(error = ?err, "prefetch spawn failed");
                    self.tasks.borrow_mut().remove(&id);
                }
            }
        }
        spawned
    }

    /// Cancel every outstanding prefetch.
    pub fn abort_all(&self) {
        let handles: Vec<AbortHandle> = self.tasks.borrow_mut().drain().map(|(_, h)| h).collect();
        if !handles.is_empty() {
            debug!(count = handles.len(), "aborting prefetches");
        }
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        self.abort_all();
    }
}
