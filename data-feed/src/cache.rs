use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::rc::{Rc, Weak};

use app_shell::{save_versioned, KeyValueStorage, StorageError, StorageKeys, Versioned};
use futures::future::{FutureExt, LocalBoxFuture, Shared, WeakShared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use ts_core::Clock;

use crate::config::CacheConfig;
use crate::error::FetchError;
use crate::memory::MemoryCache;
use crate::payload::ChartPayload;
use crate::CacheKey;

pub type FetchResult = Result<Rc<ChartPayload>, FetchError>;
type SharedFetch = Shared<LocalBoxFuture<'static, FetchResult>>;

/// In-flight identity: a forced refresh never joins a plain load and vice versa.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlightKey {
    key: CacheKey,
    refresh: bool,
}

struct InFlight {
    id: u64,
    future: WeakShared<LocalBoxFuture<'static, FetchResult>>,
}

/// Snapshot row: one cache entry with its own schema tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    v: u32,
    key: CacheKey,
    updated_at_ms: i64,
    payload: ChartPayload,
}

struct CacheInner {
    config: CacheConfig,
    memory: RefCell<MemoryCache<CacheKey, Rc<ChartPayload>>>,
    in_flight: RefCell<HashMap<FlightKey, InFlight>>,
    next_flight_id: Cell<u64>,
    persist_due_ms: Cell<Option<i64>>,
    storage: Rc<dyn KeyValueStorage>,
    storage_key: String,
    clock: Rc<dyn Clock>,
}

/// Removes the in-flight marker when the shared fetch finishes or is dropped.
struct FlightGuard {
    cache: Weak<CacheInner>,
    key: FlightKey,
    id: u64,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let Some(inner) = self.cache.upgrade() else {
            return;
        };
        let removed = {
            let mut flights = inner.in_flight.borrow_mut();
            match flights.get(&self.key) {
                Some(f) if f.id == self.id => flights.remove(&self.key),
                _ => None,
            }
        };
        if removed.is_some() {
            debug!(key = %self.key.key, "in-flight marker released");
        }
    }
}

/// Chart payload cache: TTL/LRU memory tier, request de-duplication and a
/// debounced storage snapshot. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DataCache {
    inner: Rc<CacheInner>,
}

impl DataCache {
    pub fn new(
        config: CacheConfig,
        storage: Rc<dyn KeyValueStorage>,
        keys: &StorageKeys,
        clock: Rc<dyn Clock>,
    ) -> Self {
        let memory = MemoryCache::new(config.ttl_ms, config.max_entries);
        Self {
            inner: Rc::new(CacheInner {
                config,
                memory: RefCell::new(memory),
                in_flight: RefCell::new(HashMap::new()),
                next_flight_id: Cell::new(0),
                persist_due_ms: Cell::new(None),
                storage,
                storage_key: keys.cache(),
                clock,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn now_ms(&self) -> i64 {
        self.inner.clock.now_ms()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Rc<ChartPayload>> {
        let now = self.now_ms();
        self.inner.memory.borrow_mut().get(key, now)
    }

    /// Fresh entry present, without bumping recency.
    pub fn has_cached(&self, key: &CacheKey) -> bool {
        let now = self.now_ms();
        self.inner.memory.borrow().contains(key, now)
    }

    pub fn set(&self, key: CacheKey, payload: Rc<ChartPayload>) {
        let now = self.now_ms();
        let evicted = self.inner.memory.borrow_mut().set(key.clone(), payload, now);
        for old in &evicted {
            debug!(key = %old, "cache entry evicted");
        }
        debug!(%key, "cache entry stored");
        self.inner
            .persist_due_ms
            .set(Some(now + self.inner.config.persist_debounce_ms));
    }

    pub fn remove(&self, key: &CacheKey) {
        self.inner.memory.borrow_mut().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.memory.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner
            .in_flight
            .borrow()
            .keys()
            .any(|f| &f.key == key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.borrow().len()
    }

    /// Cached payload, or the result of one shared fetch.
    ///
    /// Concurrent callers for the same key (and refresh flag) await the same
    /// pending result; `fetcher` runs only for the first of them. A success
    /// is written to the cache before the in-flight marker is released.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: CacheKey,
        refresh: bool,
        fetcher: F,
    ) -> FetchResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ChartPayload, FetchError>> + 'static,
    {
        if !refresh {
            if let Some(hit) = self.get(&key) {
                debug!(%key, "cache hit");
                return Ok(hit);
            }
        }
        let shared = self.join_or_start(FlightKey { key, refresh }, fetcher);
        shared.await
    }

    fn join_or_start<F, Fut>(&self, flight: FlightKey, fetcher: F) -> SharedFetch
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ChartPayload, FetchError>> + 'static,
    {
        let existing = self
            .inner
            .in_flight
            .borrow()
            .get(&flight)
            .and_then(|f| f.future.upgrade());
        if let Some(shared) = existing {
            debug!(key = %flight.key, "joining in-flight fetch");
            return shared;
        }

        let id = self.inner.next_flight_id.get();
        self.inner.next_flight_id.set(id + 1);
        let guard = FlightGuard {
            cache: Rc::downgrade(&self.inner),
            key: flight.clone(),
            id,
        };
        let weak = Rc::downgrade(&self.inner);
        let key = flight.key.clone();
        let pending = fetcher();
        let task = async move {
            let _guard = guard;
            let result = pending.await.map(Rc::new);
            match (&result, weak.upgrade()) {
                (Ok(payload), Some(inner)) => {
                    DataCache { inner }.set(key, payload.clone());
                }
                (Err(err), _) => debug!(%key, error = %err, "fetch failed"),
                _ => {}
            }
            result
        }
        .boxed_local()
        .shared();

        if let Some(weak_shared) = task.downgrade() {
            self.inner.in_flight.borrow_mut().insert(
                flight,
                InFlight {
                    id,
                    future: weak_shared,
                },
            );
        }
        task
    }

    /// Write the snapshot if the debounce deadline has passed.
    pub fn poll_persist(&self) -> bool {
        match self.inner.persist_due_ms.get() {
            Some(due) if self.now_ms() >= due => {
                self.persist_now();
                true
            }
            _ => false,
        }
    }

    /// Serialize the newest entries, bounded by count and byte budget.
    pub fn persist_now(&self) -> usize {
        self.inner.persist_due_ms.set(None);
        let cfg = &self.inner.config;
        let rows = {
            let memory = self.inner.memory.borrow();
            let mut rows = Vec::new();
            let mut bytes = 0usize;
            for (key, payload, updated_at_ms) in memory.iter_newest_first() {
                if rows.len() >= cfg.persist_max_entries {
                    break;
                }
                let entry = PersistedEntry {
                    v: cfg.schema_version,
                    key: key.clone(),
                    updated_at_ms,
                    payload: payload.as_ref().clone(),
                };
                let value = match serde_json::to_value(&entry) {
                    Ok(v) => v,
                    Err(err) => {
                        warn!(%key, error = %err, "skipping unserializable cache entry");
                        continue;
                    }
                };
                let size = value.to_string().len();
                if bytes + size > cfg.persist_max_bytes {
                    break;
                }
                bytes += size;
                rows.push(value);
            }
            rows
        };
        self.write_snapshot(rows)
    }

    fn write_snapshot(&self, mut rows: Vec<serde_json::Value>) -> usize {
        let storage = self.inner.storage.as_ref();
        let key = &self.inner.storage_key;
        let version = self.inner.config.schema_version;
        loop {
            match save_versioned(storage, key, version, self.now_ms(), &rows) {
                Ok(bytes) => {
                    debug!(entries = rows.len(), bytes, "cache snapshot written");
                    return rows.len();
                }
                Err(StorageError::Write(reason)) if !rows.is_empty() => {
                    warn!(entries = rows.len(), %reason, "snapshot write failed, shrinking");
                    rows.truncate(rows.len() / 2);
                }
                Err(err) => {
                    warn!(error = %err, "cache snapshot not written");
                    return 0;
                }
            }
        }
    }

    /// Load the snapshot, dropping each entry that fails shape, version or
    /// freshness checks on its own. Returns the number restored.
    pub fn restore(&self) -> usize {
        let raw = match self.inner.storage.get_item(&self.inner.storage_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(err) => {
                warn!(error = %err, "cache snapshot unreadable");
                return 0;
            }
        };
        let envelope: Versioned<Vec<serde_json::Value>> = match serde_json::from_str(&raw) {
            Ok(env) => env,
            Err(err) => {
                warn!(error = %err, "discarding corrupt cache snapshot");
                return 0;
            }
        };

        let now = self.now_ms();
        let version = self.inner.config.schema_version;
        let mut memory = self.inner.memory.borrow_mut();
        let mut restored = 0usize;
        let mut dropped = 0usize;
        for row in envelope.data {
            let entry = match serde_json::from_value::<PersistedEntry>(row) {
                Ok(e) if e.v == version => e,
                Ok(e) => {
                    debug!(found = e.v, expected = version, "dropping cache row with stale schema");
                    dropped += 1;
                    continue;
                }
                Err(err) => {
                    debug!(error = %err, "dropping malformed cache row");
                    dropped += 1;
                    continue;
                }
            };
            if let Err(err) = entry.payload.validate() {
                debug!(key = %entry.key, error = %err, "dropping invalid cache row");
                dropped += 1;
                continue;
            }
            if memory.restore(entry.key, Rc::new(entry.payload), entry.updated_at_ms, now) {
                restored += 1;
            } else {
                dropped += 1;
            }
        }
        info!(restored, dropped, "cache snapshot restored");
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use app_shell::MemoryStorage;
    use futures::channel::oneshot;
    use std::cell::Cell;
    use ta_engine::IndicatorParams;
    use ts_core::{Bar, Interval, ManualClock, TimeKey};

    fn payload(close: f64) -> ChartPayload {
        ChartPayload {
            bars: vec![Bar {
                time: TimeKey(60),
                open: close,
                high: close,
                low: close,
                close,
                volume: 0.0,
            }],
            indicator_a: vec![],
            indicator_b: vec![],
            histogram: vec![],
        }
    }

    fn key(ticker: &str) -> CacheKey {
        CacheKey {
            ticker: ticker.into(),
            interval: Interval::Days(1),
            param_hash: IndicatorParams::default().param_hash(),
        }
    }

    fn cache_with(config: CacheConfig) -> (DataCache, ManualClock, Rc<MemoryStorage>) {
        let clock = ManualClock::new(0);
        let storage = Rc::new(MemoryStorage::new());
        let cache = DataCache::new(
            config,
            storage.clone(),
            &StorageKeys::new("t"),
            Rc::new(clock.clone()),
        );
        (cache, clock, storage)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let (cache, _, _) = cache_with(CacheConfig::default());
        let calls = Rc::new(Cell::new(0));
        let (tx, rx) = oneshot::channel::<ChartPayload>();

        let c1 = calls.clone();
        let first = cache.get_or_fetch(key("AAPL"), false, move || {
            c1.set(c1.get() + 1);
            async move { rx.await.map_err(|_| FetchError::Aborted) }
        });
        let c2 = calls.clone();
        let second = cache.get_or_fetch(key("AAPL"), false, move || {
            c2.set(c2.get() + 1);
            async move { Ok(payload(0.0)) }
        });
        let sender = async move {
            let _ = tx.send(payload(7.0));
        };

        let (a, b, ()) = futures::join!(first, second, sender);
        assert_eq!(calls.get(), 1);
        assert_eq!(a.unwrap().bars[0].close, 7.0);
        assert_eq!(b.unwrap().bars[0].close, 7.0);
        assert_eq!(cache.in_flight_count(), 0);
        assert!(cache.has_cached(&key("AAPL")));
    }

    #[tokio::test]
    async fn failure_releases_marker_and_skips_cache() {
        let (cache, _, _) = cache_with(CacheConfig::default());
        let res = cache
            .get_or_fetch(key("X"), false, || async {
                Err(FetchError::Network("offline".into()))
            })
            .await;
        assert_eq!(res, Err(FetchError::Network("offline".into())));
        assert_eq!(cache.in_flight_count(), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn dropped_callers_release_marker() {
        let (cache, _, _) = cache_with(CacheConfig::default());
        let (_tx, rx) = oneshot::channel::<ChartPayload>();
        {
            let pending = cache.get_or_fetch(key("X"), false, move || async move {
                rx.await.map_err(|_| FetchError::Aborted)
            });
            let mut pending = Box::pin(pending);
            assert!(futures::poll!(pending.as_mut()).is_pending());
            assert!(cache.is_in_flight(&key("X")));
        }
        assert_eq!(cache.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn hit_skips_fetcher_unless_refresh() {
        let (cache, _, _) = cache_with(CacheConfig::default());
        cache.set(key("A"), Rc::new(payload(1.0)));
        let hit = cache
            .get_or_fetch(key("A"), false, || async { Err(FetchError::NoData) })
            .await;
        assert_eq!(hit.unwrap().bars[0].close, 1.0);

        let forced = cache
            .get_or_fetch(key("A"), true, || async { Ok(payload(2.0)) })
            .await;
        assert_eq!(forced.unwrap().bars[0].close, 2.0);
        assert_eq!(cache.get(&key("A")).unwrap().bars[0].close, 2.0);
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (cache, clock, _) = cache_with(CacheConfig::default().with_ttl_ms(1_000));
        cache.set(key("A"), Rc::new(payload(1.0)));
        clock.advance(999);
        assert!(cache.has_cached(&key("A")));
        clock.advance(1);
        assert!(cache.get(&key("A")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn reads_keep_entries_alive() {
        let (cache, clock, _) = cache_with(CacheConfig::default().with_ttl_ms(1_000));
        cache.set(key("A"), Rc::new(payload(1.0)));
        for _ in 0..3 {
            clock.advance(900);
            assert!(cache.get(&key("A")).is_some());
        }
        clock.advance(1_000);
        assert!(cache.get(&key("A")).is_none());
    }

    #[test]
    fn persistence_is_debounced() {
        let (cache, clock, storage) = cache_with(CacheConfig::default());
        cache.set(key("A"), Rc::new(payload(1.0)));
        assert!(!cache.poll_persist());
        clock.advance(1_000);
        cache.set(key("B"), Rc::new(payload(2.0)));
        clock.advance(1_000);
        assert!(!cache.poll_persist());
        clock.advance(500);
        assert!(cache.poll_persist());
        assert!(storage.get_item("t:cache").unwrap().is_some());
        assert!(!cache.poll_persist());
    }

    #[test]
    fn snapshot_round_trip_respects_count_limit() {
        let cfg = CacheConfig::default().with_persist_limits(2, usize::MAX);
        let (cache, clock, storage) = cache_with(cfg.clone());
        for (i, t) in ["A", "B", "C"].iter().enumerate() {
            cache.set(key(t), Rc::new(payload(i as f64)));
        }
        assert_eq!(cache.persist_now(), 2);

        let restored = DataCache::new(cfg, storage, &StorageKeys::new("t"), Rc::new(clock));
        assert_eq!(restored.restore(), 2);
        assert!(restored.has_cached(&key("C")));
        assert!(restored.has_cached(&key("B")));
        assert!(!restored.has_cached(&key("A")));
    }

    #[test]
    fn byte_budget_limits_snapshot() {
        let cfg = CacheConfig::default().with_persist_limits(10, 1);
        let (cache, _, _) = cache_with(cfg);
        cache.set(key("A"), Rc::new(payload(1.0)));
        assert_eq!(cache.persist_now(), 0);
    }

    #[test]
    fn restore_drops_bad_rows_individually() {
        let (cache, clock, storage) = cache_with(CacheConfig::default());
        cache.set(key("GOOD"), Rc::new(payload(1.0)));
        cache.persist_now();

        let raw = storage.get_item("t:cache").unwrap().unwrap();
        let mut env: Versioned<Vec<serde_json::Value>> = serde_json::from_str(&raw).unwrap();
        let mut stale = env.data[0].clone();
        stale["v"] = serde_json::json!(0);
        stale["key"]["ticker"] = serde_json::json!("STALE");
        let mut empty = env.data[0].clone();
        empty["payload"]["bars"] = serde_json::json!([]);
        empty["key"]["ticker"] = serde_json::json!("EMPTY");
        env.data.push(stale);
        env.data.push(empty);
        env.data.push(serde_json::json!({"garbage": true}));
        storage
            .set_item("t:cache", &serde_json::to_string(&env).unwrap())
            .unwrap();

        let fresh = DataCache::new(
            CacheConfig::default(),
            storage,
            &StorageKeys::new("t"),
            Rc::new(clock),
        );
        assert_eq!(fresh.restore(), 1);
        assert!(fresh.has_cached(&key("GOOD")));
    }

    #[test]
    fn corrupt_snapshot_restores_nothing() {
        let (cache, _, storage) = cache_with(CacheConfig::default());
        storage.set_item("t:cache", "not json").unwrap();
        assert_eq!(cache.restore(), 0);
    }

    #[test]
    fn quota_failure_shrinks_snapshot() {
        let clock = ManualClock::new(0);
        let storage = Rc::new(MemoryStorage::with_quota(1_200));
        let cache = DataCache::new(
            CacheConfig::default(),
            storage.clone(),
            &StorageKeys::new("t"),
            Rc::new(clock),
        );
        for t in ["A", "B", "C", "D", "E", "F", "G", "H"] {
            cache.set(key(t), Rc::new(payload(1.0)));
        }
        let written = cache.persist_now();
        assert!(written < 8);
        assert!(storage.get_item("t:cache").unwrap().is_some() || written == 0);
    }
}
