use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use ta_engine::IndicatorParams;
use thiserror::Error;
use tracing::{debug, warn};
use ts_core::{Clock, Interval, TrendlineDefinition};

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::JsValue;
#[cfg(target_arch = "wasm32")]
use web_sys::Storage;

/// Schema version of the trendline and layout envelopes.
pub const STATE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage write failed: {0}")]
    Write(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// String key/value store with `localStorage` semantics.
pub trait KeyValueStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

/// In-process storage for tests and non-browser hosts.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: RefCell<BTreeMap<String, String>>,
    /// Byte quota over all values; `None` is unbounded.
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            items: RefCell::default(),
            quota: Some(quota),
        }
    }

    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.items.borrow().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut items = self.items.borrow_mut();
        if let Some(quota) = self.quota {
            let used: usize = items
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            if used + value.len() > quota {
                return Err(StorageError::Write(format!(
                    "quota exceeded writing {} bytes to {key}",
                    value.len()
                )));
            }
        }
        items.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.items.borrow_mut().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .items
            .borrow()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ---------- Browser localStorage ---------------------------------------------

#[cfg(target_arch = "wasm32")]
fn js_err(err: JsValue) -> String {
    err.as_string().unwrap_or_else(|| format!("{err:?}"))
}

#[cfg(target_arch = "wasm32")]
pub struct LocalStorage {
    storage: Storage,
}

#[cfg(target_arch = "wasm32")]
impl LocalStorage {
    pub fn open() -> Result<Self, StorageError> {
        let window =
            web_sys::window().ok_or_else(|| StorageError::Unavailable("no window".into()))?;
        let storage = window
            .local_storage()
            .map_err(|e| StorageError::Unavailable(js_err(e)))?
            .ok_or_else(|| StorageError::Unavailable("localStorage unavailable".into()))?;
        Ok(Self { storage })
    }
}

#[cfg(target_arch = "wasm32")]
impl KeyValueStorage for LocalStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.storage
            .get_item(key)
            .map_err(|e| StorageError::Unavailable(js_err(e)))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.storage
            .set_item(key, value)
            .map_err(|e| StorageError::Write(js_err(e)))
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.storage
            .remove_item(key)
            .map_err(|e| StorageError::Write(js_err(e)))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let len = self
            .storage
            .length()
            .map_err(|e| StorageError::Unavailable(js_err(e)))?;
        let mut keys = Vec::new();
        for i in 0..len {
            if let Ok(Some(k)) = self.storage.key(i) {
                if k.starts_with(prefix) {
                    keys.push(k);
                }
            }
        }
        Ok(keys)
    }
}

// ---------- Keys and envelopes -----------------------------------------------

/// Namespaced storage keys under one root prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKeys {
    root: String,
}

impl StorageKeys {
    pub fn new(root: impl Into<String>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn cache(&self) -> String {
        format!("{}:cache", self.root)
    }

    pub fn layout(&self) -> String {
        format!("{}:layout", self.root)
    }

    pub fn trendlines_prefix(&self) -> String {
        format!("{}:trendlines:", self.root)
    }

    pub fn trendlines(&self, ticker: &str, interval: Interval) -> String {
        format!(
            "{}{}:{}",
            self.trendlines_prefix(),
            ticker.trim().to_uppercase(),
            interval.name()
        )
    }
}

impl Default for StorageKeys {
    fn default() -> Self {
        Self::new("chartcore")
    }
}

/// Version-tagged persisted value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub v: u32,
    pub saved_at_ms: i64,
    pub data: T,
}

/// Serialize `data` inside a [`Versioned`] envelope.
pub fn save_versioned<T: Serialize>(
    storage: &dyn KeyValueStorage,
    key: &str,
    version: u32,
    now_ms: i64,
    data: &T,
) -> Result<usize, StorageError> {
    let envelope = Versioned {
        v: version,
        saved_at_ms: now_ms,
        data,
    };
    let json = serde_json::to_string(&envelope)?;
    storage.set_item(key, &json)?;
    Ok(json.len())
}

/// Load a [`Versioned`] envelope; anything missing, corrupt or from another
/// schema version loads as `None`.
pub fn load_versioned<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    key: &str,
    version: u32,
) -> Option<Versioned<T>> {
    let raw = match storage.get_item(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(err) => {
            warn!(key, error = %err, "storage read failed");
            return None;
        }
    };
    match serde_json::from_str::<Versioned<T>>(&raw) {
        Ok(env) if env.v == version => Some(env),
        Ok(env) => {
            warn!(key, found = env.v, expected = version, "discarding snapshot with stale schema");
            None
        }
        Err(err) => {
            warn!(key, error = %err, "discarding corrupt snapshot");
            None
        }
    }
}

// ---------- Trendlines -------------------------------------------------------

/// Oscillator pane that carries trendlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrendlinePane {
    OscillatorA,
    OscillatorB,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaneTrendlines {
    pub oscillator_a: Vec<TrendlineDefinition>,
    pub oscillator_b: Vec<TrendlineDefinition>,
}

impl PaneTrendlines {
    pub fn pane(&self, pane: TrendlinePane) -> &[TrendlineDefinition] {
        match pane {
            TrendlinePane::OscillatorA => &self.oscillator_a,
            TrendlinePane::OscillatorB => &self.oscillator_b,
        }
    }

    pub fn pane_mut(&mut self, pane: TrendlinePane) -> &mut Vec<TrendlineDefinition> {
        match pane {
            TrendlinePane::OscillatorA => &mut self.oscillator_a,
            TrendlinePane::OscillatorB => &mut self.oscillator_b,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.oscillator_a.is_empty() && self.oscillator_b.is_empty()
    }
}

/// Trendline definitions keyed by (ticker, interval). Entries never expire.
pub struct TrendlineStore {
    storage: Rc<dyn KeyValueStorage>,
    keys: StorageKeys,
    clock: Rc<dyn Clock>,
}

impl TrendlineStore {
    pub fn new(storage: Rc<dyn KeyValueStorage>, keys: StorageKeys, clock: Rc<dyn Clock>) -> Self {
        Self {
            storage,
            keys,
            clock,
        }
    }

    pub fn load(&self, ticker: &str, interval: Interval) -> PaneTrendlines {
        let key = self.keys.trendlines(ticker, interval);
        load_versioned::<PaneTrendlines>(self.storage.as_ref(), &key, STATE_SCHEMA_VERSION)
            .map(|env| env.data)
            .unwrap_or_default()
    }

    /// Best-effort; failures are logged.
    pub fn save(&self, ticker: &str, interval: Interval, lines: &PaneTrendlines) {
        let key = self.keys.trendlines(ticker, interval);
        let result = if lines.is_empty() {
            self.storage.remove_item(&key).map(|_| 0)
        } else {
            save_versioned(
                self.storage.as_ref(),
                &key,
                STATE_SCHEMA_VERSION,
                self.clock.now_ms(),
                lines,
            )
        };
        match result {
            Ok(bytes) => debug!(%key, bytes, "trendlines persisted"),
            Err(err) => warn!(%key, error = %err, "failed to persist trendlines"),
        }
    }

    /// Drop one pane's lines and persist the remainder.
    pub fn erase_pane(&self, ticker: &str, interval: Interval, pane: TrendlinePane) -> PaneTrendlines {
        let mut lines = self.load(ticker, interval);
        lines.pane_mut(pane).clear();
        self.save(ticker, interval, &lines);
        lines
    }

    /// Remove every persisted trendline set.
    pub fn clear(&self) {
        let prefix = self.keys.trendlines_prefix();
        match self.storage.keys_with_prefix(&prefix) {
            Ok(keys) => {
                for key in keys {
                    if let Err(err) = self.storage.remove_item(&key) {
                        warn!(%key, error = %err, "failed to remove trendlines");
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to enumerate trendline keys"),
        }
    }
}

// ---------- Layout & settings ------------------------------------------------

/// Relative pane heights, top to bottom.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PaneWeights {
    pub price: f64,
    pub oscillator_a: f64,
    pub oscillator_b: f64,
    pub histogram: f64,
}

impl Default for PaneWeights {
    fn default() -> Self {
        Self {
            price: 0.5,
            oscillator_a: 0.2,
            oscillator_b: 0.2,
            histogram: 0.1,
        }
    }
}

impl PaneWeights {
    /// Weights scaled to sum to 1; degenerate input yields the defaults.
    pub fn normalized(&self) -> PaneWeights {
        let parts = [self.price, self.oscillator_a, self.oscillator_b, self.histogram];
        if parts.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return PaneWeights::default();
        }
        let total: f64 = parts.iter().sum();
        if total <= 0.0 {
            return PaneWeights::default();
        }
        PaneWeights {
            price: self.price / total,
            oscillator_a: self.oscillator_a / total,
            oscillator_b: self.oscillator_b / total,
            histogram: self.histogram / total,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutSettings {
    pub pane_weights: PaneWeights,
    pub crosshair_hidden: bool,
    pub params: IndicatorParams,
    pub last_ticker: Option<String>,
    pub last_interval: Option<Interval>,
    pub watchlist: Vec<String>,
}

impl Default for LayoutSettings {
    fn default() -> Self {
        Self {
            pane_weights: PaneWeights::default(),
            crosshair_hidden: false,
            params: IndicatorParams::default(),
            last_ticker: None,
            last_interval: None,
            watchlist: Vec::new(),
        }
    }
}

pub struct SettingsStore {
    storage: Rc<dyn KeyValueStorage>,
    keys: StorageKeys,
    clock: Rc<dyn Clock>,
}

impl SettingsStore {
    pub fn new(storage: Rc<dyn KeyValueStorage>, keys: StorageKeys, clock: Rc<dyn Clock>) -> Self {
        Self {
            storage,
            keys,
            clock,
        }
    }

    pub fn load(&self) -> LayoutSettings {
        load_versioned::<LayoutSettings>(
            self.storage.as_ref(),
            &self.keys.layout(),
            STATE_SCHEMA_VERSION,
        )
        .map(|env| env.data)
        .unwrap_or_default()
    }

    pub fn save(&self, settings: &LayoutSettings) {
        let key = self.keys.layout();
        if let Err(err) = save_versioned(
            self.storage.as_ref(),
            &key,
            STATE_SCHEMA_VERSION,
            self.clock.now_ms(),
            settings,
        ) {
            warn!(%key, error = %err, "failed to persist layout");
        }
    }

    /// Load, mutate and save in one step.
    pub fn update<F: FnOnce(&mut LayoutSettings)>(&self, f: F) -> LayoutSettings {
        let mut settings = self.load();
        f(&mut settings);
        self.save(&settings);
        settings
    }
}
