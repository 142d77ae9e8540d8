//! Live-updatable configuration values.
//!
//! A [`DynamicCell`] holds one scalar in an `AtomicU64`. Readers call
//! [`DynamicCell::read`] on every message and never block. The only writer is
//! the watch task started by [`spawn_watch`], which commits a new value only
//! after it parsed and validated successfully.
//!
//! The [`ConfigStore`] trait is the naming authority: it serves queue names and
//! dynamic values, and lets callers watch a key for changes.

use std::collections::HashMap;
use std::fmt::Display;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::ConfigError;

/// Well-known config store keys.
pub mod keys {
    /// Loader publication rate, messages per second.
    pub const RATE_LIMIT: &str = "loader.rate-limit";

    /// Thumbnail longest edge, pixels.
    pub const THUMBNAIL_SIZE: &str = "thumbnail.size";

    /// Key holding the configured name of a logical queue or exchange.
    pub fn topology(logical: &str) -> String {
        format!("topology.{logical}")
    }
}

/// A value that fits in a single atomic word.
pub trait CellValue: Copy + Display + Send + Sync + 'static {
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;

    /// Parse and validate a raw config value.
    fn parse(raw: &str) -> Result<Self, String>;
}

impl CellValue for u32 {
    fn to_bits(self) -> u64 {
        u64::from(self)
    }

    fn from_bits(bits: u64) -> Self {
        bits as u32
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let value: u32 = raw.trim().parse().map_err(|e| format!("{e}"))?;
        if value == 0 {
            return Err("must be > 0".to_string());
        }
        Ok(value)
    }
}

impl CellValue for f64 {
    fn to_bits(self) -> u64 {
        f64::to_bits(self)
    }

    fn from_bits(bits: u64) -> Self {
        f64::from_bits(bits)
    }

    fn parse(raw: &str) -> Result<Self, String> {
        let value: f64 = raw.trim().parse().map_err(|e| format!("{e}"))?;
        if !value.is_finite() || value <= 0.0 {
            return Err("must be a finite number > 0".to_string());
        }
        Ok(value)
    }
}

/// Single-writer, many-reader configuration cell.
pub struct DynamicCell<T: CellValue> {
    key: String,
    bits: AtomicU64,
    _marker: PhantomData<T>,
}

impl<T: CellValue> DynamicCell<T> {
    pub fn new(key: impl Into<String>, initial: T) -> Self {
        Self {
            key: key.into(),
            bits: AtomicU64::new(initial.to_bits()),
            _marker: PhantomData,
        }
    }

    /// Build a cell from the store's current value for `key`.
    pub fn from_store(store: &dyn ConfigStore, key: &str) -> Result<Self, ConfigError> {
        let raw = store
            .get(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))?;
        let value = T::parse(&raw)
            .map_err(|e| ConfigError::ValidationError(format!("{key} = {raw:?}: {e}")))?;
        Ok(Self::new(key, value))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value. Never blocks.
    pub fn read(&self) -> T {
        T::from_bits(self.bits.load(Ordering::Acquire))
    }

    /// Apply a raw value from the config store.
    ///
    /// Returns `false` (and keeps the old value) when the value is malformed.
    pub fn on_external_change(&self, raw: &str) -> bool {
        match T::parse(raw) {
            Ok(value) => {
                let previous = T::from_bits(self.bits.swap(value.to_bits(), Ordering::AcqRel));
                tracing::info!("{} changed: {} -> {}", self.key, previous, value);
                true
            }
            Err(e) => {
                tracing::warn!("Ignoring malformed value for {}: {:?} ({})", self.key, raw, e);
                false
            }
        }
    }
}

/// Key/value naming authority with change notification.
pub trait ConfigStore: Send + Sync {
    /// Current value of a key.
    fn get(&self, key: &str) -> Option<String>;

    /// Subscribe to changes of a key. The receiver sees `None` until the key is set.
    fn watch(&self, key: &str) -> watch::Receiver<Option<String>>;
}

/// In-process config store backed by one watch channel per key.
#[derive(Default)]
pub struct MemoryConfigStore {
    entries: Mutex<HashMap<String, watch::Sender<Option<String>>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store from a loaded config file.
    pub fn from_config(config: &Config) -> Self {
        let store = Self::new();
        store.set(keys::RATE_LIMIT, config.loader.rate_limit.to_string());
        store.set(keys::THUMBNAIL_SIZE, config.thumbnail.size.to_string());
        for (logical, physical) in &config.topology.names {
            store.set(&keys::topology(logical), physical.clone());
        }
        store
    }

    /// Set a key, notifying watchers.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let sender = entries
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0);
        sender.send_replace(Some(value.into()));
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Option<String> {
        let entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.get(key).and_then(|sender| sender.borrow().clone())
    }

    fn watch(&self, key: &str) -> watch::Receiver<Option<String>> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }
}

/// Feed a cell from the store's watch for its key.
///
/// The task runs until the store drops the key's sender or the handle is aborted.
pub fn spawn_watch<T: CellValue>(
    cell: Arc<DynamicCell<T>>,
    store: &dyn ConfigStore,
) -> JoinHandle<()> {
    let mut rx = store.watch(cell.key());
    // The current value was already read at construction.
    rx.mark_unchanged();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let raw = rx.borrow_and_update().clone();
            if let Some(raw) = raw {
                cell.on_external_change(&raw);
            }
        }
        tracing::debug!("Config watch for {} ended", cell.key());
    })
}
