//! Agent memory stores
//!
//! Every agent owns two [`MemoryStore`]s:
//!
//! - **short-term**: bounded by entry count, oldest-stored entry evicted first
//! - **long-term**: unbounded, optionally mirrored to a [`PersistenceSink`]
//!
//! Entries may carry an expiry. An expired entry is absent on every read and
//! is dropped the next time the store purges or makes room.
//!
//! # Example
//!
//! ```rust,ignore
//! let memory = MemoryStore::short_term(100);
//! memory.store("last_analysis", json!({"score": 0.8}), None).await;
//! assert!(memory.retrieve("last_analysis").is_some());
//! ```

mod sink;

pub use sink::{InMemorySink, JsonFileSink, PersistenceSink};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::config::MemoryConfig;
use crate::error::{PersistenceOp, PersistenceWarning};

/// A stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Entry key
    pub key: String,

    /// Stored value
    pub value: serde_json::Value,

    /// When the entry was (last) stored
    pub stored_at: DateTime<Utc>,

    /// When the entry stops being readable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MemoryEntry {
    /// Create an entry stored now
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            stored_at: Utc::now(),
            expires_at,
        }
    }

    /// Whether the entry is expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Whether the entry is expired right now
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Which role a store plays for its agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    ShortTerm,
    LongTerm,
}

#[derive(Debug, Default)]
struct StoreInner {
    entries: HashMap<String, Slot>,
    /// store sequence -> key, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

#[derive(Debug)]
struct Slot {
    entry: MemoryEntry,
    seq: u64,
}

impl StoreInner {
    /// Insert or overwrite; returns the keys evicted to stay within `max_size`.
    fn put(&mut self, entry: MemoryEntry, max_size: Option<usize>) -> Vec<String> {
        let mut evicted = Vec::new();

        if let Some(old) = self.entries.remove(&entry.key) {
            self.order.remove(&old.seq);
        } else if let Some(max_size) = max_size {
            if self.entries.len() >= max_size {
                evicted.extend(self.purge_expired(Utc::now()));
            }
            while self.entries.len() >= max_size {
                let Some((_, oldest)) = self.order.pop_first() else {
                    break;
                };
                self.entries.remove(&oldest);
                evicted.push(oldest);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, entry.key.clone());
        self.entries.insert(entry.key.clone(), Slot { entry, seq });
        evicted
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.seq);
                true
            }
            None => false,
        }
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .values()
            .filter(|slot| slot.entry.is_expired_at(now))
            .map(|slot| slot.entry.key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }
}

/// Key/value cache with optional expiry and an optional durable sink.
///
/// Reads take a shared lock and may run concurrently; writes take the
/// exclusive lock. Sink writes are serialized in store order.
pub struct MemoryStore {
    kind: MemoryKind,
    max_size: Option<usize>,
    default_ttl: Option<Duration>,
    inner: RwLock<StoreInner>,
    sink: Option<Arc<dyn PersistenceSink>>,
    persist_lock: tokio::sync::Mutex<()>,
    warnings: Mutex<Vec<PersistenceWarning>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("kind", &self.kind)
            .field("max_size", &self.max_size)
            .field("len", &self.len())
            .field("persistent", &self.sink.is_some())
            .finish()
    }
}

impl MemoryStore {
    fn with_parts(
        kind: MemoryKind,
        max_size: Option<usize>,
        sink: Option<Arc<dyn PersistenceSink>>,
    ) -> Self {
        Self {
            kind,
            max_size,
            default_ttl: None,
            inner: RwLock::new(StoreInner::default()),
            sink,
            persist_lock: tokio::sync::Mutex::new(()),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// Create a short-term store holding at most `max_size` entries
    pub fn short_term(max_size: usize) -> Self {
        Self::with_parts(MemoryKind::ShortTerm, Some(max_size.max(1)), None)
    }

    /// Create an in-memory long-term store
    pub fn long_term() -> Self {
        Self::with_parts(MemoryKind::LongTerm, None, None)
    }

    /// Create a long-term store mirrored to `sink`, loading its prior entries.
    ///
    /// A failing load leaves the store empty and records a warning.
    pub async fn long_term_with_sink(sink: Arc<dyn PersistenceSink>) -> Self {
        let store = Self::with_parts(MemoryKind::LongTerm, None, Some(Arc::clone(&sink)));

        match sink.load_all().await {
            Ok(entries) => {
                let now = Utc::now();
                let mut inner = store.write();
                let mut loaded = 0usize;
                for entry in entries.into_iter().filter(|e| !e.is_expired_at(now)) {
                    inner.put(entry, None);
                    loaded += 1;
                }
                drop(inner);
                tracing::debug!(loaded, "Loaded long-term memory from sink");
            }
            Err(e) => store.record_warning(PersistenceWarning::new(PersistenceOp::Load, None, &e)),
        }

        store
    }

    /// Create the short-term store described by `config`
    pub fn short_term_from_config(config: &MemoryConfig) -> Self {
        let mut store = Self::short_term(config.short_term_max_size);
        store.default_ttl = config.default_ttl;
        store
    }

    /// Apply `ttl` to entries stored without an explicit one
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Store kind
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Entry bound, if any
    pub fn max_size(&self) -> Option<usize> {
        self.max_size
    }

    /// Whether entries are mirrored to a sink
    pub fn is_persistent(&self) -> bool {
        self.sink.is_some()
    }

    /// Insert or overwrite `key`, expiring after `ttl` (or the store default)
    pub async fn store(&self, key: impl Into<String>, value: serde_json::Value, ttl: Option<Duration>) {
        let now = Utc::now();
        let expires_at = ttl
            .or(self.default_ttl)
            .and_then(|ttl| TimeDelta::from_std(ttl).ok())
            .and_then(|ttl| now.checked_add_signed(ttl));
        self.insert(MemoryEntry {
            key: key.into(),
            value,
            stored_at: now,
            expires_at,
        })
        .await;
    }

    /// Insert or overwrite `key` with an absolute expiry
    pub async fn store_until(
        &self,
        key: impl Into<String>,
        value: serde_json::Value,
        expires_at: DateTime<Utc>,
    ) {
        self.insert(MemoryEntry::new(key, value, Some(expires_at))).await;
    }

    async fn insert(&self, entry: MemoryEntry) {
        let _persist = match self.sink {
            Some(_) => Some(self.persist_lock.lock().await),
            None => None,
        };

        let evicted = self.write().put(entry.clone(), self.max_size);
        if !evicted.is_empty() {
            tracing::debug!(kind = ?self.kind, evicted = ?evicted, "Evicted memory entries");
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.save(&entry).await {
                self.record_warning(PersistenceWarning::new(
                    PersistenceOp::Save,
                    Some(&entry.key),
                    &e,
                ));
            }
            for key in evicted {
                self.remove_from_sink(sink.as_ref(), &key).await;
            }
        }
    }

    /// Read a value; `None` for missing or expired keys
    pub fn retrieve(&self, key: &str) -> Option<serde_json::Value> {
        self.entry(key).map(|entry| entry.value)
    }

    /// Read a full entry; `None` for missing or expired keys
    pub fn entry(&self, key: &str) -> Option<MemoryEntry> {
        let now = Utc::now();
        self.read()
            .entries
            .get(key)
            .filter(|slot| !slot.entry.is_expired_at(now))
            .map(|slot| slot.entry.clone())
    }

    /// Whether a live entry exists for `key`
    pub fn contains_key(&self, key: &str) -> bool {
        self.entry(key).is_some()
    }

    /// Delete `key`; returns whether a (possibly expired) entry existed
    pub async fn delete(&self, key: &str) -> bool {
        let _persist = match self.sink {
            Some(_) => Some(self.persist_lock.lock().await),
            None => None,
        };

        let existed = self.write().remove(key);
        if let Some(sink) = &self.sink {
            self.remove_from_sink(sink.as_ref(), key).await;
        }
        existed
    }

    async fn remove_from_sink(&self, sink: &dyn PersistenceSink, key: &str) {
        if let Err(e) = sink.remove(key).await {
            self.record_warning(PersistenceWarning::new(PersistenceOp::Remove, Some(key), &e));
        }
    }

    /// Snapshot of the entries in store order.
    ///
    /// Expiry is evaluated while iterating, and the snapshot can be iterated
    /// any number of times.
    pub fn items(&self) -> MemoryItems {
        let inner = self.read();
        let entries = inner
            .order
            .values()
            .filter_map(|key| inner.entries.get(key))
            .map(|slot| slot.entry.clone())
            .collect();
        MemoryItems { entries }
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        self.write().purge_expired(Utc::now()).len()
    }

    /// Number of stored entries, expired or not
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// Whether the store holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every in-memory entry (the sink is left untouched)
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Persistence warnings recorded so far
    pub fn warnings(&self) -> Vec<PersistenceWarning> {
        self.warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Drain the recorded persistence warnings
    pub fn take_warnings(&self) -> Vec<PersistenceWarning> {
        std::mem::take(
            &mut *self
                .warnings
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    fn record_warning(&self, warning: PersistenceWarning) {
        tracing::warn!(kind = ?self.kind, %warning, "Memory persistence failed, continuing in memory");
        self.warnings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(warning);
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Restartable view over a store snapshot, see [`MemoryStore::items`]
#[derive(Debug, Clone)]
pub struct MemoryItems {
    entries: Vec<MemoryEntry>,
}

impl MemoryItems {
    /// Iterate live `(key, value)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired())
            .map(|entry| (entry.key.as_str(), &entry.value))
    }
}

impl<'a> IntoIterator for &'a MemoryItems {
    type Item = (&'a str, &'a serde_json::Value);
    type IntoIter = Box<dyn Iterator<Item = Self::Item> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests;
