//! Persistence sinks for long-term memory
//!
//! A sink mirrors a long-term [`MemoryStore`](super::MemoryStore). Sink
//! errors are returned as `Err` here and turned into
//! [`PersistenceWarning`](crate::error::PersistenceWarning)s by the store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use super::MemoryEntry;
use crate::error::{AgoraError, Result};

/// Durable backing for a long-term memory store
#[async_trait]
pub trait PersistenceSink: Send + Sync {
    /// Load every persisted entry
    async fn load_all(&self) -> Result<Vec<MemoryEntry>>;

    /// Persist an entry, replacing any entry with the same key
    async fn save(&self, entry: &MemoryEntry) -> Result<()>;

    /// Forget a key
    async fn remove(&self, _key: &str) -> Result<()> {
        Ok(())
    }
}

/// Sink that keeps every entry in a single JSON file.
///
/// Each write rewrites the file through a temporary sibling and a rename.
pub struct JsonFileSink {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileSink {
    /// Create a sink writing to `path`; the file is created on first save
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backing file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_entries(&self) -> Result<Vec<MemoryEntry>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(Vec::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(AgoraError::Persistence(format!(
                "failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    async fn write_entries(&self, entries: &[MemoryEntry]) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(|e| {
            AgoraError::Persistence(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            AgoraError::Persistence(format!("failed to replace {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl PersistenceSink for JsonFileSink {
    async fn load_all(&self) -> Result<Vec<MemoryEntry>> {
        let _guard = self.lock.lock().await;
        self.read_entries().await
    }

    async fn save(&self, entry: &MemoryEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        match entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        self.write_entries(&entries).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_entries().await?;
        let before = entries.len();
        entries.retain(|e| e.key != key);
        if entries.len() == before {
            return Ok(());
        }
        self.write_entries(&entries).await
    }
}

/// Sink holding entries in process memory.
///
/// Failures can be switched on to exercise the warning path of a store.
#[derive(Default)]
pub struct InMemorySink {
    entries: Mutex<Vec<MemoryEntry>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl InMemorySink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a sink pre-populated with `entries`
    pub fn with_entries(entries: Vec<MemoryEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
            ..Self::default()
        }
    }

    /// Make `load_all` fail
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make `save` and `remove` fail
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    /// Entries currently held
    pub fn entries(&self) -> Vec<MemoryEntry> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MemoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl PersistenceSink for InMemorySink {
    async fn load_all(&self) -> Result<Vec<MemoryEntry>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(AgoraError::Persistence("sink unavailable".to_string()));
        }
        Ok(self.entries())
    }

    async fn save(&self, entry: &MemoryEntry) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(AgoraError::Persistence("sink unavailable".to_string()));
        }
        let mut entries = self.lock();
        match entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => *existing = entry.clone(),
            None => entries.push(entry.clone()),
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(AgoraError::Persistence("sink unavailable".to_string()));
        }
        self.lock().retain(|e| e.key != key);
        Ok(())
    }
}
