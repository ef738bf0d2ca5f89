use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::state::{PersistedSnapshot, now_millis};

pub const SNAPSHOT_KEY: &str = "agent_persistent_state";
pub const API_KEY_KEY: &str = "openai_api_key";

/// Last-write-wins key-value storage. The agent is the only writer, so no
/// transactions are needed.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Whole-map JSON file, rewritten on every change.
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn load(&self) -> Result<HashMap<String, Value>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }

    fn save(&self, map: &HashMap<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)?;
        serde_json::to_writer_pretty(file, map)?;
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let _guard = self.guard();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut map = self.load()?;
        map.insert(key.to_string(), value);
        self.save(&map)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.guard();
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    map: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    fn map(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.map().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.map().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.map().remove(key);
        Ok(())
    }
}

/// Reads and writes the task snapshot. Store failures are logged and
/// swallowed: losing a snapshot only costs resumability.
///
/// Clones share a halt flag. While halted, saves are dropped so a stopped
/// task cannot be resumed by a reload that races the stop.
#[derive(Clone)]
pub struct SnapshotStore {
    kv: Arc<dyn KeyValueStore>,
    freshness: Duration,
    halted: Arc<AtomicBool>,
}

impl SnapshotStore {
    pub fn new(kv: Arc<dyn KeyValueStore>, freshness: Duration) -> Self {
        Self {
            kv,
            freshness,
            halted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Clear the snapshot and ignore saves until [`SnapshotStore::accept_saves`].
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
        self.clear();
    }

    pub fn accept_saves(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn kv(&self) -> &Arc<dyn KeyValueStore> {
        &self.kv
    }

    pub fn save(&self, snapshot: &PersistedSnapshot) {
        if self.is_halted() {
            debug!(step = snapshot.current_step, "snapshot writes halted, not saving");
            return;
        }
        let value = match serde_json::to_value(snapshot) {
            Ok(value) => value,
            Err(e) => {
                warn!("failed to serialize snapshot: {}", e);
                return;
            }
        };
        match self.kv.set(SNAPSHOT_KEY, value) {
            Ok(()) => debug!(step = snapshot.current_step, "snapshot saved"),
            Err(e) => warn!("failed to save snapshot: {}", e),
        }
    }

    /// The stored snapshot if it may be resumed. Stale or finished snapshots
    /// are removed on the way out.
    pub fn load(&self) -> Option<PersistedSnapshot> {
        let value = match self.kv.get(SNAPSHOT_KEY) {
            Ok(Some(value)) => value,
            Ok(None) => {
                debug!("no saved snapshot");
                return None;
            }
            Err(e) => {
                warn!("failed to read snapshot: {}", e);
                return None;
            }
        };

        let snapshot: PersistedSnapshot = match serde_json::from_value(value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("discarding unreadable snapshot: {}", e);
                self.clear();
                return None;
            }
        };

        let age_ms = now_millis().saturating_sub(snapshot.saved_at);
        if age_ms > self.freshness.as_millis() as i64 {
            info!(age_secs = age_ms / 1000, "snapshot too old, discarding");
            self.clear();
            return None;
        }
        if !snapshot.running {
            info!("snapshot belongs to a finished task, discarding");
            self.clear();
            return None;
        }

        Some(snapshot)
    }

    pub fn clear(&self) {
        match self.kv.remove(SNAPSHOT_KEY) {
            Ok(()) => debug!("snapshot cleared"),
            Err(e) => warn!("failed to clear snapshot: {}", e),
        }
    }
}

/// Save a provider key under [`API_KEY_KEY`] after a basic format check.
pub fn save_api_key(kv: &dyn KeyValueStore, api_key: &str) -> Result<bool, StoreError> {
    let api_key = api_key.trim();
    if !is_plausible_api_key(api_key) {
        return Ok(false);
    }
    kv.set(API_KEY_KEY, Value::String(api_key.to_string()))?;
    Ok(true)
}

pub fn is_plausible_api_key(api_key: &str) -> bool {
    api_key.starts_with("sk-") && api_key.len() > 20
}
