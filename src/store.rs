//! Durable client-side key/value store.
//!
//! Holds the handful of strings the client keeps between runs: the session
//! id, journey version, label groups and a few admin conveniences. Writers are
//! not coordinated across processes; the last write wins.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{KininError, Result};
use crate::models::{InterviewMode, LabelGroup, LabelGroups};

#[cfg(test)]
use mockall::automock;

pub const SESSION_ID: &str = "session_id";
pub const JOURNEY_VERSION: &str = "journey_version";
pub const ADMIN_USER_ID: &str = "admin_user_id";
pub const FEEDBACK_LAST_SEEN_MS: &str = "feedback_last_seen_ms";
pub const MODE: &str = "mode";

#[cfg_attr(test, automock)]
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

/// Process-local store, used when no store file is configured and in tests
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self
            .entries
            .read()
            .map_err(|_| KininError::Store("memory store lock poisoned".to_string()))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KininError::Store("memory store lock poisoned".to_string()))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| KininError::Store("memory store lock poisoned".to_string()))?;
        entries.remove(key);
        Ok(())
    }
}

/// Store backed by a single JSON object file.
///
/// Every operation re-reads the file so that independent instances sharing a
/// path observe each other's writes. Writes go to a sibling temp file that is
/// renamed over the previous file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| {
                    KininError::Store(format!("cannot create {}: {e}", parent.display()))
                })?;
            }
        }
        tracing::debug!("Opened file store at {}", path.display());
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(&self.path)
            .map_err(|e| KininError::Store(format!("cannot read {}: {e}", self.path.display())))?;
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        match serde_json::from_str(&content) {
            Ok(map) => Ok(map),
            Err(e) => {
                tracing::warn!(
                    "Store file {} is corrupt ({}) - starting empty",
                    self.path.display(),
                    e
                );
                Ok(BTreeMap::new())
            }
        }
    }

    fn save(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let tmp_path = self.path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(entries)?;
        let io_err =
            |e: std::io::Error| KininError::Store(format!("cannot write {}: {e}", self.path.display()));

        let mut tmp = File::create(&tmp_path).map_err(io_err)?;
        tmp.write_all(content.as_bytes()).map_err(io_err)?;
        tmp.sync_all().map_err(io_err)?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).map_err(io_err)?;
        Ok(())
    }

    fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut BTreeMap<String, String>),
    {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| KininError::Store("file store lock poisoned".to_string()))?;
        let mut entries = self.load()?;
        mutate(&mut entries);
        self.save(&entries)
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.load()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.update(|entries| {
            entries.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.update(|entries| {
            entries.remove(key);
        })
    }
}

/// Typed accessors over the raw store.
///
/// Write failures are logged and swallowed: the in-memory state stays
/// authoritative for the running client.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self { inner }
    }

    fn read(&self, key: &str) -> Option<String> {
        match self.inner.get(key) {
            Ok(value) => value.filter(|v| !v.is_empty()),
            Err(e) => {
                tracing::warn!("Failed to read {} from store: {}", key, e);
                None
            }
        }
    }

    fn write(&self, key: &str, value: &str) {
        if let Err(e) = self.inner.set(key, value) {
            tracing::warn!("Failed to persist {}: {}", key, e);
        }
    }

    fn erase(&self, key: &str) {
        if let Err(e) = self.inner.remove(key) {
            tracing::warn!("Failed to remove {}: {}", key, e);
        }
    }

    pub fn session_id(&self) -> Option<String> {
        self.read(SESSION_ID)
    }

    /// Empty ids are written as-is, which reads back as "no session"
    pub fn set_session_id(&self, session_id: &str) {
        self.write(SESSION_ID, session_id);
    }

    pub fn journey_version(&self) -> Option<String> {
        self.read(JOURNEY_VERSION)
    }

    pub fn set_journey_version(&self, version: &str) {
        self.write(JOURNEY_VERSION, version);
    }

    pub fn labels(&self) -> LabelGroups {
        let mut groups = LabelGroups::default();
        for group in LabelGroup::ALL {
            let labels = self
                .read(group.key())
                .and_then(|raw| serde_json::from_str::<Vec<serde_json::Value>>(&raw).ok())
                .map(|values| crate::models::normalize_labels(&values))
                .unwrap_or_default();
            groups.set(group, labels);
        }
        groups
    }

    pub fn set_labels(&self, group: LabelGroup, labels: &[String]) {
        match serde_json::to_string(labels) {
            Ok(raw) => self.write(group.key(), &raw),
            Err(e) => tracing::warn!("Failed to encode {}: {}", group.key(), e),
        }
    }

    pub fn mode(&self) -> Option<InterviewMode> {
        self.read(MODE)
            .and_then(|raw| serde_json::from_value(serde_json::Value::String(raw)).ok())
    }

    pub fn set_mode(&self, mode: InterviewMode) {
        self.write(MODE, mode.as_str());
    }

    pub fn admin_user_id(&self) -> Option<String> {
        self.read(ADMIN_USER_ID)
    }

    pub fn set_admin_user_id(&self, user_id: &str) {
        self.write(ADMIN_USER_ID, user_id);
    }

    pub fn feedback_last_seen_ms(&self) -> Option<i64> {
        self.read(FEEDBACK_LAST_SEEN_MS)
            .and_then(|raw| raw.parse().ok())
    }

    pub fn set_feedback_last_seen_ms(&self, ms: i64) {
        self.write(FEEDBACK_LAST_SEEN_MS, &ms.to_string());
    }

    /// Drops everything tied to the account: session, journey and labels.
    pub fn clear_account(&self) {
        self.erase(SESSION_ID);
        self.erase(JOURNEY_VERSION);
        for group in LabelGroup::ALL {
            self.erase(group.key());
        }
    }
}
