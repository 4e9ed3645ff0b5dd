//! Durable key/value store
//!
//! The session layer keeps two kinds of durable state: the timer record
//! (see [`crate::timer::TimerState`]) and the remembered VPN consent. Both go
//! through [`PersistentStore`], which the host can back with whatever
//! preferences mechanism it already has.
//!
//! Two backends ship with the crate:
//!
//! - [`MemoryStore`] - process-local, used by tests and embedders that
//!   persist elsewhere
//! - [`FileStore`] - a single JSON document on disk, rewritten atomically
//!   (write to a temp file, then rename) on every mutation
//!
//! Values are `serde_json::Value` so a whole record can be written as one
//! value under one key. Readers never observe half of a record.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Durable key/value store used for timer state and remembered consent
pub trait PersistentStore: Send + Sync {
    /// Read a value, `None` if the key is absent
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: Value) -> Result<()>;

    /// Remove a single key (no-op if absent)
    fn remove(&self, key: &str) -> Result<()>;

    /// Remove every key
    fn clear(&self) -> Result<()>;
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, Value>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// True when no keys are held
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.values.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.values.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.values.lock().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.values.lock().clear();
        Ok(())
    }
}

/// JSON-file store
///
/// The whole document is cached in memory and flushed on every mutation.
/// The cache lock is held across the flush so two writers cannot interleave
/// their renames.
pub struct FileStore {
    path: PathBuf,
    cache: Mutex<Map<String, Value>>,
}

impl FileStore {
    /// Open (or create) a store at `path`
    ///
    /// A missing file is an empty store. A file that fails to parse is
    /// logged and treated as empty; the next write replaces it.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create store directory: {:?}", parent))?;
            }
        }

        let cache = if path.exists() {
            let content = fs::read_to_string(&path)
                .context(format!("Failed to read store file: {:?}", path))?;
            match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Store file {:?} is not valid JSON ({}), starting empty", path, e);
                    Map::new()
                }
            }
        } else {
            Map::new()
        };

        debug!("Opened store at {:?} ({} keys)", path, cache.len());

        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    /// Default store location under the user's local data directory
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
                    .join(".local/share")
            })
            .join("lamco-vpn-session")
            .join("state.json")
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self, map: &Map<String, Value>) -> Result<()> {
        let json = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");

        fs::write(&tmp, json).context("Failed to write store file")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp, perms).context("Failed to set store file permissions")?;
        }

        fs::rename(&tmp, &self.path).context("Failed to replace store file")?;
        Ok(())
    }
}

impl PersistentStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.cache.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        let mut map = self.cache.lock();
        map.insert(key.to_string(), value);
        self.flush(&map)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.cache.lock();
        if map.remove(key).is_some() {
            self.flush(&map)?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut map = self.cache.lock();
        map.clear();
        self.flush(&map)
    }
}
