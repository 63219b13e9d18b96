//! Durable session-id storage for the session-resume extension.
//!
//! A session id written by one connection is picked up by the next one,
//! including after a process restart when the file store is used. Writes are
//! last-writer-wins; there is no locking across processes.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::error::{LinkError, Result};

/// Key/value storage for session ids, keyed by product.
pub trait SessionStore: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<String>>;
    fn save(&self, key: &str, session_id: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Process-local store. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemorySessionStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned(key: &str) -> LinkError {
        LinkError::Storage { key: key.to_string(), detail: "lock poisoned".into() }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        let guard = self.inner.lock().map_err(|_| Self::poisoned(key))?;
        Ok(guard.get(key).cloned())
    }

    fn save(&self, key: &str, session_id: &str) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| Self::poisoned(key))?;
        guard.insert(key.to_string(), session_id.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut guard = self.inner.lock().map_err(|_| Self::poisoned(key))?;
        guard.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// File store
// ---------------------------------------------------------------------------

/// A single JSON object file mapping product key to session id.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self, key: &str) -> Result<HashMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => serde_json::from_str(&text).map_err(|e| LinkError::Storage {
                key: key.to_string(),
                detail: format!("{}: {e}", self.path.display()),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // Write-then-rename so a crash never leaves a truncated file.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(map)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all(key)?.remove(key))
    }

    fn save(&self, key: &str, session_id: &str) -> Result<()> {
        let mut map = self.read_all(key)?;
        map.insert(key.to_string(), session_id.to_string());
        self.write_all(&map)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut map = self.read_all(key)?;
        if map.remove(key).is_some() {
            self.write_all(&map)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SessionResume
// ---------------------------------------------------------------------------

/// A store bound to one product key. Storage failures are logged and
/// swallowed; resume is best-effort.
#[derive(Clone)]
pub struct SessionResume {
    key: String,
    store: Arc<dyn SessionStore>,
}

impl std::fmt::Debug for SessionResume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionResume").field("key", &self.key).finish_non_exhaustive()
    }
}

impl SessionResume {
    pub fn new(key: impl Into<String>, store: Arc<dyn SessionStore>) -> Self {
        Self { key: key.into(), store }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The persisted id, if any.
    pub fn persisted(&self) -> Option<String> {
        match self.store.load(&self.key) {
            Ok(id) => id.filter(|id| !id.is_empty()),
            Err(e) => {
                warn!(error = %e, key = %self.key, "failed to read persisted session id");
                None
            }
        }
    }

    pub fn persist(&self, session_id: &str) {
        if let Err(e) = self.store.save(&self.key, session_id) {
            warn!(error = %e, key = %self.key, "failed to persist session id");
        }
    }

    pub fn forget(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            warn!(error = %e, key = %self.key, "failed to clear persisted session id");
        }
    }
}
