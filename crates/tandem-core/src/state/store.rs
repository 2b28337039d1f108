//! Lifecycle store - handles persisted where a later invocation can find them.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use super::handle::ProcessHandle;
use crate::error::{OrchestratorError, Result};

/// Persisted handles keyed by tier name.
///
/// There is no locking: concurrent writers race and the last one wins.
pub trait LifecycleStore: Send + Sync {
    fn put(&self, handle: &ProcessHandle) -> Result<()>;

    fn get(&self, service: &str) -> Result<Option<ProcessHandle>>;

    /// Removing an absent record is not an error.
    fn clear(&self, service: &str) -> Result<()>;
}

/// One `<service>.pid` file per tier holding the pid as a plain integer.
///
/// The start timestamp is the record's modification time.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, service: &str) -> PathBuf {
        self.dir.join(format!("{service}.pid"))
    }
}

fn store_error(path: &Path, source: std::io::Error) -> OrchestratorError {
    OrchestratorError::Store {
        path: path.to_path_buf(),
        source,
    }
}

impl LifecycleStore for FileStore {
    fn put(&self, handle: &ProcessHandle) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| store_error(&self.dir, e))?;
        let path = self.path_for(&handle.service);
        std::fs::write(&path, format!("{}\n", handle.pid)).map_err(|e| store_error(&path, e))?;
        tracing::debug!(tier = %handle.service, pid = handle.pid, path = %path.display(), "Stored handle");
        Ok(())
    }

    fn get(&self, service: &str) -> Result<Option<ProcessHandle>> {
        let path = self.path_for(service);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error(&path, e)),
        };

        let pid = match content.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => pid,
            _ => {
                tracing::warn!(tier = %service, path = %path.display(), "Ignoring unreadable pid record");
                return Ok(None);
            }
        };

        let started_at = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(ProcessHandle {
            service: service.to_string(),
            pid,
            started_at,
        }))
    }

    fn clear(&self, service: &str) -> Result<()> {
        let path = self.path_for(service);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_error(&path, e)),
        }
    }
}

/// In-process store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    handles: Mutex<HashMap<String, ProcessHandle>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LifecycleStore for MemoryStore {
    fn put(&self, handle: &ProcessHandle) -> Result<()> {
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(handle.service.clone(), handle.clone());
        }
        Ok(())
    }

    fn get(&self, service: &str) -> Result<Option<ProcessHandle>> {
        Ok(self
            .handles
            .lock()
            .ok()
            .and_then(|h| h.get(service).cloned()))
    }

    fn clear(&self, service: &str) -> Result<()> {
        if let Ok(mut handles) = self.handles.lock() {
            handles.remove(service);
        }
        Ok(())
    }
}
