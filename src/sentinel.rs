//! Lifecycle sentinels
//!
//! Named markers on a tmpfs directory. They are the persistent projection of
//! the node role machine and are what external observers (the status UI, the
//! peer) read. Only existence and mtime carry meaning.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, warn};

/// Sentinel errors
#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Sentinel {name} I/O error: {err}")]
    Io { name: String, err: io::Error },
}

pub type SentinelResult<T> = Result<T, SentinelError>;

/// Known markers
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Sentinel {
    /// Fencing election in progress
    Electing,
    /// Pool import in progress
    Importing,
    /// A pool import failed
    Failed,
    /// This node owns the pools
    AssumedMaster,
    /// Reentrancy guard for one event key
    EventState(String),
    /// Operator-initiated takeover
    UserOverride,
    /// Pool decryption still needs operator action
    NeedOp,
}

impl Sentinel {
    /// File name under the sentinel directory
    pub fn file_name(&self) -> String {
        match self {
            Sentinel::Electing => ".failover_electing".to_string(),
            Sentinel::Importing => ".failover_importing".to_string(),
            Sentinel::Failed => ".failover_failed".to_string(),
            Sentinel::AssumedMaster => ".failover_master".to_string(),
            Sentinel::EventState(key) => format!(".failover_state{}", key),
            Sentinel::UserOverride => "failover_override".to_string(),
            Sentinel::NeedOp => ".failover_needop".to_string(),
        }
    }
}

/// Directory-backed sentinel set
#[derive(Debug, Clone)]
pub struct SentinelStore {
    root: PathBuf,
}

impl SentinelStore {
    pub fn new(root: impl Into<PathBuf>) -> SentinelResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|err| SentinelError::Io {
            name: root.display().to_string(),
            err,
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, sentinel: &Sentinel) -> PathBuf {
        self.root.join(sentinel.file_name())
    }

    pub fn exists(&self, sentinel: &Sentinel) -> bool {
        self.path(sentinel).exists()
    }

    /// Create (or re-stamp) a marker
    pub fn create(&self, sentinel: &Sentinel) -> SentinelResult<()> {
        let path = self.path(sentinel);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|err| io_err(sentinel, err))?;
        file.set_modified(SystemTime::now())
            .map_err(|err| io_err(sentinel, err))?;
        debug!("Created sentinel {}", path.display());
        Ok(())
    }

    /// Create the marker only if absent. Returns false when it already
    /// existed.
    pub fn create_new(&self, sentinel: &Sentinel) -> SentinelResult<bool> {
        match OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.path(sentinel))
        {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(io_err(sentinel, err)),
        }
    }

    /// Remove a marker; absent markers are not an error
    pub fn remove(&self, sentinel: &Sentinel) -> SentinelResult<()> {
        match std::fs::remove_file(self.path(sentinel)) {
            Ok(()) => {
                debug!("Removed sentinel {}", sentinel.file_name());
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(sentinel, err)),
        }
    }

    /// Remove, logging instead of failing. Used on cleanup paths.
    pub fn discard(&self, sentinel: &Sentinel) {
        if let Err(e) = self.remove(sentinel) {
            warn!("{}", e);
        }
    }

    pub fn mtime(&self, sentinel: &Sentinel) -> Option<SystemTime> {
        File::open(self.path(sentinel))
            .and_then(|f| f.metadata())
            .and_then(|m| m.modified())
            .ok()
    }

    /// Marker that is removed when the returned guard drops
    pub fn scoped(self: &Arc<Self>, sentinel: Sentinel) -> SentinelGuard {
        SentinelGuard {
            store: Arc::clone(self),
            sentinel,
        }
    }
}

fn io_err(sentinel: &Sentinel, err: io::Error) -> SentinelError {
    SentinelError::Io {
        name: sentinel.file_name(),
        err,
    }
}

/// Removes its sentinel on every exit path
pub struct SentinelGuard {
    store: Arc<SentinelStore>,
    sentinel: Sentinel,
}

impl SentinelGuard {
    pub fn sentinel(&self) -> &Sentinel {
        &self.sentinel
    }
}

impl Drop for SentinelGuard {
    fn drop(&mut self) {
        self.store.discard(&self.sentinel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_exists_remove() {
        let dir = TempDir::new().unwrap();
        let store = SentinelStore::new(dir.path()).unwrap();

        assert!(!store.exists(&Sentinel::Electing));
        store.create(&Sentinel::Electing).unwrap();
        assert!(store.exists(&Sentinel::Electing));
        assert!(store.mtime(&Sentinel::Electing).is_some());

        store.remove(&Sentinel::Electing).unwrap();
        assert!(!store.exists(&Sentinel::Electing));
        // Removing twice is fine
        store.remove(&Sentinel::Electing).unwrap();
        assert!(store.mtime(&Sentinel::Electing).is_none());
    }

    #[test]
    fn test_create_new_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let store = SentinelStore::new(dir.path()).unwrap();
        let key = Sentinel::EventState("MASTER@em0".to_string());

        assert!(store.create_new(&key).unwrap());
        assert!(!store.create_new(&key).unwrap());
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SentinelStore::new(dir.path()).unwrap());

        {
            store.create(&Sentinel::Importing).unwrap();
            let _guard = store.scoped(Sentinel::Importing);
            assert!(store.exists(&Sentinel::Importing));
        }
        assert!(!store.exists(&Sentinel::Importing));
    }

    #[test]
    fn test_file_names_are_distinct() {
        let names = [
            Sentinel::Electing,
            Sentinel::Importing,
            Sentinel::Failed,
            Sentinel::AssumedMaster,
            Sentinel::EventState("BACKUP".to_string()),
            Sentinel::UserOverride,
            Sentinel::NeedOp,
        ]
        .iter()
        .map(Sentinel::file_name)
        .collect::<std::collections::HashSet<_>>();
        assert_eq!(names.len(), 7);
    }
}
