//! ZFS pool import/export
//!
//! Import is atomic from the caller's point of view: either the pool is
//! imported on return or an error is surfaced and it is not. Export with
//! `force` detaches clients, so callers close the packet filter first.

use crate::host::exec::{execute_async, run, ExecutionError};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("zpool execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Failed to import pool '{name}': {reason}")]
    Import { name: String, reason: String },

    #[error("Failed to export pool '{name}': {reason}")]
    Export { name: String, reason: String },

    #[error("Cache file error: {0}")]
    Cache(#[from] io::Error),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Value of the pool's `cachefile` property during import
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheFile {
    None,
    Path(PathBuf),
}

/// Arguments of one import
#[derive(Debug, Clone)]
pub struct ImportOptions {
    pub cachefile: CacheFile,
    /// Alternate root the datasets mount under
    pub mount_root: PathBuf,
    /// Import even if the pool looks active elsewhere
    pub force: bool,
    /// Import with missing log devices
    pub missing_log: bool,
    /// Saved cache file to read device paths from
    pub cache_source: Option<PathBuf>,
}

impl ImportOptions {
    /// The options used during failover
    pub fn failover(mount_root: impl Into<PathBuf>, cache_source: Option<PathBuf>) -> Self {
        Self {
            cachefile: CacheFile::None,
            mount_root: mount_root.into(),
            force: true,
            missing_log: true,
            cache_source,
        }
    }

    pub fn to_args(&self, name: &str) -> Vec<String> {
        let mut args = vec!["import".to_string()];
        if let Some(source) = &self.cache_source {
            args.push("-c".to_string());
            args.push(source.display().to_string());
        }
        args.push("-o".to_string());
        args.push(match &self.cachefile {
            CacheFile::None => "cachefile=none".to_string(),
            CacheFile::Path(p) => format!("cachefile={}", p.display()),
        });
        if self.missing_log {
            args.push("-m".to_string());
        }
        args.push("-R".to_string());
        args.push(self.mount_root.display().to_string());
        if self.force {
            args.push("-f".to_string());
        }
        args.push(name.to_string());
        args
    }
}

/// Pool manager
#[async_trait]
pub trait PoolManager: Send + Sync {
    async fn import(&self, name: &str, options: &ImportOptions) -> PoolResult<()>;

    async fn export(&self, name: &str, force: bool) -> PoolResult<()>;

    async fn is_imported(&self, name: &str) -> PoolResult<bool>;

    async fn set_cachefile(&self, name: &str, path: &Path) -> PoolResult<()>;

    /// Human readable pool status for diagnostics
    async fn status(&self, name: &str) -> PoolResult<String>;
}

/// `zpool(8)` backed manager
pub struct Zpool {
    bin: PathBuf,
}

impl Zpool {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl PoolManager for Zpool {
    async fn import(&self, name: &str, options: &ImportOptions) -> PoolResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(options.to_args(name));
        execute_async(&mut cmd).await.map_err(|e| PoolError::Import {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn export(&self, name: &str, force: bool) -> PoolResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("export");
        if force {
            cmd.arg("-f");
        }
        cmd.arg(name);
        execute_async(&mut cmd).await.map_err(|e| PoolError::Export {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    async fn is_imported(&self, name: &str) -> PoolResult<bool> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("list").arg("-H").arg("-o").arg("name").arg(name);
        let output = run(&mut cmd).await?;
        Ok(output.status.success())
    }

    async fn set_cachefile(&self, name: &str, path: &Path) -> PoolResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("set")
            .arg(format!("cachefile={}", path.display()))
            .arg(name);
        execute_async(&mut cmd).await?;
        Ok(())
    }

    async fn status(&self, name: &str) -> PoolResult<String> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("status").arg(name);
        let output = run(&mut cmd).await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// zpool.cache hygiene around failover imports.
///
/// The `killcache` marker is created before importing and removed after a
/// clean run. Finding it already present means the previous import crashed
/// mid-way, so both cache files are discarded and the next import scans
/// devices instead of trusting a possibly poisoned cache.
#[derive(Debug, Clone)]
pub struct ZfsCache {
    dir: PathBuf,
}

impl ZfsCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Canonical cache path pools are pointed at after import
    pub fn cache_path(&self) -> PathBuf {
        self.dir.join("zpool.cache")
    }

    pub fn saved_path(&self) -> PathBuf {
        self.dir.join("zpool.cache.saved")
    }

    pub fn killcache_path(&self) -> PathBuf {
        self.dir.join("killcache")
    }

    /// Saved cache to import from, if any
    pub fn import_source(&self) -> Option<PathBuf> {
        let saved = self.saved_path();
        saved.exists().then_some(saved)
    }

    /// Runs before the first import of a promotion
    pub fn prepare_import(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let killcache = self.killcache_path();
        if killcache.exists() {
            warn!("Previous import did not finish, discarding zpool cache");
            remove_if_exists(&self.cache_path())?;
            remove_if_exists(&self.saved_path())?;
        } else {
            let marker = std::fs::File::create(&killcache)?;
            marker.sync_all()?;
        }
        self.save_if_newer()
    }

    /// Runs after all imports. A failed import keeps the old saved copy.
    pub fn finish_import(&self, failed: bool) -> io::Result<()> {
        remove_if_exists(&self.killcache_path())?;
        if !failed && self.cache_path().exists() {
            std::fs::copy(self.cache_path(), self.saved_path())?;
            debug!("Saved zpool cache");
        }
        Ok(())
    }

    fn save_if_newer(&self) -> io::Result<()> {
        let cache = self.cache_path();
        let Ok(cache_meta) = std::fs::metadata(&cache) else {
            return Ok(());
        };
        let newer = match std::fs::metadata(self.saved_path()) {
            Ok(saved_meta) => cache_meta.modified()? > saved_meta.modified()?,
            Err(_) => true,
        };
        if newer {
            std::fs::copy(&cache, self.saved_path())?;
            info!("Refreshed saved zpool cache");
        }
        Ok(())
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
