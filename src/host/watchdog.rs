//! Watchdog arm/disarm and the post-reboot alert marker

use super::exec::execute_async;
use super::HostResult;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::io;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, warn};

/// Hardware/software watchdog
#[async_trait]
pub trait Watchdog: Send + Sync {
    /// Reboot the node unless disarmed within `secs`
    async fn arm(&self, secs: u32) -> HostResult<()>;

    async fn disarm(&self) -> HostResult<()>;

    /// Stop the userland daemon that keeps patting the watchdog
    async fn stop_supervisor(&self) -> HostResult<()>;

    async fn start_supervisor(&self) -> HostResult<()>;
}

/// `watchdog(8)` plus the `watchdogd` rc service
pub struct WatchdogCmd {
    bin: PathBuf,
    service: PathBuf,
}

impl WatchdogCmd {
    pub fn new(bin: impl Into<PathBuf>, service: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            service: service.into(),
        }
    }

    async fn timeout(&self, secs: u32) -> HostResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-t").arg(secs.to_string());
        execute_async(&mut cmd).await?;
        Ok(())
    }

    async fn supervisor(&self, action: &str) -> HostResult<()> {
        let mut cmd = Command::new(&self.service);
        cmd.arg("watchdogd").arg(action);
        execute_async(&mut cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl Watchdog for WatchdogCmd {
    async fn arm(&self, secs: u32) -> HostResult<()> {
        self.timeout(secs).await
    }

    async fn disarm(&self) -> HostResult<()> {
        self.timeout(0).await
    }

    async fn stop_supervisor(&self) -> HostResult<()> {
        self.supervisor("quietstop").await
    }

    async fn start_supervisor(&self) -> HostResult<()> {
        self.supervisor("quietstart").await
    }
}

/// Marker written right before the watchdog is armed. Finding it after boot
/// means the watchdog fired mid-export.
///
/// Payload: the epoch second as 4 little-endian bytes.
#[derive(Debug, Clone)]
pub struct WatchdogAlert {
    path: PathBuf,
}

impl WatchdogAlert {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    pub fn write(&self, at: DateTime<Utc>) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let epoch = u32::try_from(at.timestamp()).unwrap_or(u32::MAX);
        std::fs::write(&self.path, epoch.to_le_bytes())?;
        debug!("Wrote watchdog alert marker at {}", at);
        Ok(())
    }

    pub fn write_now(&self) -> io::Result<()> {
        self.write(Utc::now())
    }

    /// Timestamp stored in the marker. `None` if absent or malformed.
    pub fn read(&self) -> Option<DateTime<Utc>> {
        let data = std::fs::read(&self.path).ok()?;
        let bytes: [u8; 4] = match data.as_slice().try_into() {
            Ok(bytes) => bytes,
            Err(_) => {
                warn!(
                    "Watchdog alert marker {} has {} bytes, expected 4",
                    self.path.display(),
                    data.len()
                );
                return None;
            }
        };
        Utc.timestamp_opt(i64::from(u32::from_le_bytes(bytes)), 0).single()
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn remove(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
