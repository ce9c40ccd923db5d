//! Disk fencing
//!
//! Wraps the fencing daemon, which places persistent SCSI reservations on the
//! shared disks and then daemonizes. Its exit code decides the election; each
//! losing code maps to a distinct advskew penalty so the peer wins the next
//! CARP round deterministically.

use crate::host::exec::{command_to_string, run, ExecutionError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Fencing errors (the daemon could not be run at all)
#[derive(Error, Debug)]
pub enum FencingError {
    #[error("Failed to run fencing daemon: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Fencing daemon killed by signal: {0}")]
    Signaled(String),
}

pub type FencingOutcome = Result<FencingResult, FencingError>;

/// fenced exits with this when it is already running locally
pub const FENCED_ALREADY_RUNNING: i32 = 6;

/// Outcome of one fencing attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FencingResult {
    Ok,
    CannotRegister,
    RemoteRunning,
    CannotReserve,
    CannotExclude,
    Fatal,
    Unknown(i32),
}

/// Exit code -> result. advskew penalties live in [`FencingResult::penalty`].
const EXIT_CODES: &[(i32, FencingResult)] = &[
    (0, FencingResult::Ok),
    (1, FencingResult::CannotRegister),
    (2, FencingResult::RemoteRunning),
    (3, FencingResult::CannotReserve),
    (4, FencingResult::CannotExclude),
    (5, FencingResult::Fatal),
];

impl FencingResult {
    pub fn from_code(code: i32) -> Self {
        EXIT_CODES
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, r)| *r)
            .unwrap_or(FencingResult::Unknown(code))
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, FencingResult::Ok)
    }

    /// advskew applied after losing the election. Unknown codes are treated
    /// like CANNOT_EXCLUDE.
    pub fn penalty(&self) -> Option<u32> {
        match self {
            FencingResult::Ok => None,
            FencingResult::CannotRegister => Some(201),
            FencingResult::RemoteRunning => Some(202),
            FencingResult::CannotReserve => Some(203),
            FencingResult::CannotExclude | FencingResult::Unknown(_) => Some(204),
            FencingResult::Fatal => Some(205),
        }
    }

    /// Codes that indicate a bug or broken installation rather than a lost
    /// election
    pub fn is_programming_error(&self) -> bool {
        matches!(self, FencingResult::Unknown(_))
    }
}

impl fmt::Display for FencingResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FencingResult::Ok => f.write_str("OK"),
            FencingResult::CannotRegister => f.write_str("can not register keys on disks"),
            FencingResult::RemoteRunning => f.write_str("remote fenced is running"),
            FencingResult::CannotReserve => f.write_str("can not reserve all disks"),
            FencingResult::CannotExclude => f.write_str("can not exclude disks"),
            FencingResult::Fatal => f.write_str("fencing daemon encountered a fatal error"),
            FencingResult::Unknown(code) => write!(f, "unexpected fencing exit code {}", code),
        }
    }
}

/// Fencing controller
#[async_trait]
pub trait Fencing: Send + Sync {
    /// Run the daemon; blocks until it daemonizes or fails
    async fn fence(&self, boot_disks: &[String], force: bool) -> FencingOutcome;

    /// Kill any running fencing daemon
    async fn kill(&self);
}

/// `fenced` subprocess
pub struct Fenced {
    bin: PathBuf,
    pkill: PathBuf,
}

impl Fenced {
    pub fn new(bin: impl Into<PathBuf>, pkill: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            pkill: pkill.into(),
        }
    }

    fn command(&self, force: bool) -> Command {
        let mut cmd = Command::new(&self.bin);
        cmd.env("LD_LIBRARY_PATH", "/usr/local/lib");
        if force {
            cmd.arg("--force");
        }
        cmd
    }
}

#[async_trait]
impl Fencing for Fenced {
    async fn fence(&self, boot_disks: &[String], force: bool) -> FencingOutcome {
        // fenced discovers the boot pool itself and never reserves it
        debug!("Boot disks left unreserved: {}", boot_disks.join(","));
        let mut cmd = self.command(force);
        info!("Starting fenced: {}", command_to_string(&cmd));
        let output = run(&mut cmd).await?;
        match output.status.code() {
            Some(code) => Ok(FencingResult::from_code(code)),
            None => Err(FencingError::Signaled(output.status.to_string())),
        }
    }

    async fn kill(&self) {
        let mut cmd = Command::new(&self.pkill);
        cmd.arg("-9").arg("-f").arg("fenced");
        // pkill exits 1 when nothing matched
        if let Err(e) = run(&mut cmd).await {
            warn!("Failed to kill fenced: {}", e);
        }
    }
}
