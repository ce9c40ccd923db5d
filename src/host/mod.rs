//! Host OS gates
//!
//! Thin typed wrappers around the system tools the engine toggles during a
//! transition: watchdog, packet filter, kernel HA knobs, key providers and
//! the mail side-channel. Each is a trait so tests can record the order of
//! calls instead of touching the machine.

pub mod exec;
pub mod keys;
pub mod notify;
pub mod pf;
pub mod sysctl;
pub mod watchdog;

use exec::ExecutionError;
use thiserror::Error;

/// Host gate errors
#[derive(Error, Debug)]
pub enum HostError {
    #[error("Host command failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected output: {0}")]
    Parse(String),
}

pub type HostResult<T> = Result<T, HostError>;

pub use keys::{EncHelper, KeyProviders};
pub use notify::{Mail, Notifier};
pub use pf::{PacketFilter, Pfctl};
pub use sysctl::{HaRole, Kernel, Sysctl};
pub use watchdog::{Watchdog, WatchdogAlert, WatchdogCmd};
