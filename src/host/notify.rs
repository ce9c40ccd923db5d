//! Mail side-channel. Best effort; callers log and move on.

use super::exec::{command_to_string, ExecutionError};
use super::{HostError, HostResult};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, body: &str) -> HostResult<()>;
}

/// `mail(1)` to a local recipient
pub struct Mail {
    bin: PathBuf,
    recipient: String,
}

impl Mail {
    pub fn new(bin: impl Into<PathBuf>, recipient: impl Into<String>) -> Self {
        Self {
            bin: bin.into(),
            recipient: recipient.into(),
        }
    }
}

#[async_trait]
impl Notifier for Mail {
    async fn notify(&self, subject: &str, body: &str) -> HostResult<()> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg("-s")
            .arg(subject)
            .arg(&self.recipient)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|err| ExecutionError::ExecutionStart {
            command: command_to_string(&cmd),
            err,
        })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
        }
        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(HostError::Parse(format!("mail exited with {}", status)))
        }
    }
}
