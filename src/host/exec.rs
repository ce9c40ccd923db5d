//! Subprocess execution helpers
//!
//! Every OS tool the engine drives (ifconfig, zpool, fenced, pfctl, ...) is
//! invoked through these helpers so failures carry the command line, exit
//! status and captured output.

use std::process::{ExitStatus, Output};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Details of a command that ran and exited unsuccessfully
#[derive(Debug)]
pub struct CommandFailureInfo {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout.trim())?;
        write!(f, "  stderr: {}", self.stderr.trim())
    }
}

/// Subprocess errors
#[derive(Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Command [{command}] did not finish within {secs}s")]
    Timeout { command: String, secs: u64 },

    #[error("Failed to parse command output: {0}")]
    ParseFailure(String),
}

impl ExecutionError {
    /// Exit code of a command that ran to completion, if any
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecutionError::CommandFailure(info) => info.status.code(),
            _ => None,
        }
    }
}

pub type ExecutionResult<T> = Result<T, ExecutionError>;

pub(crate) fn command_to_string(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|s| s.to_string_lossy().into_owned())
        .collect::<Vec<String>>()
        .join(" ")
}

fn output_to_exec_error(command: &Command, output: &Output) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Run a command to completion and fail on a non-zero exit status.
pub async fn execute_async(command: &mut Command) -> ExecutionResult<Output> {
    let output = run(command).await?;

    if !output.status.success() {
        return Err(output_to_exec_error(command, &output));
    }

    Ok(output)
}

/// Run a command to completion and hand back its output whatever the exit
/// status. Only a failure to spawn is an error.
pub async fn run(command: &mut Command) -> ExecutionResult<Output> {
    debug!("Executing [{}]", command_to_string(command));
    command.kill_on_drop(true);
    command
        .output()
        .await
        .map_err(|err| ExecutionError::ExecutionStart {
            command: command_to_string(command),
            err,
        })
}

/// Same as [`execute_async`] but bounded by `limit`. The child is killed when
/// the deadline passes.
pub async fn execute_with_timeout(
    command: &mut Command,
    limit: Duration,
) -> ExecutionResult<Output> {
    match tokio::time::timeout(limit, execute_async(command)).await {
        Ok(result) => result,
        Err(_) => Err(ExecutionError::Timeout {
            command: command_to_string(command),
            secs: limit.as_secs(),
        }),
    }
}

/// Decode stdout, trimming the trailing newline tools print.
pub fn stdout_string(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout)
        .trim_end_matches('\n')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_execute_success() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo hello");
        let output = execute_async(&mut cmd).await.unwrap();
        assert_eq!(stdout_string(&output), "hello");
    }

    #[tokio::test]
    async fn test_execute_failure_keeps_exit_code() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo oops >&2; exit 3");
        let err = execute_async(&mut cmd).await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(err.to_string().contains("oops"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let mut cmd = Command::new("/nonexistent/definitely-not-here");
        let err = execute_async(&mut cmd).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ExecutionStart { .. }));
        assert_eq!(err.exit_code(), None);
    }

    #[tokio::test]
    async fn test_timeout() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let err = execute_with_timeout(&mut cmd, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout { .. }));
    }
}
