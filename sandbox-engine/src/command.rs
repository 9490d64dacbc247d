//! One-shot host tool invocations (`unshare`, container engines, venv setup).
//!
//! Sandbox workloads never go through here; they run in their own process
//! groups under the lifecycle controller.

use std::process::Output;
use std::time::Duration;

use tokio::process::Command;
use tracing::trace;

/// A host tool that could not be started or exited non-zero.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

impl CommandError {
    fn new(program: &str, args: &[&str], detail: impl Into<String>) -> Self {
        Self {
            command: command_line(program, args),
            detail: detail.into(),
        }
    }
}

fn command_line(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

async fn output(program: &str, args: &[&str]) -> Result<Output, CommandError> {
    trace!(command = %command_line(program, args), "exec");
    Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandError::new(program, args, e.to_string()))
}

/// Run `program` and return its trimmed stdout; stderr becomes the error detail.
pub async fn exec(program: &str, args: &[&str]) -> Result<String, CommandError> {
    let out = output(program, args).await?;
    if out.status.success() {
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&out.stderr);
        Err(CommandError::new(program, args, stderr.trim()))
    }
}

/// [`exec`] bounded by `timeout`. The child is killed when the deadline passes.
pub async fn exec_timeout(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, CommandError> {
    tokio::time::timeout(timeout, exec(program, args))
        .await
        .unwrap_or_else(|_| {
            Err(CommandError::new(
                program,
                args,
                format!("timed out after {}ms", timeout.as_millis()),
            ))
        })
}

/// Best effort; failures are only traced.
pub async fn exec_ignore_errors(program: &str, args: &[&str]) {
    if let Err(e) = exec(program, args).await {
        trace!(command = %e.command, detail = %e.detail, "command failed (ignored)");
    }
}
