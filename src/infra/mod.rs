//! Infrastructure runners: terraform, the cluster control plane and local
//! tool installation
//!
//! All runners shell out through [`run_command`], which spawns children with
//! `kill_on_drop` so an aborted stage does not leave processes behind.

pub mod kubectl;
pub mod terraform;
pub mod tools;
pub mod tunnel;

pub use kubectl::{
    ControlPlane, KubectlControlPlane, PortForwardTarget, SecretSpec, Workload, WorkloadKind,
};
pub use terraform::{Terraform, TerraformCli, TerraformRun};
pub use tools::{HttpToolInstaller, ToolInstaller};
pub use tunnel::TunnelGuard;

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InfraError {
    #[error("Command `{command}` failed: {message}")]
    CommandFailed { command: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {timeout:?} waiting for {what}")]
    Timeout { what: String, timeout: Duration },

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Unexpected command output: {0}")]
    Parse(String),
}

/// Run a command to completion and return its stdout
///
/// `description` replaces the argument list in error messages, so callers
/// passing secrets on the command line can keep them out of logs.
pub async fn run_command(
    command: &mut Command,
    description: &str,
    stdin: Option<&[u8]>,
) -> Result<String, InfraError> {
    debug!("running {}", description);
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(InfraError::CommandFailed {
            command: description.to_string(),
            message: if stderr.is_empty() {
                format!("exited with {}", output.status)
            } else {
                stderr
            },
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_command_captures_stdout() {
        let out = run_command(Command::new("echo").arg("hello"), "echo hello", None)
            .await
            .unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_command_feeds_stdin() {
        let out = run_command(&mut Command::new("cat"), "cat", Some(b"piped"))
            .await
            .unwrap();
        assert_eq!(out, "piped");
    }

    #[tokio::test]
    async fn test_run_command_failure_uses_description() {
        let result = run_command(
            Command::new("sh").args(["-c", "echo boom >&2; exit 3"]),
            "sh <redacted>",
            None,
        )
        .await;
        match result {
            Err(InfraError::CommandFailed { command, message }) => {
                assert_eq!(command, "sh <redacted>");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_io_error() {
        let result = run_command(
            &mut Command::new("clusterforge-no-such-binary"),
            "missing",
            None,
        )
        .await;
        assert!(matches!(result, Err(InfraError::Io(_))));
    }
}
