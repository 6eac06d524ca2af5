// SPDX-License-Identifier: GPL-3.0-only

//! Cancellable host tool invocation

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{Result, SysError};

pub fn render(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Resolves `tool` on `PATH`
pub fn resolve(tool: &str) -> Result<PathBuf> {
    which::which(tool).map_err(|_| SysError::ToolNotFound(tool.to_string()))
}

/// Runs `tool` to completion and returns its stdout.
///
/// The child is killed when `cancel` fires. A non-zero exit becomes
/// `SysError::CommandFailed` carrying stderr, or stdout when stderr is empty.
pub async fn run(tool: &str, args: &[String], cancel: &CancellationToken) -> Result<String> {
    let program = resolve(tool)?;
    let rendered = render(tool, args);
    tracing::debug!(command = %rendered, "running host tool");

    let child = Command::new(&program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| SysError::CommandFailed {
            command: rendered.clone(),
            stderr: error.to_string(),
        })?;

    let output = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(SysError::Cancelled),
        output = child.wait_with_output() => output?,
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(SysError::CommandFailed {
            command: rendered,
            stderr: if stderr.is_empty() {
                stdout.trim().to_string()
            } else {
                stderr
            },
        });
    }

    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_command_context() {
        let args = vec![
            "--find".to_string(),
            "--show".to_string(),
            "disk.img".to_string(),
        ];
        assert_eq!(render("losetup", &args), "losetup --find --show disk.img");
        assert_eq!(render("sync", &[]), "sync");
    }

    #[test]
    fn missing_tool_is_reported() {
        let err = resolve("localdrive-no-such-tool").expect_err("tool should be missing");
        assert!(matches!(err, SysError::ToolNotFound(_)));
    }

    #[tokio::test]
    async fn captures_stdout_and_failures() {
        let cancel = CancellationToken::new();
        let out = run("echo", &["hello".to_string()], &cancel).await.expect("echo");
        assert_eq!(out.trim(), "hello");

        let err = run("false", &[], &cancel).await.expect_err("false fails");
        assert!(matches!(err, SysError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = run("sleep", &["30".to_string()], &cancel)
            .await
            .expect_err("cancelled");
        assert!(matches!(err, SysError::Cancelled));
    }
}
