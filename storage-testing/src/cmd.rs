use std::process::Command;

use crate::errors::{Result, TestingError};

pub fn render(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Runs `command` to completion and returns its stdout.
pub fn run(command: &str, args: &[String]) -> Result<String> {
    let rendered = render(command, args);
    let program = which::which(command).map_err(|_| TestingError::ToolMissing {
        tool: command.to_string(),
    })?;

    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|error| TestingError::CommandFailed {
            command: rendered.clone(),
            stderr: error.to_string(),
        })?;

    if !output.status.success() {
        return Err(TestingError::CommandFailed {
            command: rendered,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
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
        let rendered = render("losetup", &args);
        assert_eq!(rendered, "losetup --find --show disk.img");
        assert_eq!(render("sync", &[]), "sync");
    }

    #[test]
    fn missing_tool_is_reported() {
        let err = run("localdrive-no-such-tool", &[]).expect_err("missing tool");
        assert!(matches!(err, TestingError::ToolMissing { .. }));
    }
}
