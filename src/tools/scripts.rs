//! Shell command execution with timeout and output capture.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::Tool;

/// Default command timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Hard ceiling on the requested timeout.
const MAX_TIMEOUT_SECS: u64 = 600;

/// Substrings that disqualify a command outright.
const BLOCKED_PATTERNS: &[&str] = &["rm -rf /", "mkfs", "dd if=", "> /dev/", ":(){ :|:& };:"];

/// Run a shell command in the workspace.
pub struct RunCommand;

#[async_trait]
impl Tool for RunCommand {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace. Returns stdout, stderr, and the exit code."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run."
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds. Default: 30."
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, workspace: &Path) -> anyhow::Result<String> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("missing required argument 'command'"))?;

        if BLOCKED_PATTERNS.iter().any(|p| command.contains(p)) {
            return Ok("Blocked: potentially dangerous command.".to_string());
        }

        let timeout_secs = args
            .get("timeout")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(workspace)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Ok(format!("Command timed out after {}s", timeout_secs));
            }
        };

        let mut parts = Vec::new();
        if !output.stdout.is_empty() {
            parts.push(format!(
                "STDOUT:\n{}",
                String::from_utf8_lossy(&output.stdout)
            ));
        }
        if !output.stderr.is_empty() {
            parts.push(format!(
                "STDERR:\n{}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        if !output.status.success() {
            parts.push(format!("Exit code: {}", output.status.code().unwrap_or(-1)));
        }

        if parts.is_empty() {
            Ok("Command completed (no output).".to_string())
        } else {
            Ok(parts.join("\n"))
        }
    }
}
