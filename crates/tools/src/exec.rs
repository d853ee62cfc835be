//! Shell execution tool — `sh -c` with a hard timeout, a deny-list of
//! destructive patterns, and output truncation.

use std::time::Duration;

use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::registry::{Tool, ToolContext};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_OUTPUT_CHARS: usize = 10_000;

/// Substrings that block a command outright.
const DENY_PATTERNS: &[&str] = &[
    "rm -rf /",
    "rm -rf ~",
    "> /dev/",
    "mkfs",
    "dd if=",
    ":(){:|:&};:",
];

pub struct ExecTool;

#[async_trait::async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        "exec"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace. Runs with a hard timeout; \
         destructive patterns are blocked."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"},
                "workdir": {"type": "string", "description": "Working directory (defaults to the workspace)"},
                "timeout": {"type": "integer", "description": "Timeout in seconds (default 30)"}
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let command = params["command"].as_str().unwrap_or_default();
        let timeout_secs = params["timeout"].as_u64().unwrap_or(DEFAULT_TIMEOUT_SECS);
        let workdir = params["workdir"]
            .as_str()
            .map(std::path::PathBuf::from)
            .unwrap_or_else(|| ctx.workspace_dir.clone());

        for pattern in DENY_PATTERNS {
            if command.contains(pattern) {
                return ToolResult::fail(format!(
                    "Command blocked for safety: contains '{pattern}'"
                ));
            }
        }

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&workdir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return ToolResult::fail(format!("failed to spawn: {e}")),
        };

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return ToolResult::fail(e.to_string()),
            Err(_) => {
                return ToolResult::fail(format!("Command timed out after {timeout_secs}s"));
            }
        };

        let stdout = truncate(&String::from_utf8_lossy(&output.stdout));
        let stderr = truncate(&String::from_utf8_lossy(&output.stderr));
        let exit_code = output.status.code();
        let success = output.status.success();

        ToolResult {
            success,
            data: Some(json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": exit_code,
            })),
            message: if success { Some(stdout) } else { None },
            error: if success { None } else { Some(stderr) },
            requires_approval: false,
            approval_id: None,
        }
    }
}

fn truncate(s: &str) -> String {
    if s.chars().count() <= MAX_OUTPUT_CHARS {
        return s.to_owned();
    }
    let kept: String = s.chars().take(MAX_OUTPUT_CHARS).collect();
    format!("{kept}\n... (truncated)")
}
