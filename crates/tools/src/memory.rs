//! Workspace memory tools — scoped reads and writes inside one agent's
//! workspace directory. Paths are validated lexically so a crafted relative
//! path can never escape the workspace root.

use std::path::{Component, Path, PathBuf};

use chrono::Local;
use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::registry::{Tool, ToolContext};

/// Resolve `rel` inside `workspace`, rejecting absolute paths and any
/// `..` traversal.
pub(crate) fn resolve_within(workspace: &Path, rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return None;
    }
    for component in rel_path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return None,
        }
    }
    Some(workspace.join(rel_path))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// memory_read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryReadTool;

#[async_trait::async_trait]
impl Tool for MemoryReadTool {
    fn name(&self) -> &str {
        "memory_read"
    }

    fn description(&self) -> &str {
        "Read a file from your workspace (SOUL.md, memory/YYYY-MM-DD.md, skills/*, ...)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file": {
                    "type": "string",
                    "description": "Path relative to the workspace, e.g. 'MEMORY.md' or 'memory/2026-08-01.md'"
                }
            },
            "required": ["file"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let file = params["file"].as_str().unwrap_or_default();
        let Some(path) = resolve_within(&ctx.workspace_dir, file) else {
            return ToolResult::fail("Cannot read outside workspace directory");
        };

        match std::fs::read_to_string(&path) {
            Ok(content) => {
                let chars = content.len();
                ToolResult::ok_with_data(
                    format!("Read {chars} characters from {file}"),
                    json!({"content": content}),
                )
            }
            Err(_) => ToolResult::fail(format!("File not found: {file}")),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// memory_write
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct MemoryWriteTool;

#[async_trait::async_trait]
impl Tool for MemoryWriteTool {
    fn name(&self) -> &str {
        "memory_write"
    }

    fn description(&self) -> &str {
        "Write a workspace file. Use append=true to log to daily memory files \
         (memory/YYYY-MM-DD.md); appended entries are timestamped."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "file": {
                    "type": "string",
                    "description": "Path relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "Content to write"
                },
                "append": {
                    "type": "boolean",
                    "description": "Append instead of replacing",
                    "default": false
                }
            },
            "required": ["file", "content"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let file = params["file"].as_str().unwrap_or_default();
        let content = params["content"].as_str().unwrap_or_default();
        let append = params["append"].as_bool().unwrap_or(false);

        let Some(path) = resolve_within(&ctx.workspace_dir, file) else {
            return ToolResult::fail("Cannot write outside workspace directory");
        };

        if let Some(parent) = path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                return ToolResult::fail(e.to_string());
            }
        }

        let is_daily = file.starts_with("memory/") && file.ends_with(".md");

        let result = if append {
            let mut buf = String::new();
            if !path.exists() && is_daily {
                let date = file.trim_start_matches("memory/").trim_end_matches(".md");
                buf.push_str(&format!("# Memory Log: {date}\n"));
            }
            let stamp = Local::now().format("%H:%M");
            buf.push_str(&format!("\n**{stamp}:** {content}\n"));
            append_to_file(&path, &buf)
        } else {
            std::fs::write(&path, content)
        };

        match result {
            Ok(()) => ToolResult::ok(format!(
                "{} {file}",
                if append { "Appended to" } else { "Wrote" }
            )),
            Err(e) => ToolResult::fail(e.to_string()),
        }
    }
}

fn append_to_file(path: &Path, content: &str) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(content.as_bytes())
}
