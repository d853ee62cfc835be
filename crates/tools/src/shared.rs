//! Cross-agent shared knowledge area.
//!
//! A per-key markdown store (`knowledge/<key>.md`), an append-only JSONL
//! index, and an append-only findings log, all rooted at a directory every
//! agent can reach. Ordering across concurrent writers follows host
//! file-append semantics.

use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::registry::{Tool, ToolContext};

/// The shared area is a sibling tree of the agents directory:
/// `<root>/agents/<id>` → `<root>/data/shared`.
fn shared_dir(ctx: &ToolContext) -> Option<PathBuf> {
    let root = ctx.workspace_dir.parent()?.parent()?;
    let dir = root.join("data").join("shared");
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}

fn append_jsonl(path: &Path, entry: &Value) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{entry}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// shared_write
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SharedWriteTool;

#[async_trait::async_trait]
impl Tool for SharedWriteTool {
    fn name(&self) -> &str {
        "shared_write"
    }

    fn description(&self) -> &str {
        "Store content under a key in the shared knowledge area all agents can read."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {
                    "type": "string",
                    "description": "Key for the entry, e.g. 'fuel-analysis-2026-08-01'"
                },
                "content": {"type": "string"},
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Optional tags for categorization"
                }
            },
            "required": ["key", "content"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let key = params["key"].as_str().unwrap_or_default();
        let content = params["content"].as_str().unwrap_or_default();
        let tags = params["tags"].clone();
        if key.contains('/') || key.contains("..") {
            return ToolResult::fail("Key must be a plain name");
        }

        let Some(shared) = shared_dir(ctx) else {
            return ToolResult::fail("Shared area unavailable for this workspace");
        };
        let knowledge = shared.join("knowledge");
        if let Err(e) = std::fs::create_dir_all(&knowledge) {
            return ToolResult::fail(e.to_string());
        }

        let tags_json = if tags.is_array() { tags.clone() } else { json!([]) };
        let header = format!(
            "---\nauthor: {}\ncreated: {}\ntags: {}\n---\n\n",
            ctx.agent_id,
            Utc::now().to_rfc3339(),
            tags_json
        );
        if let Err(e) = std::fs::write(knowledge.join(format!("{key}.md")), header + content) {
            return ToolResult::fail(e.to_string());
        }

        let entry = json!({
            "key": key,
            "agent_id": ctx.agent_id,
            "session_key": ctx.session_key,
            "timestamp": Utc::now().to_rfc3339(),
            "tags": tags_json,
            "size": content.len(),
        });
        if let Err(e) = append_jsonl(&shared.join("index.jsonl"), &entry) {
            tracing::warn!(error = %e, "failed to append shared index entry");
        }

        ToolResult::ok(format!(
            "Shared knowledge '{key}' saved ({} chars). All agents can now read it.",
            content.len()
        ))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// shared_read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SharedReadTool;

#[async_trait::async_trait]
impl Tool for SharedReadTool {
    fn name(&self) -> &str {
        "shared_read"
    }

    fn description(&self) -> &str {
        "Read an entry from the shared knowledge area by key."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "key": {"type": "string"}
            },
            "required": ["key"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let key = params["key"].as_str().unwrap_or_default();
        let Some(shared) = shared_dir(ctx) else {
            return ToolResult::fail("Shared area unavailable for this workspace");
        };

        let path = shared.join("knowledge").join(format!("{key}.md"));
        match std::fs::read_to_string(&path) {
            Ok(content) => ToolResult::ok_with_data(
                format!("Read shared knowledge '{key}' ({} chars)", content.len()),
                json!({"key": key, "content": content}),
            ),
            Err(_) => {
                let available = list_keys(&shared.join("knowledge"));
                ToolResult::fail(format!(
                    "Key '{key}' not found. Available keys: {:?}",
                    &available[..available.len().min(20)]
                ))
            }
        }
    }
}

fn list_keys(knowledge: &Path) -> Vec<String> {
    let mut keys: Vec<String> = std::fs::read_dir(knowledge)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter_map(|e| {
                    let name = e.file_name().to_string_lossy().into_owned();
                    name.strip_suffix(".md").map(str::to_owned)
                })
                .collect()
        })
        .unwrap_or_default();
    keys.sort();
    keys
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// shared_log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SharedLogTool;

#[async_trait::async_trait]
impl Tool for SharedLogTool {
    fn name(&self) -> &str {
        "shared_log"
    }

    fn description(&self) -> &str {
        "Append a finding to the shared append-only log all agents can search."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "finding": {"type": "string"},
                "category": {
                    "type": "string",
                    "description": "e.g. 'anomaly', 'insight', 'warning', 'status'"
                },
                "severity": {
                    "type": "string",
                    "enum": ["info", "warning", "critical"]
                }
            },
            "required": ["finding"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let finding = params["finding"].as_str().unwrap_or_default();
        let category = params["category"].as_str().unwrap_or("general");
        let severity = params["severity"].as_str().unwrap_or("info");

        let Some(shared) = shared_dir(ctx) else {
            return ToolResult::fail("Shared area unavailable for this workspace");
        };

        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "agent_id": ctx.agent_id,
            "session_key": ctx.session_key,
            "category": category,
            "severity": severity,
            "finding": finding,
        });
        if let Err(e) = append_jsonl(&shared.join("findings.jsonl"), &entry) {
            return ToolResult::fail(e.to_string());
        }

        let preview: String = finding.chars().take(100).collect();
        ToolResult::ok(format!("Logged finding [{severity}|{category}]: {preview}"))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// shared_search
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SharedSearchTool;

#[async_trait::async_trait]
impl Tool for SharedSearchTool {
    fn name(&self) -> &str {
        "shared_search"
    }

    fn description(&self) -> &str {
        "Search shared knowledge entries and the findings log."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string"},
                "category": {"type": "string", "description": "Filter findings by category"},
                "agent_id": {"type": "string", "description": "Filter by authoring agent"},
                "limit": {"type": "integer", "description": "Max results (default 10)"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let query = params["query"].as_str().unwrap_or_default().to_lowercase();
        let category_filter = params["category"].as_str();
        let agent_filter = params["agent_id"].as_str();
        let limit = params["limit"].as_u64().unwrap_or(10) as usize;

        let Some(shared) = shared_dir(ctx) else {
            return ToolResult::fail("Shared area unavailable for this workspace");
        };

        let mut results: Vec<Value> = Vec::new();

        // Knowledge entries: match on key or content.
        let knowledge = shared.join("knowledge");
        for key in list_keys(&knowledge) {
            let content = std::fs::read_to_string(knowledge.join(format!("{key}.md")))
                .unwrap_or_default();
            if key.to_lowercase().contains(&query) || content.to_lowercase().contains(&query) {
                let preview: String = content.chars().take(200).collect();
                results.push(json!({
                    "type": "knowledge",
                    "key": key,
                    "preview": preview,
                }));
            }
        }

        // Findings log.
        if let Ok(raw) = std::fs::read_to_string(shared.join("findings.jsonl")) {
            for line in raw.lines().filter(|l| !l.trim().is_empty()) {
                let Ok(entry) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                if let Some(cat) = category_filter {
                    if entry["category"].as_str() != Some(cat) {
                        continue;
                    }
                }
                if let Some(aid) = agent_filter {
                    if entry["agent_id"].as_str() != Some(aid) {
                        continue;
                    }
                }
                let finding = entry["finding"].as_str().unwrap_or_default();
                let category = entry["category"].as_str().unwrap_or_default();
                if finding.to_lowercase().contains(&query)
                    || category.to_lowercase().contains(&query)
                {
                    let preview: String = finding.chars().take(200).collect();
                    results.push(json!({
                        "type": "finding",
                        "timestamp": entry["timestamp"],
                        "agent_id": entry["agent_id"],
                        "category": entry["category"],
                        "severity": entry["severity"],
                        "finding": preview,
                    }));
                }
            }
        }

        results.truncate(limit);
        let count = results.len();
        ToolResult::ok_with_data(
            format!("Found {count} results for '{query}'"),
            json!({"results": results, "total": count}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Shared tools expect `<root>/agents/<id>` workspaces.
    fn ctx(root: &tempfile::TempDir, agent: &str) -> ToolContext {
        let ws = root.path().join("agents").join(agent);
        std::fs::create_dir_all(&ws).unwrap();
        ToolContext::new(agent, format!("agent:{agent}:main"), ws)
    }

    #[tokio::test]
    async fn write_then_read_across_agents() {
        let root = tempfile::tempdir().unwrap();
        let writer = ctx(&root, "scout");
        let reader = ctx(&root, "analyst");

        let write = SharedWriteTool
            .execute(
                json!({"key": "weather-brief", "content": "storms inbound", "tags": ["wx"]}),
                &writer,
            )
            .await;
        assert!(write.success);

        let read = SharedReadTool
            .execute(json!({"key": "weather-brief"}), &reader)
            .await;
        assert!(read.success);
        let content = read.data.unwrap()["content"].as_str().unwrap().to_owned();
        assert!(content.contains("storms inbound"));
        assert!(content.contains("author: scout"));
    }

    #[tokio::test]
    async fn read_missing_key_lists_available() {
        let root = tempfile::tempdir().unwrap();
        let c = ctx(&root, "scout");
        SharedWriteTool
            .execute(json!({"key": "alpha", "content": "x"}), &c)
            .await;

        let result = SharedReadTool.execute(json!({"key": "missing"}), &c).await;
        assert!(!result.success);
        assert!(result.to_content().contains("alpha"));
    }

    #[tokio::test]
    async fn log_and_search_findings() {
        let root = tempfile::tempdir().unwrap();
        let c = ctx(&root, "scout");

        SharedLogTool
            .execute(
                json!({"finding": "fuel levels dropping fast", "category": "anomaly", "severity": "warning"}),
                &c,
            )
            .await;
        SharedLogTool
            .execute(json!({"finding": "all systems nominal", "category": "status"}), &c)
            .await;

        let hits = SharedSearchTool
            .execute(json!({"query": "fuel"}), &c)
            .await;
        assert!(hits.success);
        let data = hits.data.unwrap();
        assert_eq!(data["total"], json!(1));
        assert_eq!(data["results"][0]["severity"], json!("warning"));
    }

    #[tokio::test]
    async fn search_filters_by_category_and_agent() {
        let root = tempfile::tempdir().unwrap();
        let scout = ctx(&root, "scout");
        let analyst = ctx(&root, "analyst");

        SharedLogTool
            .execute(json!({"finding": "anomaly in sector 4", "category": "anomaly"}), &scout)
            .await;
        SharedLogTool
            .execute(json!({"finding": "anomaly resolved", "category": "status"}), &analyst)
            .await;

        let result = SharedSearchTool
            .execute(json!({"query": "anomaly", "category": "status"}), &scout)
            .await;
        let data = result.data.unwrap();
        assert_eq!(data["total"], json!(1));
        assert_eq!(data["results"][0]["agent_id"], json!("analyst"));
    }

    #[tokio::test]
    async fn write_rejects_path_like_keys() {
        let root = tempfile::tempdir().unwrap();
        let c = ctx(&root, "scout");
        let result = SharedWriteTool
            .execute(json!({"key": "../escape", "content": "x"}), &c)
            .await;
        assert!(!result.success);
    }
}
