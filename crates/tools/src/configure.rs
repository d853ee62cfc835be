//! `configure_agent` — CRUD on agent workspaces and their `agent.yaml`.
//!
//! Update semantics are deliberately shallow: top-level scalars merge
//! one-by-one, but the three nested sections (`autonomy`, `hot_state`,
//! `sensors`) are replaced whole so structured policy is never left
//! half-updated.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{json, Map, Value};

use corral_domain::config::{is_valid_agent_id, PROTECTED_AGENT_ID};
use corral_domain::tool::ToolResult;

use crate::memory::resolve_within;
use crate::registry::{Tool, ToolContext};

const VALID_FIELD_TYPES: &[&str] = &["object", "number", "string", "array", "boolean"];
const VALID_SENSOR_TYPES: &[&str] = &["poll", "watch", "stream"];
const NESTED_SECTIONS: &[&str] = &["autonomy", "hot_state", "sensors"];
const SCALAR_KEYS: &[&str] = &[
    "name",
    "description",
    "model",
    "thinking",
    "tools",
    "max_tool_rounds",
];

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager hooks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Narrow callbacks into the agent manager, wired after construction.
#[derive(Clone)]
pub struct ManagerHooks {
    pub is_running: Arc<dyn Fn(&str) -> bool + Send + Sync>,
    pub stop_agent: Arc<dyn Fn(String) -> BoxFuture<'static, bool> + Send + Sync>,
}

#[derive(Default)]
pub struct ConfigureAgentTool {
    hooks: RwLock<Option<ManagerHooks>>,
}

impl ConfigureAgentTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hooks(&self, hooks: ManagerHooks) {
        *self.hooks.write() = Some(hooks);
    }
}

#[async_trait::async_trait]
impl Tool for ConfigureAgentTool {
    fn name(&self) -> &str {
        "configure_agent"
    }

    fn description(&self) -> &str {
        "Create, read, update, or delete agent configurations. action='create' \
         makes a new agent, 'read' inspects one, 'update' modifies config or \
         workspace files, 'delete' removes an agent."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["create", "read", "update", "delete"]
                },
                "agent_id": {
                    "type": "string",
                    "description": "The agent's unique identifier (kebab-case)"
                },
                "config": {
                    "type": "object",
                    "description": "Agent configuration. Top-level: name, description, model, \
                         thinking, tools (list), max_tool_rounds, heartbeat_enabled, \
                         heartbeat_interval. Nested sections: autonomy, hot_state, sensors."
                },
                "files": {
                    "type": "object",
                    "description": "Workspace files to write, as {filename: content}"
                }
            },
            "required": ["action", "agent_id"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let action = params["action"].as_str().unwrap_or_default();
        let agent_id = params["agent_id"].as_str().unwrap_or_default().to_owned();
        let config = params["config"].clone();
        let files = params["files"].clone();

        if !is_valid_agent_id(&agent_id) {
            return ToolResult::fail(
                "Agent ID must be kebab-case (lowercase letters, numbers, hyphens)",
            );
        }

        // The caller's workspace lives directly under the agents directory.
        let Some(agents_dir) = ctx.workspace_dir.parent().map(Path::to_path_buf) else {
            return ToolResult::fail("Cannot determine agents directory");
        };

        match action {
            "create" => self.create(&agents_dir, &agent_id, config, files),
            "read" => self.read(&agents_dir, &agent_id),
            "update" => self.update(&agents_dir, &agent_id, config, files).await,
            "delete" => self.delete(&agents_dir, &agent_id).await,
            other => ToolResult::fail(format!("Invalid action: {other}")),
        }
    }
}

impl ConfigureAgentTool {
    fn create(
        &self,
        agents_dir: &Path,
        agent_id: &str,
        config: Value,
        files: Value,
    ) -> ToolResult {
        let workspace = agents_dir.join(agent_id);
        if workspace.exists() {
            return ToolResult::fail(format!("Agent '{agent_id}' already exists"));
        }

        let Some(mut config) = config.as_object().cloned() else {
            return ToolResult::fail("Config is required for create action");
        };
        if config.is_empty() {
            return ToolResult::fail("Config is required for create action");
        }
        let Some(name) = config.get("name").and_then(Value::as_str).map(str::to_owned) else {
            return ToolResult::fail("Config must include 'name'");
        };

        if let Some(err) = validate_config(&config) {
            return ToolResult::fail(err);
        }
        apply_defaults(&mut config);

        if let Err(e) = std::fs::create_dir_all(workspace.join("memory")) {
            return ToolResult::fail(e.to_string());
        }

        let yaml_value = config_to_yaml(agent_id, &config);
        if let Err(e) = write_yaml(&workspace.join("agent.yaml"), &yaml_value) {
            return ToolResult::fail(e);
        }

        let mut wrote_soul = false;
        if let Some(files) = files.as_object() {
            for (filename, content) in files {
                let Some(content) = content.as_str() else { continue };
                if let Err(e) = write_workspace_file(&workspace, filename, content) {
                    return ToolResult::fail(e);
                }
                if filename == "SOUL.md" {
                    wrote_soul = true;
                }
            }
        }

        if !wrote_soul {
            let description = config
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let soul = default_soul(&name, description);
            if let Err(e) = write_workspace_file(&workspace, "SOUL.md", &soul) {
                return ToolResult::fail(e);
            }
        }

        ToolResult::ok_with_data(
            format!(
                "Created agent '{agent_id}' ({name}) at {}",
                workspace.display()
            ),
            json!({
                "agent_id": agent_id,
                "name": name,
                "workspace": workspace.display().to_string(),
            }),
        )
    }

    fn read(&self, agents_dir: &Path, agent_id: &str) -> ToolResult {
        let workspace = agents_dir.join(agent_id);
        if !workspace.exists() {
            return ToolResult::fail(format!("Agent '{agent_id}' not found"));
        }

        let config = match std::fs::read_to_string(workspace.join("agent.yaml")) {
            Ok(raw) => serde_yaml::from_str::<Value>(&raw).unwrap_or_else(|_| json!({})),
            Err(_) => json!({}),
        };

        let mut file_list = Vec::new();
        collect_files(&workspace, &workspace, &mut file_list);
        file_list.sort_by(|a, b| a["path"].as_str().cmp(&b["path"].as_str()));

        ToolResult::ok_with_data(
            format!("Agent '{agent_id}'"),
            json!({"config": config, "files": file_list}),
        )
    }

    async fn update(
        &self,
        agents_dir: &Path,
        agent_id: &str,
        config: Value,
        files: Value,
    ) -> ToolResult {
        let workspace = agents_dir.join(agent_id);
        if !workspace.exists() {
            return ToolResult::fail(format!("Agent '{agent_id}' not found"));
        }

        let mut updated_parts: Vec<String> = Vec::new();

        if let Some(config) = config.as_object() {
            if !config.is_empty() {
                let mut config = config.clone();
                if let Some(err) = validate_config(&config) {
                    return ToolResult::fail(err);
                }
                apply_defaults(&mut config);

                let config_path = workspace.join("agent.yaml");
                let mut existing: Map<String, Value> = std::fs::read_to_string(&config_path)
                    .ok()
                    .and_then(|raw| serde_yaml::from_str::<Value>(&raw).ok())
                    .and_then(|v| v.as_object().cloned())
                    .unwrap_or_default();
                existing
                    .entry("id".to_owned())
                    .or_insert_with(|| json!(agent_id));

                // Shallow merge: nested sections replaced whole.
                for (key, value) in config {
                    if NESTED_SECTIONS.contains(&key.as_str()) {
                        existing.insert(key, value);
                    } else if key == "heartbeat_enabled" {
                        heartbeat_section(&mut existing).insert("enabled".into(), value);
                    } else if key == "heartbeat_interval" {
                        heartbeat_section(&mut existing).insert("interval".into(), value);
                    } else {
                        existing.insert(key, value);
                    }
                }

                if let Err(e) = write_yaml(&config_path, &Value::Object(existing)) {
                    return ToolResult::fail(e);
                }
                updated_parts.push("config".into());
            }
        }

        if let Some(files) = files.as_object() {
            if !files.is_empty() {
                for (filename, content) in files {
                    let Some(content) = content.as_str() else { continue };
                    if let Err(e) = write_workspace_file(&workspace, filename, content) {
                        return ToolResult::fail(e);
                    }
                }
                updated_parts.push(format!("{} file(s)", files.len()));
            }
        }

        let running_note = match self.hooks.read().clone() {
            Some(hooks) if (hooks.is_running)(agent_id) => {
                " Note: agent is running — restart for changes to take effect."
            }
            _ => "",
        };

        ToolResult::ok_with_data(
            format!(
                "Updated agent '{agent_id}': {}.{running_note}",
                updated_parts.join(", ")
            ),
            json!({"agent_id": agent_id, "updated": updated_parts}),
        )
    }

    async fn delete(&self, agents_dir: &Path, agent_id: &str) -> ToolResult {
        if agent_id == PROTECTED_AGENT_ID {
            return ToolResult::fail("Cannot delete the builder agent");
        }

        let workspace = agents_dir.join(agent_id);
        if !workspace.exists() {
            return ToolResult::fail(format!("Agent '{agent_id}' not found"));
        }

        let hooks_opt = self.hooks.read().clone();
        if let Some(hooks) = hooks_opt {
            if (hooks.is_running)(agent_id) {
                (hooks.stop_agent)(agent_id.to_owned()).await;
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&workspace) {
            return ToolResult::fail(e.to_string());
        }

        ToolResult::ok_with_data(
            format!("Deleted agent '{agent_id}'"),
            json!({"agent_id": agent_id}),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation & defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn validate_config(config: &Map<String, Value>) -> Option<String> {
    if let Some(fields) = config
        .get("hot_state")
        .and_then(|hs| hs.get("fields"))
        .and_then(Value::as_object)
    {
        for (field_name, field_cfg) in fields {
            let ftype = field_cfg
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("object");
            if !VALID_FIELD_TYPES.contains(&ftype) {
                return Some(format!(
                    "Hot state field '{field_name}': type must be one of: {}",
                    VALID_FIELD_TYPES.join(", ")
                ));
            }
        }
    }

    if let Some(sensors) = config.get("sensors").and_then(Value::as_array) {
        for sensor in sensors {
            let sname = sensor
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("<unnamed>");
            let stype = sensor.get("type").and_then(Value::as_str).unwrap_or("");

            if !VALID_SENSOR_TYPES.contains(&stype) {
                return Some(format!(
                    "Sensor '{sname}': type must be one of: {}",
                    VALID_SENSOR_TYPES.join(", ")
                ));
            }
            let source = sensor.get("source");
            let source_field =
                |key: &str| source.and_then(|s| s.get(key)).and_then(Value::as_str);
            match stype {
                "poll" if sensor.get("interval").and_then(Value::as_u64).is_none() => {
                    return Some(format!("Sensor '{sname}': poll type requires 'interval' field"));
                }
                "watch" if source_field("path").is_none() => {
                    return Some(format!(
                        "Sensor '{sname}': watch type requires 'source.path' field"
                    ));
                }
                "stream" if source_field("url").is_none() => {
                    return Some(format!(
                        "Sensor '{sname}': stream type requires 'source.url' field"
                    ));
                }
                _ => {}
            }
        }
    }

    None
}

fn apply_defaults(config: &mut Map<String, Value>) {
    if let Some(autonomy) = config.get_mut("autonomy").and_then(Value::as_object_mut) {
        let defaults = [
            ("enabled", json!(false)),
            ("max_consecutive_turns", json!(50)),
            ("token_budget_per_hour", json!(100_000)),
            ("max_actions_per_minute", json!(10)),
            ("idle_timeout", json!(600)),
        ];
        for (key, value) in defaults {
            autonomy.entry(key.to_owned()).or_insert(value);
        }
    }

    if let Some(fields) = config
        .get_mut("hot_state")
        .and_then(|hs| hs.get_mut("fields"))
        .and_then(Value::as_object_mut)
    {
        for field_cfg in fields.values_mut() {
            if let Some(obj) = field_cfg.as_object_mut() {
                obj.entry("type".to_owned()).or_insert(json!("object"));
            }
        }
    }

    if let Some(sensors) = config.get_mut("sensors").and_then(Value::as_array_mut) {
        for sensor in sensors {
            let Some(sensor) = sensor.as_object_mut() else { continue };
            sensor.entry("updates".to_owned()).or_insert(json!([]));
            sensor.entry("signals".to_owned()).or_insert(json!([]));
            if let Some(signals) = sensor.get_mut("signals").and_then(Value::as_array_mut) {
                for signal in signals {
                    if let Some(signal) = signal.as_object_mut() {
                        signal.entry("threshold".to_owned()).or_insert(json!(0.8));
                        signal.entry("notify".to_owned()).or_insert(json!(true));
                    }
                }
            }
        }
    }
}

fn config_to_yaml(agent_id: &str, config: &Map<String, Value>) -> Value {
    let mut yaml = Map::new();
    yaml.insert("id".into(), json!(agent_id));

    for key in SCALAR_KEYS {
        if let Some(value) = config.get(*key) {
            yaml.insert((*key).to_owned(), value.clone());
        }
    }

    if config.contains_key("heartbeat_enabled") || config.contains_key("heartbeat_interval") {
        yaml.insert(
            "heartbeat".into(),
            json!({
                "enabled": config.get("heartbeat_enabled").cloned().unwrap_or(json!(true)),
                "interval": config.get("heartbeat_interval").cloned().unwrap_or(json!(1800)),
            }),
        );
    }

    for section in NESTED_SECTIONS {
        if let Some(value) = config.get(*section) {
            yaml.insert((*section).to_owned(), value.clone());
        }
    }

    Value::Object(yaml)
}

fn heartbeat_section(existing: &mut Map<String, Value>) -> &mut Map<String, Value> {
    let entry = existing
        .entry("heartbeat".to_owned())
        .or_insert_with(|| json!({}));
    if !entry.is_object() {
        *entry = json!({});
    }
    entry.as_object_mut().unwrap()
}

fn default_soul(name: &str, description: &str) -> String {
    let mut lines = vec![format!("# {name}"), String::new()];
    if !description.is_empty() {
        lines.push(description.to_owned());
        lines.push(String::new());
    }
    lines.extend(
        [
            "## Mission",
            &format!("You are {name}. Assist users with your designated tasks."),
            "",
            "## Guidelines",
            "- Be helpful and concise",
            "- Use your available tools when appropriate",
            "- Ask for clarification when instructions are ambiguous",
            "",
        ]
        .map(str::to_owned),
    );
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn write_yaml(path: &Path, value: &Value) -> Result<(), String> {
    let yaml = serde_yaml::to_string(value).map_err(|e| e.to_string())?;
    std::fs::write(path, yaml).map_err(|e| e.to_string())
}

fn write_workspace_file(workspace: &Path, filename: &str, content: &str) -> Result<(), String> {
    let Some(path) = resolve_within(workspace, filename) else {
        return Err(format!("Invalid workspace filename: {filename}"));
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    std::fs::write(path, content).map_err(|e| e.to_string())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<Value>) {
    let Ok(entries) = std::fs::read_dir(dir) else { return };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(meta) = entry.metadata() {
            let rel: PathBuf = path.strip_prefix(root).unwrap_or(&path).to_path_buf();
            out.push(json!({
                "path": rel.to_string_lossy(),
                "size": meta.len(),
            }));
        }
    }
}
