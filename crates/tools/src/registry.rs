//! The tool catalog: registration, schema emission, validated dispatch.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::approvals::ApprovalQueue;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool trait + context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context handed to a tool at execution time.
#[derive(Clone)]
pub struct ToolContext {
    pub agent_id: String,
    pub session_key: String,
    pub workspace_dir: PathBuf,
    /// Present when the host has an approval queue wired up.
    pub approvals: Option<Arc<ApprovalQueue>>,
}

impl ToolContext {
    pub fn new(
        agent_id: impl Into<String>,
        session_key: impl Into<String>,
        workspace_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            session_key: session_key.into(),
            workspace_dir: workspace_dir.into(),
            approvals: None,
        }
    }

    pub fn with_approvals(mut self, approvals: Arc<ApprovalQueue>) -> Self {
        self.approvals = Some(approvals);
        self
    }
}

/// A capability the model can invoke.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-schema-shaped parameter description.
    fn parameters(&self) -> Value;
    fn requires_approval(&self) -> bool {
        false
    }
    /// Tools only offered to autonomy sessions (e.g. `yield`).
    fn autonomous_only(&self) -> bool {
        false
    }
    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    // Registration order, so schemas and listings stay stable.
    order: RwLock<Vec<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_owned();
        let mut tools = self.tools.write();
        if tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "overwriting existing tool");
        } else {
            self.order.write().push(name.clone());
        }
        tracing::debug!(tool = %name, "tool registered");
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().get(name).cloned()
    }

    /// All tools in registration order.
    pub fn list(&self) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read();
        self.order
            .read()
            .iter()
            .filter_map(|name| tools.get(name).cloned())
            .collect()
    }

    /// Function-calling schemas, filtered by an allow-list and by whether
    /// autonomous-only tools should be offered.
    pub fn schemas(&self, allowed: Option<&[String]>, include_autonomous: bool) -> Vec<Value> {
        self.list()
            .into_iter()
            .filter(|t| allowed.map_or(true, |names| names.iter().any(|n| n == t.name())))
            .filter(|t| include_autonomous || !t.autonomous_only())
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name(),
                        "description": t.description(),
                        "parameters": t.parameters(),
                    }
                })
            })
            .collect()
    }

    /// Execute a tool by name, validating declared required parameters.
    pub async fn execute(&self, name: &str, params: Value, ctx: &ToolContext) -> ToolResult {
        let Some(tool) = self.get(name) else {
            return ToolResult::fail(format!("Unknown tool: {name}"));
        };

        if let Some(missing) = missing_required_param(&tool.parameters(), &params) {
            return ToolResult::fail(format!("Missing required parameter: {missing}"));
        }

        let result = tool.execute(params, ctx).await;
        tracing::info!(
            tool = name,
            agent_id = %ctx.agent_id,
            success = result.success,
            "tool executed"
        );
        result
    }
}

/// First declared-required parameter absent from `params`, if any.
fn missing_required_param(schema: &Value, params: &Value) -> Option<String> {
    let required = schema.get("required")?.as_array()?;
    for name in required.iter().filter_map(Value::as_str) {
        let present = params.get(name).map_or(false, |v| !v.is_null());
        if !present {
            return Some(name.to_owned());
        }
    }
    None
}
