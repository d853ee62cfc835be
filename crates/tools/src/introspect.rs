//! Introspection tools: what agents exist, what tools are available.

use std::sync::{Arc, Weak};

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::registry::{Tool, ToolContext, ToolRegistry};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// list_agents
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Lister injected by the manager: returns agent summaries, optionally
/// filtered by status ("running" / "stopped").
pub type AgentLister =
    Arc<dyn Fn(Option<String>) -> BoxFuture<'static, Vec<Value>> + Send + Sync>;

#[derive(Default)]
pub struct ListAgentsTool {
    lister: RwLock<Option<AgentLister>>,
}

impl ListAgentsTool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_lister(&self, lister: AgentLister) {
        *self.lister.write() = Some(lister);
    }
}

#[async_trait::async_trait]
impl Tool for ListAgentsTool {
    fn name(&self) -> &str {
        "list_agents"
    }

    fn description(&self) -> &str {
        "List the agents on this host with their status and capabilities."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["running", "stopped"],
                    "description": "Only agents in this state"
                }
            },
            "required": []
        })
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        let lister = self.lister.read().clone();
        let Some(lister) = lister else {
            return ToolResult::fail("Agent listing is not available on this host");
        };

        let status = params["status"].as_str().map(str::to_owned);
        let agents = lister(status).await;
        let count = agents.len();
        ToolResult::ok_with_data(
            format!("{count} agents"),
            json!({"agents": agents, "count": count}),
        )
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// list_tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ListToolsTool {
    registry: Weak<ToolRegistry>,
}

impl ListToolsTool {
    pub fn new(registry: Weak<ToolRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait::async_trait]
impl Tool for ListToolsTool {
    fn name(&self) -> &str {
        "list_tools"
    }

    fn description(&self) -> &str {
        "List the tools currently available to you."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}, "required": []})
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
        let Some(registry) = self.registry.upgrade() else {
            return ToolResult::fail("Tool registry not available");
        };

        let tools: Vec<Value> = registry
            .list()
            .into_iter()
            .map(|t| {
                let first_line = t
                    .description()
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_owned();
                let param_names: Vec<String> = t.parameters()["properties"]
                    .as_object()
                    .map(|props| props.keys().cloned().collect())
                    .unwrap_or_default();
                json!({
                    "name": t.name(),
                    "description": first_line,
                    "requires_approval": t.requires_approval(),
                    "parameters": param_names,
                })
            })
            .collect();

        let count = tools.len();
        ToolResult::ok_with_data(
            format!("{count} tools available"),
            json!({"tools": tools, "count": count}),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacing::YieldTool;

    fn ctx() -> ToolContext {
        ToolContext::new("alpha", "agent:alpha:main", "/tmp/ws")
    }

    #[tokio::test]
    async fn list_tools_reports_registry_contents() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(YieldTool));
        let tool = ListToolsTool::new(Arc::downgrade(&registry));
        registry.register(Arc::new(ListToolsTool::new(Arc::downgrade(&registry))));

        let result = tool.execute(json!({}), &ctx()).await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["count"], json!(2));
        assert_eq!(data["tools"][0]["name"], json!("yield"));
    }

    #[tokio::test]
    async fn list_agents_uses_injected_lister() {
        let tool = ListAgentsTool::new();
        tool.set_lister(Arc::new(|status| {
            Box::pin(async move {
                let mut agents = vec![json!({"agent_id": "alpha", "status": "running"})];
                if status.is_none() {
                    agents.push(json!({"agent_id": "beta", "status": "stopped"}));
                }
                agents
            })
        }));

        let all = tool.execute(json!({}), &ctx()).await;
        assert_eq!(all.data.unwrap()["count"], json!(2));

        let running = tool.execute(json!({"status": "running"}), &ctx()).await;
        assert_eq!(running.data.unwrap()["count"], json!(1));
    }

    #[tokio::test]
    async fn list_agents_without_lister_fails() {
        let tool = ListAgentsTool::new();
        let result = tool.execute(json!({}), &ctx()).await;
        assert!(!result.success);
    }
}
