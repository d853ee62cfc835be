//! Sub-agent spawning tool.
//!
//! The tool itself only forwards to an injected spawn callback; the
//! sub-agent registry owns dispatch, timeout, and outcome tracking. The
//! callback is wired after construction so the tool never holds a
//! reference back into the manager.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::registry::{Tool, ToolContext};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub requester_session_key: String,
    pub agent_id: String,
    pub task: String,
    pub label: Option<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct SpawnReceipt {
    pub run_id: String,
    pub agent_id: String,
    pub child_session_key: String,
}

pub type SpawnCallback =
    Arc<dyn Fn(SpawnRequest) -> BoxFuture<'static, Result<SpawnReceipt, String>> + Send + Sync>;

#[derive(Default)]
pub struct SpawnAgentTool {
    callback: RwLock<Option<SpawnCallback>>,
}

impl SpawnAgentTool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wire the spawn callback (done by the manager after construction).
    pub fn set_callback(&self, callback: SpawnCallback) {
        *self.callback.write() = Some(callback);
    }
}

#[async_trait::async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> &str {
        "Spawn a background sub-agent for a specific task. The sub-agent runs \
         asynchronously; its result is announced when it completes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string", "description": "The task for the sub-agent"},
                "agent_id": {
                    "type": "string",
                    "description": "Agent to spawn (defaults to your own agent type)"
                },
                "label": {"type": "string", "description": "Human-readable label for tracking"},
                "timeout_seconds": {
                    "type": "integer",
                    "description": "Maximum runtime for the sub-agent (default 300)"
                }
            },
            "required": ["task"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let task = params["task"].as_str().unwrap_or_default().to_owned();
        let agent_id = params["agent_id"]
            .as_str()
            .unwrap_or(&ctx.agent_id)
            .to_owned();
        let label = params["label"].as_str().map(str::to_owned);
        let timeout_seconds = params["timeout_seconds"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS);

        let callback = self.callback.read().clone();
        let Some(callback) = callback else {
            return ToolResult::fail("Sub-agent dispatch is not available on this host");
        };

        let request = SpawnRequest {
            requester_session_key: ctx.session_key.clone(),
            agent_id: agent_id.clone(),
            task: task.clone(),
            label: label.clone(),
            timeout_seconds,
        };

        match callback(request).await {
            Ok(receipt) => {
                let display_label =
                    label.unwrap_or_else(|| task.chars().take(50).collect());
                ToolResult::ok_with_data(
                    "Sub-agent spawned. Results will be announced when complete.",
                    json!({
                        "run_id": receipt.run_id,
                        "agent_id": receipt.agent_id,
                        "child_session_key": receipt.child_session_key,
                        "label": display_label,
                        "status": "spawned",
                    }),
                )
            }
            Err(e) => ToolResult::fail(format!("Failed to spawn sub-agent: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn ctx() -> ToolContext {
        ToolContext::new("alpha", "agent:alpha:main", "/tmp/ws")
    }

    #[tokio::test]
    async fn forwards_to_callback() {
        let tool = SpawnAgentTool::new();
        let seen: Arc<Mutex<Option<SpawnRequest>>> = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        tool.set_callback(Arc::new(move |req| {
            let seen = seen_in.clone();
            Box::pin(async move {
                let child_session_key = format!("subagent:{}:abcd1234", req.agent_id);
                *seen.lock() = Some(req.clone());
                Ok(SpawnReceipt {
                    run_id: "abcd1234".into(),
                    agent_id: req.agent_id,
                    child_session_key,
                })
            })
        }));

        let result = tool
            .execute(
                json!({"task": "scout the area", "agent_id": "scout", "timeout_seconds": 60}),
                &ctx(),
            )
            .await;
        assert!(result.success);
        let data = result.data.unwrap();
        assert_eq!(data["run_id"], json!("abcd1234"));
        assert_eq!(data["status"], json!("spawned"));

        let req = seen.lock().clone().unwrap();
        assert_eq!(req.agent_id, "scout");
        assert_eq!(req.requester_session_key, "agent:alpha:main");
        assert_eq!(req.timeout_seconds, 60);
    }

    #[tokio::test]
    async fn defaults_to_own_agent_and_300s() {
        let tool = SpawnAgentTool::new();
        let seen: Arc<Mutex<Option<SpawnRequest>>> = Arc::new(Mutex::new(None));
        let seen_in = seen.clone();
        tool.set_callback(Arc::new(move |req| {
            let seen = seen_in.clone();
            Box::pin(async move {
                *seen.lock() = Some(req.clone());
                Ok(SpawnReceipt {
                    run_id: "r".into(),
                    agent_id: req.agent_id,
                    child_session_key: "k".into(),
                })
            })
        }));

        tool.execute(json!({"task": "do things"}), &ctx()).await;
        let req = seen.lock().clone().unwrap();
        assert_eq!(req.agent_id, "alpha");
        assert_eq!(req.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
    }

    #[tokio::test]
    async fn unwired_tool_fails_cleanly() {
        let tool = SpawnAgentTool::new();
        let result = tool.execute(json!({"task": "t"}), &ctx()).await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn callback_error_surfaces() {
        let tool = SpawnAgentTool::new();
        tool.set_callback(Arc::new(|_req| {
            Box::pin(async { Err("registry offline".to_string()) })
        }));
        let result = tool.execute(json!({"task": "t"}), &ctx()).await;
        assert!(!result.success);
        assert!(result.to_content().contains("registry offline"));
    }
}
