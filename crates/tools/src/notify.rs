//! Notification tool — the one approval-gated action. Returns a pending
//! approval handle; an external surface resolves it.

use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::approvals::short_id;
use crate::registry::{Tool, ToolContext};

pub struct NotifyTool;

#[async_trait::async_trait]
impl Tool for NotifyTool {
    fn name(&self) -> &str {
        "notify"
    }

    fn description(&self) -> &str {
        "Send a notification or alert to the user. Notifications are queued \
         for human approval before delivery."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "message": {"type": "string"},
                "priority": {
                    "type": "string",
                    "enum": ["low", "medium", "high", "critical"],
                    "default": "medium"
                }
            },
            "required": ["title", "message"]
        })
    }

    fn requires_approval(&self) -> bool {
        true
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolResult {
        let title = params["title"].as_str().unwrap_or_default();
        let message = params["message"].as_str().unwrap_or_default();
        let priority = params["priority"].as_str().unwrap_or("medium");

        let payload = json!({
            "title": title,
            "message": message,
            "priority": priority,
        });

        let approval_id = match &ctx.approvals {
            Some(queue) => {
                queue
                    .trigger(
                        &ctx.agent_id,
                        &format!("Send notification: {title}"),
                        payload.clone(),
                    )
                    .id
            }
            // No queue wired up: still hand back a handle so the caller can
            // track the request.
            None => short_id(),
        };

        ToolResult {
            success: true,
            data: Some(json!({
                "notification_id": approval_id,
                "title": title,
                "priority": priority,
                "status": "pending_approval",
            })),
            message: Some(format!(
                "Notification '{title}' queued for approval (ID: {approval_id})"
            )),
            error: None,
            requires_approval: true,
            approval_id: Some(approval_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approvals::ApprovalQueue;
    use corral_events::EventBus;
    use std::sync::Arc;

    #[tokio::test]
    async fn notify_queues_an_approval() {
        let bus = Arc::new(EventBus::new());
        let queue = Arc::new(ApprovalQueue::new(bus.clone()));
        let ctx = ToolContext::new("alpha", "agent:alpha:main", "/tmp/ws")
            .with_approvals(queue.clone());

        let result = NotifyTool
            .execute(json!({"title": "Fuel low", "message": "Tank at 5%"}), &ctx)
            .await;

        assert!(result.success);
        assert!(result.requires_approval);
        let id = result.approval_id.clone().unwrap();

        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].payload["priority"], json!("medium"));

        let events = bus.recent(10, Some(&[corral_events::APPROVAL_REQUESTED]), None);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn notify_without_queue_still_returns_handle() {
        let ctx = ToolContext::new("alpha", "agent:alpha:main", "/tmp/ws");
        let result = NotifyTool
            .execute(json!({"title": "T", "message": "M"}), &ctx)
            .await;
        assert!(result.success);
        assert!(result.requires_approval);
        assert_eq!(result.approval_id.as_ref().unwrap().len(), 8);
    }
}
