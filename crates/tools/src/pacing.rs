//! The `yield` tool — autonomous agents declare their next pacing action.
//!
//! The tool only validates and acknowledges; the autonomy loop enacts the
//! pacing. The ack strings ("Sleeping for Ns", "Shutting down autonomous
//! loop") are load-bearing: they are the textual fallback the loop parses
//! when the structured directive is unavailable.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use corral_domain::tool::ToolResult;

use crate::registry::{Tool, ToolContext};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Yield directive
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum YieldMode {
    Sleep,
    Continue,
    Shutdown,
}

/// The agent's declared pacing decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YieldDirective {
    pub mode: YieldMode,
    #[serde(default)]
    pub sleep: u64,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub wake_early_if: Vec<String>,
}

impl YieldDirective {
    pub fn continue_now() -> Self {
        Self {
            mode: YieldMode::Continue,
            sleep: 0,
            reason: String::new(),
            wake_early_if: Vec::new(),
        }
    }

    pub fn sleep_for(seconds: u64) -> Self {
        Self {
            mode: YieldMode::Sleep,
            sleep: seconds,
            reason: String::new(),
            wake_early_if: Vec::new(),
        }
    }

    pub fn shutdown(reason: impl Into<String>) -> Self {
        Self {
            mode: YieldMode::Shutdown,
            sleep: 0,
            reason: reason.into(),
            wake_early_if: Vec::new(),
        }
    }

    /// Validate raw tool parameters into a directive.
    pub fn from_params(params: &Value) -> Result<Self, String> {
        let mode = match params["mode"].as_str() {
            Some("sleep") => YieldMode::Sleep,
            Some("continue") => YieldMode::Continue,
            Some("shutdown") => YieldMode::Shutdown,
            other => {
                return Err(format!(
                    "Invalid mode: '{}'. Must be one of: sleep, continue, shutdown",
                    other.unwrap_or("")
                ));
            }
        };

        let sleep = params["sleep"].as_u64().unwrap_or(0);
        if mode == YieldMode::Sleep && sleep == 0 {
            return Err(
                "mode='sleep' requires a positive integer 'sleep' parameter (seconds)".into(),
            );
        }

        let wake_early_if = params["wake_early_if"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            mode,
            sleep,
            reason: params["reason"].as_str().unwrap_or_default().to_owned(),
            wake_early_if,
        })
    }

    /// The canonical acknowledgement string.
    pub fn ack_message(&self) -> String {
        let mut msg = match self.mode {
            YieldMode::Sleep => {
                let mut m = format!("Sleeping for {}s", self.sleep);
                if !self.wake_early_if.is_empty() {
                    m.push_str(&format!(" (wake early on: {})", self.wake_early_if.join(", ")));
                }
                m
            }
            YieldMode::Continue => "Continuing immediately".to_owned(),
            YieldMode::Shutdown => "Shutting down autonomous loop".to_owned(),
        };
        if !self.reason.is_empty() {
            msg.push_str(&format!(" — {}", self.reason));
        }
        msg
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct YieldTool;

#[async_trait::async_trait]
impl Tool for YieldTool {
    fn name(&self) -> &str {
        "yield"
    }

    fn description(&self) -> &str {
        "Control your execution pacing in autonomous mode. Call with \
         mode='sleep' to pause for N seconds, mode='continue' for an \
         immediate next turn, or mode='shutdown' to stop the loop."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "mode": {
                    "type": "string",
                    "enum": ["sleep", "continue", "shutdown"]
                },
                "sleep": {
                    "type": "integer",
                    "description": "Seconds to sleep (required when mode='sleep')"
                },
                "reason": {
                    "type": "string",
                    "description": "Why this pacing decision"
                },
                "wake_early_if": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Notification names that wake the agent early during sleep"
                }
            },
            "required": ["mode"]
        })
    }

    fn autonomous_only(&self) -> bool {
        true
    }

    async fn execute(&self, params: Value, _ctx: &ToolContext) -> ToolResult {
        match YieldDirective::from_params(&params) {
            Ok(directive) => ToolResult::ok(directive.ack_message()),
            Err(e) => ToolResult::fail(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::new("alpha", "agent:alpha:autonomy", "/tmp/ws")
    }

    #[tokio::test]
    async fn sleep_ack_includes_wake_list() {
        let result = YieldTool
            .execute(
                json!({"mode": "sleep", "sleep": 60, "wake_early_if": ["order_filled", "alert"]}),
                &ctx(),
            )
            .await;
        assert!(result.success);
        assert_eq!(
            result.to_content(),
            "Sleeping for 60s (wake early on: order_filled, alert)"
        );
    }

    #[tokio::test]
    async fn shutdown_ack_with_reason() {
        let result = YieldTool
            .execute(json!({"mode": "shutdown", "reason": "work complete"}), &ctx())
            .await;
        assert_eq!(
            result.to_content(),
            "Shutting down autonomous loop — work complete"
        );
    }

    #[tokio::test]
    async fn continue_ack() {
        let result = YieldTool.execute(json!({"mode": "continue"}), &ctx()).await;
        assert_eq!(result.to_content(), "Continuing immediately");
    }

    #[tokio::test]
    async fn invalid_mode_fails() {
        let result = YieldTool.execute(json!({"mode": "naptime"}), &ctx()).await;
        assert!(!result.success);
        assert!(result.to_content().contains("Invalid mode"));
    }

    #[tokio::test]
    async fn sleep_requires_positive_seconds() {
        let result = YieldTool.execute(json!({"mode": "sleep"}), &ctx()).await;
        assert!(!result.success);
        assert!(result.to_content().contains("positive integer"));
    }

    #[test]
    fn directive_round_trips_params() {
        let directive = YieldDirective::from_params(&json!({
            "mode": "sleep",
            "sleep": 30,
            "reason": "waiting on market open",
            "wake_early_if": ["order_filled"]
        }))
        .unwrap();
        assert_eq!(directive.mode, YieldMode::Sleep);
        assert_eq!(directive.sleep, 30);
        assert_eq!(directive.wake_early_if, vec!["order_filled"]);
        assert!(directive.ack_message().starts_with("Sleeping for 30s"));
    }
}
