use serde::{Deserialize, Serialize};
use serde_json::Value;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool invocation requested by the model (provider-agnostic).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as delivered by the backend. May be a JSON object or a
    /// JSON-encoded string depending on the provider; use
    /// [`ToolCall::arguments_object`] before dispatch.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }

    /// Normalize the arguments to a JSON object.
    ///
    /// Some backends deliver `arguments` as a JSON-encoded string instead of
    /// an object; anything unparseable collapses to an empty object so the
    /// tool sees a well-formed (if empty) parameter map.
    pub fn arguments_object(&self) -> Value {
        match &self.arguments {
            Value::Object(_) => self.arguments.clone(),
            Value::String(raw) => {
                if raw.trim().is_empty() {
                    return Value::Object(Default::default());
                }
                match serde_json::from_str::<Value>(raw) {
                    Ok(v @ Value::Object(_)) => v,
                    Ok(_) | Err(_) => {
                        tracing::warn!(
                            tool = %self.name,
                            call_id = %self.id,
                            "tool call arguments are not a JSON object; defaulting to empty"
                        );
                        Value::Object(Default::default())
                    }
                }
            }
            Value::Null => Value::Object(Default::default()),
            other => {
                tracing::warn!(
                    tool = %self.name,
                    call_id = %self.id,
                    kind = %json_kind(other),
                    "tool call arguments have unexpected shape; defaulting to empty"
                );
                Value::Object(Default::default())
            }
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool result
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Result of a tool execution, rendered to the model as a concise string.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_approval: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
}

impl ToolResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Render the result for the model: error text, then message, then the
    /// data as JSON, then a bare success/failure marker.
    pub fn to_content(&self) -> String {
        if let Some(err) = &self.error {
            return format!("Error: {err}");
        }
        if let Some(msg) = &self.message {
            return msg.clone();
        }
        if let Some(data) = &self.data {
            return serde_json::to_string_pretty(data).unwrap_or_else(|_| data.to_string());
        }
        if self.success { "Success".into() } else { "Failed".into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_object_passthrough() {
        let tc = ToolCall::new("c1", "exec", json!({"command": "ls"}));
        assert_eq!(tc.arguments_object(), json!({"command": "ls"}));
    }

    #[test]
    fn arguments_string_is_parsed() {
        let tc = ToolCall::new("c1", "exec", json!("{\"command\": \"ls\"}"));
        assert_eq!(tc.arguments_object(), json!({"command": "ls"}));
    }

    #[test]
    fn arguments_garbage_defaults_to_empty() {
        let tc = ToolCall::new("c1", "exec", json!("not json at all"));
        assert_eq!(tc.arguments_object(), json!({}));
    }

    #[test]
    fn arguments_null_defaults_to_empty() {
        let tc = ToolCall::new("c1", "exec", Value::Null);
        assert_eq!(tc.arguments_object(), json!({}));
    }

    #[test]
    fn arguments_non_object_json_defaults_to_empty() {
        let tc = ToolCall::new("c1", "exec", json!("[1, 2, 3]"));
        assert_eq!(tc.arguments_object(), json!({}));
    }

    #[test]
    fn result_content_priority() {
        let r = ToolResult {
            success: false,
            error: Some("boom".into()),
            message: Some("ignored".into()),
            ..Default::default()
        };
        assert_eq!(r.to_content(), "Error: boom");

        let r = ToolResult::ok("done");
        assert_eq!(r.to_content(), "done");

        let r = ToolResult {
            success: true,
            data: Some(json!({"k": 1})),
            ..Default::default()
        };
        assert!(r.to_content().contains("\"k\": 1"));

        assert_eq!(ToolResult { success: true, ..Default::default() }.to_content(), "Success");
        assert_eq!(ToolResult::default().to_content(), "Failed");
    }
}
