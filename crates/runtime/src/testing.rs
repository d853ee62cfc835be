//! Shared test doubles for the runtime crate's unit tests.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;

use corral_domain::error::{Error, Result};
use corral_domain::llm::{ChatRequest, ChatResponse, LlmClient};
use corral_domain::tool::ToolCall;

/// An `LlmClient` that replays a fixed script of responses and records
/// every request it sees. Past the end of the script it repeats the last
/// response (or a bare "ok").
pub struct ScriptedLlm {
    script: Mutex<VecDeque<ChatResponse>>,
    fallback: Mutex<ChatResponse>,
    pub requests: Mutex<Vec<ChatRequest>>,
    /// When set, every call fails with this message.
    pub fail_with: Mutex<Option<String>>,
}

impl ScriptedLlm {
    pub fn new(script: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback: Mutex::new(text_response("ok", 10)),
            requests: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        })
    }

    pub fn failing(message: &str) -> Arc<Self> {
        let llm = Self::new(vec![]);
        *llm.fail_with.lock() = Some(message.to_owned());
        llm
    }

    pub fn with_fallback(self: Arc<Self>, fallback: ChatResponse) -> Arc<Self> {
        *self.fallback.lock() = fallback;
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait::async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse> {
        self.requests.lock().push(req);
        if let Some(message) = self.fail_with.lock().clone() {
            return Err(Error::Llm(message));
        }
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone()))
    }
}

/// A plain text response with `tokens` split across prompt/completion.
pub fn text_response(content: &str, tokens: u64) -> ChatResponse {
    ChatResponse {
        content: content.to_owned(),
        prompt_tokens: tokens / 2,
        completion_tokens: tokens - tokens / 2,
        total_tokens: tokens,
        finish_reason: Some("stop".to_owned()),
        ..Default::default()
    }
}

/// A response that requests a single tool call.
pub fn tool_call_response(call_id: &str, tool: &str, args: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCall::new(call_id, tool, args)],
        prompt_tokens: 5,
        completion_tokens: 5,
        total_tokens: 10,
        finish_reason: Some("tool_calls".to_owned()),
        ..Default::default()
    }
}

/// A response that calls `yield` and then speaks the ack in prose.
pub fn yield_response(mode: &str, sleep: u64, wake_early_if: &[&str]) -> ChatResponse {
    let mut args = json!({"mode": mode});
    if mode == "sleep" {
        args["sleep"] = json!(sleep);
        args["wake_early_if"] = json!(wake_early_if);
    }
    tool_call_response("yield-1", "yield", args)
}
