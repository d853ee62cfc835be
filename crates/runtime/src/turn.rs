//! One agent turn: message in, assistant text out, with a bounded
//! tool-call loop in between.
//!
//! The turn also captures the structured pacing directive when the model
//! calls the `yield` tool, so the autonomy loop never has to re-parse
//! prose to learn what the agent decided.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use corral_domain::config::AgentConfig;
use corral_domain::error::Result;
use corral_domain::llm::{ChatMessage, ChatRequest, LlmClient, Role};
use corral_events::EventBus;
use corral_sessions::{Message, SessionStore, TranscriptStore};
use corral_tools::{ApprovalQueue, ToolContext, ToolRegistry, YieldDirective};

use crate::workspace::AgentWorkspace;

/// Non-system messages tolerated before auto-compaction kicks in.
const MAX_CONTEXT_MESSAGES: usize = 30;
/// Non-system messages preserved by a compaction.
const COMPACT_KEEP_LAST: usize = 10;
/// Non-system messages loaded into the request window.
const CONTEXT_WINDOW: usize = 50;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Setup / outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Async callback that runs one turn: `(agent_id, session_key, message)`.
///
/// The loop, heartbeat, and sub-agent registry all call back into the
/// manager through this seam instead of holding a reference to it.
pub type TurnRunner = Arc<
    dyn Fn(String, String, String) -> futures_util::future::BoxFuture<'static, Result<TurnOutcome>>
        + Send
        + Sync,
>;

/// Everything a turn needs, assembled by the manager.
#[derive(Clone)]
pub struct TurnSetup {
    pub agent_id: String,
    pub workspace_dir: PathBuf,
    pub config: AgentConfig,
    pub llm: Arc<dyn LlmClient>,
    pub registry: Arc<ToolRegistry>,
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptStore>,
    pub bus: Arc<EventBus>,
    pub approvals: Option<Arc<ApprovalQueue>>,
    /// Fast model used for compaction summaries.
    pub compaction_model: Option<String>,
}

/// What a completed turn reports back.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub content: String,
    /// Captured from the `yield` tool call, when one executed.
    pub yield_directive: Option<YieldDirective>,
    pub tool_calls_executed: usize,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn against `session_key`.
///
/// Backend failures do not propagate: the error string becomes the final
/// assistant content and the transcript still receives both messages.
pub async fn run_agent_turn(
    setup: &TurnSetup,
    session_key: &str,
    message: &str,
) -> Result<TurnOutcome> {
    // Reload the workspace each turn; it may have changed on disk.
    let workspace = AgentWorkspace::load(&setup.workspace_dir)?;
    let is_autonomy = session_key.ends_with(":autonomy");

    let allowed = setup.config.allowed_tools();
    let tool_schemas = setup.registry.schemas(allowed, is_autonomy);
    let system_prompt = build_system_prompt(&workspace, &tool_schemas);

    let session = setup
        .sessions
        .get_or_create(session_key, &setup.agent_id);

    auto_compact_if_needed(setup, &session.session_id).await;

    let history = setup
        .transcripts
        .messages_for_context(&session.session_id, CONTEXT_WINDOW);

    let mut messages = Vec::with_capacity(history.len() + 2);
    messages.push(ChatMessage::system(&system_prompt));
    messages.extend(history.iter().map(transcript_to_chat));
    messages.push(ChatMessage::user(message));

    let tool_ctx = ToolContext {
        agent_id: setup.agent_id.clone(),
        session_key: session_key.to_owned(),
        workspace_dir: setup.workspace_dir.clone(),
        approvals: setup.approvals.clone(),
    };

    let mut prompt_tokens = 0u64;
    let mut completion_tokens = 0u64;
    let mut total_tokens = 0u64;
    let mut tool_calls_executed = 0usize;
    let mut yield_directive: Option<YieldDirective> = None;
    let mut thinking: Option<String> = None;
    let mut backend_failed = false;

    let request = |msgs: Vec<ChatMessage>| {
        ChatRequest {
            messages: msgs,
            tools: tool_schemas.clone(),
            model: setup.config.model.clone(),
            think: setup.config.thinking.is_some(),
            thinking_budget: setup.config.thinking.as_ref().map(|_| 512),
            stateless: true,
            session_id: Some(session.session_id.clone()),
            rag_enabled: false,
            max_tokens: None,
            temperature: None,
        }
    };

    let mut response = match setup.llm.chat(request(messages.clone())).await {
        Ok(resp) => resp,
        Err(e) => {
            setup.bus.emit(
                corral_events::AGENT_ERROR,
                json!({
                    "agent_id": setup.agent_id,
                    "session_key": session_key,
                    "error": e.to_string(),
                }),
            );
            backend_failed = true;
            corral_domain::llm::ChatResponse {
                content: format!("Error: {e}"),
                ..Default::default()
            }
        }
    };

    if let Some(t) = &response.thinking {
        thinking = Some(t.clone());
        let preview: String = t.chars().take(500).collect();
        setup.bus.emit(
            corral_events::AGENT_THINKING,
            json!({
                "agent_id": setup.agent_id,
                "session_key": session_key,
                "thinking": preview,
            }),
        );
    }

    // ── Tool-call loop, bounded by max_tool_rounds ───────────────────
    let mut tool_round = 0usize;
    while response.has_tool_calls() && tool_round < setup.config.max_tool_rounds {
        tool_round += 1;
        let calls = response.tool_calls.clone();
        let mut tool_messages = Vec::with_capacity(calls.len());

        for call in &calls {
            let args = call.arguments_object();
            setup.bus.emit(
                corral_events::AGENT_TOOL_CALL,
                json!({
                    "agent_id": setup.agent_id,
                    "session_key": session_key,
                    "tool_name": call.name,
                    "tool_arguments": args,
                    "round": tool_round,
                }),
            );

            let result = setup
                .registry
                .execute(&call.name, args.clone(), &tool_ctx)
                .await;
            tool_calls_executed += 1;

            // Structured yield transport: the loop reads this instead of
            // re-parsing the ack from prose.
            if call.name == "yield" && result.success {
                if let Ok(directive) = YieldDirective::from_params(&args) {
                    yield_directive = Some(directive);
                }
            }

            let content = result.to_content();
            let preview: String = content.chars().take(200).collect();
            setup.bus.emit(
                corral_events::AGENT_TOOL_RESULT,
                json!({
                    "agent_id": setup.agent_id,
                    "session_key": session_key,
                    "tool_name": call.name,
                    "success": result.success,
                    "result_preview": preview,
                    "round": tool_round,
                }),
            );

            tool_messages.push(ChatMessage::tool_result(&call.id, &content));
        }

        messages.push(ChatMessage::assistant_with_calls(
            response.content.clone(),
            calls,
        ));
        messages.extend(tool_messages);

        record_usage_step(
            &response,
            &mut prompt_tokens,
            &mut completion_tokens,
            &mut total_tokens,
        );

        response = match setup.llm.chat(request(messages.clone())).await {
            Ok(resp) => resp,
            Err(e) => {
                setup.bus.emit(
                    corral_events::AGENT_ERROR,
                    json!({
                        "agent_id": setup.agent_id,
                        "session_key": session_key,
                        "error": e.to_string(),
                    }),
                );
                backend_failed = true;
                corral_domain::llm::ChatResponse {
                    content: format!("Error: {e}"),
                    ..Default::default()
                }
            }
        };
        if backend_failed {
            break;
        }
        if let Some(t) = &response.thinking {
            thinking = Some(t.clone());
        }
    }

    record_usage_step(
        &response,
        &mut prompt_tokens,
        &mut completion_tokens,
        &mut total_tokens,
    );

    let mut final_content = response.content.clone();
    if !backend_failed && tool_round >= setup.config.max_tool_rounds && response.has_tool_calls() {
        final_content.push_str("\n\n[Max tool rounds reached. Stopping tool execution.]");
    }

    // ── Persist the exchange ─────────────────────────────────────────
    setup
        .transcripts
        .append(&session.session_id, &setup.agent_id, Message::user(message))?;
    setup.transcripts.append(
        &session.session_id,
        &setup.agent_id,
        Message::assistant(&final_content).with_thinking(thinking),
    )?;

    setup
        .sessions
        .record_usage(session_key, prompt_tokens, completion_tokens);

    let message_preview: String = message.chars().take(200).collect();
    let response_preview: String = final_content.chars().take(200).collect();
    setup.bus.emit(
        corral_events::AGENT_MESSAGE,
        json!({
            "agent_id": setup.agent_id,
            "session_key": session_key,
            "message": message_preview,
            "response": response_preview,
            "tool_rounds": tool_round,
        }),
    );

    Ok(TurnOutcome {
        content: final_content,
        yield_directive,
        tool_calls_executed,
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn record_usage_step(
    response: &corral_domain::llm::ChatResponse,
    prompt: &mut u64,
    completion: &mut u64,
    total: &mut u64,
) {
    *prompt += response.prompt_tokens;
    *completion += response.completion_tokens;
    *total += response.total_tokens;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// System prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_system_prompt(workspace: &AgentWorkspace, tool_schemas: &[serde_json::Value]) -> String {
    let mut prompt = workspace.build_context();

    if !tool_schemas.is_empty() {
        prompt.push_str("\n\n## Available Tools\nYou have the following tools available:\n");
        for schema in tool_schemas {
            let name = schema["function"]["name"].as_str().unwrap_or_default();
            let description = schema["function"]["description"]
                .as_str()
                .unwrap_or_default()
                .lines()
                .next()
                .unwrap_or_default();
            prompt.push_str(&format!("- **{name}**: {description}\n"));
        }
        prompt.push_str("\nUse tools via function calling when they can help accomplish the task.");
    }

    prompt
}

fn transcript_to_chat(message: &Message) -> ChatMessage {
    match message.role {
        Role::Tool => ChatMessage::tool_result(
            message.tool_call_id.clone().unwrap_or_default(),
            &message.content,
        ),
        role => ChatMessage {
            role,
            content: message.content.clone(),
            tool_call_id: None,
            tool_calls: message.tool_calls.clone(),
        },
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Auto-compaction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn auto_compact_if_needed(setup: &TurnSetup, session_id: &str) {
    let Some(transcript) = setup.transcripts.load(session_id) else {
        return;
    };
    let non_system = transcript.non_system_len();
    if non_system <= MAX_CONTEXT_MESSAGES {
        return;
    }

    let old_count = non_system - COMPACT_KEEP_LAST;
    let old_messages: Vec<&Message> = transcript
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .take(old_count)
        .collect();

    // Summarize the tail of the old region; earlier context has already
    // been folded into prior summaries.
    let mut summary_input = String::from("Previous conversation:\n");
    let from = old_messages.len().saturating_sub(20);
    for message in &old_messages[from..] {
        let snippet: String = message.content.chars().take(150).collect();
        summary_input.push_str(&format!("- [{}]: {snippet}\n", role_label(message.role)));
    }

    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(
                "Summarize this conversation concisely, preserving key facts, \
                 decisions, and context.",
            ),
            ChatMessage::user(&summary_input),
        ],
        model: setup.compaction_model.clone(),
        stateless: true,
        ..Default::default()
    };

    let summary = match setup.llm.chat(request).await {
        Ok(resp) if !resp.content.is_empty() => resp.content,
        Ok(_) | Err(_) => {
            tracing::warn!(session_id, "auto-compaction summary failed, using placeholder");
            format!("[{old_count} earlier messages compacted]")
        }
    };

    if let Err(e) = setup
        .transcripts
        .compact(session_id, COMPACT_KEEP_LAST, Some(summary))
    {
        tracing::warn!(session_id, error = %e, "auto-compaction failed");
    } else {
        tracing::info!(session_id, compacted = old_count, "transcript auto-compacted");
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}
