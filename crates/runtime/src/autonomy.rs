//! The autonomy loop: observe → think → act → yield, with guardrails.
//!
//! One loop per autonomous agent. Each iteration gates on active hours,
//! the hourly token budget, and the idle timeout, optionally consults a
//! lightweight pre-check model, refreshes stale hot state, synthesizes an
//! observation message, runs one turn, and enacts the agent's yield
//! directive.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use corral_domain::config::AutonomyConfig;
use corral_domain::llm::{ChatMessage, ChatRequest, LlmClient};
use corral_events::EventBus;
use corral_tools::{ToolContext, ToolRegistry, YieldDirective, YieldMode};

use crate::hot_state::HotState;
use crate::sensors::Sensor;
use crate::turn::TurnRunner;

/// Forced pause after the consecutive-turn cap trips.
const FORCED_SLEEP_SECS: u64 = 60;
/// Soft sleep after a skipped pre-check.
const PRECHECK_SKIP_SLEEP_SECS: u64 = 10;
/// Poll cadence while outside active hours.
const ACTIVE_HOURS_POLL_SECS: u64 = 300;
/// Pause after an unexpected loop error.
const ERROR_PAUSE_SECS: u64 = 5;

enum LoopControl {
    Continue,
    Stop,
}

struct LoopState {
    turn_count: u64,
    consecutive_turns: u32,
    tokens_this_hour: u64,
    hour_start: Instant,
    last_meaningful_action: Instant,
    last_snapshot: DateTime<Utc>,
    actions: VecDeque<Instant>,
}

pub struct AutonomyLoop {
    agent_id: String,
    session_key: String,
    config: AutonomyConfig,
    hot_state: Arc<HotState>,
    sensors: Vec<Arc<Sensor>>,
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    run_turn: TurnRunner,
    bus: Arc<EventBus>,
    workspace_dir: PathBuf,
    cancel: CancellationToken,
    state: Mutex<LoopState>,
}

impl AutonomyLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: impl Into<String>,
        config: AutonomyConfig,
        hot_state: Arc<HotState>,
        sensors: Vec<Arc<Sensor>>,
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        run_turn: TurnRunner,
        bus: Arc<EventBus>,
        workspace_dir: PathBuf,
    ) -> Self {
        let agent_id = agent_id.into();
        let now = Instant::now();
        Self {
            session_key: format!("agent:{agent_id}:autonomy"),
            agent_id,
            config,
            hot_state,
            sensors,
            registry,
            llm,
            run_turn,
            bus,
            workspace_dir,
            cancel: CancellationToken::new(),
            state: Mutex::new(LoopState {
                turn_count: 0,
                consecutive_turns: 0,
                tokens_this_hour: 0,
                hour_start: now,
                last_meaningful_action: now,
                last_snapshot: Utc::now(),
                actions: VecDeque::new(),
            }),
        }
    }

    /// Start the sensors, then the loop task.
    pub fn start(self: &Arc<Self>) {
        for sensor in &self.sensors {
            sensor.start();
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.run_loop().await;
        });
        tracing::info!(agent_id = %self.agent_id, "autonomy loop started");
    }

    /// Cooperative stop: cancels the loop, then the sensors. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        for sensor in &self.sensors {
            sensor.stop();
        }
        tracing::info!(agent_id = %self.agent_id, "autonomy loop stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Action timestamps inside the sliding 60-second window.
    pub fn actions_last_minute(&self) -> usize {
        let mut state = self.state.lock();
        prune_actions(&mut state.actions);
        state.actions.len()
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let control = tokio::select! {
                _ = self.cancel.cancelled() => break,
                control = self.iteration() => control,
            };
            match control {
                Ok(LoopControl::Continue) => {}
                Ok(LoopControl::Stop) => break,
                Err(e) => {
                    tracing::error!(agent_id = %self.agent_id, error = %e, "autonomy loop error");
                    if self.sleep_or_cancel(ERROR_PAUSE_SECS).await {
                        break;
                    }
                }
            }
        }
        self.stop();
    }

    async fn iteration(&self) -> corral_domain::error::Result<LoopControl> {
        // ── Active-hours gate ────────────────────────────────────────
        if let Some(window) = &self.config.active_hours {
            if !window.contains(Local::now().time()) {
                self.emit_guardrail(
                    "active_hours",
                    json!({
                        "message": format!(
                            "Outside active hours, sleeping for {ACTIVE_HOURS_POLL_SECS}s"
                        ),
                    }),
                );
                self.sleep_or_cancel(ACTIVE_HOURS_POLL_SECS).await;
                return Ok(LoopControl::Continue);
            }
        }

        // ── Hour reset & token gate ──────────────────────────────────
        {
            let (over_budget, tokens_used, sleep_secs) = {
                let mut state = self.state.lock();
                if state.hour_start.elapsed() >= Duration::from_secs(3600) {
                    state.tokens_this_hour = 0;
                    state.hour_start = Instant::now();
                }
                let over = state.tokens_this_hour >= self.config.token_budget_per_hour;
                let remaining = 3600u64.saturating_sub(state.hour_start.elapsed().as_secs());
                (over, state.tokens_this_hour, remaining.max(1))
            };
            if over_budget {
                self.emit_guardrail(
                    "token_budget",
                    json!({
                        "tokens_used": tokens_used,
                        "budget": self.config.token_budget_per_hour,
                        "sleep_seconds": sleep_secs,
                    }),
                );
                self.sleep_or_cancel(sleep_secs).await;
                return Ok(LoopControl::Continue);
            }
        }

        // ── Idle gate ────────────────────────────────────────────────
        {
            let idle = self.state.lock().last_meaningful_action.elapsed();
            if idle > Duration::from_secs(self.config.idle_timeout) {
                self.emit_guardrail(
                    "idle_timeout",
                    json!({
                        "idle_seconds": idle.as_secs(),
                        "timeout": self.config.idle_timeout,
                    }),
                );
                return Ok(LoopControl::Stop);
            }
        }

        // ── Turn ─────────────────────────────────────────────────────
        let directive = self.run_turn_cycle().await?;

        // ── Enact yield ──────────────────────────────────────────────
        match directive.mode {
            YieldMode::Shutdown => {
                tracing::info!(
                    agent_id = %self.agent_id,
                    reason = %directive.reason,
                    "agent requested shutdown"
                );
                Ok(LoopControl::Stop)
            }
            YieldMode::Sleep => {
                self.state.lock().consecutive_turns = 0;
                self.sleep_with_wake_early(directive.sleep, &directive.wake_early_if)
                    .await;
                Ok(LoopControl::Continue)
            }
            YieldMode::Continue => {
                let tripped = {
                    let mut state = self.state.lock();
                    state.consecutive_turns += 1;
                    if state.consecutive_turns >= self.config.max_consecutive_turns {
                        let turns = state.consecutive_turns;
                        state.consecutive_turns = 0;
                        Some(turns)
                    } else {
                        None
                    }
                };
                if let Some(turns) = tripped {
                    self.emit_guardrail(
                        "max_consecutive_turns",
                        json!({
                            "turns": turns,
                            "limit": self.config.max_consecutive_turns,
                        }),
                    );
                    self.sleep_or_cancel(FORCED_SLEEP_SECS).await;
                }
                Ok(LoopControl::Continue)
            }
        }
    }

    /// One observe → think → act cycle. Returns the parsed yield directive.
    async fn run_turn_cycle(&self) -> corral_domain::error::Result<YieldDirective> {
        let turn = {
            let mut state = self.state.lock();
            state.turn_count += 1;
            state.turn_count
        };

        let has_notifications = self.hot_state.has_notifications();

        // ── Pre-check gate (fails open) ──────────────────────────────
        if !has_notifications {
            if let Some(precheck_model) = &self.config.precheck_model {
                let since = self.state.lock().last_snapshot;
                let diff = self.hot_state.diff_since(since);
                if diff.is_empty() {
                    self.emit_precheck_skipped(turn, "no_changes");
                    return Ok(YieldDirective {
                        mode: YieldMode::Sleep,
                        sleep: PRECHECK_SKIP_SLEEP_SECS,
                        reason: "pre-check: no changes".into(),
                        wake_early_if: Vec::new(),
                    });
                }
                if !self.run_precheck(precheck_model, &diff).await {
                    self.emit_precheck_skipped(turn, "no_material_changes");
                    return Ok(YieldDirective {
                        mode: YieldMode::Sleep,
                        sleep: PRECHECK_SKIP_SLEEP_SECS,
                        reason: "pre-check: no material changes".into(),
                        wake_early_if: Vec::new(),
                    });
                }
            }
        }

        // ── Auto-refresh stale fields ────────────────────────────────
        self.auto_refresh_stale_fields().await;

        // ── Context build ────────────────────────────────────────────
        let message = self.build_context_message(turn);

        self.bus.emit(
            corral_events::AUTONOMY_TURN_STARTED,
            json!({
                "agent_id": self.agent_id,
                "turn": turn,
                "hot_state_summary": self.hot_state_summary(),
                "notifications_pending": has_notifications,
            }),
        );

        // The agent is about to see them; drain now.
        self.hot_state.pop_notifications();
        self.state.lock().last_snapshot = self.hot_state.snapshot_time();

        // ── Run the turn ─────────────────────────────────────────────
        let outcome = (self.run_turn)(
            self.agent_id.clone(),
            self.session_key.clone(),
            message,
        )
        .await?;

        let directive = outcome
            .yield_directive
            .clone()
            .unwrap_or_else(|| parse_yield_text(&outcome.content));

        {
            let mut state = self.state.lock();
            state.tokens_this_hour += outcome.total_tokens;
            if outcome.tool_calls_executed > 0 {
                state.last_meaningful_action = Instant::now();
                state.actions.push_back(Instant::now());
                prune_actions(&mut state.actions);
                if state.actions.len() > self.config.max_actions_per_minute {
                    tracing::warn!(
                        agent_id = %self.agent_id,
                        actions = state.actions.len(),
                        ceiling = self.config.max_actions_per_minute,
                        "actions-per-minute ceiling exceeded"
                    );
                }
            }
        }

        self.bus.emit(
            corral_events::AUTONOMY_TURN_COMPLETED,
            json!({
                "agent_id": self.agent_id,
                "turn": turn,
                "yield_mode": directive.mode,
                "yield_sleep": directive.sleep,
                "yield_reason": directive.reason,
            }),
        );

        Ok(directive)
    }

    async fn run_precheck(&self, model: &str, diff: &Map<String, Value>) -> bool {
        let diff_str = serde_json::to_string(diff).unwrap_or_default();
        let request = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "You are a pre-check gate. Given the following state changes, \
                     determine if any are materially significant and require the \
                     agent's attention. Reply with YES if the agent should wake up, \
                     NO if changes are insignificant.",
                ),
                ChatMessage::user(format!("State changes:\n{diff_str}")),
            ],
            model: Some(model.to_owned()),
            stateless: true,
            ..Default::default()
        };

        match self.llm.chat(request).await {
            Ok(resp) => resp.content.to_uppercase().contains("YES"),
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    error = %e,
                    "pre-check gate failed, allowing turn"
                );
                true
            }
        }
    }

    async fn auto_refresh_stale_fields(&self) {
        for (field, tool) in self.hot_state.refreshable_stale_fields() {
            let ctx = ToolContext::new(
                self.agent_id.clone(),
                self.session_key.clone(),
                self.workspace_dir.clone(),
            );
            let result = self.registry.execute(&tool, json!({}), &ctx).await;
            if result.success {
                let value = result
                    .data
                    .or_else(|| result.message.clone().map(Value::String))
                    .unwrap_or(Value::Null);
                self.hot_state.set(&field, value);
            } else {
                tracing::warn!(
                    agent_id = %self.agent_id,
                    field,
                    tool,
                    error = %result.error.unwrap_or_default(),
                    "auto-refresh failed"
                );
            }
        }
    }

    fn build_context_message(&self, turn: u64) -> String {
        let mut parts: Vec<String> = Vec::new();

        let notifications = self.hot_state.peek_notifications();
        if !notifications.is_empty() {
            parts.push("## Notifications\n".to_owned());
            for n in &notifications {
                parts.push(format!("**{}**: {}", n.name, n.data));
            }
            parts.push(String::new());
        }

        let rendered = self.hot_state.render();
        if !rendered.is_empty() {
            parts.push(rendered);
            parts.push(String::new());
        }

        parts.push(format!("## Turn {turn}"));
        parts.push(
            "Observe the current state and decide your next action. When done, \
             call the `yield` tool to control your pacing (sleep, continue, or \
             shutdown)."
                .to_owned(),
        );

        parts.join("\n")
    }

    fn hot_state_summary(&self) -> Map<String, Value> {
        let mut summary = Map::new();
        for name in self.hot_state.field_names().into_iter().take(5) {
            if let Some(value) = self.hot_state.get(&name) {
                let text: String = value.to_string().chars().take(100).collect();
                summary.insert(name, Value::String(text));
            }
        }
        summary
    }

    /// Sleep up to `seconds`, polling the notification queue roughly ten
    /// times and returning early when a queued name matches.
    async fn sleep_with_wake_early(&self, seconds: u64, wake_early_if: &[String]) {
        if wake_early_if.is_empty() {
            self.sleep_or_cancel(seconds).await;
            return;
        }

        let slice = Duration::from_secs_f64((seconds as f64 / 10.0).min(1.0).max(0.05));
        let deadline = Instant::now() + Duration::from_secs(seconds);
        while Instant::now() < deadline && !self.cancel.is_cancelled() {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(slice) => {}
            }
            let queued = self.hot_state.peek_notifications();
            if let Some(hit) = queued.iter().find(|n| wake_early_if.contains(&n.name)) {
                tracing::info!(
                    agent_id = %self.agent_id,
                    notification = %hit.name,
                    "woken early by notification"
                );
                return;
            }
        }
    }

    /// Returns `true` if cancelled during the sleep.
    async fn sleep_or_cancel(&self, seconds: u64) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => false,
        }
    }

    fn emit_guardrail(&self, guardrail: &str, mut details: Value) {
        if let Some(obj) = details.as_object_mut() {
            obj.insert("agent_id".into(), json!(self.agent_id));
            obj.insert("guardrail".into(), json!(guardrail));
        }
        self.bus
            .emit(corral_events::AUTONOMY_GUARDRAIL_TRIGGERED, details);
        tracing::warn!(agent_id = %self.agent_id, guardrail, "guardrail triggered");
    }

    fn emit_precheck_skipped(&self, turn: u64, reason: &str) {
        self.bus.emit(
            corral_events::AUTONOMY_PRECHECK_SKIPPED,
            json!({
                "agent_id": self.agent_id,
                "turn": turn,
                "reason": reason,
            }),
        );
    }
}

fn prune_actions(actions: &mut VecDeque<Instant>) {
    let Some(cutoff) = Instant::now().checked_sub(Duration::from_secs(60)) else {
        return;
    };
    while actions.front().map_or(false, |t| *t < cutoff) {
        actions.pop_front();
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Yield text fallback
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Recover a pacing directive from the assistant's prose. Used only when
/// the structured directive was not captured from the `yield` tool call.
pub fn parse_yield_text(text: &str) -> YieldDirective {
    static SLEEP_RE: OnceLock<regex::Regex> = OnceLock::new();
    static WAKE_RE: OnceLock<regex::Regex> = OnceLock::new();

    let lower = text.to_lowercase();
    if lower.contains("shutting down") {
        return YieldDirective::shutdown("agent requested shutdown");
    }

    if lower.contains("sleeping for") {
        let sleep_re =
            SLEEP_RE.get_or_init(|| regex::Regex::new(r"sleeping for (\d+)s").unwrap());
        let sleep = sleep_re
            .captures(&lower)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(30);

        let wake_re =
            WAKE_RE.get_or_init(|| regex::Regex::new(r"wake early on: ([^)]+)\)").unwrap());
        let wake_early_if = wake_re
            .captures(&lower)
            .map(|c| {
                c[1].split(',')
                    .map(|s| s.trim().to_owned())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let mut directive = YieldDirective::sleep_for(sleep);
        directive.wake_early_if = wake_early_if;
        return directive;
    }

    YieldDirective::continue_now()
}
