//! Heartbeat runner — a periodic prompt that lets an agent check its
//! HEARTBEAT.md checklist without being autonomous.
//!
//! `HEARTBEAT_OK` replies are treated as all-clear; identical alert text
//! is suppressed so a stuck checklist doesn't spam the same warning every
//! interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use corral_domain::config::{ActiveHours, HeartbeatConfig};
use corral_events::EventBus;

use crate::turn::TurnRunner;

const HEARTBEAT_PROMPT: &str = "Read HEARTBEAT.md if it exists. Follow instructions strictly. \
     If nothing needs attention, reply HEARTBEAT_OK.";

/// Outcome of one heartbeat check.
#[derive(Debug, Clone)]
pub struct HeartbeatResult {
    /// "ran", "skipped", or "failed".
    pub status: &'static str,
    pub reason: String,
    pub duration_ms: Option<u64>,
    pub response: Option<String>,
}

impl HeartbeatResult {
    fn skipped(reason: &str) -> Self {
        Self {
            status: "skipped",
            reason: reason.to_owned(),
            duration_ms: None,
            response: None,
        }
    }
}

pub struct HeartbeatRunner {
    agent_id: String,
    config: HeartbeatConfig,
    active_hours: Option<ActiveHours>,
    run_turn: TurnRunner,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
    last_alert_text: Mutex<Option<String>>,
}

impl HeartbeatRunner {
    pub fn new(
        agent_id: impl Into<String>,
        config: HeartbeatConfig,
        active_hours: Option<ActiveHours>,
        run_turn: TurnRunner,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            config,
            active_hours,
            run_turn,
            bus,
            cancel: CancellationToken::new(),
            last_alert_text: Mutex::new(None),
        }
    }

    /// Spawn the background interval loop.
    pub fn start(self: &Arc<Self>) {
        let runner = self.clone();
        let interval = Duration::from_secs(self.config.interval.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = runner.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let result = runner.run_once("interval").await;
                tracing::info!(
                    agent_id = %runner.agent_id,
                    status = result.status,
                    reason = %result.reason,
                    "heartbeat"
                );
            }
        });
        tracing::info!(
            agent_id = %self.agent_id,
            interval = self.config.interval,
            "heartbeat started"
        );
    }

    /// Cancellation is idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        tracing::info!(agent_id = %self.agent_id, "heartbeat stopped");
    }

    /// Trigger an immediate check.
    pub async fn wake(&self) -> HeartbeatResult {
        self.run_once("wake").await
    }

    async fn run_once(&self, trigger: &str) -> HeartbeatResult {
        if !self.config.enabled {
            return HeartbeatResult::skipped("disabled");
        }
        if let Some(window) = &self.active_hours {
            if !window.contains(Local::now().time()) {
                return HeartbeatResult::skipped("quiet-hours");
            }
        }

        let started = Utc::now();
        let session_key = format!("agent:{}:heartbeat", self.agent_id);
        let outcome = (self.run_turn)(
            self.agent_id.clone(),
            session_key,
            HEARTBEAT_PROMPT.to_owned(),
        )
        .await;
        let duration_ms = (Utc::now() - started).num_milliseconds().max(0) as u64;

        let result = match outcome {
            Err(e) => {
                tracing::error!(agent_id = %self.agent_id, error = %e, "heartbeat failed");
                HeartbeatResult {
                    status: "failed",
                    reason: e.to_string(),
                    duration_ms: Some(duration_ms),
                    response: None,
                }
            }
            Ok(outcome) => {
                let response = outcome.content;
                if response.to_uppercase().contains("HEARTBEAT_OK") {
                    HeartbeatResult {
                        status: "ran",
                        reason: "ok".into(),
                        duration_ms: Some(duration_ms),
                        response: None,
                    }
                } else if self.is_duplicate(&response) {
                    HeartbeatResult {
                        status: "skipped",
                        reason: "duplicate".into(),
                        duration_ms: Some(duration_ms),
                        response: None,
                    }
                } else {
                    *self.last_alert_text.lock() = Some(response.trim().to_owned());
                    HeartbeatResult {
                        status: "ran",
                        reason: "alert".into(),
                        duration_ms: Some(duration_ms),
                        response: Some(response),
                    }
                }
            }
        };

        self.bus.emit(
            corral_events::HEARTBEAT_RAN,
            json!({
                "agent_id": self.agent_id,
                "trigger": trigger,
                "status": result.status,
                "reason": result.reason,
                "duration_ms": result.duration_ms,
            }),
        );
        result
    }

    fn is_duplicate(&self, response: &str) -> bool {
        self.last_alert_text
            .lock()
            .as_deref()
            .map_or(false, |last| last == response.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::TurnOutcome;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn turn_fn(responses: Vec<&'static str>) -> (TurnRunner, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_in = calls.clone();
        let runner: TurnRunner = Arc::new(move |_agent, _key, _msg| {
            let idx = calls_in.fetch_add(1, Ordering::SeqCst);
            let content = responses
                .get(idx)
                .copied()
                .unwrap_or("HEARTBEAT_OK")
                .to_owned();
            Box::pin(async move {
                Ok(TurnOutcome {
                    content,
                    yield_directive: None,
                    tool_calls_executed: 0,
                    prompt_tokens: 0,
                    completion_tokens: 0,
                    total_tokens: 0,
                })
            })
        });
        (runner, calls)
    }

    fn runner(
        enabled: bool,
        responses: Vec<&'static str>,
    ) -> (Arc<HeartbeatRunner>, Arc<EventBus>, Arc<AtomicUsize>) {
        let bus = Arc::new(EventBus::new());
        let (turn, calls) = turn_fn(responses);
        let hb = Arc::new(HeartbeatRunner::new(
            "alpha",
            HeartbeatConfig {
                enabled,
                interval: 1800,
            },
            None,
            turn,
            bus.clone(),
        ));
        (hb, bus, calls)
    }

    #[tokio::test]
    async fn ok_response_reports_ok() {
        let (hb, bus, _) = runner(true, vec!["All quiet. HEARTBEAT_OK"]);
        let result = hb.wake().await;
        assert_eq!(result.status, "ran");
        assert_eq!(result.reason, "ok");
        assert!(result.response.is_none());

        let events = bus.recent(10, Some(&[corral_events::HEARTBEAT_RAN]), None);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["status"], json!("ran"));
    }

    #[tokio::test]
    async fn alert_then_duplicate_is_suppressed() {
        let (hb, _, _) = runner(
            true,
            vec!["Disk almost full on /data", "Disk almost full on /data", "New problem"],
        );

        let first = hb.wake().await;
        assert_eq!(first.reason, "alert");
        assert_eq!(first.response.as_deref(), Some("Disk almost full on /data"));

        let second = hb.wake().await;
        assert_eq!(second.status, "skipped");
        assert_eq!(second.reason, "duplicate");

        let third = hb.wake().await;
        assert_eq!(third.reason, "alert");
    }

    #[tokio::test]
    async fn disabled_runner_skips() {
        let (hb, _, calls) = runner(false, vec![]);
        let result = hb.wake().await;
        assert_eq!(result.status, "skipped");
        assert_eq!(result.reason, "disabled");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn interval_loop_runs_and_stops() {
        let bus = Arc::new(EventBus::new());
        let (turn, calls) = turn_fn(vec![]);
        let hb = Arc::new(HeartbeatRunner::new(
            "alpha",
            HeartbeatConfig {
                enabled: true,
                interval: 10,
            },
            None,
            turn,
            bus,
        ));
        hb.start();

        tokio::time::sleep(Duration::from_secs(25)).await;
        let after_two = calls.load(Ordering::SeqCst);
        assert!(after_two >= 2, "expected at least two beats, got {after_two}");

        hb.stop();
        hb.stop(); // idempotent
        let frozen = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls.load(Ordering::SeqCst), frozen);
    }
}
