//! Sub-agent run registry — persisted records of every spawned child,
//! with asynchronous execution and a hard timeout per run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use corral_events::EventBus;

use crate::turn::TurnRunner;

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Run record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupPolicy {
    #[default]
    Keep,
    Delete,
}

/// One spawned sub-agent execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentRun {
    pub run_id: String,
    pub child_session_key: String,
    pub requester_session_key: String,
    pub agent_id: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub cleanup: CleanupPolicy,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubagentRun {
    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RunsFile {
    runs: Vec<SubagentRun>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SubagentRegistry {
    path: PathBuf,
    runs: Mutex<HashMap<String, SubagentRun>>,
    run_agent: TurnRunner,
    default_timeout: u64,
    bus: Arc<EventBus>,
}

impl SubagentRegistry {
    pub fn new(path: &Path, run_agent: TurnRunner, bus: Arc<EventBus>) -> Self {
        let runs = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<RunsFile>(&raw) {
                Ok(file) => file.runs.into_iter().map(|r| (r.run_id.clone(), r)).collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "subagent runs file unreadable, starting fresh");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            runs: Mutex::new(runs),
            run_agent,
            default_timeout: DEFAULT_TIMEOUT_SECONDS,
            bus,
        }
    }

    /// Create and persist a run record, then dispatch execution in the
    /// background. Returns immediately with the fresh record.
    pub fn spawn(
        self: &Arc<Self>,
        requester_session_key: &str,
        agent_id: &str,
        task: &str,
        label: Option<String>,
        timeout_seconds: Option<u64>,
        cleanup: CleanupPolicy,
    ) -> SubagentRun {
        let run_id = uuid::Uuid::new_v4().to_string()[..8].to_owned();
        let run = SubagentRun {
            run_id: run_id.clone(),
            child_session_key: format!("subagent:{agent_id}:{run_id}"),
            requester_session_key: requester_session_key.to_owned(),
            agent_id: agent_id.to_owned(),
            task: task.to_owned(),
            label: label.clone(),
            cleanup,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            outcome: None,
            result: None,
            error: None,
        };

        {
            let mut runs = self.runs.lock();
            runs.insert(run_id.clone(), run.clone());
            self.persist(&runs);
        }

        let task_preview: String = task.chars().take(200).collect();
        self.bus.emit(
            corral_events::SUBAGENT_SPAWNED,
            json!({
                "agent_id": agent_id,
                "run_id": run_id,
                "task": task_preview,
                "requester": requester_session_key,
            }),
        );

        let timeout = timeout_seconds.unwrap_or(self.default_timeout);
        let registry = self.clone();
        let run_for_exec = run.clone();
        tokio::spawn(async move {
            registry.execute_run(run_for_exec, timeout).await;
        });

        tracing::info!(
            run_id = %run.run_id,
            agent_id,
            label = %label.as_deref().unwrap_or(""),
            "sub-agent spawned"
        );
        run
    }

    async fn execute_run(self: Arc<Self>, run: SubagentRun, timeout_seconds: u64) {
        self.update(&run.run_id, |r| r.started_at = Some(Utc::now()));

        let work = (self.run_agent)(
            run.agent_id.clone(),
            run.child_session_key.clone(),
            run.task.clone(),
        );

        let (outcome, result, error) =
            match tokio::time::timeout(Duration::from_secs(timeout_seconds), work).await {
                Ok(Ok(turn)) => (RunOutcome::Completed, Some(turn.content), None),
                Ok(Err(e)) => {
                    tracing::error!(run_id = %run.run_id, error = %e, "sub-agent failed");
                    (RunOutcome::Failed, None, Some(e.to_string()))
                }
                Err(_) => (
                    RunOutcome::Timeout,
                    None,
                    Some(format!("Timed out after {timeout_seconds}s")),
                ),
            };

        self.update(&run.run_id, |r| {
            r.ended_at = Some(Utc::now());
            r.outcome = Some(outcome);
            r.result = result.clone();
            r.error = error.clone();
        });

        let success = outcome == RunOutcome::Completed;
        let preview: String = result
            .as_deref()
            .unwrap_or_default()
            .chars()
            .take(300)
            .collect();
        self.bus.emit(
            corral_events::SUBAGENT_COMPLETED,
            json!({
                "agent_id": run.agent_id,
                "run_id": run.run_id,
                "session_key": run.child_session_key,
                "success": success,
                "outcome": outcome,
                "response_preview": preview,
                "error": error,
            }),
        );

        tracing::info!(run_id = %run.run_id, outcome = ?outcome, "sub-agent finished");
    }

    pub fn get(&self, run_id: &str) -> Option<SubagentRun> {
        self.runs.lock().get(run_id).cloned()
    }

    /// List runs newest-first, optionally filtered by requester and by
    /// status ("running", "completed", "failed").
    pub fn list(&self, requester: Option<&str>, status: Option<&str>) -> Vec<SubagentRun> {
        let runs = self.runs.lock();
        let mut list: Vec<SubagentRun> = runs
            .values()
            .filter(|r| requester.map_or(true, |req| r.requester_session_key == req))
            .filter(|r| match status {
                None => true,
                Some("running") => r.is_running(),
                Some("completed") => r.outcome == Some(RunOutcome::Completed),
                Some("failed") => {
                    matches!(r.outcome, Some(RunOutcome::Failed) | Some(RunOutcome::Timeout))
                }
                Some(_) => false,
            })
            .cloned()
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// Drop ended runs older than the cutoff whose policy is `delete`.
    pub fn cleanup_old_runs(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let mut runs = self.runs.lock();
        let before = runs.len();
        runs.retain(|_, r| {
            !(r.cleanup == CleanupPolicy::Delete
                && r.ended_at.map_or(false, |ended| ended < cutoff))
        });
        let removed = before - runs.len();
        if removed > 0 {
            self.persist(&runs);
            tracing::info!(removed, "cleaned up old sub-agent runs");
        }
        removed
    }

    fn update(&self, run_id: &str, f: impl FnOnce(&mut SubagentRun)) {
        let mut runs = self.runs.lock();
        if let Some(run) = runs.get_mut(run_id) {
            f(run);
            self.persist(&runs);
        }
    }

    fn persist(&self, runs: &HashMap<String, SubagentRun>) {
        let file = RunsFile {
            runs: runs.values().cloned().collect(),
        };
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&file) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!(error = %e, "failed to persist sub-agent runs");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to serialize sub-agent runs"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::TurnOutcome;
    use corral_domain::error::Error;

    fn outcome(content: &str) -> TurnOutcome {
        TurnOutcome {
            content: content.to_owned(),
            yield_directive: None,
            tool_calls_executed: 0,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
        }
    }

    fn quick_runner() -> TurnRunner {
        Arc::new(|_agent, _key, task| {
            Box::pin(async move { Ok(outcome(&format!("handled: {task}"))) })
        })
    }

    fn slow_runner(seconds: u64) -> TurnRunner {
        Arc::new(move |_agent, _key, _task| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                Ok(outcome("too late"))
            })
        })
    }

    fn failing_runner() -> TurnRunner {
        Arc::new(|_agent, _key, _task| {
            Box::pin(async { Err(Error::Llm("child backend died".into())) })
        })
    }

    async fn wait_for_end(registry: &Arc<SubagentRegistry>, run_id: &str) -> SubagentRun {
        loop {
            if let Some(run) = registry.get(run_id) {
                if run.ended_at.is_some() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn registry(dir: &tempfile::TempDir, runner: TurnRunner) -> (Arc<SubagentRegistry>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let registry = Arc::new(SubagentRegistry::new(
            &dir.path().join("subagent_runs.json"),
            runner,
            bus.clone(),
        ));
        (registry, bus)
    }

    #[tokio::test]
    async fn spawn_completes_and_records_result() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, bus) = registry(&dir, quick_runner());

        let run = registry.spawn(
            "agent:root:main",
            "scout",
            "map the area",
            Some("mapping".into()),
            None,
            CleanupPolicy::Keep,
        );
        assert_eq!(run.run_id.len(), 8);
        assert_eq!(run.child_session_key, format!("subagent:scout:{}", run.run_id));

        let finished = wait_for_end(&registry, &run.run_id).await;
        assert_eq!(finished.outcome, Some(RunOutcome::Completed));
        assert_eq!(finished.result.as_deref(), Some("handled: map the area"));
        assert!(finished.started_at.is_some());

        let events = bus.recent(
            10,
            Some(&[corral_events::SUBAGENT_SPAWNED, corral_events::SUBAGENT_COMPLETED]),
            None,
        );
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].data["success"], json!(true));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_marks_run_timed_out() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, bus) = registry(&dir, slow_runner(3));

        let run = registry.spawn(
            "agent:root:main",
            "scout",
            "slow task",
            None,
            Some(1),
            CleanupPolicy::Keep,
        );

        let finished = wait_for_end(&registry, &run.run_id).await;
        assert_eq!(finished.outcome, Some(RunOutcome::Timeout));
        assert!(finished.error.as_deref().unwrap().contains("Timed out after 1s"));
        assert!(finished.ended_at.is_some());

        let completed = bus.recent(10, Some(&[corral_events::SUBAGENT_COMPLETED]), None);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].data["success"], json!(false));
    }

    #[tokio::test]
    async fn failure_records_error() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(&dir, failing_runner());

        let run = registry.spawn(
            "agent:root:main",
            "scout",
            "doomed",
            None,
            None,
            CleanupPolicy::Keep,
        );
        let finished = wait_for_end(&registry, &run.run_id).await;
        assert_eq!(finished.outcome, Some(RunOutcome::Failed));
        assert!(finished.error.as_deref().unwrap().contains("child backend died"));
    }

    #[tokio::test]
    async fn list_filters_by_requester_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(&dir, quick_runner());

        let a = registry.spawn("agent:root:main", "scout", "t1", None, None, CleanupPolicy::Keep);
        let b = registry.spawn("agent:other:main", "scout", "t2", None, None, CleanupPolicy::Keep);
        wait_for_end(&registry, &a.run_id).await;
        wait_for_end(&registry, &b.run_id).await;

        assert_eq!(registry.list(Some("agent:root:main"), None).len(), 1);
        assert_eq!(registry.list(None, Some("completed")).len(), 2);
        assert_eq!(registry.list(None, Some("running")).len(), 0);
        assert_eq!(registry.list(None, Some("failed")).len(), 0);
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (reg, _) = registry(&dir, quick_runner());
        let run = reg.spawn("agent:root:main", "scout", "t", None, None, CleanupPolicy::Keep);
        wait_for_end(&reg, &run.run_id).await;

        let (reloaded, _) = registry(&dir, quick_runner());
        let fetched = reloaded.get(&run.run_id).unwrap();
        assert_eq!(fetched.outcome, Some(RunOutcome::Completed));
    }

    #[tokio::test]
    async fn cleanup_honors_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, _) = registry(&dir, quick_runner());

        let keep = registry.spawn("k", "scout", "keep me", None, None, CleanupPolicy::Keep);
        let delete = registry.spawn("d", "scout", "drop me", None, None, CleanupPolicy::Delete);
        wait_for_end(&registry, &keep.run_id).await;
        wait_for_end(&registry, &delete.run_id).await;

        // Cutoff in the future: only the delete-policy run goes.
        let removed = registry.cleanup_old_runs(-1);
        assert_eq!(removed, 1);
        assert!(registry.get(&keep.run_id).is_some());
        assert!(registry.get(&delete.run_id).is_none());
    }
}
