//! The agent manager — top-level facade owning every running agent.
//!
//! Handles are created by `start_agent` and torn down by `stop_agent`;
//! everything that needs to call back "up" (the spawn tool, the sub-agent
//! registry, the loops) does so through narrow injected callbacks holding
//! a weak reference, never a direct back-pointer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use corral_domain::config::{ActiveHours, AgentConfig, PROTECTED_AGENT_ID};
use corral_domain::error::{Error, Result};
use corral_domain::llm::LlmClient;
use corral_events::EventBus;
use corral_sessions::{SessionEntry, SessionStore, TranscriptStore};
use corral_tools::configure::ManagerHooks;
use corral_tools::{
    register_builtins, ApprovalQueue, SpawnReceipt, SpawnRequest, ToolRegistry,
};

use crate::autonomy::AutonomyLoop;
use crate::heartbeat::HeartbeatRunner;
use crate::hot_state::HotState;
use crate::sensors::Sensor;
use crate::subagents::{CleanupPolicy, SubagentRegistry};
use crate::turn::{run_agent_turn, TurnOutcome, TurnRunner, TurnSetup};
use crate::workspace::ensure_workspace;

/// Heartbeats run inside this window unless configured otherwise.
const DEFAULT_ACTIVE_HOURS: (&str, &str) = ("08:00", "23:00");

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Live runtime state for one started agent.
pub struct AgentHandle {
    pub agent_id: String,
    pub config: RwLock<AgentConfig>,
    pub workspace_dir: PathBuf,
    pub session: SessionEntry,
    pub heartbeat: Option<Arc<HeartbeatRunner>>,
    pub autonomy: Option<Arc<AutonomyLoop>>,
    pub hot_state: Option<Arc<HotState>>,
    pub sensors: Vec<Arc<Sensor>>,
}

impl std::fmt::Debug for AgentHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentHandle")
            .field("agent_id", &self.agent_id)
            .field("workspace_dir", &self.workspace_dir)
            .finish()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct AgentManager {
    agents_dir: PathBuf,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    pub sessions: Arc<SessionStore>,
    pub transcripts: Arc<TranscriptStore>,
    pub registry: Arc<ToolRegistry>,
    pub approvals: Arc<ApprovalQueue>,
    subagents: OnceLock<Arc<SubagentRegistry>>,
    turn_runner: OnceLock<TurnRunner>,
    handles: Mutex<HashMap<String, Arc<AgentHandle>>>,
    compaction_model: RwLock<Option<String>>,
}

impl AgentManager {
    /// Build the manager, wire the built-in tools, and provision the
    /// default agents.
    pub fn new(
        agents_dir: &Path,
        data_dir: &Path,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(agents_dir).map_err(Error::Io)?;
        std::fs::create_dir_all(data_dir).map_err(Error::Io)?;

        let sessions = Arc::new(SessionStore::new(&data_dir.join("sessions.json")));
        let transcripts = Arc::new(TranscriptStore::new(&data_dir.join("transcripts"))?);
        let registry = Arc::new(ToolRegistry::new());
        let builtins = register_builtins(&registry);
        let approvals = Arc::new(ApprovalQueue::new(bus.clone()));

        let manager = Arc::new(Self {
            agents_dir: agents_dir.to_path_buf(),
            llm,
            bus: bus.clone(),
            sessions,
            transcripts,
            registry,
            approvals,
            subagents: OnceLock::new(),
            turn_runner: OnceLock::new(),
            handles: Mutex::new(HashMap::new()),
            compaction_model: RwLock::new(None),
        });

        // ── Turn runner shared by loops, heartbeats, and sub-agents ──
        let weak = Arc::downgrade(&manager);
        let runner: TurnRunner = Arc::new(move |agent_id, session_key, message| {
            let weak = weak.clone();
            Box::pin(async move {
                let manager = upgrade(&weak)?;
                manager.run_turn(&agent_id, &session_key, &message).await
            })
        });
        let _ = manager.turn_runner.set(runner);

        // ── Sub-agent registry, calling back for child turns ─────────
        let weak = Arc::downgrade(&manager);
        let run_subagent: TurnRunner = Arc::new(move |agent_id, session_key, task| {
            let weak = weak.clone();
            Box::pin(async move {
                let manager = upgrade(&weak)?;
                manager.run_subagent(&agent_id, &session_key, &task).await
            })
        });
        let subagents = Arc::new(SubagentRegistry::new(
            &data_dir.join("subagent_runs.json"),
            run_subagent,
            bus.clone(),
        ));
        let _ = manager.subagents.set(subagents);

        // ── Spawn tool ───────────────────────────────────────────────
        let weak = Arc::downgrade(&manager);
        builtins.spawn.set_callback(Arc::new(move |request| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(manager) = weak.upgrade() else {
                    return Err("manager shut down".to_owned());
                };
                Ok(manager.handle_spawn_request(request))
            })
        }));

        // ── configure_agent hooks ────────────────────────────────────
        let weak_running = Arc::downgrade(&manager);
        let weak_stop = Arc::downgrade(&manager);
        builtins.configure.set_hooks(ManagerHooks {
            is_running: Arc::new(move |agent_id| {
                weak_running
                    .upgrade()
                    .map_or(false, |m| m.handles.lock().contains_key(agent_id))
            }),
            stop_agent: Arc::new(move |agent_id| {
                let weak = weak_stop.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(manager) => manager.stop_agent(&agent_id),
                        None => false,
                    }
                })
            }),
        });

        // ── list_agents tool ─────────────────────────────────────────
        let weak = Arc::downgrade(&manager);
        builtins.list_agents.set_lister(Arc::new(move |status| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(manager) => manager.list_agents(status.as_deref()),
                    None => Vec::new(),
                }
            })
        }));

        manager.provision_defaults()?;
        Ok(manager)
    }

    /// Model used for auto-compaction summaries (None = backend default).
    pub fn set_compaction_model(&self, model: Option<String>) {
        *self.compaction_model.write() = model;
    }

    pub fn subagent_registry(&self) -> Arc<SubagentRegistry> {
        self.subagents.get().cloned().expect("wired at construction")
    }

    fn turn_runner(&self) -> TurnRunner {
        self.turn_runner.get().cloned().expect("wired at construction")
    }

    // ── Provisioning ─────────────────────────────────────────────────

    /// Copy the built-in default workspaces that aren't on disk yet.
    fn provision_defaults(&self) -> Result<()> {
        const BUILDER_YAML: &str = include_str!("../assets/agent-builder/agent.yaml");
        const BUILDER_SOUL: &str = include_str!("../assets/agent-builder/SOUL.md");

        let target = self.agents_dir.join(PROTECTED_AGENT_ID);
        if target.exists() {
            return Ok(());
        }
        ensure_workspace(&target)?;
        std::fs::write(target.join("agent.yaml"), BUILDER_YAML).map_err(Error::Io)?;
        std::fs::write(target.join("SOUL.md"), BUILDER_SOUL).map_err(Error::Io)?;
        tracing::info!(agent_id = PROTECTED_AGENT_ID, "provisioned default agent");
        Ok(())
    }

    // ── Listing ──────────────────────────────────────────────────────

    /// Enumerate workspaces, optionally filtered by "running"/"stopped".
    pub fn list_agents(&self, status: Option<&str>) -> Vec<Value> {
        let mut agents = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.agents_dir) else {
            return agents;
        };

        let handles = self.handles.lock();
        let all_tools: Vec<String> = self
            .registry
            .list()
            .iter()
            .map(|t| t.name().to_owned())
            .collect();

        let mut dirs: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let agent_id = dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let config = load_config(&dir, &agent_id).unwrap_or_else(|e| {
                tracing::warn!(agent_id, error = %e, "unreadable agent config");
                AgentConfig::minimal(&agent_id)
            });

            let running = handles.contains_key(&agent_id);
            let agent_status = if running { "running" } else { "stopped" };
            if status.map_or(false, |s| s != agent_status) {
                continue;
            }

            let tools = if config.tools.is_empty() {
                all_tools.clone()
            } else {
                config.tools.clone()
            };
            agents.push(json!({
                "agent_id": config.id,
                "name": config.name,
                "description": config.description,
                "status": agent_status,
                "workspace_dir": dir.display().to_string(),
                "tools": tools,
                "model": config.model,
            }));
        }
        agents
    }

    pub fn get_handle(&self, agent_id: &str) -> Option<Arc<AgentHandle>> {
        self.handles.lock().get(agent_id).cloned()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Start an agent. Idempotent: a running agent returns its existing
    /// handle without a second `agent:started`.
    pub fn start_agent(&self, agent_id: &str) -> Result<Arc<AgentHandle>> {
        if let Some(handle) = self.get_handle(agent_id) {
            return Ok(handle);
        }

        let workspace_dir = self.agents_dir.join(agent_id);
        if !workspace_dir.is_dir() {
            return Err(Error::NotFound(format!(
                "agent workspace not found: {agent_id}"
            )));
        }
        let config = load_config(&workspace_dir, agent_id)?;

        let session_key = format!("agent:{agent_id}:main");
        let session = self.sessions.get_or_create(&session_key, agent_id);

        // ── Heartbeat ────────────────────────────────────────────────
        let heartbeat = if config.heartbeat.enabled {
            let runner = Arc::new(HeartbeatRunner::new(
                agent_id,
                config.heartbeat.clone(),
                Some(ActiveHours {
                    start: DEFAULT_ACTIVE_HOURS.0.into(),
                    end: DEFAULT_ACTIVE_HOURS.1.into(),
                }),
                self.turn_runner(),
                self.bus.clone(),
            ));
            Some(runner)
        } else {
            None
        };

        // ── Autonomy: hot state, sensors, loop ───────────────────────
        let mut hot_state = None;
        let mut sensors: Vec<Arc<Sensor>> = Vec::new();
        let mut autonomy = None;

        if config.autonomy_enabled() {
            let hs = Arc::new(match &config.hot_state {
                Some(schema) => HotState::new(schema),
                None => HotState::empty(),
            });

            for sensor_config in &config.sensors {
                match Sensor::from_config(
                    sensor_config,
                    agent_id,
                    hs.clone(),
                    self.registry.clone(),
                    self.llm.clone(),
                    self.bus.clone(),
                    workspace_dir.clone(),
                ) {
                    Ok(sensor) => sensors.push(sensor),
                    Err(e) => {
                        tracing::error!(
                            agent_id,
                            sensor = %sensor_config.name,
                            error = %e,
                            "skipping invalid sensor"
                        );
                    }
                }
            }

            let autonomy_config = config.autonomy.clone().unwrap_or_default();
            autonomy = Some(Arc::new(AutonomyLoop::new(
                agent_id,
                autonomy_config,
                hs.clone(),
                sensors.clone(),
                self.registry.clone(),
                self.llm.clone(),
                self.turn_runner(),
                self.bus.clone(),
                workspace_dir.clone(),
            )));
            hot_state = Some(hs);
        }

        let handle = Arc::new(AgentHandle {
            agent_id: agent_id.to_owned(),
            config: RwLock::new(config.clone()),
            workspace_dir,
            session,
            heartbeat: heartbeat.clone(),
            autonomy: autonomy.clone(),
            hot_state,
            sensors,
        });
        self.handles.lock().insert(agent_id.to_owned(), handle.clone());

        // Start background tasks after the handle is registered so their
        // first turns can resolve it.
        if let Some(autonomy) = &autonomy {
            autonomy.start();
        }
        if let Some(heartbeat) = &heartbeat {
            heartbeat.start();
        }

        let tool_names: Vec<String> = if config.tools.is_empty() {
            self.registry.list().iter().map(|t| t.name().to_owned()).collect()
        } else {
            config.tools.clone()
        };
        self.bus.emit(
            corral_events::AGENT_STARTED,
            json!({
                "agent_id": agent_id,
                "name": config.name,
                "session_key": session_key,
                "tools": tool_names,
                "autonomy_enabled": config.autonomy_enabled(),
            }),
        );
        tracing::info!(agent_id, "agent started");
        Ok(handle)
    }

    /// Stop an agent. Returns `false` when it wasn't running.
    pub fn stop_agent(&self, agent_id: &str) -> bool {
        let Some(handle) = self.handles.lock().remove(agent_id) else {
            return false;
        };

        if let Some(autonomy) = &handle.autonomy {
            autonomy.stop();
        }
        if let Some(heartbeat) = &handle.heartbeat {
            heartbeat.stop();
        }

        self.bus
            .emit(corral_events::AGENT_STOPPED, json!({"agent_id": agent_id}));
        tracing::info!(agent_id, "agent stopped");
        true
    }

    // ── Conversation ─────────────────────────────────────────────────

    /// Send a message to an agent (auto-starting it) and return the reply.
    pub async fn chat(
        &self,
        agent_id: &str,
        message: &str,
        session_key: Option<&str>,
    ) -> Result<String> {
        self.start_agent(agent_id)?;
        let session_key = session_key
            .map(str::to_owned)
            .unwrap_or_else(|| format!("agent:{agent_id}:main"));
        let outcome = self.run_turn(agent_id, &session_key, message).await?;
        Ok(outcome.content)
    }

    async fn run_turn(
        &self,
        agent_id: &str,
        session_key: &str,
        message: &str,
    ) -> Result<TurnOutcome> {
        let handle = self
            .get_handle(agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent not running: {agent_id}")))?;

        let setup = TurnSetup {
            agent_id: agent_id.to_owned(),
            workspace_dir: handle.workspace_dir.clone(),
            config: handle.config.read().clone(),
            llm: self.llm.clone(),
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            transcripts: self.transcripts.clone(),
            bus: self.bus.clone(),
            approvals: Some(self.approvals.clone()),
            compaction_model: self.compaction_model.read().clone(),
        };
        run_agent_turn(&setup, session_key, message).await
    }

    // ── Tool maintenance ─────────────────────────────────────────────

    /// Rewrite the agent's persisted tool allow-list and the live handle.
    pub fn update_agent_tools(&self, agent_id: &str, tools: Vec<String>) -> Result<()> {
        let config_path = self.agents_dir.join(agent_id).join("agent.yaml");
        let mut data: serde_yaml::Value = std::fs::read_to_string(&config_path)
            .ok()
            .and_then(|raw| serde_yaml::from_str(&raw).ok())
            .unwrap_or(serde_yaml::Value::Null);
        if !data.is_mapping() {
            data = serde_yaml::Value::Mapping(Default::default());
        }
        if let Some(map) = data.as_mapping_mut() {
            map.insert(
                serde_yaml::Value::from("id"),
                serde_yaml::Value::from(agent_id),
            );
            map.insert(
                serde_yaml::Value::from("tools"),
                serde_yaml::to_value(&tools)?,
            );
        }
        std::fs::write(&config_path, serde_yaml::to_string(&data)?).map_err(Error::Io)?;

        if let Some(handle) = self.get_handle(agent_id) {
            handle.config.write().tools = tools;
        }
        Ok(())
    }

    // ── Sub-agents ───────────────────────────────────────────────────

    /// Entry point for the spawn tool.
    fn handle_spawn_request(&self, request: SpawnRequest) -> SpawnReceipt {
        let run = self.subagent_registry().spawn(
            &request.requester_session_key,
            &request.agent_id,
            &request.task,
            request.label,
            Some(request.timeout_seconds),
            CleanupPolicy::Keep,
        );
        SpawnReceipt {
            run_id: run.run_id,
            agent_id: run.agent_id,
            child_session_key: run.child_session_key,
        }
    }

    /// Registry callback: run one child turn, auto-starting (or
    /// provisioning) the target agent.
    async fn run_subagent(
        &self,
        agent_id: &str,
        session_key: &str,
        task: &str,
    ) -> Result<TurnOutcome> {
        if self.get_handle(agent_id).is_none() {
            match self.start_agent(agent_id) {
                Ok(_) => {}
                Err(Error::NotFound(_)) => {
                    self.create_ephemeral_agent(agent_id)?;
                    self.start_agent(agent_id)?;
                }
                Err(e) => return Err(e),
            }
        }

        let enriched = self.build_subagent_prompt(agent_id, task);
        self.run_turn(agent_id, session_key, &enriched).await
    }

    /// Minimal workspace for an on-demand sub-agent type.
    fn create_ephemeral_agent(&self, agent_id: &str) -> Result<()> {
        let workspace_dir = self.agents_dir.join(agent_id);
        ensure_workspace(&workspace_dir)?;

        let soul = format!(
            "# {agent_id}\n\n\
             You are a specialist sub-agent on this host.\n\
             Your ID is `{agent_id}`.\n\n\
             You are spawned on-demand to handle specific tasks.\n\
             Be thorough, use your tools, and report back clearly.\n"
        );
        std::fs::write(workspace_dir.join("SOUL.md"), soul).map_err(Error::Io)?;
        tracing::info!(agent_id, "created ephemeral agent workspace");
        Ok(())
    }

    fn build_subagent_prompt(&self, agent_id: &str, task: &str) -> String {
        let tools_text = {
            let allowed = self
                .get_handle(agent_id)
                .map(|h| h.config.read().tools.clone())
                .unwrap_or_default();
            let mut lines = Vec::new();
            for tool in self.registry.list() {
                if !allowed.is_empty() && !allowed.iter().any(|n| n == tool.name()) {
                    continue;
                }
                let first_line = tool.description().lines().next().unwrap_or_default();
                lines.push(format!("- **{}**: {}", tool.name(), first_line));
            }
            if lines.is_empty() {
                "All standard tools available.".to_owned()
            } else {
                lines.join("\n")
            }
        };

        format!(
            "## Sub-Agent Task Assignment\n\n\
             You have been spawned as a sub-agent to handle a specific task.\n\n\
             ### Your Task\n{task}\n\n\
             ### Tools Available to You\n{tools_text}\n\n\
             ### Important Instructions\n\
             1. Focus exclusively on the task above\n\
             2. Use `shared_write` to save any findings for other agents to access\n\
             3. Use `memory_write` to log your work in your daily memory\n\
             4. Be thorough but concise in your response\n\
             5. End with a clear **Summary** section of what you found/accomplished\n\n\
             ### Report Format\n\
             When done, provide:\n\
             - **Findings**: What you discovered\n\
             - **Actions Taken**: What tools you used and results\n\
             - **Recommendations**: Next steps if any\n\
             - **Summary**: One-paragraph synopsis"
        )
    }
}

fn upgrade(weak: &Weak<AgentManager>) -> Result<Arc<AgentManager>> {
    weak.upgrade()
        .ok_or_else(|| Error::Other("manager shut down".into()))
}

fn load_config(workspace_dir: &Path, agent_id: &str) -> Result<AgentConfig> {
    let path = workspace_dir.join("agent.yaml");
    if path.exists() {
        AgentConfig::load(&path)
    } else {
        Ok(AgentConfig::minimal(agent_id))
    }
}
