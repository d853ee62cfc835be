//! The per-agent `agent.yaml` configuration model.
//!
//! Each agent workspace carries an optional `agent.yaml`; a missing file
//! means an all-defaults agent named after its directory. The shapes here
//! are the contract between `configure_agent`, `start_agent`, and whatever
//! external tooling edits the files by hand.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent identity
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Agent IDs are lowercase kebab-case: `^[a-z0-9]+(-[a-z0-9]+)*$`.
pub fn is_valid_agent_id(id: &str) -> bool {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap()
    });
    re.is_match(id)
}

/// The builder agent cannot be deleted.
pub const PROTECTED_AGENT_ID: &str = "agent-builder";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Thinking level requested from the backend ("low", "medium", "high").
    #[serde(default)]
    pub thinking: Option<String>,
    /// Allow-list of tool names. Empty = all registered tools.
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default = "d_tool_rounds")]
    pub max_tool_rounds: usize,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub autonomy: Option<AutonomyConfig>,
    #[serde(default)]
    pub hot_state: Option<HotStateConfig>,
    #[serde(default)]
    pub sensors: Vec<SensorConfig>,
}

impl AgentConfig {
    /// An all-defaults config for an agent directory without `agent.yaml`.
    pub fn minimal(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            description: String::new(),
            model: None,
            thinking: None,
            tools: Vec::new(),
            max_tool_rounds: d_tool_rounds(),
            heartbeat: HeartbeatConfig::default(),
            autonomy: None,
            hot_state: None,
            sensors: Vec::new(),
        }
    }

    /// Load from an `agent.yaml` file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// The allow-list, or `None` when every registered tool is available.
    pub fn allowed_tools(&self) -> Option<&[String]> {
        if self.tools.is_empty() {
            None
        } else {
            Some(&self.tools)
        }
    }

    pub fn autonomy_enabled(&self) -> bool {
        self.autonomy.as_ref().map(|a| a.enabled).unwrap_or(false)
    }

    /// Structural validation shared by `start_agent` and `configure_agent`.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_agent_id(&self.id) {
            return Err(Error::Config(format!(
                "agent ID must be kebab-case (lowercase letters, numbers, hyphens): '{}'",
                self.id
            )));
        }
        for sensor in &self.sensors {
            sensor.validate()?;
        }
        Ok(())
    }
}

fn d_tool_rounds() -> usize {
    5
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Heartbeat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "d_true")]
    pub enabled: bool,
    /// Seconds between heartbeat checks.
    #[serde(default = "d_1800")]
    pub interval: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: 1800,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Autonomy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutonomyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "d_50")]
    pub max_consecutive_turns: u32,
    #[serde(default = "d_100k")]
    pub token_budget_per_hour: u64,
    #[serde(default = "d_10")]
    pub max_actions_per_minute: usize,
    /// Seconds without a meaningful action before the loop stops itself.
    #[serde(default = "d_600")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub active_hours: Option<ActiveHours>,
    /// Lightweight model consulted before waking the main model.
    #[serde(default)]
    pub precheck_model: Option<String>,
}

impl Default for AutonomyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_consecutive_turns: 50,
            token_budget_per_hour: 100_000,
            max_actions_per_minute: 10,
            idle_timeout: 600,
            active_hours: None,
            precheck_model: None,
        }
    }
}

/// A daily `[start, end)` wall-clock window; may span midnight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveHours {
    /// "HH:MM"
    pub start: String,
    /// "HH:MM"
    pub end: String,
}

impl ActiveHours {
    pub fn contains(&self, now: NaiveTime) -> bool {
        let (start, end) = match (parse_hhmm(&self.start), parse_hhmm(&self.end)) {
            (Some(s), Some(e)) => (s, e),
            // Unparseable windows never gate the loop.
            _ => return true,
        };
        if end > start {
            start <= now && now < end
        } else {
            now >= start || now < end
        }
    }
}

fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hot state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HotStateConfig {
    #[serde(default)]
    pub fields: BTreeMap<String, HotStateFieldConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HotStateFieldConfig {
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// Seconds before the field counts as stale. None = never stale.
    #[serde(default)]
    pub ttl: Option<u64>,
    /// Tool executed to refresh the field when it goes stale.
    #[serde(default)]
    pub refresh_tool: Option<String>,
    /// Bound for array fields; oldest elements drop on overflow.
    #[serde(default)]
    pub max_items: Option<usize>,
}

impl Default for HotStateFieldConfig {
    fn default() -> Self {
        Self {
            field_type: FieldType::Object,
            ttl: None,
            refresh_tool: None,
            max_items: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Object,
    Number,
    String,
    Array,
    Boolean,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sensors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SensorType,
    /// Seconds between polls. Required for `poll` sensors.
    #[serde(default)]
    pub interval: Option<u64>,
    #[serde(default)]
    pub source: SensorSource,
    #[serde(default)]
    pub updates: Vec<SensorUpdate>,
    #[serde(default)]
    pub signals: Vec<SignalConfig>,
}

impl SensorConfig {
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            SensorType::Poll => {
                if self.interval.is_none() {
                    return Err(Error::Config(format!(
                        "sensor '{}': poll type requires 'interval'",
                        self.name
                    )));
                }
                if self.source.tool.is_none() && self.source.url.is_none() {
                    return Err(Error::Config(format!(
                        "sensor '{}': poll type requires 'source.tool' or 'source.url'",
                        self.name
                    )));
                }
            }
            SensorType::Watch => {
                if self.source.path.is_none() {
                    return Err(Error::Config(format!(
                        "sensor '{}': watch type requires 'source.path'",
                        self.name
                    )));
                }
            }
            SensorType::Stream => {
                if self.source.url.is_none() {
                    return Err(Error::Config(format!(
                        "sensor '{}': stream type requires 'source.url'",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorType {
    Poll,
    Watch,
    Stream,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorSource {
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default = "d_empty_object")]
    pub params: Value,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for SensorSource {
    fn default() -> Self {
        Self {
            tool: None,
            params: d_empty_object(),
            url: None,
            path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorUpdate {
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    pub name: String,
    pub model: String,
    pub prompt: String,
    #[serde(default = "d_threshold")]
    pub threshold: f64,
    #[serde(default = "d_true")]
    pub notify: bool,
    /// Seconds between firings of the same signal.
    #[serde(default)]
    pub cooldown: Option<u64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Serde default helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_true() -> bool {
    true
}
fn d_1800() -> u64 {
    1800
}
fn d_50() -> u32 {
    50
}
fn d_100k() -> u64 {
    100_000
}
fn d_10() -> usize {
    10
}
fn d_600() -> u64 {
    600
}
fn d_threshold() -> f64 {
    0.8
}
fn d_empty_object() -> Value {
    Value::Object(Default::default())
}
