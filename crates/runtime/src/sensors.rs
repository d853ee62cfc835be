//! Sensors — long-lived collectors that feed an agent's hot state.
//!
//! Three kinds: `poll` (tool or URL on an interval), `watch` (file mtime),
//! and `stream` (websocket or line-delimited HTTP). Every fetched value is
//! written to each declared hot-state field, then scored against the
//! sensor's ML signals; a signal above threshold and past cooldown pushes
//! a notification for the autonomy loop.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use corral_domain::config::{SensorConfig, SensorType, SignalConfig};
use corral_domain::error::{Error, Result};
use corral_domain::llm::{ChatMessage, ChatRequest, LlmClient};
use corral_events::EventBus;
use corral_tools::{ToolContext, ToolRegistry};

use crate::hot_state::HotState;

/// Backoff ceiling after repeated fetch failures.
const MAX_BACKOFF_SECS: u64 = 300;
/// Watch sensors stat their path once per second.
const WATCH_TICK_SECS: u64 = 1;
/// And back off to two seconds while the path is absent.
const WATCH_ABSENT_SECS: u64 = 2;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sensor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum SensorKind {
    Poll {
        interval: u64,
        tool: Option<String>,
        params: Value,
        url: Option<String>,
    },
    Watch {
        path: PathBuf,
        last_mtime: Mutex<Option<SystemTime>>,
    },
    Stream {
        url: String,
    },
}

pub struct Sensor {
    pub name: String,
    pub agent_id: String,
    kind: SensorKind,
    update_fields: Vec<String>,
    signals: Vec<SignalConfig>,
    hot_state: Arc<HotState>,
    registry: Arc<ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    bus: Arc<EventBus>,
    workspace_dir: PathBuf,
    cancel: CancellationToken,
    signal_last_fired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Sensor {
    /// Build a sensor from its validated config.
    #[allow(clippy::too_many_arguments)]
    pub fn from_config(
        config: &SensorConfig,
        agent_id: &str,
        hot_state: Arc<HotState>,
        registry: Arc<ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        bus: Arc<EventBus>,
        workspace_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let kind = match config.kind {
            SensorType::Poll => SensorKind::Poll {
                interval: config.interval.unwrap_or(60),
                tool: config.source.tool.clone(),
                params: config.source.params.clone(),
                url: config.source.url.clone(),
            },
            SensorType::Watch => SensorKind::Watch {
                path: PathBuf::from(config.source.path.clone().unwrap_or_default()),
                last_mtime: Mutex::new(None),
            },
            SensorType::Stream => SensorKind::Stream {
                url: config.source.url.clone().unwrap_or_default(),
            },
        };

        Ok(Arc::new(Self {
            name: config.name.clone(),
            agent_id: agent_id.to_owned(),
            kind,
            update_fields: config.updates.iter().map(|u| u.field.clone()).collect(),
            signals: config.signals.clone(),
            hot_state,
            registry,
            llm,
            bus,
            workspace_dir,
            cancel: CancellationToken::new(),
            signal_last_fired: Mutex::new(HashMap::new()),
        }))
    }

    /// Spawn the sensor task.
    pub fn start(self: &Arc<Self>) {
        let sensor = self.clone();
        tokio::spawn(async move {
            sensor.run_loop().await;
        });
        tracing::info!(sensor = %self.name, agent_id = %self.agent_id, "sensor started");
    }

    /// Cooperative stop; idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
        tracing::info!(sensor = %self.name, agent_id = %self.agent_id, "sensor stopped");
    }

    async fn run_loop(self: Arc<Self>) {
        let mut backoff: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let iteration = async {
                match &self.kind {
                    SensorKind::Poll { .. } => self.poll_iteration().await,
                    SensorKind::Watch { .. } => self.watch_iteration().await,
                    SensorKind::Stream { .. } => self.stream_iteration().await,
                }
            };
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = iteration => result,
            };

            match result {
                Ok(()) => backoff = 0,
                Err(e) => {
                    tracing::error!(sensor = %self.name, error = %e, "sensor iteration failed");
                    self.bus.emit(
                        corral_events::AUTONOMY_SENSOR_ERROR,
                        json!({
                            "agent_id": self.agent_id,
                            "sensor_name": self.name,
                            "error": e.to_string(),
                        }),
                    );
                    backoff = next_backoff(backoff, self.base_interval());
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(backoff)) => {}
                    }
                }
            }
        }
    }

    fn base_interval(&self) -> u64 {
        match &self.kind {
            SensorKind::Poll { interval, .. } => *interval,
            _ => 5,
        }
    }

    // ── Iterations per kind ──────────────────────────────────────────

    async fn poll_iteration(&self) -> Result<()> {
        let data = self.fetch_poll().await?;
        self.ingest(data).await;
        let interval = self.base_interval();
        tokio::time::sleep(Duration::from_secs(interval)).await;
        Ok(())
    }

    async fn fetch_poll(&self) -> Result<Value> {
        let SensorKind::Poll { tool, params, url, .. } = &self.kind else {
            unreachable!("poll_iteration on non-poll sensor");
        };

        if let Some(tool_name) = tool {
            let ctx = ToolContext::new(
                self.agent_id.clone(),
                format!("sensor:{}:{}", self.agent_id, self.name),
                self.workspace_dir.clone(),
            );
            let result = self.registry.execute(tool_name, params.clone(), &ctx).await;
            if result.success {
                return Ok(result
                    .data
                    .or_else(|| result.message.clone().map(Value::String))
                    .unwrap_or(Value::Null));
            }
            return Err(Error::Other(format!(
                "tool {tool_name} failed: {}",
                result.error.unwrap_or_default()
            )));
        }

        if let Some(url) = url {
            let response = http_client()
                .get(url)
                .send()
                .await
                .map_err(|e| Error::Other(e.to_string()))?
                .error_for_status()
                .map_err(|e| Error::Other(e.to_string()))?;
            let is_json = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map_or(false, |ct| ct.contains("json"));
            let body = response.text().await.map_err(|e| Error::Other(e.to_string()))?;
            return Ok(if is_json {
                serde_json::from_str(&body).unwrap_or(Value::String(body))
            } else {
                Value::String(body)
            });
        }

        Err(Error::Config(format!(
            "sensor {}: no tool or URL configured",
            self.name
        )))
    }

    async fn watch_iteration(&self) -> Result<()> {
        let SensorKind::Watch { path, last_mtime } = &self.kind else {
            unreachable!("watch_iteration on non-watch sensor");
        };

        if !path.exists() {
            tokio::time::sleep(Duration::from_secs(WATCH_ABSENT_SECS)).await;
            return Ok(());
        }

        let mtime = std::fs::metadata(path)
            .and_then(|m| m.modified())
            .map_err(Error::Io)?;
        let changed = {
            let mut last = last_mtime.lock();
            let changed = last.map_or(true, |prev| mtime > prev);
            if changed {
                *last = Some(mtime);
            }
            changed
        };

        if changed {
            let content = std::fs::read_to_string(path).map_err(Error::Io)?;
            let data =
                serde_json::from_str(&content).unwrap_or(Value::String(content));
            self.ingest(data).await;
        }

        tokio::time::sleep(Duration::from_secs(WATCH_TICK_SECS)).await;
        Ok(())
    }

    async fn stream_iteration(&self) -> Result<()> {
        let SensorKind::Stream { url } = &self.kind else {
            unreachable!("stream_iteration on non-stream sensor");
        };

        if url.starts_with("ws://") || url.starts_with("wss://") {
            self.consume_websocket(url).await
        } else {
            self.consume_line_stream(url).await
        }
    }

    async fn consume_websocket(&self, url: &str) -> Result<()> {
        let (mut ws, _) = tokio_tungstenite::connect_async(url.to_owned())
            .await
            .map_err(|e| Error::Other(format!("websocket connect: {e}")))?;

        while let Some(message) = ws.next().await {
            if self.cancel.is_cancelled() {
                break;
            }
            match message {
                Ok(tokio_tungstenite::tungstenite::Message::Text(text)) => {
                    let data = serde_json::from_str(&text)
                        .unwrap_or_else(|_| Value::String(text.to_string()));
                    self.ingest(data).await;
                }
                Ok(tokio_tungstenite::tungstenite::Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => return Err(Error::Other(format!("websocket read: {e}"))),
            }
        }
        Ok(())
    }

    async fn consume_line_stream(&self, url: &str) -> Result<()> {
        let response = http_client()
            .get(url)
            .send()
            .await
            .map_err(|e| Error::Other(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Other(e.to_string()))?;

        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            if self.cancel.is_cancelled() {
                break;
            }
            let chunk = chunk.map_err(|e| Error::Other(e.to_string()))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(newline) = buffer.find('\n') {
                let line: String = buffer.drain(..=newline).collect();
                let mut text = line.trim();
                if let Some(rest) = text.strip_prefix("data:") {
                    text = rest.trim();
                }
                if text.is_empty() {
                    continue;
                }
                let data = serde_json::from_str(text)
                    .unwrap_or_else(|_| Value::String(text.to_owned()));
                self.ingest(data).await;
            }
        }
        Ok(())
    }

    // ── Ingestion + signals ──────────────────────────────────────────

    /// Write the fetched value to every declared field, then score signals.
    async fn ingest(&self, data: Value) {
        for field in &self.update_fields {
            self.hot_state.set(field, data.clone());
            self.bus.emit(
                corral_events::AUTONOMY_SENSOR_UPDATED,
                json!({
                    "agent_id": self.agent_id,
                    "sensor_name": self.name,
                    "field": field,
                }),
            );
        }
        self.run_signals(&data).await;
    }

    async fn run_signals(&self, data: &Value) {
        for signal in &self.signals {
            if self.in_cooldown(signal) {
                continue;
            }

            let data_str = match data {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let request = ChatRequest {
                messages: vec![
                    ChatMessage::system(&signal.prompt),
                    ChatMessage::user(&data_str),
                ],
                model: Some(signal.model.clone()),
                stateless: true,
                ..Default::default()
            };

            let response = match self.llm.chat(request).await {
                Ok(resp) => resp,
                Err(e) => {
                    tracing::warn!(
                        sensor = %self.name,
                        signal = %signal.name,
                        error = %e,
                        "signal evaluation failed"
                    );
                    continue;
                }
            };

            let Some(score) = parse_score(&response.content) else {
                continue;
            };
            if score < signal.threshold {
                continue;
            }

            self.signal_last_fired
                .lock()
                .insert(signal.name.clone(), Utc::now());

            if signal.notify {
                self.hot_state.push_notification(
                    &signal.name,
                    json!({
                        "signal": signal.name,
                        "score": score,
                        "data": data,
                        "sensor": self.name,
                    }),
                );
                self.bus.emit(
                    corral_events::AUTONOMY_NOTIFICATION_PUSHED,
                    json!({
                        "agent_id": self.agent_id,
                        "sensor_name": self.name,
                        "signal_name": signal.name,
                        "score": score,
                    }),
                );
            }
        }
    }

    fn in_cooldown(&self, signal: &SignalConfig) -> bool {
        let Some(cooldown) = signal.cooldown else {
            return false;
        };
        let fired = self.signal_last_fired.lock();
        fired.get(&signal.name).map_or(false, |last| {
            (Utc::now() - *last).num_seconds() < cooldown as i64
        })
    }
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(reqwest::Client::new)
}

/// Exponential backoff: base, then doubling, capped at five minutes.
fn next_backoff(current: u64, base: u64) -> u64 {
    if current == 0 {
        base.min(MAX_BACKOFF_SECS)
    } else {
        (current * 2).min(MAX_BACKOFF_SECS)
    }
}

/// Extract a confidence score in `[0, 1]` from model text. Prefers the
/// last plain `0.x`/`1.0` token; falls back to any in-range number.
fn parse_score(text: &str) -> Option<f64> {
    static STRICT: OnceLock<regex::Regex> = OnceLock::new();
    static LOOSE: OnceLock<regex::Regex> = OnceLock::new();
    let strict =
        STRICT.get_or_init(|| regex::Regex::new(r"\b(0(?:\.\d+)?|1(?:\.0+)?)\b").unwrap());
    let loose = LOOSE.get_or_init(|| regex::Regex::new(r"(\d+\.?\d*)").unwrap());

    if let Some(m) = strict.find_iter(text).last() {
        return m.as_str().parse().ok();
    }
    for m in loose.find_iter(text) {
        if let Ok(value) = m.as_str().parse::<f64>() {
            if (0.0..=1.0).contains(&value) {
                return Some(value);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{text_response, ScriptedLlm};
    use corral_domain::config::{
        HotStateConfig, HotStateFieldConfig, SensorSource, SensorUpdate,
    };
    use corral_domain::tool::ToolResult;
    use corral_tools::Tool;

    fn hot_state_with(field: &str) -> Arc<HotState> {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert(field.to_owned(), HotStateFieldConfig::default());
        Arc::new(HotState::new(&HotStateConfig { fields }))
    }

    struct FeedTool {
        payload: Value,
    }

    #[async_trait::async_trait]
    impl Tool for FeedTool {
        fn name(&self) -> &str {
            "fetch_feed"
        }
        fn description(&self) -> &str {
            "Test feed."
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}, "required": []})
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult {
                success: true,
                data: Some(self.payload.clone()),
                ..Default::default()
            }
        }
    }

    struct BrokenTool;

    #[async_trait::async_trait]
    impl Tool for BrokenTool {
        fn name(&self) -> &str {
            "fetch_feed"
        }
        fn description(&self) -> &str {
            "Always fails."
        }
        fn parameters(&self) -> Value {
            json!({"type": "object", "properties": {}, "required": []})
        }
        async fn execute(&self, _params: Value, _ctx: &ToolContext) -> ToolResult {
            ToolResult::fail("upstream offline")
        }
    }

    fn poll_config(signals: Vec<SignalConfig>) -> SensorConfig {
        SensorConfig {
            name: "feed".into(),
            kind: SensorType::Poll,
            interval: Some(30),
            source: SensorSource {
                tool: Some("fetch_feed".into()),
                ..Default::default()
            },
            updates: vec![SensorUpdate {
                field: "market".into(),
            }],
            signals,
        }
    }

    fn build_sensor(
        config: &SensorConfig,
        registry: Arc<ToolRegistry>,
        llm: Arc<ScriptedLlm>,
    ) -> (Arc<Sensor>, Arc<HotState>, Arc<EventBus>) {
        let hot_state = hot_state_with("market");
        let bus = Arc::new(EventBus::new());
        let sensor = Sensor::from_config(
            config,
            "trader",
            hot_state.clone(),
            registry,
            llm,
            bus.clone(),
            PathBuf::from("/tmp/ws"),
        )
        .unwrap();
        (sensor, hot_state, bus)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = 0;
        let mut sequence = Vec::new();
        for _ in 0..8 {
            backoff = next_backoff(backoff, 5);
            sequence.push(backoff);
        }
        assert_eq!(sequence, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn score_parsing() {
        assert_eq!(parse_score("0.93"), Some(0.93));
        assert_eq!(parse_score("confidence: 0.4 then 0.85"), Some(0.85));
        assert_eq!(parse_score("score is 1.0"), Some(1.0));
        assert_eq!(parse_score("I'd say 0.5 out of 1"), Some(1.0));
        assert_eq!(parse_score("no numbers here"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_sensor_writes_fields_and_emits() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FeedTool {
            payload: json!({"price": 101}),
        }));
        let llm = ScriptedLlm::new(vec![]);
        let (sensor, hot_state, bus) = build_sensor(&poll_config(vec![]), registry, llm);

        sensor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sensor.stop();

        assert_eq!(hot_state.get("market").unwrap(), json!({"price": 101}));
        let updates = bus.recent(10, Some(&[corral_events::AUTONOMY_SENSOR_UPDATED]), None);
        assert!(!updates.is_empty());
        assert_eq!(updates[0].data["sensor_name"], json!("feed"));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_over_threshold_pushes_notification() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FeedTool {
            payload: json!({"price": 9999}),
        }));
        let llm = ScriptedLlm::new(vec![]).with_fallback(text_response("0.95", 5));
        let config = poll_config(vec![SignalConfig {
            name: "big-move".into(),
            model: "tiny-gate".into(),
            prompt: "Score volatility 0-1.".into(),
            threshold: 0.8,
            notify: true,
            cooldown: Some(3600),
        }]);
        let (sensor, hot_state, bus) = build_sensor(&config, registry, llm);

        sensor.start();
        // Two poll cycles; the cooldown must hold the second firing back.
        tokio::time::sleep(Duration::from_secs(61)).await;
        sensor.stop();

        let notifications = hot_state.pop_notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].name, "big-move");
        assert_eq!(notifications[0].data["score"], json!(0.95));
        assert_eq!(notifications[0].data["sensor"], json!("feed"));

        let pushed = bus.recent(
            10,
            Some(&[corral_events::AUTONOMY_NOTIFICATION_PUSHED]),
            None,
        );
        assert_eq!(pushed.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_below_threshold_is_silent() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FeedTool {
            payload: json!({"price": 100}),
        }));
        let llm = ScriptedLlm::new(vec![]).with_fallback(text_response("0.2", 5));
        let config = poll_config(vec![SignalConfig {
            name: "big-move".into(),
            model: "tiny-gate".into(),
            prompt: "Score volatility 0-1.".into(),
            threshold: 0.8,
            notify: true,
            cooldown: None,
        }]);
        let (sensor, hot_state, _) = build_sensor(&config, registry, llm);

        sensor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sensor.stop();

        assert!(!hot_state.has_notifications());
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_failure_emits_sensor_error_and_backs_off() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(BrokenTool));
        let llm = ScriptedLlm::new(vec![]);
        let (sensor, hot_state, bus) = build_sensor(&poll_config(vec![]), registry, llm);

        sensor.start();
        tokio::time::sleep(Duration::from_secs(100)).await;
        sensor.stop();

        assert!(hot_state.get("market").is_none());
        let errors = bus.recent(100, Some(&[corral_events::AUTONOMY_SENSOR_ERROR]), None);
        // 30s interval with doubling backoff: ~3 failures in 100s, not dozens.
        assert!(errors.len() >= 2, "expected repeated errors, got {}", errors.len());
        assert!(errors.len() < 10, "backoff should throttle retries, got {}", errors.len());
        assert_eq!(errors[0].data["error"], json!("tool fetch_feed failed: upstream offline"));
    }

    #[tokio::test(start_paused = true)]
    async fn watch_sensor_reads_initial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, r#"{"door": "open"}"#).unwrap();

        let hot_state = hot_state_with("door_state");
        let bus = Arc::new(EventBus::new());
        let config = SensorConfig {
            name: "door".into(),
            kind: SensorType::Watch,
            interval: None,
            source: SensorSource {
                path: Some(path.display().to_string()),
                ..Default::default()
            },
            updates: vec![SensorUpdate {
                field: "door_state".into(),
            }],
            signals: vec![],
        };
        let sensor = Sensor::from_config(
            &config,
            "guard",
            hot_state.clone(),
            Arc::new(ToolRegistry::new()),
            ScriptedLlm::new(vec![]),
            bus,
            PathBuf::from("/tmp/ws"),
        )
        .unwrap();

        sensor.start();
        tokio::time::sleep(Duration::from_secs(1)).await;
        sensor.stop();

        assert_eq!(hot_state.get("door_state").unwrap(), json!({"door": "open"}));
    }

    #[tokio::test]
    async fn non_json_watch_content_is_stored_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, "plain text status").unwrap();

        let hot_state = hot_state_with("notes");
        let config = SensorConfig {
            name: "notes".into(),
            kind: SensorType::Watch,
            interval: None,
            source: SensorSource {
                path: Some(path.display().to_string()),
                ..Default::default()
            },
            updates: vec![SensorUpdate {
                field: "notes".into(),
            }],
            signals: vec![],
        };
        let sensor = Sensor::from_config(
            &config,
            "guard",
            hot_state.clone(),
            Arc::new(ToolRegistry::new()),
            ScriptedLlm::new(vec![]),
            Arc::new(EventBus::new()),
            PathBuf::from("/tmp/ws"),
        )
        .unwrap();

        // Drive one iteration directly instead of spawning the loop.
        sensor.watch_iteration().await.unwrap();
        assert_eq!(hot_state.get("notes").unwrap(), json!("plain text status"));
    }

    #[tokio::test]
    async fn multiple_update_fields_get_the_same_value() {
        let mut fields = std::collections::BTreeMap::new();
        fields.insert("a".to_owned(), HotStateFieldConfig::default());
        fields.insert("b".to_owned(), HotStateFieldConfig::default());
        let hot_state = Arc::new(HotState::new(&HotStateConfig { fields }));

        let registry = Arc::new(ToolRegistry::new());
        registry.register(Arc::new(FeedTool {
            payload: json!(42),
        }));
        let mut config = poll_config(vec![]);
        config.updates = vec![
            SensorUpdate { field: "a".into() },
            SensorUpdate { field: "b".into() },
        ];

        let sensor = Sensor::from_config(
            &config,
            "trader",
            hot_state.clone(),
            registry,
            ScriptedLlm::new(vec![]),
            Arc::new(EventBus::new()),
            PathBuf::from("/tmp/ws"),
        )
        .unwrap();

        let data = sensor.fetch_poll().await.unwrap();
        sensor.ingest(data).await;
        assert_eq!(hot_state.get("a").unwrap(), json!(42));
        assert_eq!(hot_state.get("b").unwrap(), json!(42));
    }
}
