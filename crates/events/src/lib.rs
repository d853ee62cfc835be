//! In-process event bus with bounded history and external delivery.
//!
//! Every significant runtime transition is published here. In-process
//! subscribers run synchronously in registration order before `emit`
//! returns; external consumers (websocket pushers, dashboards) ride a
//! `tokio::sync::broadcast` channel so a slow or dead consumer can never
//! block the emitter.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event names
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const AGENT_STARTED: &str = "agent:started";
pub const AGENT_STOPPED: &str = "agent:stopped";
pub const AGENT_MESSAGE: &str = "agent:message";
pub const AGENT_THINKING: &str = "agent:thinking";
pub const AGENT_TOOL_CALL: &str = "agent:tool_call";
pub const AGENT_TOOL_RESULT: &str = "agent:tool_result";
pub const AGENT_ERROR: &str = "agent:error";
pub const SUBAGENT_SPAWNED: &str = "subagent:spawned";
pub const SUBAGENT_COMPLETED: &str = "subagent:completed";
pub const APPROVAL_REQUESTED: &str = "approval:requested";
pub const APPROVAL_RESOLVED: &str = "approval:resolved";
pub const HEARTBEAT_RAN: &str = "heartbeat:ran";
pub const AUTONOMY_TURN_STARTED: &str = "autonomy:turn_started";
pub const AUTONOMY_TURN_COMPLETED: &str = "autonomy:turn_completed";
pub const AUTONOMY_PRECHECK_SKIPPED: &str = "autonomy:precheck_skipped";
pub const AUTONOMY_GUARDRAIL_TRIGGERED: &str = "autonomy:guardrail_triggered";
pub const AUTONOMY_SENSOR_UPDATED: &str = "autonomy:sensor_updated";
pub const AUTONOMY_SENSOR_ERROR: &str = "autonomy:sensor_error";
pub const AUTONOMY_NOTIFICATION_PUSHED: &str = "autonomy:notification_pushed";

/// Subscribing to `"*"` receives every event.
pub const WILDCARD: &str = "*";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    pub event_id: u64,
}

impl Event {
    /// The `agent_id` field of the payload, when present.
    pub fn agent_id(&self) -> Option<&str> {
        self.data.get("agent_id").and_then(Value::as_str)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event bus
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const MAX_HISTORY: usize = 1000;
const EXTERNAL_CHANNEL_CAPACITY: usize = 256;

pub type Handler = Box<dyn Fn(&Event) + Send + Sync>;

/// Identifies a subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    handler: Handler,
}

pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    history: RwLock<VecDeque<Event>>,
    external: broadcast::Sender<Event>,
    next_sub_id: RwLock<u64>,
    next_event_id: RwLock<u64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (external, _) = broadcast::channel(EXTERNAL_CHANNEL_CAPACITY);
        Self {
            subscribers: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(MAX_HISTORY)),
            external,
            next_sub_id: RwLock::new(0),
            next_event_id: RwLock::new(0),
        }
    }

    /// Register an in-process handler for `event_type` (or [`WILDCARD`]).
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = {
            let mut next = self.next_sub_id.write();
            *next += 1;
            SubscriptionId(*next)
        };
        self.subscribers
            .write()
            .entry(event_type.to_owned())
            .or_default()
            .push(Subscriber {
                id,
                handler: Box::new(handler),
            });
        id
    }

    /// Remove a previously registered handler. Returns `true` if found.
    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write();
        if let Some(list) = subs.get_mut(event_type) {
            let before = list.len();
            list.retain(|s| s.id != id);
            return list.len() < before;
        }
        false
    }

    /// Open an external delivery channel. Receivers that lag or disconnect
    /// drop out without affecting the emitter.
    pub fn subscribe_external(&self) -> broadcast::Receiver<Event> {
        self.external.subscribe()
    }

    /// Publish an event: record it in history, run in-process handlers in
    /// registration order, then hand it to external receivers best-effort.
    pub fn emit(&self, event_type: &str, data: Value) -> Event {
        let event_id = {
            let mut next = self.next_event_id.write();
            *next += 1;
            *next
        };
        let event = Event {
            event_type: event_type.to_owned(),
            data,
            timestamp: Utc::now(),
            event_id,
        };

        {
            let mut history = self.history.write();
            history.push_back(event.clone());
            while history.len() > MAX_HISTORY {
                history.pop_front();
            }
        }

        {
            // Recursive read: a handler is allowed to emit follow-up events.
            let subs = self.subscribers.read_recursive();
            if let Some(list) = subs.get(event_type) {
                for sub in list {
                    (sub.handler)(&event);
                }
            }
            if let Some(list) = subs.get(WILDCARD) {
                for sub in list {
                    (sub.handler)(&event);
                }
            }
        }

        // Non-blocking: an Err only means nobody is listening right now.
        let _ = self.external.send(event.clone());

        tracing::debug!(event_type, event_id, "event emitted");
        event
    }

    /// The most recent events, oldest first, optionally filtered.
    pub fn recent(
        &self,
        limit: usize,
        types: Option<&[&str]>,
        agent_id: Option<&str>,
    ) -> Vec<Event> {
        let history = self.history.read();
        let filtered: Vec<Event> = history
            .iter()
            .filter(|e| types.map_or(true, |ts| ts.contains(&e.event_type.as_str())))
            .filter(|e| agent_id.map_or(true, |aid| e.agent_id() == Some(aid)))
            .cloned()
            .collect();
        let skip = filtered.len().saturating_sub(limit);
        filtered.into_iter().skip(skip).collect()
    }
}
