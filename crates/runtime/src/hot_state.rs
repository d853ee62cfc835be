//! Hot state — the structured in-memory store an autonomous agent observes.
//!
//! Fields are declared up front in the agent's schema; writes to unknown
//! fields fail silently (with a log line) so a misspelled sensor binding
//! cannot create ghost state. Array fields are bounded, TTL'd fields go
//! stale, and a FIFO notification queue carries sensor alerts to the loop.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};

use corral_domain::config::{FieldType, HotStateConfig, HotStateFieldConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A high-priority alert pushed by a sensor signal.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

struct FieldState {
    config: HotStateFieldConfig,
    value: Option<Value>,
    updated_at: Option<DateTime<Utc>>,
}

struct Inner {
    fields: BTreeMap<String, FieldState>,
    notifications: Vec<Notification>,
}

pub struct HotState {
    inner: Mutex<Inner>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Impl
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl HotState {
    pub fn new(config: &HotStateConfig) -> Self {
        let fields = config
            .fields
            .iter()
            .map(|(name, fc)| {
                (
                    name.clone(),
                    FieldState {
                        config: fc.clone(),
                        value: None,
                        updated_at: None,
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(Inner {
                fields,
                notifications: Vec::new(),
            }),
        }
    }

    pub fn empty() -> Self {
        Self::new(&HotStateConfig::default())
    }

    /// Set a field's value. Returns `false` for fields not in the schema.
    pub fn set(&self, name: &str, mut value: Value) -> bool {
        let mut inner = self.inner.lock();
        let Some(field) = inner.fields.get_mut(name) else {
            tracing::warn!(field = name, "hot state field not in schema");
            return false;
        };

        if field.config.field_type == FieldType::Array {
            if let (Some(max), Value::Array(items)) = (field.config.max_items, &mut value) {
                if items.len() > max {
                    items.drain(..items.len() - max);
                }
            }
        }

        field.value = Some(value);
        field.updated_at = Some(Utc::now());
        true
    }

    /// Append to an array field, dropping the oldest items past `max_items`.
    pub fn append(&self, name: &str, item: Value) -> bool {
        let mut inner = self.inner.lock();
        let Some(field) = inner.fields.get_mut(name) else {
            tracing::warn!(field = name, "hot state field not in schema");
            return false;
        };
        if field.config.field_type != FieldType::Array {
            tracing::warn!(field = name, "cannot append to non-array field");
            return false;
        }

        let items = match field.value.take() {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };
        let mut items = items;
        items.push(item);
        if let Some(max) = field.config.max_items {
            if items.len() > max {
                items.drain(..items.len() - max);
            }
        }
        field.value = Some(Value::Array(items));
        field.updated_at = Some(Utc::now());
        true
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.inner.lock().fields.get(name).and_then(|f| f.value.clone())
    }

    /// A field is stale iff it has a TTL and was never set or was set more
    /// than `ttl` seconds ago.
    pub fn is_stale(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        let Some(field) = inner.fields.get(name) else {
            return false;
        };
        field_is_stale(field, Utc::now())
    }

    pub fn stale_fields(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let now = Utc::now();
        inner
            .fields
            .iter()
            .filter(|(_, f)| field_is_stale(f, now))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stale fields with a refresh tool, as `(field, tool)` pairs.
    pub fn refreshable_stale_fields(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        let now = Utc::now();
        inner
            .fields
            .iter()
            .filter(|(_, f)| field_is_stale(f, now))
            .filter_map(|(name, f)| {
                f.config
                    .refresh_tool
                    .clone()
                    .map(|tool| (name.clone(), tool))
            })
            .collect()
    }

    pub fn field_names(&self) -> Vec<String> {
        self.inner.lock().fields.keys().cloned().collect()
    }

    /// Human-readable block for LLM context injection, one line per field,
    /// marking staleness with the elapsed age.
    pub fn render(&self) -> String {
        let inner = self.inner.lock();
        if inner.fields.is_empty() {
            return String::new();
        }

        let now = Utc::now();
        let mut lines = vec!["## Hot State".to_owned(), String::new()];
        for (name, field) in &inner.fields {
            let line = match &field.value {
                None => format!("**{name}**: (not yet loaded)"),
                Some(value) => {
                    let rendered = render_value(value);
                    match (field.config.ttl, field.updated_at) {
                        (Some(ttl), Some(at)) => {
                            let age = (now - at).num_seconds().max(0) as u64;
                            if age > ttl {
                                format!("**{name}**: {rendered} (stale: {})", humanize_age(age))
                            } else {
                                format!("**{name}**: {rendered}")
                            }
                        }
                        _ => format!("**{name}**: {rendered}"),
                    }
                }
            };
            lines.push(line);
        }
        lines.join("\n")
    }

    // ── Notifications ────────────────────────────────────────────────

    pub fn push_notification(&self, name: &str, data: Value) {
        self.inner.lock().notifications.push(Notification {
            name: name.to_owned(),
            data,
            timestamp: Utc::now(),
        });
    }

    /// Drain the queue atomically, FIFO order.
    pub fn pop_notifications(&self) -> Vec<Notification> {
        std::mem::take(&mut self.inner.lock().notifications)
    }

    /// Clone the queue without draining (context build, wake-early checks).
    pub fn peek_notifications(&self) -> Vec<Notification> {
        self.inner.lock().notifications.clone()
    }

    pub fn has_notifications(&self) -> bool {
        !self.inner.lock().notifications.is_empty()
    }

    // ── Change tracking ──────────────────────────────────────────────

    /// Fields whose `updated_at` is after the given snapshot.
    pub fn diff_since(&self, since: DateTime<Utc>) -> Map<String, Value> {
        let inner = self.inner.lock();
        let mut changed = Map::new();
        for (name, field) in &inner.fields {
            if let Some(at) = field.updated_at {
                if at > since {
                    changed.insert(
                        name.clone(),
                        json!({
                            "value": field.value,
                            "updated_at": at.to_rfc3339(),
                        }),
                    );
                }
            }
        }
        changed
    }

    pub fn snapshot_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    #[cfg(test)]
    fn force_updated_at(&self, name: &str, at: DateTime<Utc>) {
        if let Some(field) = self.inner.lock().fields.get_mut(name) {
            field.updated_at = Some(at);
        }
    }
}

fn field_is_stale(field: &FieldState, now: DateTime<Utc>) -> bool {
    let Some(ttl) = field.config.ttl else {
        return false;
    };
    match field.updated_at {
        None => true,
        Some(at) => (now - at).num_seconds() > ttl as i64,
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn humanize_age(seconds: u64) -> String {
    if seconds < 60 {
        format!("{seconds}s ago")
    } else if seconds < 3600 {
        format!("{}m ago", seconds / 60)
    } else {
        format!("{}h ago", seconds / 3600)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn schema() -> HotStateConfig {
        let mut fields = BTreeMap::new();
        fields.insert(
            "positions".to_owned(),
            HotStateFieldConfig {
                field_type: FieldType::Object,
                ttl: Some(60),
                refresh_tool: Some("fetch_positions".to_owned()),
                max_items: None,
            },
        );
        fields.insert(
            "signals_log".to_owned(),
            HotStateFieldConfig {
                field_type: FieldType::Array,
                ttl: None,
                refresh_tool: None,
                max_items: Some(5),
            },
        );
        fields.insert(
            "mood".to_owned(),
            HotStateFieldConfig {
                field_type: FieldType::String,
                ttl: None,
                refresh_tool: None,
                max_items: None,
            },
        );
        HotStateConfig { fields }
    }

    #[test]
    fn unknown_field_writes_are_rejected() {
        let hs = HotState::new(&schema());
        assert!(!hs.set("gohst_field", json!(1)));
        assert!(hs.get("gohst_field").is_none());
    }

    #[test]
    fn array_overflow_keeps_most_recent() {
        let hs = HotState::new(&schema());
        for i in 1..=7 {
            assert!(hs.append("signals_log", json!(i)));
        }
        assert_eq!(hs.get("signals_log").unwrap(), json!([3, 4, 5, 6, 7]));
    }

    #[test]
    fn set_oversized_array_is_trimmed() {
        let hs = HotState::new(&schema());
        hs.set("signals_log", json!([1, 2, 3, 4, 5, 6, 7, 8]));
        assert_eq!(hs.get("signals_log").unwrap(), json!([4, 5, 6, 7, 8]));
    }

    #[test]
    fn append_to_non_array_is_rejected() {
        let hs = HotState::new(&schema());
        assert!(!hs.append("mood", json!("sunny")));
    }

    #[test]
    fn ttl_staleness() {
        let hs = HotState::new(&schema());
        // Never set + ttl = stale.
        assert!(hs.is_stale("positions"));
        // No ttl = never stale.
        assert!(!hs.is_stale("mood"));

        hs.set("positions", json!({"BTC": 2}));
        assert!(!hs.is_stale("positions"));

        hs.force_updated_at("positions", Utc::now() - Duration::seconds(61));
        assert!(hs.is_stale("positions"));
    }

    #[test]
    fn refreshable_stale_fields_pairs_tool() {
        let hs = HotState::new(&schema());
        let refreshable = hs.refreshable_stale_fields();
        assert_eq!(
            refreshable,
            vec![("positions".to_owned(), "fetch_positions".to_owned())]
        );

        hs.set("positions", json!({}));
        assert!(hs.refreshable_stale_fields().is_empty());
    }

    #[test]
    fn render_marks_staleness_and_missing_values() {
        let hs = HotState::new(&schema());
        hs.set("mood", json!("watchful"));
        hs.set("positions", json!({"BTC": 2}));
        hs.force_updated_at("positions", Utc::now() - Duration::seconds(90));

        let rendered = hs.render();
        assert!(rendered.starts_with("## Hot State"));
        assert!(rendered.contains("**mood**: watchful"));
        assert!(rendered.contains("(stale: 1m ago)"));
        assert!(rendered.contains("**signals_log**: (not yet loaded)"));
    }

    #[test]
    fn empty_schema_renders_nothing() {
        assert_eq!(HotState::empty().render(), "");
    }

    #[test]
    fn notification_queue_is_fifo_and_drains_atomically() {
        let hs = HotState::new(&schema());
        assert!(!hs.has_notifications());

        hs.push_notification("order_filled", json!({"qty": 10}));
        hs.push_notification("price_alert", json!({"px": 42}));
        assert!(hs.has_notifications());
        assert_eq!(hs.peek_notifications().len(), 2);
        assert!(hs.has_notifications(), "peek must not drain");

        let drained = hs.pop_notifications();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].name, "order_filled");
        assert_eq!(drained[1].name, "price_alert");
        assert!(!hs.has_notifications());
    }

    #[test]
    fn diff_since_tracks_changes() {
        let hs = HotState::new(&schema());
        let before = hs.snapshot_time();
        assert!(hs.diff_since(before).is_empty());

        hs.set("mood", json!("alert"));
        let diff = hs.diff_since(before);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff["mood"]["value"], json!("alert"));

        let after = hs.snapshot_time();
        assert!(hs.diff_since(after).is_empty());
    }

    #[test]
    fn humanize_age_units() {
        assert_eq!(humanize_age(45), "45s ago");
        assert_eq!(humanize_age(150), "2m ago");
        assert_eq!(humanize_age(7300), "2h ago");
    }
}
