//! Session store backed by a single `sessions.json` file.
//!
//! Each session key maps to a [`SessionEntry`] tracking the session ID,
//! token counters, status, and metadata. Every mutation writes through to
//! disk so a restart picks up where the host left off.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use corral_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single session tracked by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub session_id: String,
    pub session_key: String,
    pub agent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default = "d_active")]
    pub status: String,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

fn d_active() -> String {
    "active".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionStore {
    path: PathBuf,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionStore {
    /// Load or create the store at the given file path.
    pub fn new(path: &Path) -> Self {
        let sessions = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, SessionEntry>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!(error = %e, path = %path.display(), "session file unreadable, starting fresh");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        tracing::info!(
            sessions = sessions.len(),
            path = %path.display(),
            "session store loaded"
        );

        Self {
            path: path.to_path_buf(),
            sessions: Mutex::new(sessions),
        }
    }

    pub fn get(&self, session_key: &str) -> Option<SessionEntry> {
        self.sessions.lock().get(session_key).cloned()
    }

    /// Return the existing entry or create one with a fresh UUID.
    pub fn get_or_create(&self, session_key: &str, agent_id: &str) -> SessionEntry {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get(session_key) {
            return entry.clone();
        }

        let now = Utc::now();
        let entry = SessionEntry {
            session_id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.to_owned(),
            agent_id: agent_id.to_owned(),
            created_at: now,
            updated_at: now,
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            status: "active".into(),
            metadata: HashMap::new(),
        };
        sessions.insert(session_key.to_owned(), entry.clone());
        self.persist(&sessions);
        tracing::info!(session_key, agent_id, "session created");
        entry
    }

    /// Advance token counters. Counters only ever grow.
    pub fn record_usage(&self, session_key: &str, input_tokens: u64, output_tokens: u64) {
        let mut sessions = self.sessions.lock();
        if let Some(entry) = sessions.get_mut(session_key) {
            entry.input_tokens += input_tokens;
            entry.output_tokens += output_tokens;
            entry.total_tokens += input_tokens + output_tokens;
            entry.updated_at = Utc::now();
            self.persist(&sessions);
        }
    }

    pub fn set_status(&self, session_key: &str, status: &str) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(session_key) {
            Some(entry) => {
                entry.status = status.to_owned();
                entry.updated_at = Utc::now();
                self.persist(&sessions);
                true
            }
            None => false,
        }
    }

    pub fn set_metadata(&self, session_key: &str, key: &str, value: Value) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get_mut(session_key) {
            Some(entry) => {
                entry.metadata.insert(key.to_owned(), value);
                entry.updated_at = Utc::now();
                self.persist(&sessions);
                true
            }
            None => false,
        }
    }

    /// List sessions, newest first, optionally filtered.
    pub fn list(&self, agent_id: Option<&str>, status: Option<&str>) -> Vec<SessionEntry> {
        let sessions = self.sessions.lock();
        let mut entries: Vec<SessionEntry> = sessions
            .values()
            .filter(|e| agent_id.map_or(true, |aid| e.agent_id == aid))
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        entries
    }

    pub fn delete(&self, session_key: &str) -> bool {
        let mut sessions = self.sessions.lock();
        if sessions.remove(session_key).is_some() {
            self.persist(&sessions);
            return true;
        }
        false
    }

    /// Drop completed/failed sessions untouched for longer than the cutoff.
    pub fn cleanup_old(&self, max_age_hours: i64) -> usize {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, e| {
            !(matches!(e.status.as_str(), "completed" | "failed") && e.updated_at < cutoff)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            self.persist(&sessions);
            tracing::info!(removed, "cleaned up old sessions");
        }
        removed
    }

    fn persist(&self, sessions: &HashMap<String, SessionEntry>) {
        if let Err(e) = self.write_file(sessions) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to persist sessions");
        }
    }

    fn write_file(&self, sessions: &HashMap<String, SessionEntry>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        let json = serde_json::to_string_pretty(sessions)?;
        std::fs::write(&self.path, json).map_err(Error::Io)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(&dir.path().join("sessions.json"))
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);

        let a = store.get_or_create("agent:alpha:main", "alpha");
        let b = store.get_or_create("agent:alpha:main", "alpha");
        assert_eq!(a.session_id, b.session_id);
        assert_eq!(a.status, "active");
    }

    #[test]
    fn tokens_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_or_create("agent:alpha:main", "alpha");

        store.record_usage("agent:alpha:main", 100, 20);
        store.record_usage("agent:alpha:main", 50, 10);

        let entry = store.get("agent:alpha:main").unwrap();
        assert_eq!(entry.input_tokens, 150);
        assert_eq!(entry.output_tokens, 30);
        assert_eq!(entry.total_tokens, 180);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");

        let first = SessionStore::new(&path);
        let created = first.get_or_create("agent:alpha:main", "alpha");
        first.record_usage("agent:alpha:main", 10, 5);

        let second = SessionStore::new(&path);
        let reloaded = second.get("agent:alpha:main").unwrap();
        assert_eq!(reloaded.session_id, created.session_id);
        assert_eq!(reloaded.total_tokens, 15);
    }

    #[test]
    fn list_filters_by_agent_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_or_create("agent:alpha:main", "alpha");
        store.get_or_create("agent:beta:main", "beta");
        store.get_or_create("agent:alpha:autonomy", "alpha");
        store.set_status("agent:alpha:autonomy", "completed");

        assert_eq!(store.list(Some("alpha"), None).len(), 2);
        assert_eq!(store.list(Some("alpha"), Some("active")).len(), 1);
        assert_eq!(store.list(None, None).len(), 3);
    }

    #[test]
    fn delete_and_missing_updates() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_or_create("agent:alpha:main", "alpha");

        assert!(store.delete("agent:alpha:main"));
        assert!(!store.delete("agent:alpha:main"));
        assert!(!store.set_status("agent:alpha:main", "completed"));
    }

    #[test]
    fn cleanup_spares_active_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_or_create("agent:alpha:main", "alpha");
        store.set_status("agent:alpha:main", "completed");
        store.get_or_create("agent:beta:main", "beta");

        // Nothing is old enough yet.
        assert_eq!(store.cleanup_old(1), 0);
        // With a cutoff in the future, only the completed one goes.
        assert_eq!(store.cleanup_old(-1), 1);
        assert!(store.get("agent:beta:main").is_some());
    }

    #[test]
    fn metadata_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.get_or_create("agent:alpha:main", "alpha");
        store.set_metadata("agent:alpha:main", "spawned_by", serde_json::json!("agent:root:main"));

        let entry = store.get("agent:alpha:main").unwrap();
        assert_eq!(entry.metadata["spawned_by"], serde_json::json!("agent:root:main"));
    }
}
