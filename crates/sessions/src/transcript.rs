//! Per-session transcripts, one JSON file per session ID.
//!
//! Transcripts are append-only between compactions. A compaction rewrites
//! the message list to `{system messages} + {summary} + {last N non-system
//! messages}` and bumps `compaction_count`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use corral_domain::error::{Error, Result};
use corral_domain::llm::Role;
use corral_domain::tool::ToolCall;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message / transcript
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A single transcript message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            thinking: None,
            tool_call_id: None,
            tool_name: None,
            tool_calls: None,
            metadata: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_thinking(mut self, thinking: Option<String>) -> Self {
        self.thinking = thinking;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    pub session_id: String,
    pub agent_id: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub compaction_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl Transcript {
    pub fn non_system_len(&self) -> usize {
        self.messages.iter().filter(|m| m.role != Role::System).count()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct TranscriptStore {
    dir: PathBuf,
    // Serializes read-modify-write cycles across tasks.
    write_lock: Mutex<()>,
}

impl TranscriptStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(Error::Io)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}.json"))
    }

    pub fn load(&self, session_id: &str) -> Option<Transcript> {
        let path = self.path_for(session_id);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(t) => Some(t),
            Err(e) => {
                tracing::warn!(session_id, error = %e, "transcript unreadable");
                None
            }
        }
    }

    fn save(&self, transcript: &mut Transcript) -> Result<()> {
        transcript.updated_at = Utc::now();
        let json = serde_json::to_string_pretty(transcript)?;
        std::fs::write(self.path_for(&transcript.session_id), json).map_err(Error::Io)?;
        Ok(())
    }

    fn get_or_create(&self, session_id: &str, agent_id: &str) -> Transcript {
        self.load(session_id).unwrap_or_else(|| {
            let now = Utc::now();
            Transcript {
                session_id: session_id.to_owned(),
                agent_id: agent_id.to_owned(),
                messages: Vec::new(),
                created_at: now,
                updated_at: now,
                compaction_count: 0,
                summary: None,
            }
        })
    }

    /// Append one message.
    pub fn append(&self, session_id: &str, agent_id: &str, message: Message) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut transcript = self.get_or_create(session_id, agent_id);
        transcript.messages.push(message);
        self.save(&mut transcript)
    }

    /// Messages for the context window: system messages first, then the
    /// compaction summary (as a synthetic system message), then the last
    /// `max` non-system messages in order.
    pub fn messages_for_context(&self, session_id: &str, max: usize) -> Vec<Message> {
        let Some(transcript) = self.load(session_id) else {
            return Vec::new();
        };

        let mut result: Vec<Message> = transcript
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();

        if let Some(summary) = &transcript.summary {
            let mut marker = Message::new(
                Role::System,
                format!("[Previous conversation summary]\n{summary}"),
            );
            marker.metadata = Some(serde_json::json!({"compaction": true}));
            result.push(marker);
        }

        let non_system: Vec<Message> = transcript
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        let skip = non_system.len().saturating_sub(max);
        result.extend(non_system.into_iter().skip(skip));
        result
    }

    /// Rewrite the transcript to `{systems} + {last keep_last non-system}`,
    /// record the summary, and bump the compaction counter. A transcript
    /// already at or under `keep_last` non-system messages is untouched.
    pub fn compact(
        &self,
        session_id: &str,
        keep_last: usize,
        summary: Option<String>,
    ) -> Result<Option<Transcript>> {
        let _guard = self.write_lock.lock();
        let Some(mut transcript) = self.load(session_id) else {
            return Ok(None);
        };
        if transcript.non_system_len() <= keep_last {
            return Ok(Some(transcript));
        }

        let system: Vec<Message> = transcript
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        let non_system: Vec<Message> = transcript
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();
        let skip = non_system.len() - keep_last;

        let mut messages = system;
        messages.extend(non_system.into_iter().skip(skip));
        transcript.messages = messages;
        transcript.summary = summary;
        transcript.compaction_count += 1;
        self.save(&mut transcript)?;

        tracing::info!(
            session_id,
            kept = transcript.messages.len(),
            compaction_count = transcript.compaction_count,
            "transcript compacted"
        );
        Ok(Some(transcript))
    }

    pub fn delete(&self, session_id: &str) -> bool {
        let _guard = self.write_lock.lock();
        std::fs::remove_file(self.path_for(session_id)).is_ok()
    }
}
