//! In-memory queue of side-effecting actions awaiting human approval.
//!
//! Tools that gate on approval insert a pending entry and return an
//! approval handle; an external surface resolves it later. The queue never
//! blocks the tool loop.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};

use corral_events::EventBus;

/// A pending approval waiting for human review.
#[derive(Debug, Clone, Serialize)]
pub struct PendingApproval {
    pub id: String,
    pub agent_id: String,
    pub description: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

pub struct ApprovalQueue {
    pending: RwLock<HashMap<String, PendingApproval>>,
    bus: Arc<EventBus>,
}

impl ApprovalQueue {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            pending: RwLock::new(HashMap::new()),
            bus,
        }
    }

    /// Insert a pending approval and announce it.
    pub fn trigger(
        &self,
        agent_id: &str,
        description: &str,
        payload: Value,
    ) -> PendingApproval {
        let approval = PendingApproval {
            id: short_id(),
            agent_id: agent_id.to_owned(),
            description: description.to_owned(),
            payload,
            created_at: Utc::now(),
        };
        self.pending.write().insert(approval.id.clone(), approval.clone());
        self.bus.emit(
            corral_events::APPROVAL_REQUESTED,
            json!({
                "agent_id": approval.agent_id,
                "approval_id": approval.id,
                "description": approval.description,
            }),
        );
        approval
    }

    /// Resolve a pending approval. Returns the entry if it existed.
    pub fn resolve(&self, id: &str, approved: bool) -> Option<PendingApproval> {
        let removed = self.pending.write().remove(id);
        if let Some(approval) = &removed {
            self.bus.emit(
                corral_events::APPROVAL_RESOLVED,
                json!({
                    "agent_id": approval.agent_id,
                    "approval_id": approval.id,
                    "approved": approved,
                }),
            );
        }
        removed
    }

    pub fn list_pending(&self) -> Vec<PendingApproval> {
        let mut entries: Vec<PendingApproval> = self.pending.read().values().cloned().collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }
}

/// 8-char opaque ID, same shape as sub-agent run IDs.
pub fn short_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_owned()
}
