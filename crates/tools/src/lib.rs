//! Tool capabilities and the registry that dispatches them.
//!
//! A tool is anything implementing [`Tool`]; the [`ToolRegistry`] owns the
//! catalog, emits function-calling schemas, and validates + dispatches
//! calls. Built-in tools cover workspace memory, the cross-agent shared
//! knowledge area, shell execution, notifications (approval-gated),
//! sub-agent spawning, pacing (`yield`), and agent CRUD.

pub mod approvals;
pub mod configure;
pub mod exec;
pub mod introspect;
pub mod memory;
pub mod notify;
pub mod pacing;
pub mod registry;
pub mod shared;
pub mod spawn;

pub use approvals::{ApprovalQueue, PendingApproval};
pub use pacing::{YieldDirective, YieldMode};
pub use registry::{Tool, ToolContext, ToolRegistry};
pub use spawn::{SpawnAgentTool, SpawnReceipt, SpawnRequest};

use std::sync::Arc;

/// Handles to the built-in tools that need post-construction wiring.
pub struct Builtins {
    pub spawn: Arc<spawn::SpawnAgentTool>,
    pub configure: Arc<configure::ConfigureAgentTool>,
    pub list_agents: Arc<introspect::ListAgentsTool>,
}

/// Register every built-in tool on the registry.
pub fn register_builtins(registry: &Arc<ToolRegistry>) -> Builtins {
    registry.register(Arc::new(memory::MemoryReadTool));
    registry.register(Arc::new(memory::MemoryWriteTool));
    registry.register(Arc::new(shared::SharedReadTool));
    registry.register(Arc::new(shared::SharedWriteTool));
    registry.register(Arc::new(shared::SharedSearchTool));
    registry.register(Arc::new(shared::SharedLogTool));
    registry.register(Arc::new(exec::ExecTool));
    registry.register(Arc::new(notify::NotifyTool));
    registry.register(Arc::new(pacing::YieldTool));

    let spawn = Arc::new(spawn::SpawnAgentTool::new());
    registry.register(spawn.clone());

    let configure = Arc::new(configure::ConfigureAgentTool::new());
    registry.register(configure.clone());

    let list_agents = Arc::new(introspect::ListAgentsTool::new());
    registry.register(list_agents.clone());

    let list_tools = Arc::new(introspect::ListToolsTool::new(Arc::downgrade(registry)));
    registry.register(list_tools);

    Builtins {
        spawn,
        configure,
        list_agents,
    }
}
