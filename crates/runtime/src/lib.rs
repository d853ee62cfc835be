//! The corral runtime: agent lifecycle, turns, autonomy, sensors.
//!
//! [`AgentManager`] is the facade. It owns the stores, the tool registry,
//! and a handle per running agent; handles own their autonomy loop,
//! sensors, hot state, and heartbeat. Sub-agent runs live in the persisted
//! [`SubagentRegistry`].

pub mod autonomy;
pub mod heartbeat;
pub mod hot_state;
pub mod manager;
pub mod sensors;
pub mod subagents;
pub mod turn;
pub mod workspace;

#[cfg(test)]
pub(crate) mod testing;

pub use autonomy::AutonomyLoop;
pub use heartbeat::HeartbeatRunner;
pub use hot_state::{HotState, Notification};
pub use manager::{AgentHandle, AgentManager};
pub use sensors::Sensor;
pub use subagents::{SubagentRegistry, SubagentRun};
pub use turn::{run_agent_turn, TurnOutcome, TurnRunner, TurnSetup};
pub use workspace::AgentWorkspace;
