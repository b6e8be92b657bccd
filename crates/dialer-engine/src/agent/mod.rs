//! Agents: the live projection and the manager that drives its state machine

pub mod manager;
pub mod types;

pub use manager::{AgentManager, AgentManagerImpl};
pub use types::Agent;
