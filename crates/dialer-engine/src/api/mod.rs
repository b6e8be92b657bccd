//! Entry points for the outer surfaces (RPC handlers, agent desktops)
//!
//! - [`MemberApi`]: put callers into queues, direct members to agents,
//!   report attempt results
//! - [`AgentApi`]: agent presence

pub mod agent;
pub mod member;

pub use agent::AgentApi;
pub use member::{MemberApi, QueueEvent};
