//! Attempt distribution engine for the rvoip contact center.
//!
//! A dialer node pulls member attempts reserved for it from a shared store,
//! routes each one through its queue's strategy (preview, inbound or
//! progressive), dials through outbound resources and connects the member to
//! an agent. Several nodes share one store; the store is the only arbiter of
//! which node owns which attempt and which agent.

// Error handling
pub mod error;

// Configuration
pub mod config;

// Entity snapshots exchanged with the store and the bus
pub mod model;

pub mod cache;

// Persistence contract and implementations
pub mod store;

// Message bus
pub mod mq;

// Telephony control plane
pub mod call_manager;

pub mod agent;
pub mod resource;

// Queues, attempts and the dispatch loop
pub mod queue;

// Polling scheduler
pub mod dialing;

// Admission surfaces
pub mod api;

pub mod server;

// Public exports
pub use agent::{Agent, AgentManager, AgentManagerImpl};
pub use api::{AgentApi, MemberApi, QueueEvent};
pub use cache::ExpiringCache;
pub use call_manager::{Call, CallCommands, CallManager, CallState};
pub use config::DialerConfig;
pub use dialing::Dialing;
pub use error::{DialerError, Result};
pub use mq::{LocalBus, MessageBus};
pub use queue::{Attempt, QueueManager, QueueObject};
pub use resource::{Resource, ResourceManager};
pub use server::{DialerServer, DialerServerBuilder, init_logging};
pub use store::{MemoryStore, SqliteStore, Store};

/// Re-export of common types and functions
pub mod prelude {
    pub use super::{
        Agent, AgentApi, AgentManager, Attempt, Call, CallCommands, CallManager, DialerConfig,
        DialerError, DialerServer, DialerServerBuilder, LocalBus, MemberApi, MemoryStore,
        MessageBus, QueueEvent, QueueManager, ResourceManager, Result, SqliteStore, Store,
        init_logging,
    };
    pub use crate::model::{
        AgentSnapshot, AgentState, InboundCallInfo, MemberAttempt, MemberCommunication,
        MemberState, OutboundResourceConfig, QueueSettings, QueueType,
    };
}
