//! Persistence contract
//!
//! The shared store is the only cross-node arbiter: it reserves members and
//! agents for a node and applies every attempt transition atomically. The
//! engine only caches what it reads from here.
//!
//! Two implementations ship with the crate: [`memory::MemoryStore`] keeps the
//! tables in process and is what the tests run against, [`sqlite::SqliteStore`]
//! keeps them in SQLite through `sqlx`.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{
    AgentReservation, AgentSnapshot, AgentState, AttemptLeaving, AttemptReportResult,
    AttemptReported, AttemptTimeout, ChannelTimeout, HistoryAttempt, InboundCallInfo,
    MemberAttempt, MemberState, MissedAgent, OutboundResourceConfig, QueueSettings,
    RenewalProcessing, ResourceErrorResult, ResourceStrategy,
};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Attempt and member operations
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// Reserve eligible members for this node, returns how many attempts were created
    async fn reserve_members_by_node(&self, node_id: &str) -> Result<u64>;

    /// Release attempts of this node that were reserved but never started
    async fn un_reserve_members_by_node(&self, node_id: &str, cause: &str) -> Result<u64>;

    /// Attempts reserved for this node that were not handed out yet
    async fn get_active_members_attempt(&self, node_id: &str) -> Result<Vec<MemberAttempt>>;

    async fn set_attempt_state(&self, attempt_id: i64, state: MemberState) -> Result<()>;

    async fn set_attempt_find_agent(&self, attempt_id: i64) -> Result<()>;

    async fn answer_and_find_agent(&self, attempt_id: i64) -> Result<()>;

    async fn set_attempt_offering(
        &self,
        attempt_id: i64,
        agent_id: Option<i64>,
        agent_call_id: Option<&str>,
        member_call_id: Option<&str>,
        destination: Option<&str>,
        display: Option<&str>,
    ) -> Result<i64>;

    async fn set_attempt_bridged(&self, attempt_id: i64) -> Result<i64>;

    async fn set_attempt_abandoned(
        &self,
        attempt_id: i64,
        max_attempts: u32,
        wait_between_sec: u64,
        variables: Option<&HashMap<String, String>>,
    ) -> Result<AttemptLeaving>;

    async fn set_attempt_missed_agent(&self, attempt_id: i64, agent_hold_sec: u32)
    -> Result<MissedAgent>;

    /// Move the attempt to processing with a deadline, returns the timestamp
    async fn set_attempt_reporting(&self, attempt_id: i64, deadline_sec: u32) -> Result<i64>;

    async fn set_attempt_result(
        &self,
        attempt_id: i64,
        result: &str,
        agent_hold_sec: u32,
        variables: Option<&HashMap<String, String>>,
        max_attempts: u32,
        wait_between_sec: u64,
    ) -> Result<MissedAgent>;

    async fn set_barred(&self, attempt_id: i64) -> Result<()>;

    async fn set_distribute_cancel(
        &self,
        attempt_id: i64,
        description: &str,
        next_distribute_sec: u32,
        stop: bool,
    ) -> Result<()>;

    /// Create an attempt for a parked inbound call
    async fn distribute_call_to_queue(
        &self,
        node_id: &str,
        call: &InboundCallInfo,
    ) -> Result<MemberAttempt>;

    /// Create an attempt for a member with a given agent already reserved
    async fn distribute_direct(
        &self,
        node_id: &str,
        member_id: i64,
        communication_id: i64,
        agent_id: i64,
    ) -> Result<MemberAttempt>;

    async fn get_timeouts(&self, node_id: &str) -> Result<Vec<AttemptTimeout>>;

    /// Move terminal attempts to history, rows locked elsewhere are skipped
    async fn save_to_history(&self) -> Result<Vec<HistoryAttempt>>;

    async fn renewal_processing(
        &self,
        domain_id: i64,
        attempt_id: i64,
        renewal_sec: u32,
    ) -> Result<RenewalProcessing>;

    async fn report_attempt_result(
        &self,
        attempt_id: i64,
        result: &AttemptReportResult,
    ) -> Result<AttemptReported>;
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn get_queue(&self, queue_id: i64) -> Result<QueueSettings>;
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_resource(&self, resource_id: i64) -> Result<OutboundResourceConfig>;

    /// Record a dialing error and return the circuit breaker verdict
    async fn set_error(
        &self,
        resource_id: i64,
        routing_id: Option<i64>,
        error_id: &str,
        strategy: ResourceStrategy,
    ) -> Result<ResourceErrorResult>;

    async fn set_successively_errors(&self, resource_id: i64, count: u16) -> Result<()>;
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get_agent(&self, agent_id: i64) -> Result<AgentSnapshot>;

    /// Versioned write, fails with `Stale` when `expected_updated_at` is old
    async fn set_agent_state(
        &self,
        agent_id: i64,
        expected_updated_at: i64,
        state: &AgentState,
    ) -> Result<i64>;

    async fn get_channel_timeouts(&self) -> Result<Vec<ChannelTimeout>>;

    async fn reserved_for_attempt_by_node(&self, node_id: &str) -> Result<Vec<AgentReservation>>;

    async fn missed_attempt(&self, agent_id: i64, attempt_id: i64, cause: &str) -> Result<()>;
}

/// The whole persistence tier
#[async_trait]
pub trait Store: Send + Sync {
    fn members(&self) -> &dyn MemberStore;
    fn queues(&self) -> &dyn QueueStore;
    fn resources(&self) -> &dyn ResourceStore;
    fn agents(&self) -> &dyn AgentStore;

    /// Reachability check used at startup
    async fn ping(&self) -> Result<()>;
}
