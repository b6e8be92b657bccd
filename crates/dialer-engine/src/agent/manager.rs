use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Agent;
use super::types::AgentBinding;
use crate::cache::ExpiringCache;
use crate::config::CacheConfig;
use crate::error::{DialerError, Result};
use crate::model::{AgentState, get_millis};
use crate::mq::{AgentChannelEvent, MessageBus};
use crate::store::Store;

/// Capabilities the distribution core uses to drive agents
///
/// Every mutating call is a versioned write: when the projection is stale
/// the call fails with `Stale`, the agent is evicted and the caller has to
/// re-fetch it with `get_agent`.
#[async_trait]
pub trait AgentManager: Send + Sync {
    async fn get_agent(&self, id: i64, updated_at: i64) -> Result<Arc<Agent>>;

    async fn set_online(&self, agent: &Agent) -> Result<()>;

    async fn set_offline(&self, agent: &Agent) -> Result<()>;

    async fn set_on_break(
        &self,
        agent: &Agent,
        payload: Option<String>,
        timeout_sec: Option<u32>,
    ) -> Result<()>;

    async fn set_agent_waiting(&self, agent: &Agent, bridged: bool) -> Result<()>;

    /// Returns the consecutive no-answer count of the agent
    async fn set_agent_offering(&self, agent: &Agent, queue_id: i64, attempt_id: i64)
    -> Result<u16>;

    async fn set_agent_talking(&self, agent: &Agent, attempt_id: i64) -> Result<()>;

    async fn set_agent_reporting(&self, agent: &Agent, timeout_sec: u32) -> Result<()>;

    async fn set_agent_fine(&self, agent: &Agent, timeout_sec: u32, no_answer: bool) -> Result<()>;

    async fn missed_attempt(&self, agent_id: i64, attempt_id: i64, cause: &str) -> Result<()>;
}

/// Agent manager backed by the shared store
pub struct AgentManagerImpl {
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    agents: ExpiringCache<i64, Arc<Agent>>,
    // outlive projections: evicting or reloading an agent keeps its binding
    bindings: DashMap<i64, AgentBinding>,
    lock: Mutex<()>,
}

impl AgentManagerImpl {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn MessageBus>, config: &CacheConfig) -> Self {
        Self {
            store,
            bus,
            agents: ExpiringCache::new("agent", config.max_agents, config.expire()),
            bindings: DashMap::new(),
            lock: Mutex::new(()),
        }
    }

    pub fn cached(&self) -> usize {
        self.agents.len()
    }

    async fn transition(&self, agent: &Agent, next: AgentState) -> Result<()> {
        let current = agent.state();
        if !current.can_transition_to(&next) {
            return Err(DialerError::InvalidTransition {
                agent_id: agent.id(),
                from: current.name().to_string(),
                to: next.name().to_string(),
            });
        }

        let updated_at = match self
            .store
            .agents()
            .set_agent_state(agent.id(), agent.updated_at(), &next)
            .await
        {
            Ok(updated_at) => updated_at,
            Err(e) => {
                if matches!(e, DialerError::Stale { .. }) {
                    self.agents.remove(&agent.id());
                }
                return Err(e);
            }
        };

        debug!(
            "AgentId={} {} -> {} (version {})",
            agent.id(),
            current.name(),
            next.name(),
            updated_at
        );
        let event = AgentChannelEvent {
            agent_id: agent.id(),
            user_id: agent.user_id(),
            domain_id: agent.domain_id(),
            channel: "call".to_string(),
            state: next.name().to_string(),
            attempt_id: match &next {
                AgentState::Offering { attempt_id, .. } => Some(*attempt_id),
                AgentState::Talking { attempt_id } => *attempt_id,
                _ => None,
            },
            queue_id: match &next {
                AgentState::Offering { queue_id, .. } => Some(*queue_id),
                _ => None,
            },
            timestamp: updated_at,
        };
        agent.apply_state(next, updated_at);

        if let Err(e) = self.bus.send_agent_channel_event(&event).await {
            warn!("AgentId={} channel event not sent: {}", agent.id(), e);
        }
        Ok(())
    }
}

fn deadline_after(timeout_sec: u32) -> i64 {
    get_millis() + timeout_sec as i64 * 1000
}

#[async_trait]
impl AgentManager for AgentManagerImpl {
    async fn get_agent(&self, id: i64, updated_at: i64) -> Result<Arc<Agent>> {
        let _guard = self.lock.lock().await;

        if let Some(agent) = self.agents.get(&id) {
            if !agent.is_expire(updated_at) {
                return Ok(agent);
            }
        }

        let snapshot = self.store.agents().get_agent(id).await?;
        let binding = self.bindings.entry(id).or_default().clone();
        let agent = Arc::new(Agent::with_binding(snapshot, binding));
        self.agents.insert(id, agent.clone());
        debug!("Load agent {} [{}] to cache", agent.name(), agent.id());
        Ok(agent)
    }

    async fn set_online(&self, agent: &Agent) -> Result<()> {
        self.transition(agent, AgentState::Online).await
    }

    async fn set_offline(&self, agent: &Agent) -> Result<()> {
        self.transition(agent, AgentState::Offline).await
    }

    async fn set_on_break(
        &self,
        agent: &Agent,
        payload: Option<String>,
        timeout_sec: Option<u32>,
    ) -> Result<()> {
        self.transition(
            agent,
            AgentState::OnBreak {
                payload,
                until: timeout_sec.map(deadline_after),
            },
        )
        .await
    }

    async fn set_agent_waiting(&self, agent: &Agent, bridged: bool) -> Result<()> {
        if bridged {
            debug!("AgentId={} back to waiting after bridge", agent.id());
        }
        self.transition(agent, AgentState::Waiting).await
    }

    async fn set_agent_offering(
        &self,
        agent: &Agent,
        queue_id: i64,
        attempt_id: i64,
    ) -> Result<u16> {
        self.transition(
            agent,
            AgentState::Offering {
                queue_id,
                attempt_id,
            },
        )
        .await?;
        Ok(agent.successively_no_answers())
    }

    async fn set_agent_talking(&self, agent: &Agent, attempt_id: i64) -> Result<()> {
        self.transition(
            agent,
            AgentState::Talking {
                attempt_id: Some(attempt_id),
            },
        )
        .await
    }

    async fn set_agent_reporting(&self, agent: &Agent, timeout_sec: u32) -> Result<()> {
        self.transition(
            agent,
            AgentState::Reporting {
                deadline: deadline_after(timeout_sec),
            },
        )
        .await
    }

    async fn set_agent_fine(&self, agent: &Agent, timeout_sec: u32, no_answer: bool) -> Result<()> {
        self.transition(
            agent,
            AgentState::Fine {
                deadline: deadline_after(timeout_sec),
                no_answer,
            },
        )
        .await
    }

    async fn missed_attempt(&self, agent_id: i64, attempt_id: i64, cause: &str) -> Result<()> {
        self.store
            .agents()
            .missed_attempt(agent_id, attempt_id, cause)
            .await
    }
}
