use std::sync::Arc;

use tracing::info;

use crate::agent::AgentManager;
use crate::error::Result;

/// Agent presence
#[derive(Clone)]
pub struct AgentApi {
    agents: Arc<dyn AgentManager>,
}

impl AgentApi {
    pub fn new(agents: Arc<dyn AgentManager>) -> Self {
        Self { agents }
    }

    pub async fn login(&self, agent_id: i64) -> Result<()> {
        let agent = self.agents.get_agent(agent_id, 0).await?;
        self.agents.set_online(&agent).await?;
        info!("AgentId={} logged in", agent_id);
        Ok(())
    }

    pub async fn logout(&self, agent_id: i64) -> Result<()> {
        let agent = self.agents.get_agent(agent_id, 0).await?;
        self.agents.set_offline(&agent).await?;
        info!("AgentId={} logged out", agent_id);
        Ok(())
    }

    pub async fn pause(
        &self,
        agent_id: i64,
        payload: Option<String>,
        timeout_sec: Option<u32>,
    ) -> Result<()> {
        let agent = self.agents.get_agent(agent_id, 0).await?;
        self.agents.set_on_break(&agent, payload, timeout_sec).await?;
        info!("AgentId={} paused", agent_id);
        Ok(())
    }
}
