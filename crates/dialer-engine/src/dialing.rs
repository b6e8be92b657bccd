//! Polling scheduler
//!
//! One cycle pulls everything this node has to act on from the shared store
//! and hands it to the queue manager. Cycles never overlap.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::agent::AgentManager;
use crate::config::DialerConfig;
use crate::error::Result;
use crate::model::MEMBER_CAUSE_SYSTEM_SHUTDOWN;
use crate::mq::AgentChannelEvent;
use crate::queue::QueueManager;
use crate::store::Store;

pub struct Dialing {
    node_id: String,
    config: DialerConfig,
    store: Arc<dyn Store>,
    queue_manager: Arc<QueueManager>,
    agent_manager: Arc<dyn AgentManager>,
    cancel: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dialing {
    pub fn new(
        config: &DialerConfig,
        store: Arc<dyn Store>,
        queue_manager: Arc<QueueManager>,
        agent_manager: Arc<dyn AgentManager>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: config.general.node_id.clone(),
            config: config.clone(),
            store,
            queue_manager,
            agent_manager,
            cancel: Mutex::new(None),
            handle: Mutex::new(None),
        })
    }

    /// Run cycles every polling interval until `cancel` fires
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        *self.cancel.lock() = Some(cancel.clone());

        let dialing = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(dialing.config.dialing.polling_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                "Dialing started on node {} every {:?}",
                dialing.node_id,
                dialing.config.dialing.polling_interval()
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = dialing.tick().await {
                            error!("Dialing cycle failed: {}", e);
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(dialing.config.dialing.error_backoff()) => {}
                            }
                        }
                    }
                }
            }
            info!("Dialing stopped on node {}", dialing.node_id);
        });
        *self.handle.lock() = Some(handle);
    }

    /// One polling cycle
    ///
    /// Steps run in a fixed order; a failing optional step is logged and the
    /// cycle continues, a failing fetch of attempts or reservations ends it.
    pub async fn tick(&self) -> Result<()> {
        self.channel_timeouts().await;

        if self.queue_manager.is_accepting() {
            self.route_members().await?;
        }

        self.attempt_timeouts().await;
        self.save_history().await;
        self.route_agents().await
    }

    async fn channel_timeouts(&self) {
        let timeouts = match self.store.agents().get_channel_timeouts().await {
            Ok(timeouts) => timeouts,
            Err(e) => {
                error!("Get channel timeouts error: {}", e);
                return;
            }
        };

        for timeout in timeouts {
            let event = AgentChannelEvent {
                agent_id: timeout.agent_id,
                user_id: timeout.user_id,
                domain_id: timeout.domain_id,
                channel: timeout.channel,
                state: "waiting".to_string(),
                attempt_id: None,
                queue_id: None,
                timestamp: timeout.timestamp,
            };
            if let Err(e) = self
                .queue_manager
                .bus()
                .send_agent_channel_event(&event)
                .await
            {
                warn!("AgentId={} channel timeout event error: {}", event.agent_id, e);
            }
        }
    }

    async fn route_members(&self) -> Result<()> {
        let members = self.store.members();
        if self.queue_manager.has_capacity() {
            match members.reserve_members_by_node(&self.node_id).await {
                Ok(0) => {}
                Ok(count) => debug!("Node {} reserved {} members", self.node_id, count),
                Err(e) => error!("Reserve members error: {}", e),
            }
        }

        for member in members.get_active_members_attempt(&self.node_id).await? {
            let id = member.id;
            match self.queue_manager.route_member(member).await {
                Ok(_) => {}
                Err(e) if e.is_refused() => {
                    warn!("AttemptId={} returned to the store: {}", id, e);
                    let retry_sec = self.config.dialing.error_backoff().as_secs().max(1) as u32;
                    if let Err(e) = members
                        .set_distribute_cancel(id, &e.to_string(), retry_sec, false)
                        .await
                    {
                        error!("AttemptId={} cancel error: {}", id, e);
                    }
                }
                Err(e) => warn!("AttemptId={} not routed: {}", id, e),
            }
        }
        Ok(())
    }

    async fn attempt_timeouts(&self) {
        match self.store.members().get_timeouts(&self.node_id).await {
            Ok(timeouts) => {
                for timeout in timeouts {
                    self.queue_manager.apply_attempt_timeout(timeout).await;
                }
            }
            Err(e) => error!("Get attempt timeouts error: {}", e),
        }
    }

    async fn save_history(&self) {
        match self.store.members().save_to_history().await {
            Ok(saved) => {
                for attempt in saved {
                    debug!("AttemptId={} moved to history: {}", attempt.id, attempt.result);
                }
            }
            Err(e) => error!("Save history error: {}", e),
        }
    }

    async fn route_agents(&self) -> Result<()> {
        let reservations = self
            .store
            .agents()
            .reserved_for_attempt_by_node(&self.node_id)
            .await?;

        for reservation in reservations {
            let agent = match self
                .agent_manager
                .get_agent(reservation.agent_id, reservation.agent_updated_at)
                .await
            {
                Ok(agent) => agent,
                Err(e) => {
                    error!("AgentId={} load error: {}", reservation.agent_id, e);
                    continue;
                }
            };

            if let Err(e) = self
                .queue_manager
                .route_agent_to_attempt(reservation.attempt_id, agent)
                .await
            {
                warn!(
                    "AgentId={} not routed to AttemptId={}: {}",
                    reservation.agent_id, reservation.attempt_id, e
                );
            }
        }
        Ok(())
    }

    /// Drain the queue manager, stop polling and release what is still
    /// reserved for this node
    pub async fn stop(&self) {
        self.queue_manager.stop().await;

        let cancel = self.cancel.lock().take();
        if let Some(cancel) = cancel {
            cancel.cancel();
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Dialing loop ended abnormally: {}", e);
            }
        }

        match self
            .store
            .members()
            .un_reserve_members_by_node(&self.node_id, MEMBER_CAUSE_SYSTEM_SHUTDOWN)
            .await
        {
            Ok(count) => info!("Node {} released {} reserved members", self.node_id, count),
            Err(e) => error!("Un-reserve members error: {}", e),
        }
    }
}
