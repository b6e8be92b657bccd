use std::sync::Arc;

use async_trait::async_trait;
use tracing::error;

use super::{Attempt, CallingQueue, QueueObject};
use crate::agent::Agent;
use crate::model::{CallEvent, MemberState, QueueSettings};

/// The member is an inbound call already parked on this node
#[derive(Clone)]
pub struct InboundQueue {
    base: Arc<CallingQueue>,
}

impl InboundQueue {
    pub fn new(base: Arc<CallingQueue>) -> Self {
        Self { base }
    }
}

#[async_trait]
impl QueueObject for InboundQueue {
    fn settings(&self) -> &QueueSettings {
        self.base.settings()
    }

    async fn join_attempt(&self, attempt: Arc<Attempt>) {
        let Ok(manager) = self.base.manager() else {
            return;
        };

        let Some(call) = attempt
            .member_call_id()
            .and_then(|id| manager.call_manager().get_call(&id))
        else {
            attempt.log("member call not found");
            self.base.abandon(&manager, &attempt).await;
            manager.leaving_member(&attempt, self.settings()).await;
            return;
        };

        if let Err(e) = manager
            .store()
            .members()
            .set_attempt_find_agent(attempt.id())
            .await
        {
            error!("AttemptId={} set find agent error: {}", attempt.id(), e);
        }
        attempt.set_state(MemberState::WaitAgent);

        let base = self.base.clone();
        tokio::spawn(async move {
            base.watch_member_call(&manager, &attempt, &call).await;
        });
    }

    async fn route_agent_to_attempt(&self, attempt: Arc<Attempt>, agent: Arc<Agent>) {
        let Ok(manager) = self.base.manager() else {
            return;
        };

        let Some(call) = attempt
            .member_call_id()
            .and_then(|id| manager.call_manager().get_call(&id))
        else {
            attempt.clear_agent();
            return;
        };

        let queue = self.clone();
        tokio::spawn(async move {
            if let Some(event) = queue
                .base
                .offer_agent_leg(&manager, &attempt, &agent, &call)
                .await
            {
                queue.set_hangup_call(attempt, event).await;
            }
        });
    }

    async fn set_hangup_call(&self, attempt: Arc<Attempt>, event: CallEvent) {
        let Ok(manager) = self.base.manager() else {
            return;
        };
        self.base.hangup_call(&manager, &attempt, &event).await;
    }
}
