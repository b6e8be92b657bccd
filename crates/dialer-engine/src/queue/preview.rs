use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use super::{Attempt, CallingQueue, QueueObject};
use crate::agent::Agent;
use crate::call_manager::CallState;
use crate::model::{
    CALL_CAUSE_NO_ANSWER, CallEvent, CallRequest, MEMBER_CAUSE_ENDPOINT_NOT_FOUND,
    MEMBER_CAUSE_RESOURCE_NOT_FOUND, MemberState, QUEUE_SIDE_AGENT, QUEUE_SIDE_FIELD,
    QUEUE_SIDE_MEMBER, QueueSettings,
};

/// Agent-first dialing: the agent leg is answered, then the member is
/// dialed through the attempt resource and bridged in
#[derive(Clone)]
pub struct PreviewQueue {
    base: Arc<CallingQueue>,
}

impl PreviewQueue {
    pub fn new(base: Arc<CallingQueue>) -> Self {
        Self { base }
    }

    async fn make_call_to_agent(&self, attempt: Arc<Attempt>, agent: Arc<Agent>) {
        let base = &self.base;
        let Ok(manager) = base.manager() else {
            return;
        };

        let Some(resource) = attempt.resource() else {
            attempt.clear_agent();
            base.fail(&manager, &attempt, MEMBER_CAUSE_RESOURCE_NOT_FOUND).await;
            return;
        };

        let member_endpoint = match base.member_endpoint(&manager, &attempt, &resource) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                attempt.log(format!("endpoint error: {}", e));
                attempt.clear_agent();
                base.fail(&manager, &attempt, MEMBER_CAUSE_ENDPOINT_NOT_FOUND).await;
                return;
            }
        };

        // held until the conversation ends
        let Some(_permit) = resource.take() else {
            attempt.clear_agent();
            base.cancel(&manager, &attempt, "resource limit", 1).await;
            manager.leaving_member(&attempt, base.settings()).await;
            return;
        };

        let agents = manager.agent_manager();
        let members = manager.store().members();

        if let Err(e) = agents
            .set_agent_offering(&agent, base.id(), attempt.id())
            .await
        {
            warn!("AgentId={} offering to AttemptId={} error: {}", agent.id(), attempt.id(), e);
            attempt.clear_agent();
            if let Err(e) = members.set_attempt_find_agent(attempt.id()).await {
                error!("AttemptId={} set find agent error: {}", attempt.id(), e);
            }
            return;
        }

        let display = resource.get_display();
        attempt.set_state(MemberState::Active);
        if let Err(e) = members
            .set_attempt_offering(
                attempt.id(),
                Some(agent.id()),
                None,
                None,
                Some(&member_endpoint),
                display.as_deref(),
            )
            .await
        {
            error!("AttemptId={} set offering error: {}", attempt.id(), e);
        }

        let mut request = CallRequest {
            endpoints: agent.call_endpoints(),
            caller_name: attempt.name(),
            caller_number: attempt.destination(),
            timeout: base.settings().timeout,
            variables: base.call_variables(&manager, &attempt, Some(&resource), QUEUE_SIDE_AGENT),
            applications: Vec::new(),
        };
        base.set_record_call(
            &mut request,
            &manager.config().telephony.record_template,
            attempt.id(),
        );
        request.add_application("answer", "");
        request.add_application(
            "bridge",
            format!(
                "{{{}={},origination_caller_id_number={}}}{}",
                QUEUE_SIDE_FIELD,
                QUEUE_SIDE_MEMBER,
                display.unwrap_or_default(),
                member_endpoint
            ),
        );

        let call = match base
            .new_call_to_member(&manager, request, &attempt, Some(&resource))
            .await
        {
            Ok(call) => call,
            Err(e) => {
                let cause = e.hangup_cause().unwrap_or(CALL_CAUSE_NO_ANSWER).to_string();
                base.fail(&manager, &attempt, &cause).await;
                let hold = manager.config().agents.call_error_hold_sec;
                if let Err(e) = agents
                    .set_agent_fine(&agent, hold, cause == CALL_CAUSE_NO_ANSWER)
                    .await
                {
                    warn!("AgentId={} set fine error: {}", agent.id(), e);
                }
                return;
            }
        };

        attempt.set_member_call_id(call.id());
        attempt.set_agent_call_id(call.id());
        if let Err(e) = agents.set_agent_talking(&agent, attempt.id()).await {
            warn!("AgentId={} set talking error: {}", agent.id(), e);
        }

        if call.wait_for_bridge().await == CallState::Bridge {
            if let Err(e) = members.set_attempt_bridged(attempt.id()).await {
                error!("AttemptId={} set bridged error: {}", attempt.id(), e);
            }
            attempt.set_state(MemberState::Bridged);
            debug!("AttemptId={} preview call {} bridged", attempt.id(), call.id());
        }

        call.wait_for_hangup().await;
        let event = call
            .last_event()
            .unwrap_or_else(|| CallEvent::hangup(call.id(), ""));
        self.set_hangup_call(attempt, event).await;
    }
}

#[async_trait]
impl QueueObject for PreviewQueue {
    fn settings(&self) -> &QueueSettings {
        self.base.settings()
    }

    async fn join_attempt(&self, attempt: Arc<Attempt>) {
        let Ok(manager) = self.base.manager() else {
            return;
        };

        match manager
            .store()
            .members()
            .set_attempt_find_agent(attempt.id())
            .await
        {
            Ok(()) => {
                attempt.set_state(MemberState::WaitAgent);
            }
            Err(e) => {
                error!("AttemptId={} set find agent error: {}", attempt.id(), e);
                self.base.abandon(&manager, &attempt).await;
                manager.leaving_member(&attempt, self.settings()).await;
            }
        }
    }

    async fn route_agent_to_attempt(&self, attempt: Arc<Attempt>, agent: Arc<Agent>) {
        let queue = self.clone();
        tokio::spawn(async move { queue.make_call_to_agent(attempt, agent).await });
    }

    async fn set_hangup_call(&self, attempt: Arc<Attempt>, event: CallEvent) {
        let Ok(manager) = self.base.manager() else {
            return;
        };
        self.base.hangup_call(&manager, &attempt, &event).await;
    }
}
