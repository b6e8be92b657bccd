use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{Attempt, CallingQueue, QueueObject};
use crate::agent::Agent;
use crate::call_manager::Call;
use crate::model::{
    CALL_CAUSE_NETWORK_ERROR, CallEvent, CallRequest, MEMBER_CAUSE_ENDPOINT_NOT_FOUND,
    MEMBER_CAUSE_RESOURCE_NOT_FOUND, MemberState, QUEUE_SIDE_MEMBER, QueueSettings,
};
use crate::resource::ResourcePermit;

enum DialFailure {
    /// No free slot on the resource, the member is offered again later
    Busy(String),
    Failed(String),
}

/// Member-first dialing: the member leg is originated and parked, then an
/// agent is looked for
#[derive(Clone)]
pub struct ProgressiveQueue {
    base: Arc<CallingQueue>,
}

impl ProgressiveQueue {
    pub fn new(base: Arc<CallingQueue>) -> Self {
        Self { base }
    }

    /// Originate the member leg, moving to another resource when the
    /// current one opens its circuit on the failure
    async fn originate_member(
        &self,
        attempt: &Attempt,
    ) -> Result<(Arc<Call>, ResourcePermit), DialFailure> {
        let base = &self.base;
        let manager = base
            .manager()
            .map_err(|e| DialFailure::Failed(e.to_string()))?;
        let settings = base.settings();
        let retries = settings.resource_ids.len().max(1);

        for _ in 0..retries {
            let Some(resource) = attempt.resource() else {
                return Err(DialFailure::Failed(MEMBER_CAUSE_RESOURCE_NOT_FOUND.to_string()));
            };
            let Some(permit) = resource.take() else {
                return Err(DialFailure::Busy(format!("resource {} limit", resource.id())));
            };
            let endpoint = base
                .member_endpoint(&manager, attempt, &resource)
                .map_err(|_| DialFailure::Failed(MEMBER_CAUSE_ENDPOINT_NOT_FOUND.to_string()))?;
            let display = resource.get_display();

            attempt.set_state(MemberState::Active);
            if let Err(e) = manager
                .store()
                .members()
                .set_attempt_offering(attempt.id(), None, None, None, Some(&endpoint), display.as_deref())
                .await
            {
                error!("AttemptId={} set offering error: {}", attempt.id(), e);
            }

            let mut request = CallRequest {
                endpoints: vec![endpoint],
                caller_name: display.clone().unwrap_or_default(),
                caller_number: display.unwrap_or_default(),
                timeout: settings.timeout,
                variables: base.call_variables(&manager, attempt, Some(&resource), QUEUE_SIDE_MEMBER),
                applications: Vec::new(),
            };
            base.set_record_call(
                &mut request,
                &manager.config().telephony.record_template,
                attempt.id(),
            );
            request.add_application("park", "");

            let cause = match base
                .new_call_to_member(&manager, request, attempt, Some(&resource))
                .await
            {
                Ok(call) => return Ok((call, permit)),
                Err(e) => e
                    .hangup_cause()
                    .unwrap_or(CALL_CAUSE_NETWORK_ERROR)
                    .to_string(),
            };
            drop(permit);

            let resources = manager.resource_manager();
            if resources.get(resource.id(), 0).await.is_ok() {
                return Err(DialFailure::Failed(cause));
            }
            let Some(next) = resources
                .select(&settings.resource_ids, settings.resource_strategy, Some(resource.id()))
                .await
            else {
                return Err(DialFailure::Failed(cause));
            };

            info!(
                "AttemptId={} resource {} stopped, retry through {}",
                attempt.id(),
                resource.id(),
                next.id()
            );
            attempt.log(format!("retry through resource {}", next.id()));
            attempt.set_resource(Some(next));
        }

        Err(DialFailure::Failed(CALL_CAUSE_NETWORK_ERROR.to_string()))
    }

    async fn dial_member(&self, attempt: Arc<Attempt>) {
        let base = &self.base;
        let Ok(manager) = base.manager() else {
            return;
        };

        let (call, _permit) = match self.originate_member(&attempt).await {
            Ok(dialed) => dialed,
            Err(DialFailure::Busy(description)) => {
                base.cancel(&manager, &attempt, &description, 1).await;
                manager.leaving_member(&attempt, base.settings()).await;
                return;
            }
            Err(DialFailure::Failed(cause)) => {
                base.fail(&manager, &attempt, &cause).await;
                return;
            }
        };

        attempt.set_member_call_id(call.id());
        if let Err(e) = manager
            .store()
            .members()
            .answer_and_find_agent(attempt.id())
            .await
        {
            error!("AttemptId={} answer and find agent error: {}", attempt.id(), e);
        }
        attempt.set_state(MemberState::WaitAgent);
        debug!("AttemptId={} member call {} parked", attempt.id(), call.id());

        base.watch_member_call(&manager, &attempt, &call).await;
    }
}

#[async_trait]
impl QueueObject for ProgressiveQueue {
    fn settings(&self) -> &QueueSettings {
        self.base.settings()
    }

    async fn join_attempt(&self, attempt: Arc<Attempt>) {
        let queue = self.clone();
        tokio::spawn(async move { queue.dial_member(attempt).await });
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
