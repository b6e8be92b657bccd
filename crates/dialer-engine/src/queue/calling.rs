use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tracing::{debug, error, warn};

use super::{Attempt, QueueManager};
use crate::agent::Agent;
use crate::call_manager::{Call, CallState};
use crate::error::{DialerError, Result};
use crate::model::{
    CALL_CAUSE_NETWORK_ERROR, CALL_CAUSE_NO_ANSWER, CALL_DIRECTION_DIALER,
    CALL_DIRECTION_VARIABLE, CALL_DOMAIN_VARIABLE, CALL_HANGUP_CAUSE_VARIABLE,
    CALL_IGNORE_EARLY_MEDIA_VARIABLE, CALL_TIMEOUT_VARIABLE, CallEvent, CallRequest,
    MEMBER_CAUSE_ABANDONED, MEMBER_CAUSE_CANCEL, MEMBER_CAUSE_SUCCESSFUL, MemberState,
    QUEUE_AGENT_ID_FIELD, QUEUE_ATTEMPT_ID_FIELD, QUEUE_ID_FIELD, QUEUE_MEMBER_ID_FIELD,
    QUEUE_NAME_FIELD, QUEUE_NODE_ID_FIELD, QUEUE_RESOURCE_ID_FIELD, QUEUE_ROUTING_ID_FIELD,
    QUEUE_SIDE_AGENT, QUEUE_SIDE_FIELD, QUEUE_TYPE_NAME_FIELD, QueueSettings,
    union_string_maps,
};
use crate::resource::{DEFAULT_ENDPOINT_PATTERN, Resource};

/// Call handling shared by every queue variant
pub struct CallingQueue {
    settings: QueueSettings,
    manager: Weak<QueueManager>,
}

impl CallingQueue {
    pub fn new(manager: Weak<QueueManager>, settings: QueueSettings) -> Self {
        Self { settings, manager }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn id(&self) -> i64 {
        self.settings.id
    }

    pub(crate) fn manager(&self) -> Result<Arc<QueueManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| DialerError::shutdown("queue manager dropped"))
    }

    /// Agent cool-down after a missed offer
    pub(crate) fn agent_hold_sec(&self, manager: &QueueManager) -> u32 {
        match self.settings.no_answer_hold_sec {
            0 => manager.config().agents.no_answer_hold_sec,
            sec => sec,
        }
    }

    /// Variables of a leg: resource < queue < attempt < call control
    pub fn call_variables(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        resource: Option<&Resource>,
        side: &str,
    ) -> HashMap<String, String> {
        let resource_variables = resource.map(Resource::variables).unwrap_or_default();
        let attempt_variables = attempt.variables();

        let mut control = HashMap::from([
            (CALL_TIMEOUT_VARIABLE.to_string(), self.settings.timeout.to_string()),
            (CALL_IGNORE_EARLY_MEDIA_VARIABLE.to_string(), "true".to_string()),
            ("ignore_display_updates".to_string(), "true".to_string()),
            (CALL_DIRECTION_VARIABLE.to_string(), CALL_DIRECTION_DIALER.to_string()),
            (CALL_DOMAIN_VARIABLE.to_string(), self.settings.domain_id.to_string()),
            (QUEUE_NODE_ID_FIELD.to_string(), manager.node_id().to_string()),
            (QUEUE_ID_FIELD.to_string(), self.settings.id.to_string()),
            (QUEUE_NAME_FIELD.to_string(), self.settings.name.clone()),
            (
                QUEUE_TYPE_NAME_FIELD.to_string(),
                self.settings.queue_type.as_str().to_string(),
            ),
            (QUEUE_SIDE_FIELD.to_string(), side.to_string()),
            (QUEUE_ATTEMPT_ID_FIELD.to_string(), attempt.id().to_string()),
        ]);
        if let Some(member_id) = attempt.member_id() {
            control.insert(QUEUE_MEMBER_ID_FIELD.to_string(), member_id.to_string());
        }
        if let Some(resource) = resource {
            control.insert(QUEUE_RESOURCE_ID_FIELD.to_string(), resource.id().to_string());
        }
        if let Some(routing_id) = attempt.routing_id() {
            control.insert(QUEUE_ROUTING_ID_FIELD.to_string(), routing_id.to_string());
        }
        if let Some(agent) = attempt.agent() {
            control.insert(QUEUE_AGENT_ID_FIELD.to_string(), agent.id().to_string());
        }

        union_string_maps(&[
            &resource_variables,
            &self.settings.variables,
            &attempt_variables,
            &control,
        ])
    }

    pub fn set_record_call(&self, request: &mut CallRequest, template: &str, attempt_id: i64) {
        if self.settings.record {
            request.add_application(
                "record_session",
                template.replace("{id}", &attempt_id.to_string()),
            );
        }
    }

    /// Dialable member endpoint through `resource`
    pub(crate) fn member_endpoint(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        resource: &Resource,
    ) -> Result<String> {
        let pattern = attempt
            .communication_pattern()
            .unwrap_or_else(|| DEFAULT_ENDPOINT_PATTERN.to_string());
        let endpoint = manager.resource_manager().get_endpoint(&pattern)?;
        let destination = attempt.destination();
        Ok(endpoint.parse(&resource.dial_string(&destination), &destination))
    }

    /// Originate a leg through `resource` and feed its circuit breaker
    pub(crate) async fn new_call_to_member(
        &self,
        manager: &QueueManager,
        request: CallRequest,
        attempt: &Attempt,
        resource: Option<&Resource>,
    ) -> Result<Arc<Call>> {
        let cause = match manager.call_manager().new_call(request).await {
            Ok(call) if !call.is_hangup() => {
                if let Some(resource) = resource {
                    manager.set_resource_successful(resource).await;
                }
                return Ok(call);
            }
            Ok(call) => call
                .hangup_cause()
                .unwrap_or_else(|| CALL_CAUSE_NETWORK_ERROR.to_string()),
            Err(e) => {
                attempt.log(format!("new call error: {}", e));
                e.hangup_cause()
                    .unwrap_or(CALL_CAUSE_NETWORK_ERROR)
                    .to_string()
            }
        };

        attempt.log(format!("call failed: {}", cause));
        if let Some(resource) = resource {
            manager
                .set_resource_error(resource, attempt.routing_id(), &cause)
                .await;
        }
        Err(DialerError::call_failed(cause))
    }

    /// Persist a result and close the attempt
    pub(crate) async fn stop_attempt(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        result: &str,
    ) -> bool {
        if attempt.is_terminal() {
            attempt.log(format!("stop {} ignored: attempt closed", result));
            return false;
        }

        let variables = attempt.variables();
        match manager
            .store()
            .members()
            .set_attempt_result(
                attempt.id(),
                result,
                self.agent_hold_sec(manager),
                Some(&variables),
                self.settings.max_attempts,
                self.settings.wait_between_retries,
            )
            .await
        {
            Ok(res) => {
                if let Some(stop) = res.member_stop_cause {
                    attempt.log(format!("member stopped: {}", stop));
                }
            }
            Err(e) => error!("AttemptId={} set result error: {}", attempt.id(), e),
        }
        attempt.set_result(result)
    }

    pub(crate) async fn abandon(&self, manager: &QueueManager, attempt: &Attempt) -> bool {
        if attempt.is_terminal() {
            return false;
        }

        match manager
            .store()
            .members()
            .set_attempt_abandoned(
                attempt.id(),
                self.settings.max_attempts,
                self.settings.wait_between_retries,
                None,
            )
            .await
        {
            Ok(res) => {
                if let Some(stop) = res.member_stop_cause {
                    attempt.log(format!("member stopped: {}", stop));
                }
            }
            Err(e) => error!("AttemptId={} set abandoned error: {}", attempt.id(), e),
        }
        attempt.set_result(MEMBER_CAUSE_ABANDONED)
    }

    /// Close without counting against the member, it is offered again later
    pub(crate) async fn cancel(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        description: &str,
        next_distribute_sec: u32,
    ) -> bool {
        if attempt.is_terminal() {
            return false;
        }

        if let Err(e) = manager
            .store()
            .members()
            .set_distribute_cancel(attempt.id(), description, next_distribute_sec, false)
            .await
        {
            error!("AttemptId={} cancel error: {}", attempt.id(), e);
        }
        attempt.log(format!("cancel: {}", description));
        attempt.set_result(MEMBER_CAUSE_CANCEL)
    }

    /// Stop with `result` and release the attempt from the queue
    pub(crate) async fn fail(&self, manager: &QueueManager, attempt: &Attempt, result: &str) {
        self.stop_attempt(manager, attempt, result).await;
        manager.leaving_member(attempt, &self.settings).await;
    }

    /// Telephony leg of a connected attempt ended
    ///
    /// Ignored once the attempt is in wrap-up or closed.
    pub(crate) async fn hangup_call(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        event: &CallEvent,
    ) {
        if attempt.is_terminal() || attempt.state() >= MemberState::Processing {
            attempt.log("hangup ignored");
            return;
        }

        // TODO: map telephony hangup causes to member results; an absent cause is recorded as success
        let result = event
            .get_variable(CALL_HANGUP_CAUSE_VARIABLE)
            .filter(|cause| !cause.is_empty())
            .unwrap_or(MEMBER_CAUSE_SUCCESSFUL)
            .to_string();

        self.finish_call(manager, attempt, &result).await;
    }

    /// Wrap-up after a connected call: processing window or leave
    pub(crate) async fn finish_call(&self, manager: &QueueManager, attempt: &Attempt, result: &str) {
        let agent = attempt.agent();

        if self.settings.processing {
            if let Some(agent) = &agent {
                match manager
                    .store()
                    .members()
                    .set_attempt_reporting(attempt.id(), self.settings.processing_sec)
                    .await
                {
                    Ok(_) => {
                        attempt.set_state(MemberState::Processing);
                        if let Err(e) = manager
                            .agent_manager()
                            .set_agent_reporting(agent, self.settings.processing_sec)
                            .await
                        {
                            warn!("AgentId={} set reporting error: {}", agent.id(), e);
                        }
                        return;
                    }
                    Err(e) => error!("AttemptId={} set processing error: {}", attempt.id(), e),
                }
            }
        }

        self.stop_attempt(manager, attempt, result).await;
        manager.leaving_member(attempt, &self.settings).await;

        if let Some(agent) = agent {
            let timeout = manager.config().agents.reporting_timeout_sec;
            if let Err(e) = manager
                .agent_manager()
                .set_agent_reporting(&agent, timeout)
                .await
            {
                warn!("AgentId={} set reporting error: {}", agent.id(), e);
            }
        }
    }

    /// The agent did not take the offer
    ///
    /// The attempt goes back to `wait_agent` while the member is still on
    /// the line and the retry budget allows it, otherwise it is abandoned.
    pub(crate) async fn missed_agent(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        agent: &Agent,
        cause: &str,
        member_call: Option<&Call>,
    ) {
        let hold = self.agent_hold_sec(manager);
        let agents = manager.agent_manager();
        if let Err(e) = agents.set_agent_fine(agent, hold, true).await {
            warn!("AgentId={} set fine error: {}", agent.id(), e);
        }
        if let Err(e) = agents.missed_attempt(agent.id(), attempt.id(), cause).await {
            warn!("AgentId={} missed attempt error: {}", agent.id(), e);
        }
        attempt.clear_agent();

        if attempt.is_terminal() {
            return;
        }

        let no_answers = attempt.increment_no_answers();
        let member_up = member_call.map(|call| !call.is_hangup()).unwrap_or(true);
        let exhausted = self.settings.max_attempts > 0 && no_answers >= self.settings.max_attempts;
        attempt.log(format!(
            "agent {} missed ({}), no answers {}",
            agent.id(),
            cause,
            no_answers
        ));

        if member_up && !exhausted {
            match manager
                .store()
                .members()
                .set_attempt_missed_agent(attempt.id(), hold)
                .await
            {
                Ok(_) => {
                    attempt.set_state(MemberState::WaitAgent);
                    return;
                }
                Err(e) => error!("AttemptId={} set missed agent error: {}", attempt.id(), e),
            }
        }

        self.abandon(manager, attempt).await;
        if let Some(call) = member_call.filter(|call| !call.is_hangup()) {
            if let Err(e) = manager
                .call_manager()
                .hangup(call, CALL_CAUSE_NO_ANSWER)
                .await
            {
                warn!("[{}] call {} hangup error: {}", call.app_id(), call.id(), e);
            }
        }
        manager.leaving_member(attempt, &self.settings).await;
    }

    /// Abandon the attempt if the member leg ends before it is bridged
    pub(crate) async fn watch_member_call(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        member_call: &Call,
    ) {
        member_call.wait_for_hangup().await;
        if attempt.is_terminal() || attempt.state() >= MemberState::Bridged {
            return;
        }

        attempt.log(format!(
            "member hangup before bridge: {}",
            member_call.hangup_cause().unwrap_or_default()
        ));
        if let Some(call) = attempt
            .agent_call_id()
            .and_then(|id| manager.call_manager().get_call(&id))
        {
            let cause = &manager.config().telephony.cancel_hangup_cause;
            if let Err(e) = manager.call_manager().hangup(&call, cause).await {
                warn!("[{}] call {} hangup error: {}", call.app_id(), call.id(), e);
            }
        }

        self.abandon(manager, attempt).await;
        manager.leaving_member(attempt, &self.settings).await;
    }

    /// Ring the agent and bridge it to a member leg that is already up
    ///
    /// Returns the hangup event once the bridged conversation ended, `None`
    /// when the offer did not connect.
    pub(crate) async fn offer_agent_leg(
        &self,
        manager: &QueueManager,
        attempt: &Attempt,
        agent: &Agent,
        member_call: &Call,
    ) -> Option<CallEvent> {
        if attempt.is_terminal() || member_call.is_hangup() {
            attempt.clear_agent();
            return None;
        }

        let agents = manager.agent_manager();
        let members = manager.store().members();

        if let Err(e) = agents
            .set_agent_offering(agent, self.settings.id, attempt.id())
            .await
        {
            warn!("AgentId={} offering to AttemptId={} error: {}", agent.id(), attempt.id(), e);
            attempt.clear_agent();
            if let Err(e) = members.set_attempt_find_agent(attempt.id()).await {
                error!("AttemptId={} set find agent error: {}", attempt.id(), e);
            }
            return None;
        }

        attempt.set_state(MemberState::Active);
        if let Err(e) = members
            .set_attempt_offering(
                attempt.id(),
                Some(agent.id()),
                None,
                Some(member_call.id()),
                None,
                None,
            )
            .await
        {
            error!("AttemptId={} set offering error: {}", attempt.id(), e);
        }

        let mut request = CallRequest {
            endpoints: agent.call_endpoints(),
            caller_name: attempt.name(),
            caller_number: attempt.destination(),
            timeout: self.settings.timeout,
            variables: self.call_variables(manager, attempt, None, QUEUE_SIDE_AGENT),
            applications: Vec::new(),
        };
        self.set_record_call(
            &mut request,
            &manager.config().telephony.record_template,
            attempt.id(),
        );
        request.add_application("answer", "");
        request.add_application("uuid_bridge", member_call.id());

        let agent_call = match manager.call_manager().new_call(request).await {
            Ok(call) if !call.is_hangup() => call,
            Ok(call) => {
                let cause = call
                    .hangup_cause()
                    .unwrap_or_else(|| CALL_CAUSE_NO_ANSWER.to_string());
                self.missed_agent(manager, attempt, agent, &cause, Some(member_call))
                    .await;
                return None;
            }
            Err(e) => {
                let cause = e
                    .hangup_cause()
                    .unwrap_or(CALL_CAUSE_NETWORK_ERROR)
                    .to_string();
                self.missed_agent(manager, attempt, agent, &cause, Some(member_call))
                    .await;
                return None;
            }
        };

        attempt.set_agent_call_id(agent_call.id());
        if let Err(e) = members
            .set_attempt_offering(attempt.id(), None, Some(agent_call.id()), None, None, None)
            .await
        {
            error!("AttemptId={} set offering error: {}", attempt.id(), e);
        }

        let bridged = tokio::select! {
            state = agent_call.wait_for_bridge() => state == CallState::Bridge,
            _ = member_call.wait_for_hangup() => false,
        };

        if !bridged {
            if member_call.is_hangup() || attempt.is_terminal() {
                // member left first, the offer is withdrawn
                if !agent_call.is_hangup() {
                    let cause = &manager.config().telephony.cancel_hangup_cause;
                    if let Err(e) = manager.call_manager().hangup(&agent_call, cause).await {
                        warn!("[{}] call {} hangup error: {}", agent_call.app_id(), agent_call.id(), e);
                    }
                }
                attempt.clear_agent();
                if let Err(e) = agents.set_agent_waiting(agent, false).await {
                    warn!("AgentId={} set waiting error: {}", agent.id(), e);
                }
                return None;
            }

            let cause = agent_call
                .hangup_cause()
                .unwrap_or_else(|| CALL_CAUSE_NO_ANSWER.to_string());
            self.missed_agent(manager, attempt, agent, &cause, Some(member_call))
                .await;
            return None;
        }

        if let Err(e) = agents.set_agent_talking(agent, attempt.id()).await {
            warn!("AgentId={} set talking error: {}", agent.id(), e);
        }
        if let Err(e) = members.set_attempt_bridged(attempt.id()).await {
            error!("AttemptId={} set bridged error: {}", attempt.id(), e);
        }
        attempt.set_state(MemberState::Bridged);
        debug!(
            "AttemptId={} bridged member {} with agent {}",
            attempt.id(),
            member_call.id(),
            agent.id()
        );

        tokio::select! {
            _ = agent_call.wait_for_hangup() => {}
            _ = member_call.wait_for_hangup() => {}
        }

        let first = if member_call.is_hangup() {
            member_call
        } else {
            agent_call.as_ref()
        };
        Some(
            first
                .last_event()
                .unwrap_or_else(|| CallEvent::hangup(first.id(), "")),
        )
    }
}
