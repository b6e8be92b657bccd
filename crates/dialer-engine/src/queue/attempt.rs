use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::agent::Agent;
use crate::error::{DialerError, Result};
use crate::model::{
    AttemptTimeout, MEMBER_CAUSE_CANCEL, MemberAttempt, MemberCommunication, MemberState,
    get_millis,
};
use crate::resource::Resource;

const MAX_LOG_ENTRIES: usize = 64;

/// Lifecycle notification of one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptEvent {
    State(MemberState),
    Leaving { result: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLogEntry {
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug)]
struct AttemptInner {
    member: MemberAttempt,
    state: MemberState,
    agent: Option<Arc<Agent>>,
    resource: Option<Arc<Resource>>,
    agent_call_id: Option<String>,
    result: Option<String>,
    no_answers: u32,
    offering_at: i64,
    bridged_at: i64,
    leaving_at: i64,
    logs: VecDeque<AttemptLogEntry>,
}

/// One member's journey through a queue on this node
///
/// The attempt is the unit of concurrency control: queue workers drive it
/// through [`MemberState`] and every transition requested after it reached
/// `leaving` or `cancel` is dropped.
#[derive(Debug)]
pub struct Attempt {
    id: i64,
    inner: RwLock<AttemptInner>,
    events: broadcast::Sender<AttemptEvent>,
}

impl Attempt {
    pub fn new(member: MemberAttempt) -> Self {
        let (events, _) = broadcast::channel(16);
        let state = member.state.unwrap_or(MemberState::Waiting);
        Self {
            id: member.id,
            inner: RwLock::new(AttemptInner {
                result: member.result.clone(),
                bridged_at: member.bridged_at,
                member,
                state,
                agent: None,
                resource: None,
                agent_call_id: None,
                no_answers: 0,
                offering_at: 0,
                leaving_at: 0,
                logs: VecDeque::new(),
            }),
            events,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn queue_id(&self) -> i64 {
        self.inner.read().member.queue_id
    }

    pub fn queue_updated_at(&self) -> i64 {
        self.inner.read().member.queue_updated_at
    }

    pub fn member_id(&self) -> Option<i64> {
        self.inner.read().member.member_id
    }

    pub fn name(&self) -> String {
        self.inner.read().member.name.clone()
    }

    pub fn destination(&self) -> String {
        self.inner.read().member.destination.destination.clone()
    }

    pub fn communication(&self) -> MemberCommunication {
        self.inner.read().member.destination.clone()
    }

    pub fn communication_pattern(&self) -> Option<String> {
        self.inner.read().member.destination.pattern.clone()
    }

    pub fn routing_id(&self) -> Option<i64> {
        self.inner.read().member.destination.routing_id
    }

    pub fn variables(&self) -> HashMap<String, String> {
        self.inner.read().member.variables.clone()
    }

    pub fn resource_id(&self) -> Option<i64> {
        self.inner.read().member.resource_id
    }

    pub fn resource_updated_at(&self) -> Option<i64> {
        self.inner.read().member.resource_updated_at
    }

    pub fn created_at(&self) -> i64 {
        self.inner.read().member.created_at
    }

    pub fn state(&self) -> MemberState {
        self.inner.read().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn result(&self) -> Option<String> {
        self.inner.read().result.clone()
    }

    pub fn is_barred(&self) -> bool {
        self.inner.read().member.barred
    }

    pub fn is_timeout(&self) -> bool {
        self.inner.read().member.is_timeout()
    }

    pub fn agent(&self) -> Option<Arc<Agent>> {
        self.inner.read().agent.clone()
    }

    pub fn resource(&self) -> Option<Arc<Resource>> {
        self.inner.read().resource.clone()
    }

    pub fn member_call_id(&self) -> Option<String> {
        self.inner.read().member.member_call_id.clone()
    }

    pub fn agent_call_id(&self) -> Option<String> {
        self.inner.read().agent_call_id.clone()
    }

    pub fn no_answers(&self) -> u32 {
        self.inner.read().no_answers
    }

    pub fn offering_at(&self) -> i64 {
        self.inner.read().offering_at
    }

    pub fn bridged_at(&self) -> i64 {
        self.inner.read().bridged_at
    }

    pub fn leaving_at(&self) -> i64 {
        self.inner.read().leaving_at
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AttemptEvent> {
        self.events.subscribe()
    }

    /// Refresh the mutable fields from a newer store snapshot
    pub fn set_member(&self, update: MemberAttempt) -> bool {
        let mut inner = self.inner.write();
        if inner.state.is_terminal() {
            drop(inner);
            self.log("set member rejected: attempt closed");
            return false;
        }

        if update.queue_updated_at > inner.member.queue_updated_at {
            inner.member.queue_updated_at = update.queue_updated_at;
        }
        if update.resource_id.is_some() {
            inner.member.resource_id = update.resource_id;
            inner.member.resource_updated_at = update.resource_updated_at;
        }
        if update.member_call_id.is_some() {
            inner.member.member_call_id = update.member_call_id;
        }
        inner.member.destination = update.destination;
        inner.member.variables = update.variables;
        inner.member.name = update.name;
        inner.member.barred = update.barred;
        drop(inner);

        self.log("member refreshed");
        true
    }

    /// Close the attempt because the store reported its deadline passed
    pub fn set_timeout(&self, timeout: &AttemptTimeout) -> bool {
        let closed = {
            let mut inner = self.inner.write();
            if inner.state.is_terminal() {
                false
            } else {
                inner.state = MemberState::Leaving;
                inner.result = Some(timeout.result.clone());
                inner.leaving_at = timeout.timestamp;
                true
            }
        };

        if closed {
            self.log(format!("timeout {}", timeout.result));
            self.emit(AttemptEvent::Leaving {
                result: timeout.result.clone(),
            });
        } else {
            self.log("timeout ignored: attempt closed");
        }
        closed
    }

    /// Bind the agent the store reserved for this attempt
    pub fn distribute_agent(&self, agent: Arc<Agent>) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if inner.state.is_terminal() {
                return Err(DialerError::protocol(format!(
                    "attempt {} is closed, agent {} not bound",
                    self.id,
                    agent.id()
                )));
            }
            if let Some(bound) = &inner.agent {
                if bound.id() != agent.id() {
                    return Err(DialerError::protocol(format!(
                        "attempt {} already holds agent {}",
                        self.id,
                        bound.id()
                    )));
                }
            }
            agent.claim(self.id)?;
            inner.member.agent_id = Some(agent.id());
            inner.member.agent_updated_at = Some(agent.updated_at());
            inner.agent = Some(agent.clone());
        }
        self.log(format!("distribute agent {} [{}]", agent.name(), agent.id()));
        Ok(())
    }

    /// Drop the agent binding, returns the agent that held it
    pub fn clear_agent(&self) -> Option<Arc<Agent>> {
        let agent = {
            let mut inner = self.inner.write();
            inner.member.agent_id = None;
            inner.member.agent_updated_at = None;
            inner.agent.take()
        }?;
        agent.release(self.id);
        self.log(format!("release agent {}", agent.id()));
        Some(agent)
    }

    /// Move along the lifecycle; terminal states go through `set_result`
    pub fn set_state(&self, next: MemberState) -> bool {
        if next.is_terminal() {
            return false;
        }

        let current = {
            let mut inner = self.inner.write();
            let current = inner.state;
            if !current.can_advance_to(next) {
                None
            } else {
                let now = get_millis();
                match next {
                    MemberState::Active => inner.offering_at = now,
                    MemberState::Bridged => inner.bridged_at = now,
                    _ => {}
                }
                inner.state = next;
                Some(current)
            }
        };

        match current {
            Some(current) => {
                self.log(format!("{} -> {}", current, next));
                self.emit(AttemptEvent::State(next));
                true
            }
            None => {
                self.log(format!("transition to {} rejected in {}", next, self.state()));
                false
            }
        }
    }

    /// Close the attempt with a result; only the first call has effect
    pub fn set_result<S: Into<String>>(&self, result: S) -> bool {
        let result = result.into();
        let closed = {
            let mut inner = self.inner.write();
            if inner.state.is_terminal() {
                false
            } else {
                inner.state = if result == MEMBER_CAUSE_CANCEL {
                    MemberState::Cancel
                } else {
                    MemberState::Leaving
                };
                inner.result = Some(result.clone());
                inner.leaving_at = get_millis();
                true
            }
        };

        if closed {
            self.log(format!("result {}", result));
            self.emit(AttemptEvent::Leaving { result });
        } else {
            self.log(format!("result {} ignored: attempt closed", result));
        }
        closed
    }

    pub fn increment_no_answers(&self) -> u32 {
        let mut inner = self.inner.write();
        inner.no_answers += 1;
        inner.no_answers
    }

    pub fn set_resource(&self, resource: Option<Arc<Resource>>) {
        let mut inner = self.inner.write();
        inner.member.resource_id = resource.as_ref().map(|r| r.id());
        inner.member.resource_updated_at = resource.as_ref().map(|r| r.updated_at());
        inner.resource = resource;
    }

    pub fn set_member_call_id<S: Into<String>>(&self, id: S) {
        self.inner.write().member.member_call_id = Some(id.into());
    }

    pub fn set_agent_call_id<S: Into<String>>(&self, id: S) {
        self.inner.write().agent_call_id = Some(id.into());
    }

    /// Append to the diagnostic trail
    pub fn log<S: Into<String>>(&self, message: S) {
        let message = message.into();
        debug!("AttemptId={} {}", self.id, message);
        let mut inner = self.inner.write();
        if inner.logs.len() == MAX_LOG_ENTRIES {
            inner.logs.pop_front();
        }
        inner.logs.push_back(AttemptLogEntry {
            timestamp: get_millis(),
            message,
        });
    }

    pub fn logs(&self) -> Vec<AttemptLogEntry> {
        self.inner.read().logs.iter().cloned().collect()
    }

    fn emit(&self, event: AttemptEvent) {
        // no subscriber is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AgentSnapshot, MEMBER_CAUSE_SUCCESSFUL};

    fn attempt(id: i64) -> Attempt {
        Attempt::new(MemberAttempt {
            id,
            queue_id: 7,
            queue_updated_at: 100,
            state: Some(MemberState::Waiting),
            member_id: Some(1),
            name: "John".to_string(),
            destination: MemberCommunication::new("100"),
            ..Default::default()
        })
    }

    fn agent(id: i64) -> Arc<Agent> {
        Arc::new(Agent::from_snapshot(AgentSnapshot::new(id, "alice", 10)))
    }

    #[test]
    fn test_forward_transitions() {
        let attempt = attempt(1);
        assert!(attempt.set_state(MemberState::WaitAgent));
        assert!(attempt.set_state(MemberState::Active));
        assert!(attempt.offering_at() > 0);
        // no answer loops back
        assert!(attempt.set_state(MemberState::WaitAgent));
        assert!(!attempt.set_state(MemberState::Waiting));
        assert!(!attempt.set_state(MemberState::Leaving));
    }

    #[test]
    fn test_terminal_is_idempotent() {
        let attempt = attempt(1);
        let mut events = attempt.subscribe();
        assert!(attempt.set_result(MEMBER_CAUSE_SUCCESSFUL));
        let leaving_at = attempt.leaving_at();

        assert!(!attempt.set_result("abandoned"));
        assert!(!attempt.set_state(MemberState::Bridged));
        assert!(!attempt.set_member(MemberAttempt::default()));
        assert!(attempt.distribute_agent(agent(5)).is_err());

        assert_eq!(attempt.state(), MemberState::Leaving);
        assert_eq!(attempt.result().as_deref(), Some(MEMBER_CAUSE_SUCCESSFUL));
        assert_eq!(attempt.leaving_at(), leaving_at);
        assert_eq!(
            events.try_recv().unwrap(),
            AttemptEvent::Leaving {
                result: MEMBER_CAUSE_SUCCESSFUL.to_string()
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_cancel_result_maps_to_cancel_state() {
        let attempt = attempt(1);
        assert!(attempt.set_result(MEMBER_CAUSE_CANCEL));
        assert_eq!(attempt.state(), MemberState::Cancel);
    }

    #[test]
    fn test_agent_exclusive_between_attempts() {
        let a = attempt(1);
        let b = attempt(2);
        let agent = agent(5);

        a.distribute_agent(agent.clone()).unwrap();
        assert!(b.distribute_agent(agent.clone()).is_err());
        assert!(b.agent().is_none());

        a.set_result(MEMBER_CAUSE_SUCCESSFUL);
        a.clear_agent();
        b.distribute_agent(agent.clone()).unwrap();
        assert_eq!(agent.bound_attempt(), Some(2));
    }

    #[test]
    fn test_set_member_keeps_identity() {
        let attempt = attempt(1);
        let mut update = MemberAttempt {
            id: 1,
            queue_id: 7,
            queue_updated_at: 200,
            name: "John Smith".to_string(),
            destination: MemberCommunication::new("200"),
            ..Default::default()
        };
        update.variables.insert("lang".to_string(), "en".to_string());

        assert!(attempt.set_member(update));
        assert_eq!(attempt.id(), 1);
        assert_eq!(attempt.queue_updated_at(), 200);
        assert_eq!(attempt.destination(), "200");
        assert_eq!(attempt.variables()["lang"], "en");
    }

    #[test]
    fn test_log_is_bounded() {
        let attempt = attempt(1);
        for i in 0..100 {
            attempt.log(format!("entry {}", i));
        }
        let logs = attempt.logs();
        assert_eq!(logs.len(), MAX_LOG_ENTRIES);
        assert_eq!(logs.last().unwrap().message, "entry 99");
    }

    #[test]
    fn test_timeout_closes_once() {
        let attempt = attempt(1);
        let timeout = AttemptTimeout {
            attempt_id: 1,
            timestamp: 500,
            result: "timeout".to_string(),
            agent_id: None,
            agent_updated_at: None,
            user_id: None,
            channel: None,
            domain_id: 1,
        };
        assert!(attempt.set_timeout(&timeout));
        assert!(!attempt.set_timeout(&timeout));
        assert_eq!(attempt.leaving_at(), 500);
        assert_eq!(attempt.result().as_deref(), Some("timeout"));
    }
}
