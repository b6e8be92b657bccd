use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{DialerError, Result};
use crate::model::{AgentSnapshot, AgentState};

#[derive(Debug)]
struct AgentInner {
    state: AgentState,
    updated_at: i64,
    successively_no_answers: u16,
}

/// Exclusive attempt binding of one agent
///
/// Every projection of the same agent shares one slot, so a binding taken
/// through an old projection still holds after the agent is reloaded.
pub(crate) type AgentBinding = Arc<Mutex<Option<i64>>>;

/// Live agent projection
///
/// Only the agent manager changes the state (`apply_state`), and only an
/// attempt claims or releases the binding. Everything else reads.
#[derive(Debug)]
pub struct Agent {
    id: i64,
    domain_id: i64,
    user_id: i64,
    name: String,
    endpoints: Vec<String>,
    call_number: Option<String>,
    inner: RwLock<AgentInner>,
    binding: AgentBinding,
}

impl Agent {
    pub fn from_snapshot(snapshot: AgentSnapshot) -> Self {
        Self::with_binding(snapshot, AgentBinding::default())
    }

    pub(crate) fn with_binding(snapshot: AgentSnapshot, binding: AgentBinding) -> Self {
        Self {
            id: snapshot.id,
            domain_id: snapshot.domain_id,
            user_id: snapshot.user_id,
            name: snapshot.name,
            endpoints: snapshot.endpoints,
            call_number: snapshot.call_number,
            inner: RwLock::new(AgentInner {
                state: snapshot.state,
                updated_at: snapshot.updated_at,
                successively_no_answers: snapshot.successively_no_answers,
            }),
            binding,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn domain_id(&self) -> i64 {
        self.domain_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn call_number(&self) -> Option<&str> {
        self.call_number.as_deref()
    }

    /// Endpoints to ring, falling back to the call number
    pub fn call_endpoints(&self) -> Vec<String> {
        if !self.endpoints.is_empty() {
            return self.endpoints.clone();
        }
        self.call_number
            .iter()
            .map(|number| format!("user/{}", number))
            .collect()
    }

    pub fn state(&self) -> AgentState {
        self.inner.read().state.clone()
    }

    pub fn updated_at(&self) -> i64 {
        self.inner.read().updated_at
    }

    pub fn successively_no_answers(&self) -> u16 {
        self.inner.read().successively_no_answers
    }

    pub fn bound_attempt(&self) -> Option<i64> {
        *self.binding.lock()
    }

    /// The caller carries a newer version than this projection
    pub fn is_expire(&self, updated_at: i64) -> bool {
        updated_at > self.updated_at()
    }

    /// Bind the agent to an attempt; fails while another attempt holds it
    pub(crate) fn claim(&self, attempt_id: i64) -> Result<()> {
        let mut bound = self.binding.lock();
        match *bound {
            Some(other) if other != attempt_id => Err(DialerError::protocol(format!(
                "agent {} is bound to attempt {}",
                self.id, other
            ))),
            _ => {
                *bound = Some(attempt_id);
                Ok(())
            }
        }
    }

    /// Drop the binding if `attempt_id` holds it
    pub(crate) fn release(&self, attempt_id: i64) -> bool {
        let mut bound = self.binding.lock();
        if *bound == Some(attempt_id) {
            *bound = None;
            true
        } else {
            false
        }
    }

    /// Apply a state the store accepted under version `updated_at`
    pub(crate) fn apply_state(&self, state: AgentState, updated_at: i64) {
        let mut inner = self.inner.write();
        match &state {
            AgentState::Fine {
                no_answer: true, ..
            } => {
                inner.successively_no_answers = inner.successively_no_answers.saturating_add(1)
            }
            AgentState::Talking { .. } => inner.successively_no_answers = 0,
            _ => {}
        }
        inner.state = state;
        inner.updated_at = updated_at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> Agent {
        let mut snapshot = AgentSnapshot::new(1, "alice", 100);
        snapshot.call_number = Some("1001".to_string());
        Agent::from_snapshot(snapshot)
    }

    #[test]
    fn test_exclusive_binding() {
        let agent = agent();
        agent.claim(10).unwrap();
        agent.claim(10).unwrap();
        assert!(agent.claim(11).is_err());

        assert!(!agent.release(11));
        assert!(agent.release(10));
        agent.claim(11).unwrap();
        assert_eq!(agent.bound_attempt(), Some(11));
    }

    #[test]
    fn test_binding_shared_between_projections() {
        let binding = AgentBinding::default();
        let old = Agent::with_binding(AgentSnapshot::new(1, "alice", 100), binding.clone());
        let fresh = Agent::with_binding(AgentSnapshot::new(1, "alice", 200), binding);

        old.claim(10).unwrap();
        assert_eq!(fresh.bound_attempt(), Some(10));
        assert!(fresh.claim(11).is_err());

        assert!(old.release(10));
        fresh.claim(11).unwrap();
    }

    #[test]
    fn test_no_answer_counter() {
        let agent = agent();
        agent.apply_state(
            AgentState::Fine {
                deadline: 0,
                no_answer: true,
            },
            101,
        );
        agent.apply_state(
            AgentState::Fine {
                deadline: 0,
                no_answer: true,
            },
            102,
        );
        assert_eq!(agent.successively_no_answers(), 2);

        agent.apply_state(AgentState::Talking { attempt_id: None }, 103);
        assert_eq!(agent.successively_no_answers(), 0);
        assert_eq!(agent.updated_at(), 103);
    }

    #[test]
    fn test_endpoints_fallback() {
        assert_eq!(agent().call_endpoints(), vec!["user/1001".to_string()]);
        assert!(agent().is_expire(101));
        assert!(!agent().is_expire(100));
    }
}
