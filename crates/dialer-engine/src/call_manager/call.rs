use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::model::{CALL_HANGUP_CAUSE_VARIABLE, CallEvent, CallEventKind, CallRequest, get_millis};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Ringing,
    Accept,
    Bridge,
    Park,
    Hangup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Default)]
struct CallInner {
    offering_at: i64,
    accept_at: i64,
    bridge_at: i64,
    hangup_at: i64,
    hangup_cause: Option<String>,
    last_event: Option<CallEvent>,
}

/// One telephony leg
///
/// State only moves towards `Hangup`; once hung up nothing else is accepted.
#[derive(Debug)]
pub struct Call {
    id: String,
    app_id: String,
    direction: CallDirection,
    request: Option<CallRequest>,
    inner: RwLock<CallInner>,
    state: watch::Sender<CallState>,
}

impl Call {
    pub fn new<I: Into<String>, A: Into<String>>(
        id: I,
        app_id: A,
        direction: CallDirection,
        request: Option<CallRequest>,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Ringing);
        Self {
            id: id.into(),
            app_id: app_id.into(),
            direction,
            request,
            inner: RwLock::new(CallInner {
                offering_at: get_millis(),
                ..Default::default()
            }),
            state,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn request(&self) -> Option<&CallRequest> {
        self.request.as_ref()
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    pub fn offering_at(&self) -> i64 {
        self.inner.read().offering_at
    }

    pub fn accept_at(&self) -> i64 {
        self.inner.read().accept_at
    }

    pub fn bridge_at(&self) -> i64 {
        self.inner.read().bridge_at
    }

    pub fn hangup_at(&self) -> i64 {
        self.inner.read().hangup_at
    }

    pub fn hangup_cause(&self) -> Option<String> {
        self.inner.read().hangup_cause.clone()
    }

    pub fn last_event(&self) -> Option<CallEvent> {
        self.inner.read().last_event.clone()
    }

    pub fn is_hangup(&self) -> bool {
        self.state() == CallState::Hangup
    }

    /// Move to `next`; rejected once hung up or when it is the current state
    pub fn set_state(&self, next: CallState) -> bool {
        if next == CallState::Hangup {
            return self.set_hangup(None);
        }

        let mut inner = self.inner.write();
        let current = self.state();
        if current == CallState::Hangup || current == next {
            return false;
        }

        let now = get_millis();
        match next {
            CallState::Accept => inner.accept_at = now,
            CallState::Bridge => inner.bridge_at = now,
            _ => {}
        }
        self.state.send_replace(next);
        true
    }

    /// Apply a bus event to this leg
    pub fn apply_event(&self, event: &CallEvent) -> bool {
        match event.event {
            CallEventKind::Ringing => false,
            CallEventKind::Answer => self.set_state(CallState::Accept),
            CallEventKind::Bridge => self.set_state(CallState::Bridge),
            CallEventKind::Park => self.set_state(CallState::Park),
            CallEventKind::Hangup => self.set_hangup(Some(event.clone())),
        }
    }

    /// Hang up with an immediate cause reported by the control plane
    pub fn set_hangup_cause(&self, cause: &str) -> bool {
        self.set_hangup(Some(CallEvent::hangup(self.id.clone(), cause)))
    }

    fn set_hangup(&self, event: Option<CallEvent>) -> bool {
        let mut inner = self.inner.write();
        if self.state() == CallState::Hangup {
            return false;
        }

        inner.hangup_at = get_millis();
        if let Some(event) = event {
            inner.hangup_cause = event
                .get_variable(CALL_HANGUP_CAUSE_VARIABLE)
                .map(str::to_string);
            inner.last_event = Some(event);
        }
        self.state.send_replace(CallState::Hangup);
        true
    }

    /// Resolves once the leg is hung up
    pub async fn wait_for_hangup(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|state| *state == CallState::Hangup).await;
    }

    /// Resolves with `Bridge` once bridged or `Hangup` if it ends first
    pub async fn wait_for_bridge(&self) -> CallState {
        let mut rx = self.subscribe();
        let reached = match rx
            .wait_for(|state| matches!(state, CallState::Bridge | CallState::Hangup))
            .await
        {
            Ok(state) => *state,
            Err(_) => CallState::Hangup,
        };

        // bridged and hung up before we looked
        if reached == CallState::Hangup && self.bridge_at() > 0 {
            CallState::Bridge
        } else {
            reached
        }
    }

    fn int_var_of_last_event(&self, name: &str) -> i64 {
        self.inner
            .read()
            .last_event
            .as_ref()
            .and_then(|event| event.get_int_variable(name))
            .unwrap_or(0)
    }

    pub fn duration_seconds(&self) -> i64 {
        self.int_var_of_last_event("duration")
    }

    pub fn bill_seconds(&self) -> i64 {
        self.int_var_of_last_event("billsec")
    }

    pub fn answer_seconds(&self) -> i64 {
        self.int_var_of_last_event("answersec")
    }

    pub fn wait_seconds(&self) -> i64 {
        self.int_var_of_last_event("waitsec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_hangup_is_final() {
        let call = Call::new("c1", "fs1", CallDirection::Outbound, None);
        assert!(call.set_state(CallState::Accept));
        assert!(call.set_hangup_cause("USER_BUSY"));
        assert!(!call.set_hangup_cause("NORMAL_CLEARING"));
        assert!(!call.set_state(CallState::Bridge));

        assert_eq!(call.state(), CallState::Hangup);
        assert_eq!(call.hangup_cause().as_deref(), Some("USER_BUSY"));
        assert_eq!(call.bridge_at(), 0);
    }

    #[test]
    fn test_billing_vars_from_last_event() {
        let call = Call::new("c1", "fs1", CallDirection::Inbound, None);
        let event = CallEvent::hangup("c1", "NORMAL_CLEARING")
            .with_variable("duration", "42")
            .with_variable("billsec", "30");
        assert!(call.apply_event(&event));
        assert_eq!(call.duration_seconds(), 42);
        assert_eq!(call.bill_seconds(), 30);
        assert_eq!(call.wait_seconds(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_hangup() {
        let call = Arc::new(Call::new("c1", "fs1", CallDirection::Outbound, None));
        let waiter = {
            let call = call.clone();
            tokio::spawn(async move { call.wait_for_hangup().await })
        };

        call.apply_event(&CallEvent::new("c1", CallEventKind::Bridge));
        assert!(call.bridge_at() > 0);
        call.apply_event(&CallEvent::hangup("c1", ""));

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(call.hangup_cause(), None);
    }
}
