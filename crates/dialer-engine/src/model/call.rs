use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub const CALL_HANGUP_CAUSE_VARIABLE: &str = "hangup_cause";
pub const CALL_TIMEOUT_VARIABLE: &str = "call_timeout";
pub const CALL_IGNORE_EARLY_MEDIA_VARIABLE: &str = "ignore_early_media";
pub const CALL_DIRECTION_VARIABLE: &str = "cc_direction";
pub const CALL_DIRECTION_DIALER: &str = "dialer";
pub const CALL_DOMAIN_VARIABLE: &str = "cc_domain_id";
pub const CALL_GATEWAY_VARIABLE: &str = "cc_gateway_id";

pub const QUEUE_NODE_ID_FIELD: &str = "cc_node_id";
pub const QUEUE_ID_FIELD: &str = "cc_queue_id";
pub const QUEUE_NAME_FIELD: &str = "cc_queue_name";
pub const QUEUE_TYPE_NAME_FIELD: &str = "cc_queue_type";
pub const QUEUE_SIDE_FIELD: &str = "cc_side";
pub const QUEUE_SIDE_AGENT: &str = "agent";
pub const QUEUE_SIDE_MEMBER: &str = "member";
pub const QUEUE_MEMBER_ID_FIELD: &str = "cc_member_id";
pub const QUEUE_ATTEMPT_ID_FIELD: &str = "cc_attempt_id";
pub const QUEUE_RESOURCE_ID_FIELD: &str = "cc_resource_id";
pub const QUEUE_ROUTING_ID_FIELD: &str = "cc_routing_id";
pub const QUEUE_AGENT_ID_FIELD: &str = "cc_agent_id";
pub const QUEUE_PRIORITY_FIELD: &str = "cc_priority";
pub const QUEUE_RESULT_FIELD: &str = "cc_result";

pub const CALL_CAUSE_NETWORK_ERROR: &str = "NETWORK_OUT_OF_ORDER";
pub const CALL_CAUSE_NO_ANSWER: &str = "NO_ANSWER";

/// Application executed on a leg once it answers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallRequestApplication {
    pub app_name: String,
    pub args: String,
}

impl CallRequestApplication {
    pub fn new<N: Into<String>, A: Into<String>>(app_name: N, args: A) -> Self {
        Self {
            app_name: app_name.into(),
            args: args.into(),
        }
    }
}

/// Outbound call request sent to the telephony control plane
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub endpoints: Vec<String>,
    pub caller_name: String,
    pub caller_number: String,
    pub timeout: u16,
    pub variables: HashMap<String, String>,
    pub applications: Vec<CallRequestApplication>,
}

impl CallRequest {
    pub fn add_application<N: Into<String>, A: Into<String>>(&mut self, app_name: N, args: A) {
        self.applications
            .push(CallRequestApplication::new(app_name, args));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallEventKind {
    Ringing,
    Answer,
    Bridge,
    Park,
    Hangup,
}

/// Call lifecycle event delivered by the message bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEvent {
    pub id: String,
    pub app_id: String,
    pub event: CallEventKind,
    pub timestamp: i64,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl CallEvent {
    pub fn new<S: Into<String>>(id: S, event: CallEventKind) -> Self {
        Self {
            id: id.into(),
            app_id: String::new(),
            event,
            timestamp: super::get_millis(),
            variables: HashMap::new(),
        }
    }

    /// Hangup event, an empty cause leaves the variable out
    pub fn hangup<S: Into<String>>(id: S, cause: &str) -> Self {
        let mut event = Self::new(id, CallEventKind::Hangup);
        if !cause.is_empty() {
            event
                .variables
                .insert(CALL_HANGUP_CAUSE_VARIABLE.to_string(), cause.to_string());
        }
        event
    }

    pub fn with_variable<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn get_variable(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    pub fn get_int_variable(&self, name: &str) -> Option<i64> {
        self.get_variable(name).and_then(|v| v.parse().ok())
    }
}

/// Parked call that carries a queue id and waits for distribution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundCallInfo {
    pub id: String,
    pub app_id: String,
    pub queue_id: i64,
    pub priority: i32,
    pub from_number: String,
    pub from_name: String,
    pub created_at: i64,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl InboundCallInfo {
    /// Build from a park event, `None` when the event is not routed to a queue
    pub fn from_park_event(event: &CallEvent) -> Option<Self> {
        let queue_id = event.get_int_variable(QUEUE_ID_FIELD)?;
        if event.get_variable(QUEUE_ATTEMPT_ID_FIELD).is_some() {
            return None;
        }

        Some(Self {
            id: event.id.clone(),
            app_id: event.app_id.clone(),
            queue_id,
            priority: event
                .get_int_variable(QUEUE_PRIORITY_FIELD)
                .unwrap_or_default() as i32,
            from_number: event
                .get_variable("caller_id_number")
                .unwrap_or_default()
                .to_string(),
            from_name: event
                .get_variable("caller_id_name")
                .unwrap_or_default()
                .to_string(),
            created_at: event.timestamp,
            variables: event.variables.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hangup_event_cause() {
        let event = CallEvent::hangup("c1", "USER_BUSY");
        assert_eq!(event.get_variable(CALL_HANGUP_CAUSE_VARIABLE), Some("USER_BUSY"));

        let event = CallEvent::hangup("c1", "");
        assert_eq!(event.get_variable(CALL_HANGUP_CAUSE_VARIABLE), None);
    }

    #[test]
    fn test_park_event_with_queue() {
        let event = CallEvent::new("c2", CallEventKind::Park)
            .with_variable(QUEUE_ID_FIELD, "7")
            .with_variable("caller_id_number", "100");
        let info = InboundCallInfo::from_park_event(&event).unwrap();
        assert_eq!(info.queue_id, 7);
        assert_eq!(info.from_number, "100");

        let routed = event.clone().with_variable(QUEUE_ATTEMPT_ID_FIELD, "1");
        assert!(InboundCallInfo::from_park_event(&routed).is_none());

        let plain = CallEvent::new("c3", CallEventKind::Park);
        assert!(InboundCallInfo::from_park_event(&plain).is_none());
    }
}
