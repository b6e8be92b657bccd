use serde::{Deserialize, Serialize};

/// Agent state machine
///
/// `offline -> online -> {waiting, offering, talking, reporting, fine} -> on_break`
/// and back to `online`/`offline`. Deadlines are unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AgentState {
    Offline,
    Online,
    Waiting,
    Offering { queue_id: i64, attempt_id: i64 },
    Talking { attempt_id: Option<i64> },
    Reporting { deadline: i64 },
    Fine { deadline: i64, no_answer: bool },
    OnBreak { payload: Option<String>, until: Option<i64> },
}

impl AgentState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Waiting => "waiting",
            Self::Offering { .. } => "offering",
            Self::Talking { .. } => "talking",
            Self::Reporting { .. } => "reporting",
            Self::Fine { .. } => "fine",
            Self::OnBreak { .. } => "on_break",
        }
    }

    /// Free to be reserved for an attempt
    pub fn is_distributable(&self) -> bool {
        matches!(self, Self::Online | Self::Waiting)
    }

    pub fn deadline(&self) -> Option<i64> {
        match self {
            Self::Reporting { deadline } | Self::Fine { deadline, .. } => Some(*deadline),
            Self::OnBreak { until, .. } => *until,
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: &AgentState) -> bool {
        use AgentState::*;

        match (self, next) {
            // logout is always allowed
            (_, Offline) => !matches!(self, Offline),
            (Offline, Online) => true,
            (Offline, _) => false,

            (Online | Waiting, Waiting | Online) => true,
            (Online | Waiting, Offering { .. } | OnBreak { .. }) => true,

            (Offering { .. }, Talking { .. } | Fine { .. } | Waiting | Reporting { .. }) => true,
            (Talking { .. }, Reporting { .. } | Waiting | Fine { .. }) => true,

            (Reporting { .. }, Waiting | Online | Reporting { .. } | OnBreak { .. }) => true,
            (Fine { .. }, Waiting | Online | OnBreak { .. }) => true,
            (OnBreak { .. }, Online | Waiting) => true,

            _ => false,
        }
    }
}

/// Agent row as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub id: i64,
    pub domain_id: i64,
    pub user_id: i64,
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    pub call_number: Option<String>,
    pub state: AgentState,
    pub updated_at: i64,
    #[serde(default)]
    pub successively_no_answers: u16,
}

impl AgentSnapshot {
    pub fn new<S: Into<String>>(id: i64, name: S, updated_at: i64) -> Self {
        Self {
            id,
            domain_id: 1,
            user_id: id,
            name: name.into(),
            endpoints: Vec::new(),
            call_number: None,
            state: AgentState::Offline,
            updated_at,
            successively_no_answers: 0,
        }
    }
}

/// Persistence bound an agent to an attempt of this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReservation {
    pub attempt_id: i64,
    pub agent_id: i64,
    pub agent_updated_at: i64,
}

/// An agent channel left its reporting or fine window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelTimeout {
    pub agent_id: i64,
    pub user_id: i64,
    pub channel: String,
    pub domain_id: i64,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offering_only_from_free_states() {
        let offering = AgentState::Offering {
            queue_id: 1,
            attempt_id: 2,
        };
        assert!(AgentState::Waiting.can_transition_to(&offering));
        assert!(AgentState::Online.can_transition_to(&offering));
        assert!(!AgentState::Offline.can_transition_to(&offering));
        assert!(!AgentState::Talking { attempt_id: None }.can_transition_to(&offering));
        assert!(!offering.can_transition_to(&offering));
    }

    #[test]
    fn test_wrap_up_returns_to_waiting() {
        let reporting = AgentState::Reporting { deadline: 10 };
        assert!(reporting.can_transition_to(&AgentState::Waiting));
        assert!(reporting.can_transition_to(&AgentState::Reporting { deadline: 20 }));

        let fine = AgentState::Fine {
            deadline: 10,
            no_answer: true,
        };
        assert!(fine.can_transition_to(&AgentState::Waiting));
        assert!(!fine.can_transition_to(&AgentState::Talking { attempt_id: None }));
        assert_eq!(fine.deadline(), Some(10));
    }

    #[test]
    fn test_offline_from_anywhere() {
        assert!(AgentState::Talking { attempt_id: Some(1) }.can_transition_to(&AgentState::Offline));
        assert!(!AgentState::Offline.can_transition_to(&AgentState::Offline));
        assert!(!AgentState::Offline.can_transition_to(&AgentState::Waiting));
    }

    #[test]
    fn test_state_json_tag() {
        let json = serde_json::to_string(&AgentState::Fine {
            deadline: 5,
            no_answer: true,
        })
        .unwrap();
        assert_eq!(json, r#"{"state":"fine","deadline":5,"no_answer":true}"#);
    }
}
