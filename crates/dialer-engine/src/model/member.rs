use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub const MEMBER_CAUSE_SYSTEM_SHUTDOWN: &str = "SYSTEM_SHUTDOWN";
pub const MEMBER_CAUSE_ABANDONED: &str = "abandoned";
pub const MEMBER_CAUSE_TIMEOUT: &str = "timeout";
pub const MEMBER_CAUSE_CANCEL: &str = "cancel";
pub const MEMBER_CAUSE_BARRED: &str = "barred";
pub const MEMBER_CAUSE_MISSED: &str = "missed";
pub const MEMBER_CAUSE_SUCCESSFUL: &str = "SUCCESSFUL";
pub const MEMBER_CAUSE_QUEUE_NOT_IMPLEMENT: &str = "QUEUE_NOT_IMPLEMENT";
pub const MEMBER_CAUSE_RESOURCE_NOT_FOUND: &str = "RESOURCE_NOT_FOUND";
pub const MEMBER_CAUSE_ENDPOINT_NOT_FOUND: &str = "ENDPOINT_NOT_FOUND";

/// Attempt lifecycle states, ordered along the success path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Idle,
    Waiting,
    WaitAgent,
    Active,
    Bridged,
    Processing,
    Leaving,
    Cancel,
}

impl MemberState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Waiting => "waiting",
            Self::WaitAgent => "wait_agent",
            Self::Active => "active",
            Self::Bridged => "bridged",
            Self::Processing => "processing",
            Self::Leaving => "leaving",
            Self::Cancel => "cancel",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Leaving | Self::Cancel)
    }

    /// Whether an attempt may move from `self` to `next`
    ///
    /// Forward moves only, plus the retry loop back to `wait_agent` from the
    /// offering and bridged stages. Terminal states accept nothing.
    pub fn can_advance_to(&self, next: MemberState) -> bool {
        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, MemberState::Leaving) | (_, MemberState::Cancel) => true,
            (MemberState::Active, MemberState::WaitAgent)
            | (MemberState::Bridged, MemberState::WaitAgent) => true,
            (current, next) => next > *current,
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "waiting" => Ok(Self::Waiting),
            "wait_agent" | "find_agent" => Ok(Self::WaitAgent),
            "active" | "offering" => Ok(Self::Active),
            "bridged" => Ok(Self::Bridged),
            "processing" | "reporting" => Ok(Self::Processing),
            "leaving" => Ok(Self::Leaving),
            "cancel" => Ok(Self::Cancel),
            other => Err(format!("unknown member state: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Communication {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

/// Where and how a member is reached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberCommunication {
    pub destination: String,
    #[serde(rename = "type", default)]
    pub kind: Communication,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub display: Option<String>,
    /// Endpoint pattern of the routing rule that matched this destination
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub routing_id: Option<i64>,
}

impl MemberCommunication {
    pub fn new<S: Into<String>>(destination: S) -> Self {
        Self {
            destination: destination.into(),
            ..Default::default()
        }
    }
}

/// Attempt row as the store hands it to this node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemberAttempt {
    pub id: i64,
    pub queue_id: i64,
    pub queue_updated_at: i64,
    pub state: Option<MemberState>,
    pub member_id: Option<i64>,
    pub created_at: i64,
    pub hangup_at: i64,
    pub bridged_at: i64,
    pub resource_id: Option<i64>,
    pub resource_updated_at: Option<i64>,
    pub result: Option<String>,
    pub destination: MemberCommunication,
    pub agent_id: Option<i64>,
    pub agent_updated_at: Option<i64>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    pub name: String,
    pub member_call_id: Option<String>,
    #[serde(default)]
    pub barred: bool,
}

impl MemberAttempt {
    pub fn is_timeout(&self) -> bool {
        self.result.as_deref() == Some(MEMBER_CAUSE_TIMEOUT)
    }
}

/// Persistence closed an attempt on this node because a deadline passed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptTimeout {
    pub attempt_id: i64,
    pub timestamp: i64,
    pub result: String,
    pub agent_id: Option<i64>,
    pub agent_updated_at: Option<i64>,
    pub user_id: Option<i64>,
    pub channel: Option<String>,
    pub domain_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryAttempt {
    pub id: i64,
    pub result: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptLeaving {
    pub timestamp: i64,
    pub member_stop_cause: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MissedAgent {
    pub timestamp: i64,
    pub no_answers: u32,
    pub member_stop_cause: Option<String>,
}

/// External or integration result reported for an attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptReportResult {
    pub success: bool,
    pub status: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub display: bool,
    pub expire_at: Option<i64>,
    pub next_distribute_at: Option<i64>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptReported {
    pub timestamp: i64,
    pub queue_id: i64,
    pub agent_id: Option<i64>,
    pub member_stop_cause: Option<String>,
}

/// New processing deadline granted by a renewal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenewalProcessing {
    pub attempt_id: i64,
    pub queue_id: i64,
    pub timeout: i64,
    pub timestamp: i64,
    pub renewal_sec: u32,
    pub user_id: Option<i64>,
    pub domain_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_with_retry_loop() {
        use MemberState::*;

        assert!(Idle.can_advance_to(Waiting));
        assert!(WaitAgent.can_advance_to(Active));
        assert!(Active.can_advance_to(WaitAgent));
        assert!(Bridged.can_advance_to(WaitAgent));
        assert!(Bridged.can_advance_to(Processing));
        assert!(Waiting.can_advance_to(Cancel));

        assert!(!Active.can_advance_to(Waiting));
        assert!(!Processing.can_advance_to(WaitAgent));
        assert!(!Leaving.can_advance_to(Cancel));
        assert!(!Cancel.can_advance_to(Leaving));
    }

    #[test]
    fn test_state_parse_aliases() {
        assert_eq!("find_agent".parse::<MemberState>().unwrap(), MemberState::WaitAgent);
        assert_eq!("wait_agent".parse::<MemberState>().unwrap(), MemberState::WaitAgent);
        assert_eq!(MemberState::WaitAgent.to_string(), "wait_agent");
        assert!("ringing".parse::<MemberState>().is_err());
    }

    #[test]
    fn test_destination_json() {
        let dest: MemberCommunication = serde_json::from_str(
            r#"{"destination":"380501234567","type":{"id":1,"name":"phone"},"priority":2,"display":null}"#,
        )
        .unwrap();
        assert_eq!(dest.destination, "380501234567");
        assert_eq!(dest.kind.name, "phone");
        assert_eq!(dest.pattern, None);
    }
}
