use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::resource::ResourceStrategy;

/// Dialing mode of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    /// Member leg already exists, an agent is looked for
    Inbound,
    /// Agent is engaged first, then the member is dialed
    Preview,
    /// Member is dialed first, then an agent is looked for
    #[serde(alias = "calling")]
    Progressive,
}

impl QueueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Preview => "preview",
            Self::Progressive => "progressive",
        }
    }

    /// Whether attempts of this queue need an outbound resource
    pub fn uses_resource(&self) -> bool {
        !matches!(self, Self::Inbound)
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "preview" => Ok(Self::Preview),
            "progressive" | "calling" => Ok(Self::Progressive),
            other => Err(format!("unknown queue type: {}", other)),
        }
    }
}

/// Authoritative queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    pub id: i64,
    pub domain_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub queue_type: QueueType,
    pub updated_at: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ring timeout for legs originated by this queue, seconds
    pub timeout: u16,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub record: bool,
    /// Retry budget for the member, 0 disables the limit
    #[serde(default)]
    pub max_attempts: u32,
    #[serde(default)]
    pub wait_between_retries: u64,
    /// Wrap-up window after hangup, handled as attempt `processing`
    #[serde(default)]
    pub processing: bool,
    #[serde(default)]
    pub processing_sec: u32,
    #[serde(default)]
    pub processing_renewal_sec: u32,
    /// Agent cool-down after a no-answer, 0 uses the node default
    #[serde(default)]
    pub no_answer_hold_sec: u32,
    #[serde(default)]
    pub resource_ids: Vec<i64>,
    #[serde(default)]
    pub resource_strategy: ResourceStrategy,
}

fn default_true() -> bool {
    true
}

impl QueueSettings {
    pub fn new<S: Into<String>>(id: i64, name: S, queue_type: QueueType, updated_at: i64) -> Self {
        Self {
            id,
            domain_id: 1,
            name: name.into(),
            queue_type,
            updated_at,
            enabled: true,
            timeout: 60,
            variables: HashMap::new(),
            record: false,
            max_attempts: 0,
            wait_between_retries: 0,
            processing: false,
            processing_sec: 0,
            processing_renewal_sec: 0,
            no_answer_hold_sec: 0,
            resource_ids: Vec::new(),
            resource_strategy: ResourceStrategy::default(),
        }
    }
}

/// Published whenever the number of cached attempts of a queue changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEventCount {
    pub queue_id: i64,
    pub domain_id: i64,
    pub count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calling_is_progressive() {
        assert_eq!("calling".parse::<QueueType>().unwrap(), QueueType::Progressive);
        let settings: QueueSettings = serde_json::from_str(
            r#"{"id":7,"domain_id":1,"name":"sales","type":"calling","updated_at":100,"timeout":30}"#,
        )
        .unwrap();
        assert_eq!(settings.queue_type, QueueType::Progressive);
        assert!(settings.enabled);
        assert_eq!(settings.resource_strategy, ResourceStrategy::Random);
    }

    #[test]
    fn test_inbound_needs_no_resource() {
        assert!(!QueueType::Inbound.uses_resource());
        assert!(QueueType::Preview.uses_resource());
    }
}
