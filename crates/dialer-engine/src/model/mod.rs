//! Plain data carried between the store, the bus and the engine
//!
//! Nothing in here has behaviour beyond small accessors: the live entities
//! (`Attempt`, `Resource`, `Agent`, `Call`) are built from these snapshots.

pub mod agent;
pub mod call;
pub mod member;
pub mod queue;
pub mod resource;

use std::collections::HashMap;

pub use agent::{AgentReservation, AgentSnapshot, AgentState, ChannelTimeout};
pub use call::*;
pub use member::*;
pub use queue::{QueueEventCount, QueueSettings, QueueType};
pub use resource::{OutboundResourceConfig, ResourceErrorResult, ResourceStrategy, SipGateway};

/// Milliseconds since the unix epoch, the timestamp unit of the shared store
pub fn get_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Merge variable maps, later maps override earlier ones
pub fn union_string_maps(maps: &[&HashMap<String, String>]) -> HashMap<String, String> {
    let mut merged = HashMap::with_capacity(maps.iter().map(|m| m.len()).sum());
    for map in maps {
        for (key, value) in map.iter() {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_union_later_wins() {
        let resource = HashMap::from([
            ("a".to_string(), "resource".to_string()),
            ("b".to_string(), "resource".to_string()),
        ]);
        let queue = HashMap::from([("b".to_string(), "queue".to_string())]);
        let attempt = HashMap::from([
            ("b".to_string(), "attempt".to_string()),
            ("c".to_string(), "attempt".to_string()),
        ]);

        let merged = union_string_maps(&[&resource, &queue, &attempt]);
        assert_eq!(merged["a"], "resource");
        assert_eq!(merged["b"], "attempt");
        assert_eq!(merged["c"], "attempt");
    }
}
