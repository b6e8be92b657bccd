//! Circuit breaker and agent reservation over the shared store

use std::sync::Arc;

use anyhow::Result;
use rvoip_dialer_engine::config::CacheConfig;
use rvoip_dialer_engine::store::{AgentStore, MemberStore};
use rvoip_dialer_engine::prelude::*;
use tokio_test::{assert_err, assert_ok};

fn resource_manager(store: Arc<MemoryStore>) -> ResourceManager {
    ResourceManager::new(store, &CacheConfig::default())
}

#[tokio::test]
async fn test_resource_stops_after_max_errors() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut config = OutboundResourceConfig::new(1, "trunk", 1);
    config.max_successively_errors = 3;
    store.add_resource(config);
    let resources = resource_manager(store.clone());

    let trunk = resources.get(1, 0).await?;
    for _ in 0..2 {
        let verdict = resources.report_error(&trunk, None, "USER_BUSY").await?;
        assert!(!verdict.expect("cause counts").is_stopped());
    }
    assert_ok!(resources.get(1, 0).await);

    let verdict = resources.report_error(&trunk, None, "USER_BUSY").await?;
    assert!(verdict.expect("cause counts").is_stopped());
    assert_err!(resources.get(1, 0).await);
    assert!(matches!(
        resources.get(1, 0).await,
        Err(DialerError::CircuitOpen { id: 1 })
    ));
    assert!(resources.select(&[1], Default::default(), None).await.is_none());

    let version = store.rearm_resource(1).expect("resource exists");
    let trunk = resources.get(1, version).await?;
    assert_eq!(trunk.successively_errors(), 0);
    Ok(())
}

#[tokio::test]
async fn test_success_resets_error_counter() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut config = OutboundResourceConfig::new(1, "trunk", 1);
    config.max_successively_errors = 2;
    store.add_resource(config);
    let resources = resource_manager(store.clone());

    let trunk = resources.get(1, 0).await?;
    resources.report_error(&trunk, None, "USER_BUSY").await?;
    assert_eq!(store.resource(1).map(|r| r.successively_errors), Some(1));

    resources.report_success(&trunk).await?;
    assert_eq!(trunk.successively_errors(), 0);
    assert_eq!(store.resource(1).map(|r| r.successively_errors), Some(0));

    // one more error no longer reaches the threshold
    let verdict = resources.report_error(&trunk, None, "USER_BUSY").await?;
    assert!(!verdict.expect("cause counts").is_stopped());
    assert_ok!(resources.get(1, 0).await);
    Ok(())
}

#[tokio::test]
async fn test_agent_reserved_for_one_attempt_at_a_time() -> Result<()> {
    let store = MemoryStore::new();
    let mut queue = QueueSettings::new(1, "sales", QueueType::Preview, 1);
    queue.resource_ids = vec![10];
    store.add_queue(queue);
    store.add_resource(OutboundResourceConfig::new(10, "trunk", 1));
    let mut agent = AgentSnapshot::new(5, "alice", 1);
    agent.state = AgentState::Waiting;
    store.add_agent(agent);
    store.set_queue_agents(1, vec![5]);
    store.add_member(1, "John", MemberCommunication::new("100"));
    store.add_member(1, "Jane", MemberCommunication::new("200"));

    assert_eq!(store.reserve_members_by_node("n1").await?, 2);
    let attempts = store.get_active_members_attempt("n1").await?;
    for attempt in &attempts {
        store.set_attempt_find_agent(attempt.id).await?;
    }

    let reservations = store.reserved_for_attempt_by_node("n1").await?;
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].agent_id, 5);
    assert!(store.reserved_for_attempt_by_node("n1").await?.is_empty());

    // released once the first attempt closes
    let reserved_attempt = reservations[0].attempt_id;
    store
        .set_attempt_result(reserved_attempt, "SUCCESSFUL", 0, None, 0, 0)
        .await?;
    let reservations = store.reserved_for_attempt_by_node("n1").await?;
    assert_eq!(reservations.len(), 1);
    assert_ne!(reservations[0].attempt_id, reserved_attempt);
    Ok(())
}
