//! End-to-end flows of a dialer node
//!
//! Every test runs the real managers over the in-memory store, the local bus
//! and a scripted telephony connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rvoip_dialer_engine::call_manager::testing::{MockCallCommands, MockOutcome, OriginatedCall};
use rvoip_dialer_engine::model::{
    AttemptReportResult, CALL_CAUSE_NO_ANSWER, CallEvent, CallEventKind, MEMBER_CAUSE_ABANDONED,
    MEMBER_CAUSE_BARRED, MEMBER_CAUSE_RESOURCE_NOT_FOUND, MEMBER_CAUSE_SUCCESSFUL,
    MEMBER_CAUSE_TIMEOUT, QUEUE_ATTEMPT_ID_FIELD, QUEUE_RESOURCE_ID_FIELD,
};
use rvoip_dialer_engine::mq::BusMessage;
use rvoip_dialer_engine::prelude::*;
use serial_test::serial;
use tokio::sync::broadcast;

const NODE: &str = "fs1";

struct Node {
    server: DialerServer,
    store: Arc<MemoryStore>,
    bus: Arc<LocalBus>,
    connection: Arc<MockCallCommands>,
}

fn test_config() -> DialerConfig {
    let mut config = DialerConfig::default();
    config.dialing.polling_interval_ms = 20;
    config.dialing.error_backoff_ms = 20;
    config
}

async fn build_node(store: Arc<MemoryStore>) -> Result<Node> {
    build_node_with(store, test_config()).await
}

async fn build_node_with(store: Arc<MemoryStore>, config: DialerConfig) -> Result<Node> {
    init_logging("rvoip_dialer_engine=debug");
    let bus = LocalBus::new(256);
    let connection = MockCallCommands::new(NODE);

    let server = DialerServerBuilder::new()
        .with_config(config)
        .with_store(store.clone())
        .with_bus(bus.clone())
        .with_connection(connection.clone())
        .build()
        .await?;

    Ok(Node {
        server,
        store,
        bus,
        connection,
    })
}

fn waiting_agent(id: i64) -> AgentSnapshot {
    let mut agent = AgentSnapshot::new(id, format!("agent-{}", id), 1);
    agent.state = AgentState::Waiting;
    agent.call_number = Some(format!("10{}", id));
    agent
}

fn parked_call(id: &str, queue_id: i64) -> InboundCallInfo {
    InboundCallInfo {
        id: id.to_string(),
        app_id: NODE.to_string(),
        queue_id,
        priority: 0,
        from_number: "380501234567".to_string(),
        from_name: "John".to_string(),
        created_at: 0,
        variables: Default::default(),
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn queue_lengths(rx: &mut broadcast::Receiver<BusMessage>, queue_id: i64) -> Vec<usize> {
    let mut lengths = Vec::new();
    while let Ok(message) = rx.try_recv() {
        if let BusMessage::QueueLength(event) = message {
            if event.queue_id == queue_id {
                lengths.push(event.count);
            }
        }
    }
    lengths
}

#[tokio::test]
#[serial]
async fn test_inbound_hangup_without_cause_is_successful() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(QueueSettings::new(7, "support", QueueType::Inbound, 100));
    store.add_agent(waiting_agent(5));
    store.set_queue_agents(7, vec![5]);

    let mut node = build_node(store).await?;
    let mut observer = node.bus.subscribe();
    node.server.start().await?;

    let (attempt, mut events) = node
        .server
        .member_api()
        .call_join_to_queue(&parked_call("member-1", 7))
        .await?;
    let queue_manager = node.server.queue_manager().clone();
    assert!(queue_manager.get_attempt(attempt.id()).is_some());

    let agent_call = node
        .connection
        .next_call(Duration::from_secs(3))
        .await
        .expect("agent leg originated");
    assert!(agent_call.request.endpoints.contains(&"user/105".to_string()));

    node.bus
        .publish_call_event(CallEvent::new(agent_call.id.clone(), CallEventKind::Bridge))
        .await?;
    match events.recv().await {
        Some(QueueEvent::Bridged { agent_id, .. }) => assert_eq!(agent_id, Some(5)),
        other => panic!("expected bridged, got {:?}", other),
    }

    node.bus
        .publish_call_event(CallEvent::hangup("member-1", ""))
        .await?;
    match events.recv().await {
        Some(QueueEvent::Leaving { result, .. }) => assert_eq!(result, MEMBER_CAUSE_SUCCESSFUL),
        other => panic!("expected leaving, got {:?}", other),
    }
    assert!(events.recv().await.is_none());

    wait_until("attempt released", || {
        queue_manager.get_attempt(attempt.id()).is_none()
    })
    .await;
    assert_eq!(queue_manager.queue_length(7), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let lengths = queue_lengths(&mut observer, 7);
    assert_eq!(lengths.iter().filter(|count| **count == 0).count(), 1);

    let member_id = attempt.member_id().expect("member created for the call");
    assert_eq!(
        node.store.member_stop_cause(member_id).as_deref(),
        Some(MEMBER_CAUSE_SUCCESSFUL)
    );
    assert_eq!(attempt.state(), MemberState::Leaving);

    // a late duplicate hangup changes nothing
    let leaving_at = attempt.leaving_at();
    node.bus
        .publish_call_event(CallEvent::hangup("member-1", "NORMAL_CLEARING"))
        .await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(attempt.leaving_at(), leaving_at);
    assert!(queue_lengths(&mut observer, 7).is_empty());

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_preview_dials_agent_then_member() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut queue = QueueSettings::new(1, "sales", QueueType::Preview, 1);
    queue.resource_ids = vec![10];
    store.add_queue(queue);
    store.add_resource(OutboundResourceConfig::new(10, "trunk", 1));
    store.add_agent(waiting_agent(5));
    store.set_queue_agents(1, vec![5]);
    let member_id = store.add_member(1, "John", MemberCommunication::new("380501234567"));

    let mut node = build_node(store).await?;
    node.server.start().await?;

    let call = node
        .connection
        .next_call(Duration::from_secs(3))
        .await
        .expect("preview call originated");
    assert_eq!(call.request.endpoints, vec!["user/105".to_string()]);
    let bridge = call
        .request
        .applications
        .iter()
        .find(|app| app.app_name == "bridge")
        .expect("bridge application");
    assert!(bridge.args.contains("380501234567"));

    node.bus
        .publish_call_event(CallEvent::new(call.id.clone(), CallEventKind::Bridge))
        .await?;
    node.bus
        .publish_call_event(CallEvent::hangup(call.id.clone(), ""))
        .await?;

    let store = node.store.clone();
    wait_until("member closed", || {
        store.member_stop_cause(member_id).is_some()
    })
    .await;
    assert_eq!(
        store.member_stop_cause(member_id).as_deref(),
        Some(MEMBER_CAUSE_SUCCESSFUL)
    );
    wait_until("agent in wrap-up", || {
        matches!(
            store.agent(5).map(|agent| agent.state),
            Some(AgentState::Reporting { .. })
        )
    })
    .await;

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_barred_member_never_dialed() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut queue = QueueSettings::new(1, "sales", QueueType::Preview, 1);
    queue.resource_ids = vec![10];
    store.add_queue(queue);
    store.add_resource(OutboundResourceConfig::new(10, "trunk", 1));
    let member_id = store.add_member(1, "John", MemberCommunication::new("100"));
    store.set_member_barred(member_id, true);

    let mut node = build_node(store).await?;
    node.server.start().await?;

    let store = node.store.clone();
    wait_until("member barred", || {
        store.member_stop_cause(member_id).is_some()
    })
    .await;
    assert_eq!(
        store.member_stop_cause(member_id).as_deref(),
        Some(MEMBER_CAUSE_BARRED)
    );
    assert!(node.connection.originated().is_empty());

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_queue_without_resource_fails_attempt() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut queue = QueueSettings::new(1, "sales", QueueType::Progressive, 1);
    queue.max_attempts = 1;
    store.add_queue(queue);
    let member_id = store.add_member(1, "John", MemberCommunication::new("100"));

    let mut node = build_node(store).await?;
    node.server.start().await?;

    let store = node.store.clone();
    wait_until("member failed", || {
        store.member_stop_cause(member_id).is_some()
    })
    .await;
    assert_eq!(
        store.member_stop_cause(member_id).as_deref(),
        Some(MEMBER_CAUSE_RESOURCE_NOT_FOUND)
    );
    let queue_manager = node.server.queue_manager().clone();
    wait_until("attempt released", || queue_manager.attempts_count() == 0).await;

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_stop_waits_for_outstanding_attempts() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(QueueSettings::new(7, "support", QueueType::Inbound, 100));

    let mut node = build_node(store).await?;
    node.server.start().await?;
    let (attempt, _events) = node
        .server
        .member_api()
        .call_join_to_queue(&parked_call("member-1", 7))
        .await?;
    let queue_manager = node.server.queue_manager().clone();
    assert_eq!(queue_manager.outstanding(), 1);

    let bus = node.bus.clone();
    let mut server = node.server;
    let stopping = tokio::spawn(async move { server.stop().await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!stopping.is_finished());
    assert!(!queue_manager.is_accepting());
    assert!(
        queue_manager
            .distribute_call(&parked_call("member-2", 7))
            .await
            .is_err()
    );

    bus.publish_call_event(CallEvent::hangup("member-1", "NORMAL_CLEARING"))
        .await?;
    tokio::time::timeout(Duration::from_secs(2), stopping).await???;

    assert!(attempt.is_terminal());
    assert_eq!(queue_manager.outstanding(), 0);
    Ok(())
}

#[tokio::test]
async fn test_route_member_twice_keeps_one_attempt() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(QueueSettings::new(7, "support", QueueType::Inbound, 100));
    let node = build_node(store).await?;
    let queue_manager = node.server.queue_manager();

    let member = MemberAttempt {
        id: 42,
        queue_id: 7,
        queue_updated_at: 100,
        name: "John".to_string(),
        ..Default::default()
    };
    let first = queue_manager.route_member(member.clone()).await?;

    let mut update = member;
    update.name = "John Smith".to_string();
    let second = queue_manager.route_member(update).await?;

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(queue_manager.attempts_count(), 1);
    assert_eq!(first.name(), "John Smith");
    Ok(())
}

#[tokio::test]
async fn test_queue_reloaded_on_newer_version() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(QueueSettings::new(7, "support", QueueType::Inbound, 100));
    let node = build_node(store).await?;
    let queue_manager = node.server.queue_manager();

    let v1 = queue_manager.get_queue(7, 100).await?;
    let cached = queue_manager.get_queue(7, 100).await?;
    assert!(Arc::ptr_eq(&v1, &cached));

    let v2_version = node.store.touch_queue(7).expect("queue exists");
    let v2 = queue_manager.get_queue(7, v2_version).await?;
    assert!(!Arc::ptr_eq(&v1, &v2));
    assert_eq!(v2.updated_at(), v2_version);
    Ok(())
}

fn attempt_id_of(call: &OriginatedCall) -> i64 {
    call.request
        .variables
        .get(QUEUE_ATTEMPT_ID_FIELD)
        .and_then(|id| id.parse().ok())
        .expect("attempt id variable")
}

fn processing_queue(enabled: bool) -> QueueSettings {
    let mut queue = QueueSettings::new(1, "sales", QueueType::Preview, 1);
    queue.resource_ids = vec![10];
    queue.processing = true;
    queue.processing_sec = 30;
    queue.max_attempts = 1;
    queue.enabled = enabled;
    queue
}

/// Preview call bridged and hung up, left in its processing window
async fn attempt_in_processing(node: &mut Node) -> Result<Arc<Attempt>> {
    node.server.start().await?;

    let call = node
        .connection
        .next_call(Duration::from_secs(3))
        .await
        .expect("preview call originated");
    let attempt_id = attempt_id_of(&call);
    let attempt = node
        .server
        .queue_manager()
        .get_attempt(attempt_id)
        .expect("attempt held by the node");

    node.bus
        .publish_call_event(CallEvent::new(call.id.clone(), CallEventKind::Bridge))
        .await?;
    node.bus
        .publish_call_event(CallEvent::hangup(call.id.clone(), ""))
        .await?;

    let store = node.store.clone();
    wait_until("attempt in processing", || {
        attempt.state() == MemberState::Processing
            && store.attempt_state(attempt_id) == Some(MemberState::Processing)
    })
    .await;
    assert!(matches!(
        store.agent(5).map(|agent| agent.state),
        Some(AgentState::Reporting { .. })
    ));
    Ok(attempt)
}

fn processing_store() -> (Arc<MemoryStore>, i64) {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(processing_queue(true));
    store.add_resource(OutboundResourceConfig::new(10, "trunk", 1));
    store.add_agent(waiting_agent(5));
    store.set_queue_agents(1, vec![5]);
    let member_id = store.add_member(1, "John", MemberCommunication::new("380501234567"));
    (store, member_id)
}

#[tokio::test]
#[serial]
async fn test_agent_no_answer_returns_attempt_to_wait_agent() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut queue = QueueSettings::new(7, "support", QueueType::Inbound, 100);
    queue.max_attempts = 2;
    store.add_queue(queue);
    store.add_agent(waiting_agent(5));
    store.set_queue_agents(7, vec![5]);

    let mut node = build_node(store).await?;
    node.connection
        .push_outcome(MockOutcome::Hangup(CALL_CAUSE_NO_ANSWER.to_string()));
    node.connection
        .push_outcome(MockOutcome::Hangup(CALL_CAUSE_NO_ANSWER.to_string()));
    node.server.start().await?;

    let (attempt, _events) = node
        .server
        .member_api()
        .call_join_to_queue(&parked_call("member-1", 7))
        .await?;
    let queue_manager = node.server.queue_manager().clone();

    let first = node
        .connection
        .next_call(Duration::from_secs(3))
        .await
        .expect("first agent leg");
    assert!(first.request.endpoints.contains(&"user/105".to_string()));

    wait_until("first offer missed", || {
        attempt.no_answers() == 1 && attempt.state() == MemberState::WaitAgent
    })
    .await;
    assert!(attempt.agent().is_none());
    assert!(!attempt.is_terminal());
    let agent = node.store.agent(5).expect("agent exists");
    assert!(matches!(
        agent.state,
        AgentState::Fine {
            no_answer: true,
            ..
        }
    ));
    assert_eq!(agent.successively_no_answers, 1);
    assert_eq!(
        node.store.missed_attempts(),
        vec![(5, attempt.id(), CALL_CAUSE_NO_ANSWER.to_string())]
    );
    assert!(node.connection.hangups().is_empty());

    // cool-down over, the agent is offered the same attempt again
    assert!(node.store.expire_agent_deadline(5));
    node.connection
        .next_call(Duration::from_secs(3))
        .await
        .expect("second agent leg");

    wait_until("attempt abandoned", || {
        queue_manager.get_attempt(attempt.id()).is_none()
    })
    .await;
    assert_eq!(attempt.no_answers(), 2);
    assert_eq!(attempt.result().as_deref(), Some(MEMBER_CAUSE_ABANDONED));
    assert!(
        node.connection
            .hangups()
            .contains(&("member-1".to_string(), CALL_CAUSE_NO_ANSWER.to_string()))
    );
    assert_eq!(node.store.missed_attempts().len(), 2);
    assert_eq!(queue_manager.outstanding(), 0);

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_stopped_resource_reroutes_member_dial() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    let mut queue = QueueSettings::new(1, "sales", QueueType::Progressive, 1);
    queue.resource_ids = vec![10, 11];
    store.add_queue(queue);
    let mut fragile = OutboundResourceConfig::new(10, "fragile", 1);
    fragile.max_successively_errors = 1;
    store.add_resource(fragile);
    store.add_resource(OutboundResourceConfig::new(11, "backup", 1));
    store.add_member(1, "John", MemberCommunication::new("380501234567"));

    let mut node = build_node(store).await?;
    let mut observer = node.bus.subscribe();
    node.connection
        .push_outcome(MockOutcome::Error("gateway down".to_string()));
    node.server.start().await?;

    let call = node
        .connection
        .next_call(Duration::from_secs(3))
        .await
        .expect("member leg through the backup resource");
    assert_eq!(node.connection.originated().len(), 1);
    assert_eq!(
        call.request.variables.get(QUEUE_RESOURCE_ID_FIELD).map(String::as_str),
        Some("11")
    );

    let queue_manager = node.server.queue_manager().clone();
    let attempt = queue_manager
        .get_attempt(attempt_id_of(&call))
        .expect("attempt held by the node");
    wait_until("member parked", || attempt.state() == MemberState::WaitAgent).await;
    assert_eq!(attempt.resource().map(|resource| resource.id()), Some(11));

    let resources = queue_manager.resource_manager();
    assert!(matches!(
        resources.get(10, 0).await,
        Err(DialerError::CircuitOpen { id: 10, .. })
    ));
    assert!(resources.get(11, 0).await.is_ok());
    let stopped = node.store.resource(10).expect("resource exists");
    assert!(!stopped.enabled);
    assert_eq!(stopped.successively_errors, 1);

    let mut stop_events = Vec::new();
    while let Ok(message) = observer.try_recv() {
        if let BusMessage::ResourceStopped { resource_id, .. } = message {
            stop_events.push(resource_id);
        }
    }
    assert_eq!(stop_events, vec![10]);

    node.bus
        .publish_call_event(CallEvent::hangup(call.id.clone(), "NORMAL_CLEARING"))
        .await?;
    wait_until("attempt released", || {
        queue_manager.get_attempt(attempt.id()).is_none()
    })
    .await;

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_processing_closed_by_reported_result() -> Result<()> {
    let (store, member_id) = processing_store();
    let mut node = build_node(store).await?;
    let attempt = attempt_in_processing(&mut node).await?;
    let queue_manager = node.server.queue_manager().clone();
    let member_api = node.server.member_api();

    let renewal = member_api.renewal(1, attempt.id(), 60).await?;
    assert_eq!(renewal.attempt_id, attempt.id());
    assert_eq!(renewal.queue_id, 1);
    assert!(renewal.timeout >= renewal.timestamp + 60_000);
    assert!(queue_manager.get_attempt(attempt.id()).is_some());
    assert_eq!(attempt.state(), MemberState::Processing);

    let reported = member_api
        .attempt_result(
            attempt.id(),
            &AttemptReportResult {
                success: true,
                status: MEMBER_CAUSE_SUCCESSFUL.to_string(),
                description: "sale closed".to_string(),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(reported.queue_id, 1);
    assert_eq!(reported.agent_id, Some(5));

    assert!(queue_manager.get_attempt(attempt.id()).is_none());
    assert_eq!(attempt.result().as_deref(), Some(MEMBER_CAUSE_SUCCESSFUL));
    assert_eq!(
        node.store.member_stop_cause(member_id).as_deref(),
        Some(MEMBER_CAUSE_SUCCESSFUL)
    );
    assert_eq!(
        node.store.agent(5).map(|agent| agent.state),
        Some(AgentState::Waiting)
    );

    // the window is gone, a second report is refused
    assert!(
        member_api
            .attempt_result(
                attempt.id(),
                &AttemptReportResult {
                    status: MEMBER_CAUSE_SUCCESSFUL.to_string(),
                    ..Default::default()
                },
            )
            .await
            .is_err()
    );

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_processing_deadline_closes_attempt() -> Result<()> {
    let (store, member_id) = processing_store();
    let mut node = build_node(store).await?;
    let attempt = attempt_in_processing(&mut node).await?;
    let queue_manager = node.server.queue_manager().clone();

    assert!(node.store.expire_processing(attempt.id()));
    wait_until("attempt timed out", || {
        queue_manager.get_attempt(attempt.id()).is_none()
    })
    .await;
    assert_eq!(attempt.result().as_deref(), Some(MEMBER_CAUSE_TIMEOUT));
    assert_eq!(attempt.state(), MemberState::Leaving);
    assert_eq!(
        node.store.member_stop_cause(member_id).as_deref(),
        Some(MEMBER_CAUSE_TIMEOUT)
    );
    assert_eq!(node.store.member_attempts(member_id), 1);
    assert_eq!(queue_manager.outstanding(), 0);

    node.server.stop().await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_processing_deadline_with_unresolvable_queue_releases_attempt() -> Result<()> {
    let (store, _member_id) = processing_store();
    let mut node = build_node(store).await?;
    let mut observer = node.bus.subscribe();
    let attempt = attempt_in_processing(&mut node).await?;
    let queue_manager = node.server.queue_manager().clone();

    node.store.add_queue(processing_queue(false));
    queue_manager.remove_queue_from_cache(1);
    assert!(queue_manager.get_queue(1, 0).await.is_err());
    queue_lengths(&mut observer, 1);

    assert!(node.store.expire_processing(attempt.id()));
    wait_until("attempt dropped", || {
        queue_manager.get_attempt(attempt.id()).is_none()
    })
    .await;
    assert_eq!(attempt.result().as_deref(), Some(MEMBER_CAUSE_TIMEOUT));
    assert_eq!(queue_manager.outstanding(), 0);
    assert_eq!(queue_manager.queue_length(1), 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(queue_lengths(&mut observer, 1).is_empty());

    tokio::time::timeout(Duration::from_secs(2), node.server.stop()).await??;
    Ok(())
}

#[tokio::test]
async fn test_admission_refused_at_capacity() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(QueueSettings::new(7, "support", QueueType::Inbound, 100));
    let mut config = test_config();
    config.cache.max_attempts = 1;
    let node = build_node_with(store, config).await?;
    let queue_manager = node.server.queue_manager();

    let member = |id: i64| MemberAttempt {
        id,
        queue_id: 7,
        queue_updated_at: 100,
        name: format!("member-{}", id),
        ..Default::default()
    };

    let first = queue_manager.route_member(member(1)).await?;
    assert!(!queue_manager.has_capacity());

    let refused = queue_manager.route_member(member(2)).await;
    assert!(matches!(refused, Err(DialerError::Capacity(_))));
    assert!(queue_manager.get_attempt(2).is_none());

    // the held attempt is still the live one
    let again = queue_manager.route_member(member(1)).await?;
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(queue_manager.attempts_count(), 1);
    assert_eq!(queue_manager.outstanding(), 1);
    assert_eq!(queue_manager.queue_length(7), 1);
    Ok(())
}

#[tokio::test]
async fn test_admission_refused_after_stop() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(QueueSettings::new(7, "support", QueueType::Inbound, 100));
    let node = build_node(store).await?;
    let queue_manager = node.server.queue_manager();

    queue_manager.stop().await;
    let refused = queue_manager
        .route_member(MemberAttempt {
            id: 1,
            queue_id: 7,
            queue_updated_at: 100,
            ..Default::default()
        })
        .await;

    match refused {
        Err(err) => {
            assert!(err.is_refused());
            assert!(matches!(err, DialerError::Shutdown(_)));
        }
        Ok(_) => panic!("attempt admitted by a stopping node"),
    }
    assert_eq!(queue_manager.outstanding(), 0);
    assert_eq!(queue_manager.attempts_count(), 0);
    assert_eq!(queue_manager.queue_length(7), 0);
    Ok(())
}

#[tokio::test]
#[serial]
async fn test_timed_out_member_leaves_with_timeout_result() -> Result<()> {
    let store = Arc::new(MemoryStore::new());
    store.add_queue(QueueSettings::new(7, "support", QueueType::Inbound, 100));
    let mut node = build_node(store).await?;
    node.server.start().await?;
    let queue_manager = node.server.queue_manager().clone();

    let attempt = queue_manager
        .route_member(MemberAttempt {
            id: 77,
            queue_id: 7,
            queue_updated_at: 100,
            result: Some(MEMBER_CAUSE_TIMEOUT.to_string()),
            ..Default::default()
        })
        .await?;
    wait_until("attempt released", || {
        queue_manager.get_attempt(77).is_none()
    })
    .await;
    assert_eq!(attempt.result().as_deref(), Some(MEMBER_CAUSE_TIMEOUT));
    assert_eq!(queue_manager.outstanding(), 0);

    node.server.stop().await?;
    Ok(())
}
