use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::error::{DialerError, Result};
use crate::model::{
    AttemptReportResult, AttemptReported, InboundCallInfo, MemberState, RenewalProcessing,
    get_millis,
};
use crate::queue::{Attempt, AttemptEvent, QueueManager};

/// Progress of a caller waiting in a queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    Bridged {
        attempt_id: i64,
        agent_id: Option<i64>,
        timestamp: i64,
    },
    Leaving {
        attempt_id: i64,
        result: String,
        timestamp: i64,
    },
}

#[derive(Clone)]
pub struct MemberApi {
    queue_manager: Arc<QueueManager>,
}

impl MemberApi {
    pub fn new(queue_manager: Arc<QueueManager>) -> Self {
        Self { queue_manager }
    }

    /// Put a parked call into its queue
    ///
    /// The receiver yields `Bridged` when an agent is connected and ends
    /// after the single `Leaving` event.
    pub async fn call_join_to_queue(
        &self,
        info: &InboundCallInfo,
    ) -> Result<(Arc<Attempt>, mpsc::Receiver<QueueEvent>)> {
        let attempt = self.queue_manager.distribute_call(info).await?;
        let events = attempt.subscribe();
        let (tx, rx) = mpsc::channel(8);

        if attempt.is_terminal() {
            let _ = tx.send(leaving_event(&attempt)).await;
            return Ok((attempt, rx));
        }

        tokio::spawn(forward_events(attempt.clone(), events, tx));
        Ok((attempt, rx))
    }

    pub async fn chat_join_to_queue(&self, _queue_id: i64, _conversation_id: &str) -> Result<()> {
        Err(DialerError::NotImplemented("chat queues".to_string()))
    }

    pub async fn direct_agent_to_member(
        &self,
        member_id: i64,
        communication_id: i64,
        agent_id: i64,
    ) -> Result<i64> {
        let attempt = self
            .queue_manager
            .distribute_direct_member(member_id, communication_id, agent_id)
            .await?;
        Ok(attempt.id())
    }

    pub async fn attempt_result(
        &self,
        attempt_id: i64,
        result: &AttemptReportResult,
    ) -> Result<AttemptReported> {
        if result.status.is_empty() {
            return Err(DialerError::invalid_input("attempt result status is empty"));
        }
        self.queue_manager.reporting_attempt(attempt_id, result).await
    }

    pub async fn renewal(
        &self,
        domain_id: i64,
        attempt_id: i64,
        renewal_sec: u32,
    ) -> Result<RenewalProcessing> {
        if renewal_sec == 0 {
            return Err(DialerError::invalid_input("renewal must be positive"));
        }
        self.queue_manager
            .renewal_processing(domain_id, attempt_id, renewal_sec)
            .await
    }
}

fn leaving_event(attempt: &Attempt) -> QueueEvent {
    QueueEvent::Leaving {
        attempt_id: attempt.id(),
        result: attempt.result().unwrap_or_default(),
        timestamp: get_millis(),
    }
}

async fn forward_events(
    attempt: Arc<Attempt>,
    mut events: broadcast::Receiver<AttemptEvent>,
    tx: mpsc::Sender<QueueEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(AttemptEvent::State(MemberState::Bridged)) => QueueEvent::Bridged {
                attempt_id: attempt.id(),
                agent_id: attempt.agent().map(|agent| agent.id()),
                timestamp: get_millis(),
            },
            Ok(AttemptEvent::State(_)) => continue,
            Ok(AttemptEvent::Leaving { result }) => QueueEvent::Leaving {
                attempt_id: attempt.id(),
                result,
                timestamp: get_millis(),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("AttemptId={} queue events lagged by {}", attempt.id(), skipped);
                if attempt.is_terminal() {
                    leaving_event(&attempt)
                } else {
                    continue;
                }
            }
            Err(broadcast::error::RecvError::Closed) => leaving_event(&attempt),
        };

        let last = matches!(event, QueueEvent::Leaving { .. });
        if tx.send(event).await.is_err() {
            debug!("AttemptId={} queue events receiver dropped", attempt.id());
            return;
        }
        if last {
            return;
        }
    }
}
