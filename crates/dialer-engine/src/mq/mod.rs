//! Message bus seam
//!
//! Inbound: call lifecycle events from the telephony control plane, handed
//! over once to the call manager. Outbound: queue length, agent channel,
//! attempt and resource notifications for observers.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::trace;

use crate::error::{DialerError, Result};
use crate::model::{CallEvent, QueueEventCount};

/// Agent channel change published for observers (dashboards, agent UI)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentChannelEvent {
    pub agent_id: i64,
    pub user_id: i64,
    pub domain_id: i64,
    pub channel: String,
    pub state: String,
    pub attempt_id: Option<i64>,
    pub queue_id: Option<i64>,
    pub timestamp: i64,
}

/// Attempt lifecycle notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptBusEvent {
    pub attempt_id: i64,
    pub member_id: Option<i64>,
    pub queue_id: i64,
    pub status: String,
    pub agent_id: Option<i64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusMessage {
    QueueLength(QueueEventCount),
    AgentChannel(AgentChannelEvent),
    Attempt(AttemptBusEvent),
    ResourceStopped {
        resource_id: i64,
        name: String,
        cause: String,
    },
}

impl BusMessage {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn send_queue_length_changed(&self, event: &QueueEventCount) -> Result<()>;

    async fn send_agent_channel_event(&self, event: &AgentChannelEvent) -> Result<()>;

    async fn send_attempt_event(&self, event: &AttemptBusEvent) -> Result<()>;

    async fn send_resource_stopped(&self, resource_id: i64, name: &str, cause: &str)
    -> Result<()>;

    /// Receiver of call events; `None` once taken
    fn take_call_events(&self) -> Option<mpsc::Receiver<CallEvent>>;
}

/// In-process bus
///
/// Observers subscribe to a broadcast channel, a message published without
/// subscribers is dropped. Call events go through an mpsc channel that the
/// call manager drains.
pub struct LocalBus {
    observers: broadcast::Sender<BusMessage>,
    call_tx: mpsc::Sender<CallEvent>,
    call_rx: Mutex<Option<mpsc::Receiver<CallEvent>>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Arc<Self> {
        let (observers, _) = broadcast::channel(capacity.max(1));
        let (call_tx, call_rx) = mpsc::channel(capacity.max(1));
        Arc::new(Self {
            observers,
            call_tx,
            call_rx: Mutex::new(Some(call_rx)),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusMessage> {
        self.observers.subscribe()
    }

    /// Deliver a call event as the telephony control plane would
    pub async fn publish_call_event(&self, event: CallEvent) -> Result<()> {
        self.call_tx
            .send(event)
            .await
            .map_err(|e| DialerError::bus(format!("call event dropped: {}", e)))
    }

    fn publish(&self, message: BusMessage) -> Result<()> {
        trace!("bus: {:?}", message);
        // no subscriber is not an error
        let _ = self.observers.send(message);
        Ok(())
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn send_queue_length_changed(&self, event: &QueueEventCount) -> Result<()> {
        self.publish(BusMessage::QueueLength(event.clone()))
    }

    async fn send_agent_channel_event(&self, event: &AgentChannelEvent) -> Result<()> {
        self.publish(BusMessage::AgentChannel(event.clone()))
    }

    async fn send_attempt_event(&self, event: &AttemptBusEvent) -> Result<()> {
        self.publish(BusMessage::Attempt(event.clone()))
    }

    async fn send_resource_stopped(
        &self,
        resource_id: i64,
        name: &str,
        cause: &str,
    ) -> Result<()> {
        self.publish(BusMessage::ResourceStopped {
            resource_id,
            name: name.to_string(),
            cause: cause.to_string(),
        })
    }

    fn take_call_events(&self) -> Option<mpsc::Receiver<CallEvent>> {
        self.call_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CallEventKind;

    #[tokio::test]
    async fn test_observers_receive_queue_length() {
        let bus = LocalBus::new(16);
        let mut rx = bus.subscribe();
        bus.send_queue_length_changed(&QueueEventCount {
            queue_id: 7,
            domain_id: 1,
            count: 2,
        })
        .await
        .unwrap();

        match rx.recv().await.unwrap() {
            BusMessage::QueueLength(event) => assert_eq!(event.count, 2),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = LocalBus::new(4);
        bus.send_resource_stopped(1, "trunk", "503").await.unwrap();
    }

    #[tokio::test]
    async fn test_call_events_taken_once() {
        let bus = LocalBus::new(4);
        let mut rx = bus.take_call_events().unwrap();
        assert!(bus.take_call_events().is_none());

        bus.publish_call_event(CallEvent::hangup("c1", "NORMAL_CLEARING"))
            .await
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event, CallEventKind::Hangup);
    }

    #[test]
    fn test_json_tag() {
        let json = BusMessage::ResourceStopped {
            resource_id: 1,
            name: "trunk".to_string(),
            cause: "503".to_string(),
        }
        .to_json()
        .unwrap();
        assert!(json.starts_with(r#"{"event":"resource_stopped""#));
    }
}
