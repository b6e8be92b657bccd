//! Scripted control plane connection for tests and local runs

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::CallCommands;
use crate::error::{DialerError, Result};
use crate::model::CallRequest;

/// What the next `new_call` does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOutcome {
    /// Call is created and stays up until a hangup event arrives
    Answer,
    /// Call is created and hung up at once with the cause
    Hangup(String),
    /// Transport failure
    Error(String),
}

#[derive(Debug, Clone)]
pub struct OriginatedCall {
    pub id: String,
    pub request: CallRequest,
}

pub struct MockCallCommands {
    id: String,
    healthy: AtomicBool,
    script: Mutex<VecDeque<MockOutcome>>,
    originated: Mutex<Vec<OriginatedCall>>,
    hangups: Mutex<Vec<(String, String)>>,
    joined: Mutex<Vec<(String, String, HashMap<String, String>)>>,
    notify_tx: mpsc::UnboundedSender<OriginatedCall>,
    notify_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OriginatedCall>>,
}

impl MockCallCommands {
    pub fn new<S: Into<String>>(id: S) -> Arc<Self> {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: id.into(),
            healthy: AtomicBool::new(true),
            script: Mutex::new(VecDeque::new()),
            originated: Mutex::new(Vec::new()),
            hangups: Mutex::new(Vec::new()),
            joined: Mutex::new(Vec::new()),
            notify_tx,
            notify_rx: tokio::sync::Mutex::new(notify_rx),
        })
    }

    /// Queue the outcome of a future `new_call`; unscripted calls answer
    pub fn push_outcome(&self, outcome: MockOutcome) {
        self.script.lock().push_back(outcome);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Wait for the next originated call
    pub async fn next_call(&self, timeout: Duration) -> Option<OriginatedCall> {
        let mut rx = self.notify_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    pub fn originated(&self) -> Vec<OriginatedCall> {
        self.originated.lock().clone()
    }

    pub fn hangups(&self) -> Vec<(String, String)> {
        self.hangups.lock().clone()
    }

    pub fn joined(&self) -> Vec<(String, String, HashMap<String, String>)> {
        self.joined.lock().clone()
    }
}

#[async_trait]
impl CallCommands for MockCallCommands {
    fn id(&self) -> &str {
        &self.id
    }

    async fn new_call(&self, request: &CallRequest) -> Result<(String, Option<String>)> {
        let outcome = self
            .script
            .lock()
            .pop_front()
            .unwrap_or(MockOutcome::Answer);

        if let MockOutcome::Error(message) = outcome {
            return Err(DialerError::telephony(message));
        }

        let call = OriginatedCall {
            id: uuid::Uuid::new_v4().to_string(),
            request: request.clone(),
        };
        self.originated.lock().push(call.clone());
        let _ = self.notify_tx.send(call.clone());

        match outcome {
            MockOutcome::Hangup(cause) => Ok((call.id, Some(cause))),
            _ => Ok((call.id, None)),
        }
    }

    async fn hangup_call(&self, id: &str, cause: &str) -> Result<()> {
        self.hangups.lock().push((id.to_string(), cause.to_string()));
        Ok(())
    }

    async fn join_queue(
        &self,
        id: &str,
        ringtone: &str,
        variables: HashMap<String, String>,
    ) -> Result<()> {
        self.joined
            .lock()
            .push((id.to_string(), ringtone.to_string(), variables));
        Ok(())
    }

    async fn server_version(&self) -> Result<String> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok("mock-1.0".to_string())
        } else {
            Err(DialerError::telephony("connection refused"))
        }
    }

    async fn remote_sps(&self) -> Result<u32> {
        Ok(100)
    }
}
