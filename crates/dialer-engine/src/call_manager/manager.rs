use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{Call, CallCommands, CallDirection, CallState, ConnectionPool};
use crate::cache::ExpiringCache;
use crate::config::DialerConfig;
use crate::error::{DialerError, Result};
use crate::model::{
    CallEvent, CallEventKind, CallRequest, InboundCallInfo, QUEUE_NODE_ID_FIELD,
    QUEUE_RESULT_FIELD, MEMBER_CAUSE_ABANDONED,
};
use crate::mq::MessageBus;

/// Events kept for a call id the cache does not know yet
const PENDING_EVENTS_TTL: Duration = Duration::from_secs(60);

/// Owns the control plane connections and the live call legs of this node
pub struct CallManager {
    node_id: String,
    pool: ConnectionPool,
    calls: ExpiringCache<String, Arc<Call>>,
    // events that raced ahead of `new_call` returning the call id
    pending: Mutex<ExpiringCache<String, Arc<Mutex<Vec<CallEvent>>>>>,
    bus: Arc<dyn MessageBus>,
    recheck_interval: Duration,
    inbound_tx: mpsc::Sender<InboundCallInfo>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundCallInfo>>>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CallManager {
    pub fn new(config: &DialerConfig, bus: Arc<dyn MessageBus>) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.dialing.input_buffer);
        Arc::new(Self {
            node_id: config.general.node_id.clone(),
            pool: ConnectionPool::new(),
            calls: ExpiringCache::new("call", config.cache.max_calls, config.cache.expire()),
            pending: Mutex::new(ExpiringCache::new(
                "call_pending",
                config.cache.max_calls,
                PENDING_EVENTS_TTL,
            )),
            bus,
            recheck_interval: config.telephony.recheck_interval(),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Register the connections and start consuming call events
    ///
    /// Fails when none of the connections answers its version query.
    pub async fn start(self: &Arc<Self>, connections: Vec<Arc<dyn CallCommands>>) -> Result<()> {
        debug!("starting call manager service");

        for connection in connections {
            self.register_connection(connection).await;
        }

        if self.pool.is_empty() {
            return Err(DialerError::telephony(
                "no reachable call control connection",
            ));
        }

        let mut handles = self.handles.lock();

        if let Some(mut events) = self.bus.take_call_events() {
            let manager = Arc::clone(self);
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("call manager received stop signal");
                            break;
                        }
                        event = events.recv() => match event {
                            Some(event) => manager.handle_call_event(event).await,
                            None => break,
                        },
                    }
                }
                debug!("stopped call manager");
            }));
        } else {
            warn!("call events already consumed by another manager");
        }

        let manager = Arc::clone(self);
        let cancel = self.cancel.clone();
        let period = self.recheck_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.pool.recheck_connections().await;
                        if removed > 0 && manager.pool.is_empty() {
                            error!("all call control connections are down");
                        }
                    }
                }
            }
        }));

        Ok(())
    }

    pub async fn stop(&self) {
        debug!("call manager stopping");
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn register_connection(&self, connection: Arc<dyn CallCommands>) {
        let version = match connection.server_version().await {
            Ok(version) => version,
            Err(e) => {
                error!("connection {} get version error: {}", connection.id(), e);
                return;
            }
        };

        let sps = match connection.remote_sps().await {
            Ok(sps) => sps,
            Err(e) => {
                error!("connection {} get SPS error: {}", connection.id(), e);
                return;
            }
        };

        info!(
            "register connection {} [{}] [sps={}]",
            connection.id(),
            version,
            sps
        );
        self.pool.append(connection);
    }

    /// Add a connection discovered after start
    pub async fn add_connection(&self, connection: Arc<dyn CallCommands>) -> bool {
        if self.pool.get_by_id(connection.id()).is_ok() {
            return false;
        }
        self.register_connection(connection).await;
        true
    }

    pub fn count_connections(&self) -> usize {
        self.pool.len()
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }

    /// Originate a call through a round-robin connection
    ///
    /// A call the node hung up immediately is returned already in
    /// `Hangup` and is not cached.
    pub async fn new_call(&self, request: CallRequest) -> Result<Arc<Call>> {
        let connection = self.pool.get_round_robin()?;
        let (id, cause) = connection.new_call(&request).await?;
        let call = Arc::new(Call::new(
            id,
            connection.id(),
            CallDirection::Outbound,
            Some(request),
        ));

        if let Some(cause) = cause {
            debug!("[{}] call {} hangup at start: {}", call.app_id(), call.id(), cause);
            call.set_hangup_cause(&cause);
            return Ok(call);
        }

        call.set_state(CallState::Accept);
        self.save_to_cache(call.clone());
        debug!("[{}] call {} init request", call.app_id(), call.id());
        Ok(call)
    }

    /// Join a parked inbound call to a queue on the node that holds it
    pub async fn inbound_call(&self, info: &InboundCallInfo, ringtone: &str) -> Result<Arc<Call>> {
        let connection = self.pool.get_by_id(&info.app_id)?;
        let variables = HashMap::from([
            (QUEUE_NODE_ID_FIELD.to_string(), self.node_id.clone()),
            (
                QUEUE_RESULT_FIELD.to_string(),
                MEMBER_CAUSE_ABANDONED.to_string(),
            ),
        ]);
        connection.join_queue(&info.id, ringtone, variables).await?;

        let call = match self.calls.get(&info.id) {
            Some(call) => call,
            None => {
                let call = Arc::new(Call::new(
                    info.id.clone(),
                    info.app_id.clone(),
                    CallDirection::Inbound,
                    None,
                ));
                call.set_state(CallState::Accept);
                self.save_to_cache(call.clone());
                call
            }
        };
        Ok(call)
    }

    pub fn get_call(&self, id: &str) -> Option<Arc<Call>> {
        self.calls.get(&id.to_string())
    }

    /// Ask the node holding the call to hang it up
    pub async fn hangup(&self, call: &Call, cause: &str) -> Result<()> {
        if call.is_hangup() {
            return Ok(());
        }
        let connection = self.pool.get_by_id(call.app_id())?;
        connection.hangup_call(call.id(), cause).await
    }

    /// Parked inbound calls waiting for distribution; `None` once taken
    pub fn take_inbound_calls(&self) -> Option<mpsc::Receiver<InboundCallInfo>> {
        self.inbound_rx.lock().take()
    }

    pub async fn handle_call_event(&self, event: CallEvent) {
        let call = {
            let pending = self.pending.lock();
            match self.calls.get(&event.id) {
                Some(call) => Some(call),
                None if event.event == CallEventKind::Park => None,
                None => {
                    let (events, _) = pending
                        .get_or_insert_with(event.id.clone(), || Arc::new(Mutex::new(Vec::new())));
                    trace!("call {} not cached yet, keep {:?}", event.id, event.event);
                    events.lock().push(event);
                    return;
                }
            }
        };

        match call {
            Some(call) => self.apply_to_call(&call, &event),
            None => {
                let Some(info) = InboundCallInfo::from_park_event(&event) else {
                    trace!("call {} park without queue", event.id);
                    return;
                };
                debug!(
                    "[{}] call {} parked for QueueId={}",
                    info.app_id, info.id, info.queue_id
                );
                if let Err(e) = self.inbound_tx.send(info).await {
                    error!("inbound call {} dropped: {}", event.id, e);
                }
            }
        }
    }

    fn apply_to_call(&self, call: &Call, event: &CallEvent) {
        if call.apply_event(event) {
            trace!("[{}] call {} -> {:?}", call.app_id(), call.id(), call.state());
        }
        if call.is_hangup() {
            self.remove_from_cache(call);
        }
    }

    fn save_to_cache(&self, call: Arc<Call>) {
        let pending = self.pending.lock();
        self.calls.insert(call.id().to_string(), call.clone());
        let early = pending.remove(&call.id().to_string());
        drop(pending);

        if let Some(events) = early {
            let events: Vec<CallEvent> = events.lock().drain(..).collect();
            for event in events {
                self.apply_to_call(&call, &event);
            }
        }
    }

    fn remove_from_cache(&self, call: &Call) {
        if self.calls.remove(&call.id().to_string()).is_some() {
            debug!("[{}] call {} remove from store", call.app_id(), call.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_manager::testing::{MockCallCommands, MockOutcome};
    use crate::model::QUEUE_ID_FIELD;
    use crate::mq::LocalBus;

    async fn started() -> (Arc<LocalBus>, Arc<MockCallCommands>, Arc<CallManager>) {
        let bus = LocalBus::new(16);
        let connection = MockCallCommands::new("fs1");
        let manager = CallManager::new(&DialerConfig::default(), bus.clone());
        manager.start(vec![connection.clone()]).await.unwrap();
        (bus, connection, manager)
    }

    #[tokio::test]
    async fn test_start_without_connections_fails() {
        let bus = LocalBus::new(4);
        let broken = MockCallCommands::new("fs1");
        broken.set_healthy(false);
        let manager = CallManager::new(&DialerConfig::default(), bus);

        let err = manager.start(vec![broken]).await.unwrap_err();
        assert!(matches!(err, DialerError::Telephony(_)));
    }

    #[tokio::test]
    async fn test_immediate_hangup_not_cached() {
        let (_, connection, manager) = started().await;
        connection.push_outcome(MockOutcome::Hangup("USER_BUSY".to_string()));

        let call = manager.new_call(CallRequest::default()).await.unwrap();
        assert!(call.is_hangup());
        assert_eq!(call.hangup_cause().as_deref(), Some("USER_BUSY"));
        assert_eq!(manager.active_calls(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_hangup_event_closes_call() {
        let (bus, _, manager) = started().await;
        let call = manager.new_call(CallRequest::default()).await.unwrap();
        assert_eq!(call.state(), CallState::Accept);
        assert_eq!(manager.active_calls(), 1);

        bus.publish_call_event(CallEvent::hangup(call.id(), "NORMAL_CLEARING"))
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), call.wait_for_hangup())
            .await
            .unwrap();
        assert_eq!(call.hangup_cause().as_deref(), Some("NORMAL_CLEARING"));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_event_before_call_is_cached() {
        let bus = LocalBus::new(4);
        let manager = CallManager::new(&DialerConfig::default(), bus);
        let call = Arc::new(Call::new("c1", "fs1", CallDirection::Outbound, None));

        manager
            .handle_call_event(CallEvent::new("c1", CallEventKind::Bridge))
            .await;
        manager.save_to_cache(call.clone());
        assert_eq!(call.state(), CallState::Bridge);
    }

    #[tokio::test]
    async fn test_park_with_queue_forwarded() {
        let (bus, _, manager) = started().await;
        let mut inbound = manager.take_inbound_calls().unwrap();
        assert!(manager.take_inbound_calls().is_none());

        let mut park = CallEvent::new("in-1", CallEventKind::Park).with_variable(QUEUE_ID_FIELD, "7");
        park.app_id = "fs1".to_string();
        bus.publish_call_event(park).await.unwrap();

        let info = tokio::time::timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.queue_id, 7);

        let call = manager.inbound_call(&info, "moh").await.unwrap();
        assert_eq!(call.direction(), CallDirection::Inbound);
        assert!(manager.get_call("in-1").is_some());
        manager.stop().await;
    }
}
