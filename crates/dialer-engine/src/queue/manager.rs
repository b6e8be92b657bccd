use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Attempt, QueueObject, new_queue};
use crate::agent::{Agent, AgentManager};
use crate::cache::ExpiringCache;
use crate::call_manager::CallManager;
use crate::config::DialerConfig;
use crate::error::{DialerError, Result};
use crate::model::{
    AttemptReportResult, AttemptReported, AttemptTimeout, InboundCallInfo, MEMBER_CAUSE_BARRED,
    MEMBER_CAUSE_QUEUE_NOT_IMPLEMENT, MEMBER_CAUSE_RESOURCE_NOT_FOUND, MEMBER_CAUSE_TIMEOUT,
    MemberAttempt, QueueEventCount, QueueSettings, RenewalProcessing, get_millis,
};
use crate::mq::{AttemptBusEvent, MessageBus};
use crate::resource::{Resource, ResourceManager};
use crate::store::Store;

/// Admission and lifecycle owner of every attempt on this node
///
/// Attempts enter through [`QueueManager::route_member`] (at most once per
/// attempt id), are dispatched to their queue by a single loop and leave
/// through [`QueueManager::leaving_member`]. An outstanding-work counter
/// tracks everything admitted and not yet left; [`QueueManager::stop`]
/// waits for it to drain.
///
/// Live attempts are never evicted. Once `cache.max_attempts` of them are
/// held, new ones are refused until some leave.
pub struct QueueManager {
    node_id: String,
    config: DialerConfig,
    store: Arc<dyn Store>,
    bus: Arc<dyn MessageBus>,
    call_manager: Arc<CallManager>,
    agent_manager: Arc<dyn AgentManager>,
    resource_manager: Arc<ResourceManager>,
    queues: ExpiringCache<i64, Arc<dyn QueueObject>>,
    attempts: DashMap<i64, Arc<Attempt>>,
    queue_lengths: DashMap<i64, usize>,
    max_attempts: usize,
    queue_lock: tokio::sync::Mutex<()>,
    input_tx: mpsc::Sender<Arc<Attempt>>,
    input_rx: Mutex<Option<mpsc::Receiver<Arc<Attempt>>>>,
    outstanding: watch::Sender<usize>,
    // admission decision and the outstanding increment happen under this lock
    accepting: Mutex<bool>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<QueueManager>,
}

impl QueueManager {
    pub fn new(
        config: &DialerConfig,
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        call_manager: Arc<CallManager>,
        agent_manager: Arc<dyn AgentManager>,
        resource_manager: Arc<ResourceManager>,
    ) -> Arc<Self> {
        let (input_tx, input_rx) = mpsc::channel(config.dialing.input_buffer);
        let (outstanding, _) = watch::channel(0);

        Arc::new_cyclic(|weak_self| Self {
            node_id: config.general.node_id.clone(),
            config: config.clone(),
            store,
            bus,
            call_manager,
            agent_manager,
            resource_manager,
            queues: ExpiringCache::new("queue", config.cache.max_queues, config.cache.expire()),
            attempts: DashMap::new(),
            queue_lengths: DashMap::new(),
            max_attempts: config.cache.max_attempts,
            queue_lock: tokio::sync::Mutex::new(()),
            input_tx,
            input_rx: Mutex::new(Some(input_rx)),
            outstanding,
            accepting: Mutex::new(true),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// Spawn the dispatch loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let mut input = self
            .input_rx
            .lock()
            .take()
            .ok_or_else(|| DialerError::internal("queue manager already started"))?;
        let mut inbound = self.call_manager.take_inbound_calls();

        let manager = self.clone();
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            info!("Queue manager started on node {}", manager.node_id);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    Some(attempt) = input.recv() => {
                        manager.distribute_attempt(attempt).await;
                    }
                    Some(info) = recv_inbound(&mut inbound) => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            if let Err(e) = manager.distribute_call(&info).await {
                                error!("[{}] distribute call {} error: {}", info.app_id, info.id, e);
                            }
                        });
                    }
                }
            }
            info!("Queue manager stopped");
        });

        *self.handle.lock() = Some(handle);
        Ok(())
    }

    /// Stop admitting, wait for every admitted attempt to leave, then end
    /// the dispatch loop
    pub async fn stop(&self) {
        *self.accepting.lock() = false;

        let mut outstanding = self.outstanding.subscribe();
        let pending = *outstanding.borrow();
        if pending > 0 {
            info!("Queue manager waiting for {} attempts", pending);
        }
        let _ = outstanding.wait_for(|count| *count == 0).await;

        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Queue manager loop ended abnormally: {}", e);
            }
        }
    }

    /// Admit `member`, or refresh the attempt already held under its id
    pub async fn route_member(&self, member: MemberAttempt) -> Result<Arc<Attempt>> {
        if let Some(attempt) = self.get_attempt(member.id) {
            attempt.set_member(member);
            return Ok(attempt);
        }

        let id = member.id;
        self.admit(id)?;

        let attempt = match self.attempts.entry(id) {
            Entry::Occupied(occupied) => {
                let attempt = occupied.get().clone();
                drop(occupied);
                self.release_slot();
                attempt.set_member(member);
                return Ok(attempt);
            }
            Entry::Vacant(vacant) => {
                let attempt = Arc::new(Attempt::new(member));
                vacant.insert(attempt.clone());
                attempt
            }
        };
        *self.queue_lengths.entry(attempt.queue_id()).or_insert(0) += 1;

        if let Err(e) = self.input_tx.send(attempt.clone()).await {
            self.forget(&attempt);
            return Err(DialerError::shutdown(format!("dispatch loop closed: {}", e)));
        }
        Ok(attempt)
    }

    /// Reserve an outstanding-work slot for a new attempt
    fn admit(&self, id: i64) -> Result<()> {
        let accepting = self.accepting.lock();
        if !*accepting {
            return Err(DialerError::shutdown(format!(
                "attempt {} refused: node is stopping",
                id
            )));
        }
        let held = *self.outstanding.borrow();
        if held >= self.max_attempts {
            return Err(DialerError::capacity(format!(
                "attempt {} refused: {} attempts held",
                id, self.max_attempts
            )));
        }
        self.outstanding.send_modify(|count| *count += 1);
        Ok(())
    }

    fn release_slot(&self) {
        self.outstanding
            .send_modify(|count| *count = count.saturating_sub(1));
    }

    /// Queue object for `id`, rebuilt when `updated_at` is newer
    pub async fn get_queue(&self, id: i64, updated_at: i64) -> Result<Arc<dyn QueueObject>> {
        let _guard = self.queue_lock.lock().await;

        if let Some(queue) = self.queues.get(&id) {
            if !queue.is_expire(updated_at) {
                return Ok(queue);
            }
            debug!("Queue {} [{}] expired", queue.name(), id);
            self.queues.remove(&id);
        }

        let settings = self.store.queues().get_queue(id).await?;
        if !settings.enabled {
            return Err(DialerError::not_found(format!("queue {} is disabled", id)));
        }
        let queue = new_queue(self.weak_self.clone(), settings);
        debug!("Queue {} [{}] {} loaded", queue.name(), id, queue.type_name());
        self.queues.insert(id, queue.clone());
        Ok(queue)
    }

    pub fn remove_queue_from_cache(&self, id: i64) {
        if self.queues.remove(&id).is_some() {
            debug!("Remove queue from cache QueueId={}", id);
        }
    }

    async fn distribute_attempt(&self, attempt: Arc<Attempt>) {
        let queue = match self
            .get_queue(attempt.queue_id(), attempt.queue_updated_at())
            .await
        {
            Ok(queue) => queue,
            Err(e) => {
                error!("AttemptId={} queue {} error: {}", attempt.id(), attempt.queue_id(), e);
                if let Err(e) = self
                    .store
                    .members()
                    .set_attempt_result(attempt.id(), MEMBER_CAUSE_QUEUE_NOT_IMPLEMENT, 0, None, 1, 0)
                    .await
                {
                    error!("AttemptId={} set result error: {}", attempt.id(), e);
                }
                attempt.set_result(MEMBER_CAUSE_QUEUE_NOT_IMPLEMENT);
                self.forget(&attempt);
                return;
            }
        };
        let settings = queue.settings();

        if attempt.is_barred() {
            if let Err(e) = self.store.members().set_barred(attempt.id()).await {
                error!("AttemptId={} set barred error: {}", attempt.id(), e);
            }
            attempt.set_result(MEMBER_CAUSE_BARRED);
            self.leaving_member(&attempt, settings).await;
            return;
        }

        if attempt.is_timeout() {
            let result = attempt
                .result()
                .unwrap_or_else(|| MEMBER_CAUSE_TIMEOUT.to_string());
            attempt.set_result(result);
            self.leaving_member(&attempt, settings).await;
            return;
        }

        if settings.queue_type.uses_resource() {
            match self.resolve_resource(&attempt, settings).await {
                Some(resource) => attempt.set_resource(Some(resource)),
                None => {
                    attempt.log("no resource available");
                    if let Err(e) = self
                        .store
                        .members()
                        .set_attempt_result(
                            attempt.id(),
                            MEMBER_CAUSE_RESOURCE_NOT_FOUND,
                            0,
                            None,
                            settings.max_attempts,
                            settings.wait_between_retries,
                        )
                        .await
                    {
                        error!("AttemptId={} set result error: {}", attempt.id(), e);
                    }
                    attempt.set_result(MEMBER_CAUSE_RESOURCE_NOT_FOUND);
                    self.leaving_member(&attempt, settings).await;
                    return;
                }
            }
        }

        queue.join_attempt(attempt.clone()).await;
        self.notify_queue_length(settings).await;
        debug!(
            "AttemptId={} joined {} queue {} [{}]",
            attempt.id(),
            queue.type_name(),
            queue.name(),
            queue.id()
        );
    }

    /// Bound resource of the attempt, or another one of the queue when it
    /// cannot be used
    async fn resolve_resource(
        &self,
        attempt: &Attempt,
        settings: &QueueSettings,
    ) -> Option<Arc<Resource>> {
        let exclude = match attempt.resource_id() {
            Some(id) => match self
                .resource_manager
                .get(id, attempt.resource_updated_at().unwrap_or_default())
                .await
            {
                Ok(resource) => return Some(resource),
                Err(e) => {
                    warn!("AttemptId={} ResourceId={} unavailable: {}", attempt.id(), id, e);
                    Some(id)
                }
            },
            None => None,
        };

        self.resource_manager
            .select(&settings.resource_ids, settings.resource_strategy, exclude)
            .await
    }

    /// Drop the attempt from the working set, `false` when already gone
    fn forget(&self, attempt: &Attempt) -> bool {
        let removed = self
            .attempts
            .remove_if(&attempt.id(), |_, held| std::ptr::eq(Arc::as_ptr(held), attempt));
        if removed.is_none() {
            return false;
        }
        if let Some(mut count) = self.queue_lengths.get_mut(&attempt.queue_id()) {
            *count = count.saturating_sub(1);
        }
        self.release_slot();
        true
    }

    /// Release a closed attempt from the node
    ///
    /// Only the first call per attempt has an effect.
    pub async fn leaving_member(&self, attempt: &Attempt, settings: &QueueSettings) {
        let agent_id = attempt.agent().map(|agent| agent.id());
        attempt.clear_agent();
        if !self.forget(attempt) {
            return;
        }

        self.notify_queue_length(settings).await;

        let event = AttemptBusEvent {
            attempt_id: attempt.id(),
            member_id: attempt.member_id(),
            queue_id: settings.id,
            status: attempt.result().unwrap_or_else(|| attempt.state().to_string()),
            agent_id,
            timestamp: get_millis(),
        };
        if let Err(e) = self.bus.send_attempt_event(&event).await {
            warn!("AttemptId={} send event error: {}", attempt.id(), e);
        }
        debug!(
            "AttemptId={} left queue {} [{}] with {}",
            attempt.id(),
            settings.name,
            settings.id,
            event.status
        );
    }

    async fn notify_queue_length(&self, settings: &QueueSettings) {
        let event = QueueEventCount {
            queue_id: settings.id,
            domain_id: settings.domain_id,
            count: self.queue_length(settings.id),
        };
        if let Err(e) = self.bus.send_queue_length_changed(&event).await {
            warn!("Queue {} length notification error: {}", settings.id, e);
        }
    }

    /// Feed a dialing error to the circuit breaker, `true` when the
    /// resource got stopped
    pub async fn set_resource_error(
        &self,
        resource: &Resource,
        routing_id: Option<i64>,
        cause: &str,
    ) -> bool {
        match self
            .resource_manager
            .report_error(resource, routing_id, cause)
            .await
        {
            Ok(Some(verdict)) if verdict.is_stopped() => {
                if let Err(e) = self
                    .bus
                    .send_resource_stopped(resource.id(), resource.name(), cause)
                    .await
                {
                    warn!("ResourceId={} stop notification error: {}", resource.id(), e);
                }
                true
            }
            Ok(_) => false,
            Err(e) => {
                error!("ResourceId={} report error failed: {}", resource.id(), e);
                false
            }
        }
    }

    pub async fn set_resource_successful(&self, resource: &Resource) {
        if let Err(e) = self.resource_manager.report_success(resource).await {
            error!("ResourceId={} report success failed: {}", resource.id(), e);
        }
    }

    /// Park an inbound call in its queue and admit the attempt created for it
    pub async fn distribute_call(&self, info: &InboundCallInfo) -> Result<Arc<Attempt>> {
        if !self.is_accepting() {
            return Err(DialerError::shutdown("node is stopping"));
        }

        self.call_manager
            .inbound_call(info, &self.config.telephony.default_ringtone)
            .await?;
        let mut member = self
            .store
            .members()
            .distribute_call_to_queue(&self.node_id, info)
            .await?;
        if member.member_call_id.is_none() {
            member.member_call_id = Some(info.id.clone());
        }
        info!(
            "[{}] call {} distributed to queue {} as AttemptId={}",
            info.app_id, info.id, info.queue_id, member.id
        );
        self.route_member(member).await
    }

    /// Admit a member with an agent already reserved for it
    pub async fn distribute_direct_member(
        &self,
        member_id: i64,
        communication_id: i64,
        agent_id: i64,
    ) -> Result<Arc<Attempt>> {
        let member = self
            .store
            .members()
            .distribute_direct(&self.node_id, member_id, communication_id, agent_id)
            .await?;
        self.route_member(member).await
    }

    /// Apply an externally reported result
    pub async fn reporting_attempt(
        &self,
        attempt_id: i64,
        result: &AttemptReportResult,
    ) -> Result<AttemptReported> {
        let reported = self
            .store
            .members()
            .report_attempt_result(attempt_id, result)
            .await?;

        if let Some(attempt) = self.get_attempt(attempt_id) {
            let agent = attempt.agent();
            attempt.set_result(result.status.clone());
            if let Some(agent) = agent {
                if let Err(e) = self.agent_manager.set_agent_waiting(&agent, false).await {
                    warn!("AgentId={} set waiting error: {}", agent.id(), e);
                }
            }
            match self.get_queue(attempt.queue_id(), 0).await {
                Ok(queue) => self.leaving_member(&attempt, queue.settings()).await,
                Err(e) => {
                    warn!("AttemptId={} queue error: {}", attempt_id, e);
                    self.forget(&attempt);
                }
            }
        }
        Ok(reported)
    }

    pub async fn renewal_processing(
        &self,
        domain_id: i64,
        attempt_id: i64,
        renewal_sec: u32,
    ) -> Result<RenewalProcessing> {
        let renewal = self
            .store
            .members()
            .renewal_processing(domain_id, attempt_id, renewal_sec)
            .await?;
        if let Some(attempt) = self.get_attempt(attempt_id) {
            attempt.log(format!("processing renewed for {} sec", renewal_sec));
        }
        Ok(renewal)
    }

    /// The store closed the attempt on a deadline
    pub async fn apply_attempt_timeout(&self, timeout: AttemptTimeout) {
        let Some(attempt) = self.get_attempt(timeout.attempt_id) else {
            error!("AttemptId={} timeout for an unknown attempt", timeout.attempt_id);
            return;
        };

        let queue = match self.get_queue(attempt.queue_id(), 0).await {
            Ok(queue) => queue,
            Err(e) => {
                error!("AttemptId={} timeout dropped, queue error: {}", attempt.id(), e);
                // the store has already closed the row
                attempt.set_timeout(&timeout);
                self.forget(&attempt);
                return;
            }
        };

        attempt.set_timeout(&timeout);
        self.leaving_member(&attempt, queue.settings()).await;
    }

    /// The store reserved `agent` for `attempt_id`
    pub async fn route_agent_to_attempt(&self, attempt_id: i64, agent: Arc<Agent>) -> Result<()> {
        let attempt = self
            .get_attempt(attempt_id)
            .ok_or_else(|| DialerError::not_found(format!("attempt {}", attempt_id)))?;
        let queue = self.get_queue(attempt.queue_id(), 0).await?;

        if let Err(e) = attempt.distribute_agent(agent.clone()) {
            warn!("AttemptId={} AgentId={} not routed: {}", attempt_id, agent.id(), e);
            return Err(e);
        }
        queue.route_agent_to_attempt(attempt, agent).await;
        Ok(())
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn call_manager(&self) -> &Arc<CallManager> {
        &self.call_manager
    }

    pub fn agent_manager(&self) -> &Arc<dyn AgentManager> {
        &self.agent_manager
    }

    pub fn resource_manager(&self) -> &Arc<ResourceManager> {
        &self.resource_manager
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn get_attempt(&self, id: i64) -> Option<Arc<Attempt>> {
        self.attempts.get(&id).map(|attempt| attempt.value().clone())
    }

    pub fn attempts_count(&self) -> usize {
        self.attempts.len()
    }

    /// Admitted attempts that have not left yet
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Live attempts of one queue on this node
    pub fn queue_length(&self, queue_id: i64) -> usize {
        self.queue_lengths
            .get(&queue_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn has_capacity(&self) -> bool {
        *self.outstanding.borrow() < self.max_attempts
    }

    pub fn is_accepting(&self) -> bool {
        *self.accepting.lock()
    }
}

async fn recv_inbound(
    inbound: &mut Option<mpsc::Receiver<InboundCallInfo>>,
) -> Option<InboundCallInfo> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
