//! In-process store
//!
//! Every operation takes one lock over all tables, so each call is atomic the
//! way a stored procedure of the shared store is. Besides the trait
//! operations it exposes helpers to seed configuration and to inspect rows.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{AgentStore, MemberStore, QueueStore, ResourceStore, Store};
use crate::error::{DialerError, Result};
use crate::model::{
    AgentReservation, AgentSnapshot, AgentState, AttemptLeaving, AttemptReportResult,
    AttemptReported, AttemptTimeout, ChannelTimeout, HistoryAttempt, InboundCallInfo,
    MEMBER_CAUSE_ABANDONED, MEMBER_CAUSE_BARRED, MEMBER_CAUSE_CANCEL, MEMBER_CAUSE_SUCCESSFUL,
    MEMBER_CAUSE_TIMEOUT, MemberAttempt, MemberCommunication, MemberState, MissedAgent,
    OutboundResourceConfig, QueueSettings, QueueType, RenewalProcessing, ResourceErrorResult,
    ResourceStrategy, get_millis,
};

#[derive(Debug, Clone)]
struct MemberRow {
    queue_id: i64,
    name: String,
    communications: Vec<MemberCommunication>,
    variables: HashMap<String, String>,
    attempts: u32,
    next_call_at: i64,
    stop_cause: Option<String>,
    barred: bool,
    active_attempt: Option<i64>,
}

#[derive(Debug, Clone)]
struct AttemptRow {
    attempt: MemberAttempt,
    node_id: String,
    state: MemberState,
    fetched: bool,
    processing_deadline: Option<i64>,
    offering_at: i64,
    answered_at: i64,
    leaving_at: i64,
    agent_call_id: Option<String>,
    display: Option<String>,
    description: Option<String>,
}

impl AttemptRow {
    fn new(attempt: MemberAttempt, node_id: &str, state: MemberState, fetched: bool) -> Self {
        Self {
            attempt,
            node_id: node_id.to_string(),
            state,
            fetched,
            processing_deadline: None,
            offering_at: 0,
            answered_at: 0,
            leaving_at: 0,
            agent_call_id: None,
            display: None,
            description: None,
        }
    }

    fn snapshot(&self) -> MemberAttempt {
        let mut attempt = self.attempt.clone();
        attempt.state = Some(self.state);
        attempt
    }
}

#[derive(Debug, Default)]
struct Tables {
    queues: HashMap<i64, QueueSettings>,
    queue_agents: HashMap<i64, Vec<i64>>,
    resources: HashMap<i64, OutboundResourceConfig>,
    agents: BTreeMap<i64, AgentSnapshot>,
    members: BTreeMap<i64, MemberRow>,
    attempts: BTreeMap<i64, AttemptRow>,
    /// agent id -> attempt id
    reservations: HashMap<i64, i64>,
    pending_reservations: Vec<(String, AgentReservation)>,
    history: Vec<HistoryAttempt>,
    locked: HashSet<i64>,
    missed: Vec<(i64, i64, String)>,
    next_attempt_id: i64,
    next_member_id: i64,
    clock: i64,
}

impl Tables {
    /// Strictly increasing millisecond clock, doubles as version stamp
    fn now(&mut self) -> i64 {
        let now = get_millis().max(self.clock + 1);
        self.clock = now;
        now
    }

    fn attempt_mut(&mut self, attempt_id: i64) -> Result<&mut AttemptRow> {
        self.attempts
            .get_mut(&attempt_id)
            .ok_or_else(|| DialerError::not_found(format!("attempt {}", attempt_id)))
    }

    fn release_reservation_of(&mut self, attempt_id: i64) {
        self.reservations.retain(|_, bound| *bound != attempt_id);
    }

    /// Close an attempt and update its member, returns the member stop cause
    fn close_attempt(
        &mut self,
        attempt_id: i64,
        result: &str,
        state: MemberState,
        stop_member: bool,
        max_attempts: u32,
        next_call_at: i64,
    ) -> Result<Option<String>> {
        let now = self.now();
        let row = self.attempt_mut(attempt_id)?;
        row.state = state;
        row.attempt.result = Some(result.to_string());
        row.leaving_at = now;
        row.processing_deadline = None;
        let member_id = row.attempt.member_id;
        self.release_reservation_of(attempt_id);

        let Some(member) = member_id.and_then(|id| self.members.get_mut(&id)) else {
            return Ok(None);
        };

        member.active_attempt = None;
        member.attempts += 1;
        if stop_member || (max_attempts > 0 && member.attempts >= max_attempts) {
            member.stop_cause = Some(result.to_string());
        } else {
            member.next_call_at = next_call_at;
        }
        Ok(member.stop_cause.clone())
    }

    fn queue_retry_policy(&self, attempt_id: i64) -> (u32, u64) {
        self.attempts
            .get(&attempt_id)
            .and_then(|row| self.queues.get(&row.attempt.queue_id))
            .map(|q| (q.max_attempts, q.wait_between_retries))
            .unwrap_or((0, 0))
    }

    fn new_attempt(
        &mut self,
        member_id: i64,
        node_id: &str,
        state: MemberState,
        fetched: bool,
        communication: usize,
    ) -> Result<MemberAttempt> {
        let now = self.now();
        let member = self
            .members
            .get(&member_id)
            .ok_or_else(|| DialerError::not_found(format!("member {}", member_id)))?
            .clone();
        let queue = self
            .queues
            .get(&member.queue_id)
            .ok_or_else(|| DialerError::not_found(format!("queue {}", member.queue_id)))?
            .clone();

        let resource = if queue.queue_type.uses_resource() {
            let enabled: Vec<&OutboundResourceConfig> = queue
                .resource_ids
                .iter()
                .filter_map(|id| self.resources.get(id))
                .filter(|r| r.enabled)
                .collect();
            enabled
                .iter()
                .find(|r| !r.reserve)
                .or_else(|| enabled.first())
                .map(|r| (r.id, r.updated_at))
        } else {
            None
        };

        self.next_attempt_id += 1;
        let id = self.next_attempt_id;
        let destination = member
            .communications
            .get(communication)
            .or_else(|| member.communications.first())
            .cloned()
            .unwrap_or_default();

        let attempt = MemberAttempt {
            id,
            queue_id: queue.id,
            queue_updated_at: queue.updated_at,
            state: Some(state),
            member_id: Some(member_id),
            created_at: now,
            resource_id: resource.map(|(id, _)| id),
            resource_updated_at: resource.map(|(_, updated_at)| updated_at),
            destination,
            variables: member.variables.clone(),
            name: member.name.clone(),
            barred: member.barred,
            ..Default::default()
        };

        if let Some(member) = self.members.get_mut(&member_id) {
            member.active_attempt = Some(id);
        }
        self.attempts
            .insert(id, AttemptRow::new(attempt.clone(), node_id, state, fetched));
        Ok(attempt)
    }

    fn bump_agent(&mut self, agent_id: i64, state: AgentState) -> Option<i64> {
        let now = self.now();
        let agent = self.agents.get_mut(&agent_id)?;
        agent.state = state;
        agent.updated_at = now;
        Some(now)
    }
}

/// Store backed by in-process tables
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_queue(&self, settings: QueueSettings) {
        self.tables.lock().queues.insert(settings.id, settings);
    }

    /// Bump the queue version as a configuration edit would
    pub fn touch_queue(&self, queue_id: i64) -> Option<i64> {
        let mut t = self.tables.lock();
        let now = t.now();
        let queue = t.queues.get_mut(&queue_id)?;
        queue.updated_at = now;
        Some(now)
    }

    pub fn set_queue_agents(&self, queue_id: i64, agent_ids: Vec<i64>) {
        self.tables.lock().queue_agents.insert(queue_id, agent_ids);
    }

    pub fn add_resource(&self, config: OutboundResourceConfig) {
        self.tables.lock().resources.insert(config.id, config);
    }

    /// Re-enable a stopped resource and reset its error counter
    pub fn rearm_resource(&self, resource_id: i64) -> Option<i64> {
        let mut t = self.tables.lock();
        let now = t.now();
        let resource = t.resources.get_mut(&resource_id)?;
        resource.enabled = true;
        resource.successively_errors = 0;
        resource.updated_at = now;
        Some(now)
    }

    pub fn resource(&self, resource_id: i64) -> Option<OutboundResourceConfig> {
        self.tables.lock().resources.get(&resource_id).cloned()
    }

    pub fn add_agent(&self, agent: AgentSnapshot) {
        self.tables.lock().agents.insert(agent.id, agent);
    }

    pub fn agent(&self, agent_id: i64) -> Option<AgentSnapshot> {
        self.tables.lock().agents.get(&agent_id).cloned()
    }

    pub fn add_member<S: Into<String>>(
        &self,
        queue_id: i64,
        name: S,
        destination: MemberCommunication,
    ) -> i64 {
        let mut t = self.tables.lock();
        t.next_member_id += 1;
        let id = t.next_member_id;
        t.members.insert(
            id,
            MemberRow {
                queue_id,
                name: name.into(),
                communications: vec![destination],
                variables: HashMap::new(),
                attempts: 0,
                next_call_at: 0,
                stop_cause: None,
                barred: false,
                active_attempt: None,
            },
        );
        id
    }

    pub fn set_member_barred(&self, member_id: i64, barred: bool) {
        if let Some(member) = self.tables.lock().members.get_mut(&member_id) {
            member.barred = barred;
        }
    }

    pub fn set_member_variables(&self, member_id: i64, variables: HashMap<String, String>) {
        if let Some(member) = self.tables.lock().members.get_mut(&member_id) {
            member.variables = variables;
        }
    }

    pub fn member_stop_cause(&self, member_id: i64) -> Option<String> {
        self.tables
            .lock()
            .members
            .get(&member_id)
            .and_then(|m| m.stop_cause.clone())
    }

    pub fn member_attempts(&self, member_id: i64) -> u32 {
        self.tables
            .lock()
            .members
            .get(&member_id)
            .map(|m| m.attempts)
            .unwrap_or(0)
    }

    pub fn attempt(&self, attempt_id: i64) -> Option<MemberAttempt> {
        self.tables
            .lock()
            .attempts
            .get(&attempt_id)
            .map(AttemptRow::snapshot)
    }

    pub fn attempt_state(&self, attempt_id: i64) -> Option<MemberState> {
        self.tables.lock().attempts.get(&attempt_id).map(|r| r.state)
    }

    /// Put a processing attempt past its deadline
    pub fn expire_processing(&self, attempt_id: i64) -> bool {
        let mut t = self.tables.lock();
        let now = t.now();
        match t.attempts.get_mut(&attempt_id) {
            Some(row) if row.state == MemberState::Processing => {
                row.processing_deadline = Some(now - 1);
                true
            }
            _ => false,
        }
    }

    /// Put an agent wrap-up window in the past
    pub fn expire_agent_deadline(&self, agent_id: i64) -> bool {
        let mut t = self.tables.lock();
        let now = t.now();
        let Some(agent) = t.agents.get_mut(&agent_id) else {
            return false;
        };
        match &mut agent.state {
            AgentState::Reporting { deadline } | AgentState::Fine { deadline, .. } => {
                *deadline = now - 1;
                true
            }
            _ => false,
        }
    }

    /// Simulate a history row locked by another transaction
    pub fn lock_attempt(&self, attempt_id: i64) {
        self.tables.lock().locked.insert(attempt_id);
    }

    pub fn unlock_attempt(&self, attempt_id: i64) {
        self.tables.lock().locked.remove(&attempt_id);
    }

    pub fn history(&self) -> Vec<HistoryAttempt> {
        self.tables.lock().history.clone()
    }

    pub fn missed_attempts(&self) -> Vec<(i64, i64, String)> {
        self.tables.lock().missed.clone()
    }
}

#[async_trait]
impl MemberStore for MemoryStore {
    async fn reserve_members_by_node(&self, node_id: &str) -> Result<u64> {
        let mut t = self.tables.lock();
        let now = t.now();

        let candidates: Vec<i64> = t
            .members
            .iter()
            .filter(|(_, m)| m.active_attempt.is_none() && m.stop_cause.is_none())
            .filter(|(_, m)| m.next_call_at <= now)
            .filter(|(_, m)| {
                t.queues
                    .get(&m.queue_id)
                    .map(|q| q.enabled && q.queue_type != QueueType::Inbound)
                    .unwrap_or(false)
            })
            .map(|(id, _)| *id)
            .collect();

        let mut reserved = 0;
        for member_id in candidates {
            t.new_attempt(member_id, node_id, MemberState::Idle, false, 0)?;
            reserved += 1;
        }

        if reserved > 0 {
            debug!("reserved {} members for node {}", reserved, node_id);
        }
        Ok(reserved)
    }

    async fn un_reserve_members_by_node(&self, node_id: &str, cause: &str) -> Result<u64> {
        let mut t = self.tables.lock();
        let ids: Vec<i64> = t
            .attempts
            .iter()
            .filter(|(_, row)| row.node_id == node_id && !row.fetched)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(row) = t.attempts.remove(id) {
                if let Some(member) = row.attempt.member_id.and_then(|m| t.members.get_mut(&m)) {
                    member.active_attempt = None;
                }
            }
        }

        if !ids.is_empty() {
            debug!(
                "un-reserved {} attempts of node {} ({})",
                ids.len(),
                node_id,
                cause
            );
        }
        Ok(ids.len() as u64)
    }

    async fn get_active_members_attempt(&self, node_id: &str) -> Result<Vec<MemberAttempt>> {
        let mut t = self.tables.lock();
        let mut out = Vec::new();
        for row in t.attempts.values_mut() {
            if row.node_id == node_id && !row.fetched {
                row.fetched = true;
                row.state = MemberState::Waiting;
                out.push(row.snapshot());
            }
        }
        Ok(out)
    }

    async fn set_attempt_state(&self, attempt_id: i64, state: MemberState) -> Result<()> {
        self.tables.lock().attempt_mut(attempt_id)?.state = state;
        Ok(())
    }

    async fn set_attempt_find_agent(&self, attempt_id: i64) -> Result<()> {
        let mut t = self.tables.lock();
        let row = t.attempt_mut(attempt_id)?;
        if row.state.is_terminal() {
            return Err(DialerError::protocol(format!(
                "attempt {} already closed",
                attempt_id
            )));
        }
        row.state = MemberState::WaitAgent;
        row.attempt.agent_id = None;
        row.attempt.agent_updated_at = None;
        t.release_reservation_of(attempt_id);
        Ok(())
    }

    async fn answer_and_find_agent(&self, attempt_id: i64) -> Result<()> {
        let mut t = self.tables.lock();
        let now = t.now();
        let row = t.attempt_mut(attempt_id)?;
        row.answered_at = now;
        row.state = MemberState::WaitAgent;
        row.attempt.agent_id = None;
        Ok(())
    }

    async fn set_attempt_offering(
        &self,
        attempt_id: i64,
        agent_id: Option<i64>,
        agent_call_id: Option<&str>,
        member_call_id: Option<&str>,
        destination: Option<&str>,
        display: Option<&str>,
    ) -> Result<i64> {
        let mut t = self.tables.lock();
        let now = t.now();
        let row = t.attempt_mut(attempt_id)?;
        row.state = MemberState::Active;
        row.offering_at = now;
        if agent_id.is_some() {
            row.attempt.agent_id = agent_id;
        }
        if let Some(id) = agent_call_id {
            row.agent_call_id = Some(id.to_string());
        }
        if let Some(id) = member_call_id {
            row.attempt.member_call_id = Some(id.to_string());
        }
        if let Some(destination) = destination {
            row.attempt.destination.destination = destination.to_string();
        }
        row.display = display.map(str::to_string);
        Ok(now)
    }

    async fn set_attempt_bridged(&self, attempt_id: i64) -> Result<i64> {
        let mut t = self.tables.lock();
        let now = t.now();
        let row = t.attempt_mut(attempt_id)?;
        row.state = MemberState::Bridged;
        row.attempt.bridged_at = now;
        Ok(now)
    }

    async fn set_attempt_abandoned(
        &self,
        attempt_id: i64,
        max_attempts: u32,
        wait_between_sec: u64,
        variables: Option<&HashMap<String, String>>,
    ) -> Result<AttemptLeaving> {
        let mut t = self.tables.lock();
        let now = t.now();
        if let Some(vars) = variables {
            t.attempt_mut(attempt_id)?
                .attempt
                .variables
                .extend(vars.clone());
        }
        let stop = t.close_attempt(
            attempt_id,
            MEMBER_CAUSE_ABANDONED,
            MemberState::Leaving,
            false,
            max_attempts,
            now + (wait_between_sec as i64) * 1000,
        )?;
        Ok(AttemptLeaving {
            timestamp: now,
            member_stop_cause: stop,
        })
    }

    async fn set_attempt_missed_agent(
        &self,
        attempt_id: i64,
        _agent_hold_sec: u32,
    ) -> Result<MissedAgent> {
        let mut t = self.tables.lock();
        let now = t.now();
        let row = t.attempt_mut(attempt_id)?;
        row.state = MemberState::WaitAgent;
        let agent_id = row.attempt.agent_id.take();
        row.attempt.agent_updated_at = None;
        t.release_reservation_of(attempt_id);

        let no_answers = agent_id
            .and_then(|id| t.agents.get(&id))
            .map(|a| a.successively_no_answers as u32)
            .unwrap_or(0);

        Ok(MissedAgent {
            timestamp: now,
            no_answers,
            member_stop_cause: None,
        })
    }

    async fn set_attempt_reporting(&self, attempt_id: i64, deadline_sec: u32) -> Result<i64> {
        let mut t = self.tables.lock();
        let now = t.now();
        let row = t.attempt_mut(attempt_id)?;
        row.state = MemberState::Processing;
        row.processing_deadline = (deadline_sec > 0).then(|| now + deadline_sec as i64 * 1000);
        Ok(now)
    }

    async fn set_attempt_result(
        &self,
        attempt_id: i64,
        result: &str,
        _agent_hold_sec: u32,
        variables: Option<&HashMap<String, String>>,
        max_attempts: u32,
        wait_between_sec: u64,
    ) -> Result<MissedAgent> {
        let mut t = self.tables.lock();
        let now = t.now();
        if let Some(vars) = variables {
            t.attempt_mut(attempt_id)?
                .attempt
                .variables
                .extend(vars.clone());
        }
        let stop = t.close_attempt(
            attempt_id,
            result,
            MemberState::Leaving,
            result == MEMBER_CAUSE_SUCCESSFUL,
            max_attempts,
            now + wait_between_sec as i64 * 1000,
        )?;
        Ok(MissedAgent {
            timestamp: now,
            no_answers: 0,
            member_stop_cause: stop,
        })
    }

    async fn set_barred(&self, attempt_id: i64) -> Result<()> {
        let mut t = self.tables.lock();
        let now = t.now();
        t.close_attempt(
            attempt_id,
            MEMBER_CAUSE_BARRED,
            MemberState::Leaving,
            true,
            0,
            now,
        )?;
        Ok(())
    }

    async fn set_distribute_cancel(
        &self,
        attempt_id: i64,
        description: &str,
        next_distribute_sec: u32,
        stop: bool,
    ) -> Result<()> {
        let mut t = self.tables.lock();
        let now = t.now();
        t.attempt_mut(attempt_id)?.description = Some(description.to_string());
        t.close_attempt(
            attempt_id,
            MEMBER_CAUSE_CANCEL,
            MemberState::Cancel,
            stop,
            0,
            now + next_distribute_sec as i64 * 1000,
        )?;
        Ok(())
    }

    async fn distribute_call_to_queue(
        &self,
        node_id: &str,
        call: &InboundCallInfo,
    ) -> Result<MemberAttempt> {
        let mut t = self.tables.lock();
        if !t.queues.contains_key(&call.queue_id) {
            return Err(DialerError::not_found(format!("queue {}", call.queue_id)));
        }

        t.next_member_id += 1;
        let member_id = t.next_member_id;
        let mut destination = MemberCommunication::new(call.from_number.clone());
        destination.priority = call.priority;
        t.members.insert(
            member_id,
            MemberRow {
                queue_id: call.queue_id,
                name: call.from_name.clone(),
                communications: vec![destination],
                variables: call.variables.clone(),
                attempts: 0,
                next_call_at: 0,
                stop_cause: None,
                barred: false,
                active_attempt: None,
            },
        );

        let mut attempt = t.new_attempt(member_id, node_id, MemberState::Waiting, true, 0)?;
        attempt.member_call_id = Some(call.id.clone());
        if let Some(row) = t.attempts.get_mut(&attempt.id) {
            row.attempt.member_call_id = Some(call.id.clone());
        }
        Ok(attempt)
    }

    async fn distribute_direct(
        &self,
        node_id: &str,
        member_id: i64,
        communication_id: i64,
        agent_id: i64,
    ) -> Result<MemberAttempt> {
        let mut t = self.tables.lock();
        let member = t
            .members
            .get(&member_id)
            .ok_or_else(|| DialerError::not_found(format!("member {}", member_id)))?;
        if member.active_attempt.is_some() {
            return Err(DialerError::invalid_input(format!(
                "member {} already has an active attempt",
                member_id
            )));
        }
        let agent_updated_at = t
            .agents
            .get(&agent_id)
            .map(|a| a.updated_at)
            .ok_or_else(|| DialerError::not_found(format!("agent {}", agent_id)))?;
        if t.reservations.contains_key(&agent_id) {
            return Err(DialerError::invalid_input(format!(
                "agent {} is reserved",
                agent_id
            )));
        }

        let attempt = t.new_attempt(
            member_id,
            node_id,
            MemberState::Waiting,
            true,
            communication_id.max(0) as usize,
        )?;
        t.reservations.insert(agent_id, attempt.id);
        t.pending_reservations.push((
            node_id.to_string(),
            AgentReservation {
                attempt_id: attempt.id,
                agent_id,
                agent_updated_at,
            },
        ));
        Ok(attempt)
    }

    async fn get_timeouts(&self, node_id: &str) -> Result<Vec<AttemptTimeout>> {
        let mut t = self.tables.lock();
        let now = t.now();
        let expired: Vec<i64> = t
            .attempts
            .iter()
            .filter(|(_, row)| row.node_id == node_id && row.state == MemberState::Processing)
            .filter(|(_, row)| row.processing_deadline.map(|d| d <= now).unwrap_or(false))
            .map(|(id, _)| *id)
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for attempt_id in expired {
            let (max_attempts, wait_between) = t.queue_retry_policy(attempt_id);
            let agent_id = t.attempts.get(&attempt_id).and_then(|r| r.attempt.agent_id);
            t.close_attempt(
                attempt_id,
                MEMBER_CAUSE_TIMEOUT,
                MemberState::Leaving,
                false,
                max_attempts,
                now + wait_between as i64 * 1000,
            )?;

            let agent_updated_at =
                agent_id.and_then(|id| t.bump_agent(id, AgentState::Waiting));
            let (user_id, domain_id) = agent_id
                .and_then(|id| t.agents.get(&id))
                .map(|a| (Some(a.user_id), a.domain_id))
                .unwrap_or((None, 0));

            out.push(AttemptTimeout {
                attempt_id,
                timestamp: now,
                result: MEMBER_CAUSE_TIMEOUT.to_string(),
                agent_id,
                agent_updated_at,
                user_id,
                channel: agent_id.map(|_| "call".to_string()),
                domain_id,
            });
        }
        Ok(out)
    }

    async fn save_to_history(&self) -> Result<Vec<HistoryAttempt>> {
        let mut t = self.tables.lock();
        let done: Vec<i64> = t
            .attempts
            .iter()
            .filter(|(id, row)| row.state.is_terminal() && !t.locked.contains(id))
            .map(|(id, _)| *id)
            .collect();

        let mut out = Vec::with_capacity(done.len());
        for id in done {
            if let Some(row) = t.attempts.remove(&id) {
                let entry = HistoryAttempt {
                    id,
                    result: row.attempt.result.unwrap_or_default(),
                };
                t.history.push(entry.clone());
                out.push(entry);
            }
        }
        Ok(out)
    }

    async fn renewal_processing(
        &self,
        domain_id: i64,
        attempt_id: i64,
        renewal_sec: u32,
    ) -> Result<RenewalProcessing> {
        if renewal_sec == 0 {
            return Err(DialerError::invalid_input("renewal_sec must be positive"));
        }

        let mut t = self.tables.lock();
        let now = t.now();
        let row = t.attempt_mut(attempt_id)?;
        if row.state != MemberState::Processing {
            return Err(DialerError::not_found(format!(
                "processing attempt {}",
                attempt_id
            )));
        }

        let deadline = now + renewal_sec as i64 * 1000;
        row.processing_deadline = Some(deadline);
        let queue_id = row.attempt.queue_id;
        let agent_id = row.attempt.agent_id;
        let user_id = agent_id
            .and_then(|id| t.agents.get(&id))
            .map(|a| a.user_id);

        Ok(RenewalProcessing {
            attempt_id,
            queue_id,
            timeout: deadline,
            timestamp: now,
            renewal_sec,
            user_id,
            domain_id,
        })
    }

    async fn report_attempt_result(
        &self,
        attempt_id: i64,
        result: &AttemptReportResult,
    ) -> Result<AttemptReported> {
        let mut t = self.tables.lock();
        let now = t.now();
        let row = t.attempt_mut(attempt_id)?;
        if row.state.is_terminal() {
            return Err(DialerError::invalid_input(format!(
                "attempt {} already closed",
                attempt_id
            )));
        }

        row.attempt.variables.extend(result.variables.clone());
        if !result.description.is_empty() {
            row.description = Some(result.description.clone());
        }
        let queue_id = row.attempt.queue_id;
        let agent_id = row.attempt.agent_id;

        let status = if !result.status.is_empty() {
            result.status.clone()
        } else if result.success {
            MEMBER_CAUSE_SUCCESSFUL.to_string()
        } else {
            MEMBER_CAUSE_ABANDONED.to_string()
        };
        let (max_attempts, _) = t.queue_retry_policy(attempt_id);
        let stop = t.close_attempt(
            attempt_id,
            &status,
            MemberState::Leaving,
            result.success,
            max_attempts,
            result.next_distribute_at.unwrap_or(now),
        )?;

        Ok(AttemptReported {
            timestamp: now,
            queue_id,
            agent_id,
            member_stop_cause: stop,
        })
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn get_queue(&self, queue_id: i64) -> Result<QueueSettings> {
        self.tables
            .lock()
            .queues
            .get(&queue_id)
            .cloned()
            .ok_or_else(|| DialerError::not_found(format!("queue {}", queue_id)))
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_resource(&self, resource_id: i64) -> Result<OutboundResourceConfig> {
        self.tables
            .lock()
            .resources
            .get(&resource_id)
            .cloned()
            .ok_or_else(|| DialerError::not_found(format!("resource {}", resource_id)))
    }

    async fn set_error(
        &self,
        resource_id: i64,
        _routing_id: Option<i64>,
        error_id: &str,
        _strategy: ResourceStrategy,
    ) -> Result<ResourceErrorResult> {
        let mut t = self.tables.lock();
        let now = t.now();
        let resource = t
            .resources
            .get_mut(&resource_id)
            .ok_or_else(|| DialerError::not_found(format!("resource {}", resource_id)))?;

        resource.successively_errors = resource.successively_errors.saturating_add(1);
        let stopped = resource.max_successively_errors > 0
            && resource.successively_errors >= resource.max_successively_errors;
        if stopped {
            resource.enabled = false;
            resource.updated_at = now;
            debug!(
                "resource {} stopped after {} errors, last {}",
                resource_id, resource.successively_errors, error_id
            );
        }

        Ok(ResourceErrorResult {
            count_successively_error: Some(resource.successively_errors),
            stopped: Some(stopped),
            un_reserve_resource_id: stopped.then_some(resource_id),
        })
    }

    async fn set_successively_errors(&self, resource_id: i64, count: u16) -> Result<()> {
        let mut t = self.tables.lock();
        let resource = t
            .resources
            .get_mut(&resource_id)
            .ok_or_else(|| DialerError::not_found(format!("resource {}", resource_id)))?;
        resource.successively_errors = count;
        Ok(())
    }
}

#[async_trait]
impl AgentStore for MemoryStore {
    async fn get_agent(&self, agent_id: i64) -> Result<AgentSnapshot> {
        self.tables
            .lock()
            .agents
            .get(&agent_id)
            .cloned()
            .ok_or_else(|| DialerError::not_found(format!("agent {}", agent_id)))
    }

    async fn set_agent_state(
        &self,
        agent_id: i64,
        expected_updated_at: i64,
        state: &AgentState,
    ) -> Result<i64> {
        let mut t = self.tables.lock();
        let now = t.now();
        let agent = t
            .agents
            .get_mut(&agent_id)
            .ok_or_else(|| DialerError::not_found(format!("agent {}", agent_id)))?;

        if agent.updated_at != expected_updated_at {
            return Err(DialerError::Stale {
                entity: "agent",
                id: agent_id,
                expected: expected_updated_at,
                actual: agent.updated_at,
            });
        }

        match state {
            AgentState::Fine {
                no_answer: true, ..
            } => agent.successively_no_answers = agent.successively_no_answers.saturating_add(1),
            AgentState::Talking { .. } => agent.successively_no_answers = 0,
            _ => {}
        }
        agent.state = state.clone();
        agent.updated_at = now;

        if !state.is_distributable() {
            if let Some(attempt_id) = t.reservations.get(&agent_id).copied() {
                let offered = matches!(state, AgentState::Offering { attempt_id: a, .. } if *a == attempt_id);
                if !offered {
                    t.reservations.remove(&agent_id);
                }
            }
        }
        Ok(now)
    }

    async fn get_channel_timeouts(&self) -> Result<Vec<ChannelTimeout>> {
        let mut t = self.tables.lock();
        let now = t.now();
        let expired: Vec<(i64, AgentState)> = t
            .agents
            .values()
            .filter(|a| a.state.deadline().map(|d| d <= now).unwrap_or(false))
            .map(|a| {
                let next = match a.state {
                    AgentState::OnBreak { .. } => AgentState::Online,
                    _ => AgentState::Waiting,
                };
                (a.id, next)
            })
            .collect();

        let mut out = Vec::with_capacity(expired.len());
        for (agent_id, next) in expired {
            t.bump_agent(agent_id, next);
            if let Some(agent) = t.agents.get(&agent_id) {
                out.push(ChannelTimeout {
                    agent_id,
                    user_id: agent.user_id,
                    channel: "call".to_string(),
                    domain_id: agent.domain_id,
                    timestamp: now,
                });
            }
        }
        Ok(out)
    }

    async fn reserved_for_attempt_by_node(&self, node_id: &str) -> Result<Vec<AgentReservation>> {
        let mut t = self.tables.lock();
        let pending = std::mem::take(&mut t.pending_reservations);
        let (mine, others): (Vec<_>, Vec<_>) =
            pending.into_iter().partition(|(node, _)| node == node_id);
        t.pending_reservations = others;
        let mut out: Vec<AgentReservation> = mine.into_iter().map(|(_, r)| r).collect();

        let Tables {
            attempts,
            agents,
            queue_agents,
            reservations,
            ..
        } = &mut *t;

        let busy: HashSet<i64> = attempts
            .values()
            .filter(|row| !row.state.is_terminal())
            .filter_map(|row| row.attempt.agent_id)
            .collect();

        for (attempt_id, row) in attempts.iter_mut() {
            if row.node_id != node_id
                || row.state != MemberState::WaitAgent
                || row.attempt.agent_id.is_some()
                || reservations.values().any(|bound| bound == attempt_id)
            {
                continue;
            }

            let Some(candidates) = queue_agents.get(&row.attempt.queue_id) else {
                continue;
            };

            let agent = candidates.iter().filter_map(|id| agents.get(id)).find(|a| {
                a.state.is_distributable()
                    && !reservations.contains_key(&a.id)
                    && !busy.contains(&a.id)
            });

            if let Some(agent) = agent {
                reservations.insert(agent.id, *attempt_id);
                row.attempt.agent_id = Some(agent.id);
                row.attempt.agent_updated_at = Some(agent.updated_at);
                out.push(AgentReservation {
                    attempt_id: *attempt_id,
                    agent_id: agent.id,
                    agent_updated_at: agent.updated_at,
                });
            }
        }

        Ok(out)
    }

    async fn missed_attempt(&self, agent_id: i64, attempt_id: i64, cause: &str) -> Result<()> {
        self.tables
            .lock()
            .missed
            .push((agent_id, attempt_id, cause.to_string()));
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn members(&self) -> &dyn MemberStore {
        self
    }

    fn queues(&self) -> &dyn QueueStore {
        self
    }

    fn resources(&self) -> &dyn ResourceStore {
        self
    }

    fn agents(&self) -> &dyn AgentStore {
        self
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> (MemoryStore, i64) {
        let store = MemoryStore::new();
        let mut queue = QueueSettings::new(1, "outbound", QueueType::Preview, 100);
        queue.resource_ids = vec![10];
        store.add_queue(queue);
        store.add_resource(OutboundResourceConfig::new(10, "trunk", 5));
        let member = store.add_member(1, "John", MemberCommunication::new("100"));
        (store, member)
    }

    #[tokio::test]
    async fn test_reserve_then_fetch_once() {
        let (store, member) = seeded();
        assert_eq!(store.reserve_members_by_node("n1").await.unwrap(), 1);
        // member already holds an attempt
        assert_eq!(store.reserve_members_by_node("n1").await.unwrap(), 0);

        let active = store.get_active_members_attempt("n1").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].member_id, Some(member));
        assert_eq!(active[0].resource_id, Some(10));
        assert_eq!(active[0].queue_updated_at, 100);
        assert_eq!(active[0].state, Some(MemberState::Waiting));

        assert!(store.get_active_members_attempt("n1").await.unwrap().is_empty());
        assert!(store.get_active_members_attempt("n2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_un_reserve_releases_member() {
        let (store, _) = seeded();
        store.reserve_members_by_node("n1").await.unwrap();
        assert_eq!(
            store
                .un_reserve_members_by_node("n1", "SYSTEM_SHUTDOWN")
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.reserve_members_by_node("n2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stale_agent_write_rejected() {
        let store = MemoryStore::new();
        let mut agent = AgentSnapshot::new(1, "alice", 10);
        agent.state = AgentState::Waiting;
        store.add_agent(agent);

        let v2 = store
            .set_agent_state(1, 10, &AgentState::OnBreak {
                payload: None,
                until: None,
            })
            .await
            .unwrap();
        assert!(v2 > 10);

        let err = store
            .set_agent_state(1, 10, &AgentState::Online)
            .await
            .unwrap_err();
        assert!(matches!(err, DialerError::Stale { actual, .. } if actual == v2));
    }

    #[tokio::test]
    async fn test_resource_error_stops_at_threshold() {
        let store = MemoryStore::new();
        let mut resource = OutboundResourceConfig::new(1, "trunk", 1);
        resource.max_successively_errors = 2;
        store.add_resource(resource);

        let first = store
            .set_error(1, None, "USER_BUSY", ResourceStrategy::Random)
            .await
            .unwrap();
        assert!(!first.is_stopped());

        let second = store
            .set_error(1, None, "USER_BUSY", ResourceStrategy::Random)
            .await
            .unwrap();
        assert!(second.is_stopped());
        assert!(!store.resource(1).unwrap().enabled);

        store.rearm_resource(1);
        let resource = store.resource(1).unwrap();
        assert!(resource.enabled);
        assert_eq!(resource.successively_errors, 0);
    }

    #[tokio::test]
    async fn test_history_skips_locked_rows() {
        let (store, _) = seeded();
        store.add_member(1, "Jane", MemberCommunication::new("200"));
        store.reserve_members_by_node("n1").await.unwrap();
        let active = store.get_active_members_attempt("n1").await.unwrap();
        assert_eq!(active.len(), 2);

        for attempt in &active {
            store
                .set_attempt_result(attempt.id, MEMBER_CAUSE_SUCCESSFUL, 0, None, 0, 0)
                .await
                .unwrap();
        }
        store.lock_attempt(active[0].id);

        let saved = store.save_to_history().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].id, active[1].id);

        store.unlock_attempt(active[0].id);
        assert_eq!(store.save_to_history().await.unwrap().len(), 1);
        assert_eq!(store.history().len(), 2);
    }

    #[tokio::test]
    async fn test_abandoned_respects_retry_budget() {
        let (store, member) = seeded();
        store.reserve_members_by_node("n1").await.unwrap();
        let attempt = store.get_active_members_attempt("n1").await.unwrap()[0].id;

        let leaving = store.set_attempt_abandoned(attempt, 1, 0, None).await.unwrap();
        assert_eq!(leaving.member_stop_cause.as_deref(), Some(MEMBER_CAUSE_ABANDONED));
        assert_eq!(store.member_stop_cause(member).as_deref(), Some("abandoned"));
        assert_eq!(store.attempt_state(attempt), Some(MemberState::Leaving));
    }

    #[tokio::test]
    async fn test_agent_reserved_for_waiting_attempt() {
        let (store, _) = seeded();
        let mut agent = AgentSnapshot::new(5, "alice", 10);
        agent.state = AgentState::Waiting;
        store.add_agent(agent);
        store.set_queue_agents(1, vec![5]);

        store.reserve_members_by_node("n1").await.unwrap();
        let attempt = store.get_active_members_attempt("n1").await.unwrap()[0].id;
        assert!(store.reserved_for_attempt_by_node("n1").await.unwrap().is_empty());

        store.set_attempt_find_agent(attempt).await.unwrap();
        let reservations = store.reserved_for_attempt_by_node("n1").await.unwrap();
        assert_eq!(
            reservations,
            vec![AgentReservation {
                attempt_id: attempt,
                agent_id: 5,
                agent_updated_at: 10
            }]
        );
        // delivered once
        assert!(store.reserved_for_attempt_by_node("n1").await.unwrap().is_empty());
    }
}
