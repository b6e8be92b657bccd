//! SQLite store through `sqlx`
//!
//! Rows keep the columns the store filters on as plain columns and the rest
//! of the entity as JSON. Every trait operation runs in one transaction on a
//! single pooled connection, which serializes writers the way row locks do
//! in a shared database.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

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

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS queues (
        id INTEGER PRIMARY KEY,
        enabled INTEGER NOT NULL,
        queue_type TEXT NOT NULL,
        settings TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS queue_agents (
        queue_id INTEGER NOT NULL,
        agent_id INTEGER NOT NULL,
        position INTEGER NOT NULL,
        PRIMARY KEY (queue_id, agent_id)
    )",
    "CREATE TABLE IF NOT EXISTS resources (
        id INTEGER PRIMARY KEY,
        config TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agents (
        id INTEGER PRIMARY KEY,
        snapshot TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS members (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        queue_id INTEGER NOT NULL,
        name TEXT NOT NULL,
        communications TEXT NOT NULL,
        variables TEXT NOT NULL DEFAULT '{}',
        attempts INTEGER NOT NULL DEFAULT 0,
        next_call_at INTEGER NOT NULL DEFAULT 0,
        stop_cause TEXT,
        barred INTEGER NOT NULL DEFAULT 0,
        active_attempt INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS attempts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        node_id TEXT NOT NULL,
        queue_id INTEGER NOT NULL,
        member_id INTEGER,
        state TEXT NOT NULL,
        fetched INTEGER NOT NULL DEFAULT 0,
        agent_id INTEGER,
        processing_deadline INTEGER,
        offering_at INTEGER NOT NULL DEFAULT 0,
        answered_at INTEGER NOT NULL DEFAULT 0,
        leaving_at INTEGER NOT NULL DEFAULT 0,
        agent_call_id TEXT,
        display TEXT,
        description TEXT,
        data TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS attempts_node_state ON attempts (node_id, state)",
    "CREATE TABLE IF NOT EXISTS reservations (
        agent_id INTEGER PRIMARY KEY,
        attempt_id INTEGER NOT NULL,
        node_id TEXT NOT NULL,
        pending INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS attempt_history (
        id INTEGER PRIMARY KEY,
        node_id TEXT NOT NULL,
        queue_id INTEGER NOT NULL,
        member_id INTEGER,
        result TEXT NOT NULL,
        leaving_at INTEGER NOT NULL,
        data TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS agent_missed_attempts (
        agent_id INTEGER NOT NULL,
        attempt_id INTEGER NOT NULL,
        cause TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
];

#[derive(sqlx::FromRow, Debug)]
struct DbAttempt {
    id: i64,
    state: String,
    fetched: bool,
    agent_id: Option<i64>,
    processing_deadline: Option<i64>,
    data: String,
}

#[derive(sqlx::FromRow, Debug)]
struct DbMember {
    queue_id: i64,
    name: String,
    communications: String,
    variables: String,
    attempts: i64,
    stop_cause: Option<String>,
    barred: bool,
}

/// Attempt row decoded from its columns and JSON body
#[derive(Debug)]
struct AttemptRow {
    attempt: MemberAttempt,
    state: MemberState,
    fetched: bool,
    processing_deadline: Option<i64>,
}

impl AttemptRow {
    fn decode(row: DbAttempt) -> Result<Self> {
        let mut attempt: MemberAttempt = from_json(&row.data)?;
        let state = parse_state(&row.state)?;
        attempt.id = row.id;
        attempt.state = Some(state);
        attempt.agent_id = row.agent_id;
        Ok(Self {
            attempt,
            state,
            fetched: row.fetched,
            processing_deadline: row.processing_deadline,
        })
    }

    fn snapshot(&self) -> MemberAttempt {
        let mut attempt = self.attempt.clone();
        attempt.state = Some(self.state);
        attempt
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

fn parse_state(text: &str) -> Result<MemberState> {
    MemberState::from_str(text).map_err(DialerError::store)
}

async fn load_attempt(conn: &mut SqliteConnection, attempt_id: i64) -> Result<AttemptRow> {
    let row = sqlx::query_as::<_, DbAttempt>(
        "SELECT id, node_id, state, fetched, agent_id, processing_deadline, data
         FROM attempts WHERE id = ?",
    )
    .bind(attempt_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| DialerError::not_found(format!("attempt {}", attempt_id)))?;
    AttemptRow::decode(row)
}

async fn save_attempt(conn: &mut SqliteConnection, row: &AttemptRow) -> Result<()> {
    sqlx::query(
        "UPDATE attempts
         SET state = ?, fetched = ?, agent_id = ?, processing_deadline = ?, data = ?
         WHERE id = ?",
    )
    .bind(row.state.as_str())
    .bind(row.fetched)
    .bind(row.attempt.agent_id)
    .bind(row.processing_deadline)
    .bind(to_json(&row.attempt)?)
    .bind(row.attempt.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn load_queue(conn: &mut SqliteConnection, queue_id: i64) -> Result<QueueSettings> {
    let settings: String = sqlx::query_scalar("SELECT settings FROM queues WHERE id = ?")
        .bind(queue_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DialerError::not_found(format!("queue {}", queue_id)))?;
    from_json(&settings)
}

async fn load_resource(
    conn: &mut SqliteConnection,
    resource_id: i64,
) -> Result<OutboundResourceConfig> {
    let config: String = sqlx::query_scalar("SELECT config FROM resources WHERE id = ?")
        .bind(resource_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DialerError::not_found(format!("resource {}", resource_id)))?;
    from_json(&config)
}

async fn save_resource(conn: &mut SqliteConnection, config: &OutboundResourceConfig) -> Result<()> {
    sqlx::query("UPDATE resources SET config = ? WHERE id = ?")
        .bind(to_json(config)?)
        .bind(config.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn load_agent(conn: &mut SqliteConnection, agent_id: i64) -> Result<AgentSnapshot> {
    let snapshot: String = sqlx::query_scalar("SELECT snapshot FROM agents WHERE id = ?")
        .bind(agent_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DialerError::not_found(format!("agent {}", agent_id)))?;
    from_json(&snapshot)
}

async fn load_agents(conn: &mut SqliteConnection) -> Result<Vec<AgentSnapshot>> {
    let rows: Vec<String> = sqlx::query_scalar("SELECT snapshot FROM agents ORDER BY id")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(|text| from_json(text)).collect()
}

async fn save_agent(conn: &mut SqliteConnection, agent: &AgentSnapshot) -> Result<()> {
    sqlx::query("UPDATE agents SET snapshot = ? WHERE id = ?")
        .bind(to_json(agent)?)
        .bind(agent.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Move the agent to `state` under a fresh, strictly greater version
async fn bump_agent(
    conn: &mut SqliteConnection,
    agent_id: i64,
    state: AgentState,
) -> Result<AgentSnapshot> {
    let mut agent = load_agent(conn, agent_id).await?;
    agent.state = state;
    agent.updated_at = get_millis().max(agent.updated_at + 1);
    save_agent(conn, &agent).await?;
    Ok(agent)
}

async fn release_reservation_of(conn: &mut SqliteConnection, attempt_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM reservations WHERE attempt_id = ?")
        .bind(attempt_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Close an attempt and do the member retry bookkeeping, returns the
/// member stop cause
async fn close_attempt(
    conn: &mut SqliteConnection,
    attempt_id: i64,
    result: &str,
    state: MemberState,
    stop_member: bool,
    max_attempts: u32,
    next_call_at: i64,
) -> Result<Option<String>> {
    let now = get_millis();
    let mut row = load_attempt(conn, attempt_id).await?;
    row.state = state;
    row.attempt.result = Some(result.to_string());
    row.processing_deadline = None;
    save_attempt(conn, &row).await?;
    sqlx::query("UPDATE attempts SET leaving_at = ? WHERE id = ?")
        .bind(now)
        .bind(attempt_id)
        .execute(&mut *conn)
        .await?;
    release_reservation_of(conn, attempt_id).await?;

    let Some(member_id) = row.attempt.member_id else {
        return Ok(None);
    };
    let Some(member) = sqlx::query_as::<_, DbMember>("SELECT * FROM members WHERE id = ?")
        .bind(member_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };

    let attempts = member.attempts + 1;
    let stop_cause = if stop_member || (max_attempts > 0 && attempts >= max_attempts as i64) {
        Some(result.to_string())
    } else {
        member.stop_cause
    };
    sqlx::query(
        "UPDATE members
         SET active_attempt = NULL, attempts = ?, stop_cause = ?,
             next_call_at = CASE WHEN ? IS NULL THEN ? ELSE next_call_at END
         WHERE id = ?",
    )
    .bind(attempts)
    .bind(&stop_cause)
    .bind(&stop_cause)
    .bind(next_call_at)
    .bind(member_id)
    .execute(&mut *conn)
    .await?;
    Ok(stop_cause)
}

async fn queue_retry_policy(conn: &mut SqliteConnection, queue_id: i64) -> (u32, u64) {
    match load_queue(conn, queue_id).await {
        Ok(queue) => (queue.max_attempts, queue.wait_between_retries),
        Err(_) => (0, 0),
    }
}

/// Create an attempt for `member_id` on `node_id`
async fn new_attempt(
    conn: &mut SqliteConnection,
    member_id: i64,
    node_id: &str,
    state: MemberState,
    fetched: bool,
    communication: usize,
) -> Result<MemberAttempt> {
    let now = get_millis();
    let member = sqlx::query_as::<_, DbMember>("SELECT * FROM members WHERE id = ?")
        .bind(member_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| DialerError::not_found(format!("member {}", member_id)))?;
    let queue = load_queue(conn, member.queue_id).await?;

    let mut resource = None;
    if queue.queue_type.uses_resource() {
        let mut enabled = Vec::new();
        for id in &queue.resource_ids {
            if let Ok(config) = load_resource(conn, *id).await {
                if config.enabled {
                    enabled.push(config);
                }
            }
        }
        resource = enabled
            .iter()
            .find(|r| !r.reserve)
            .or_else(|| enabled.first())
            .map(|r| (r.id, r.updated_at));
    }

    let communications: Vec<MemberCommunication> = from_json(&member.communications)?;
    let destination = communications
        .get(communication)
        .or_else(|| communications.first())
        .cloned()
        .unwrap_or_default();

    let id = sqlx::query(
        "INSERT INTO attempts (node_id, queue_id, member_id, state, fetched, data)
         VALUES (?, ?, ?, ?, ?, '{}')",
    )
    .bind(node_id)
    .bind(queue.id)
    .bind(member_id)
    .bind(state.as_str())
    .bind(fetched)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

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
        variables: from_json(&member.variables)?,
        name: member.name,
        barred: member.barred,
        ..Default::default()
    };
    sqlx::query("UPDATE attempts SET data = ? WHERE id = ?")
        .bind(to_json(&attempt)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("UPDATE members SET active_attempt = ? WHERE id = ?")
        .bind(id)
        .bind(member_id)
        .execute(&mut *conn)
        .await?;
    Ok(attempt)
}

/// Store backed by a SQLite database
#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `url` and bootstrap the schema
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        info!("SQLite store ready at {}", url);
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn add_queue(&self, settings: &QueueSettings) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO queues (id, enabled, queue_type, settings) VALUES (?, ?, ?, ?)",
        )
        .bind(settings.id)
        .bind(settings.enabled)
        .bind(settings.queue_type.as_str())
        .bind(to_json(settings)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_queue_agents(&self, queue_id: i64, agent_ids: &[i64]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM queue_agents WHERE queue_id = ?")
            .bind(queue_id)
            .execute(&mut *tx)
            .await?;
        for (position, agent_id) in agent_ids.iter().enumerate() {
            sqlx::query("INSERT INTO queue_agents (queue_id, agent_id, position) VALUES (?, ?, ?)")
                .bind(queue_id)
                .bind(agent_id)
                .bind(position as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn add_resource(&self, config: &OutboundResourceConfig) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO resources (id, config) VALUES (?, ?)")
            .bind(config.id)
            .bind(to_json(config)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_agent(&self, agent: &AgentSnapshot) -> Result<()> {
        sqlx::query("INSERT OR REPLACE INTO agents (id, snapshot) VALUES (?, ?)")
            .bind(agent.id)
            .bind(to_json(agent)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn add_member<S: Into<String>>(
        &self,
        queue_id: i64,
        name: S,
        destination: MemberCommunication,
    ) -> Result<i64> {
        let id = sqlx::query("INSERT INTO members (queue_id, name, communications) VALUES (?, ?, ?)")
            .bind(queue_id)
            .bind(name.into())
            .bind(to_json(&vec![destination])?)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn member_stop_cause(&self, member_id: i64) -> Result<Option<String>> {
        let cause: Option<Option<String>> =
            sqlx::query_scalar("SELECT stop_cause FROM members WHERE id = ?")
                .bind(member_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(cause.flatten())
    }

    pub async fn attempt_state(&self, attempt_id: i64) -> Result<MemberState> {
        let state: String = sqlx::query_scalar("SELECT state FROM attempts WHERE id = ?")
            .bind(attempt_id)
            .fetch_one(&self.pool)
            .await?;
        parse_state(&state)
    }

    pub async fn history(&self) -> Result<Vec<HistoryAttempt>> {
        let rows = sqlx::query("SELECT id, result FROM attempt_history ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| -> Result<HistoryAttempt> {
                Ok(HistoryAttempt {
                    id: row.try_get("id")?,
                    result: row.try_get("result")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl MemberStore for SqliteStore {
    async fn reserve_members_by_node(&self, node_id: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let now = get_millis();

        let candidates: Vec<i64> = sqlx::query_scalar(
            "SELECT m.id FROM members m
             JOIN queues q ON q.id = m.queue_id
             WHERE m.active_attempt IS NULL AND m.stop_cause IS NULL
               AND m.next_call_at <= ? AND q.enabled = 1 AND q.queue_type != ?
             ORDER BY m.id",
        )
        .bind(now)
        .bind(QueueType::Inbound.as_str())
        .fetch_all(&mut *tx)
        .await?;

        for member_id in &candidates {
            new_attempt(&mut tx, *member_id, node_id, MemberState::Idle, false, 0).await?;
        }
        tx.commit().await?;

        if !candidates.is_empty() {
            debug!("reserved {} members for node {}", candidates.len(), node_id);
        }
        Ok(candidates.len() as u64)
    }

    async fn un_reserve_members_by_node(&self, node_id: &str, cause: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE members SET active_attempt = NULL
             WHERE active_attempt IN (SELECT id FROM attempts WHERE node_id = ? AND fetched = 0)",
        )
        .bind(node_id)
        .execute(&mut *tx)
        .await?;
        let removed = sqlx::query("DELETE FROM attempts WHERE node_id = ? AND fetched = 0")
            .bind(node_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;

        if removed > 0 {
            debug!("un-reserved {} attempts of node {} ({})", removed, node_id, cause);
        }
        Ok(removed)
    }

    async fn get_active_members_attempt(&self, node_id: &str) -> Result<Vec<MemberAttempt>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, DbAttempt>(
            "SELECT id, node_id, state, fetched, agent_id, processing_deadline, data
             FROM attempts WHERE node_id = ? AND fetched = 0 ORDER BY id",
        )
        .bind(node_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut row = AttemptRow::decode(row)?;
            row.fetched = true;
            row.state = MemberState::Waiting;
            save_attempt(&mut tx, &row).await?;
            out.push(row.snapshot());
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn set_attempt_state(&self, attempt_id: i64, state: MemberState) -> Result<()> {
        let result = sqlx::query("UPDATE attempts SET state = ? WHERE id = ?")
            .bind(state.as_str())
            .bind(attempt_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DialerError::not_found(format!("attempt {}", attempt_id)));
        }
        Ok(())
    }

    async fn set_attempt_find_agent(&self, attempt_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        if row.state.is_terminal() {
            return Err(DialerError::protocol(format!(
                "attempt {} already closed",
                attempt_id
            )));
        }
        row.state = MemberState::WaitAgent;
        row.attempt.agent_id = None;
        row.attempt.agent_updated_at = None;
        save_attempt(&mut tx, &row).await?;
        release_reservation_of(&mut tx, attempt_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn answer_and_find_agent(&self, attempt_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        row.state = MemberState::WaitAgent;
        row.attempt.agent_id = None;
        save_attempt(&mut tx, &row).await?;
        sqlx::query("UPDATE attempts SET answered_at = ? WHERE id = ?")
            .bind(get_millis())
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        row.state = MemberState::Active;
        if agent_id.is_some() {
            row.attempt.agent_id = agent_id;
        }
        if let Some(id) = member_call_id {
            row.attempt.member_call_id = Some(id.to_string());
        }
        if let Some(destination) = destination {
            row.attempt.destination.destination = destination.to_string();
        }
        save_attempt(&mut tx, &row).await?;
        sqlx::query(
            "UPDATE attempts
             SET offering_at = ?, agent_call_id = COALESCE(?, agent_call_id), display = ?
             WHERE id = ?",
        )
        .bind(now)
        .bind(agent_call_id)
        .bind(display)
        .bind(attempt_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(now)
    }

    async fn set_attempt_bridged(&self, attempt_id: i64) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        row.state = MemberState::Bridged;
        row.attempt.bridged_at = now;
        save_attempt(&mut tx, &row).await?;
        tx.commit().await?;
        Ok(now)
    }

    async fn set_attempt_abandoned(
        &self,
        attempt_id: i64,
        max_attempts: u32,
        wait_between_sec: u64,
        variables: Option<&HashMap<String, String>>,
    ) -> Result<AttemptLeaving> {
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        if let Some(vars) = variables {
            let mut row = load_attempt(&mut tx, attempt_id).await?;
            row.attempt.variables.extend(vars.clone());
            save_attempt(&mut tx, &row).await?;
        }
        let stop = close_attempt(
            &mut tx,
            attempt_id,
            MEMBER_CAUSE_ABANDONED,
            MemberState::Leaving,
            false,
            max_attempts,
            now + wait_between_sec as i64 * 1000,
        )
        .await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        row.state = MemberState::WaitAgent;
        let agent_id = row.attempt.agent_id.take();
        row.attempt.agent_updated_at = None;
        save_attempt(&mut tx, &row).await?;
        release_reservation_of(&mut tx, attempt_id).await?;

        let no_answers = match agent_id {
            Some(id) => load_agent(&mut tx, id)
                .await
                .map(|agent| agent.successively_no_answers as u32)
                .unwrap_or(0),
            None => 0,
        };
        tx.commit().await?;

        Ok(MissedAgent {
            timestamp: now,
            no_answers,
            member_stop_cause: None,
        })
    }

    async fn set_attempt_reporting(&self, attempt_id: i64, deadline_sec: u32) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        row.state = MemberState::Processing;
        row.processing_deadline = (deadline_sec > 0).then(|| now + deadline_sec as i64 * 1000);
        save_attempt(&mut tx, &row).await?;
        tx.commit().await?;
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
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        if let Some(vars) = variables {
            let mut row = load_attempt(&mut tx, attempt_id).await?;
            row.attempt.variables.extend(vars.clone());
            save_attempt(&mut tx, &row).await?;
        }
        let stop = close_attempt(
            &mut tx,
            attempt_id,
            result,
            MemberState::Leaving,
            result == MEMBER_CAUSE_SUCCESSFUL,
            max_attempts,
            now + wait_between_sec as i64 * 1000,
        )
        .await?;
        tx.commit().await?;
        Ok(MissedAgent {
            timestamp: now,
            no_answers: 0,
            member_stop_cause: stop,
        })
    }

    async fn set_barred(&self, attempt_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        close_attempt(
            &mut tx,
            attempt_id,
            MEMBER_CAUSE_BARRED,
            MemberState::Leaving,
            true,
            0,
            get_millis(),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_distribute_cancel(
        &self,
        attempt_id: i64,
        description: &str,
        next_distribute_sec: u32,
        stop: bool,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE attempts SET description = ? WHERE id = ?")
            .bind(description)
            .bind(attempt_id)
            .execute(&mut *tx)
            .await?;
        close_attempt(
            &mut tx,
            attempt_id,
            MEMBER_CAUSE_CANCEL,
            MemberState::Cancel,
            stop,
            0,
            get_millis() + next_distribute_sec as i64 * 1000,
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn distribute_call_to_queue(
        &self,
        node_id: &str,
        call: &InboundCallInfo,
    ) -> Result<MemberAttempt> {
        let mut tx = self.pool.begin().await?;
        load_queue(&mut tx, call.queue_id).await?;

        let mut destination = MemberCommunication::new(call.from_number.clone());
        destination.priority = call.priority;
        let member_id = sqlx::query(
            "INSERT INTO members (queue_id, name, communications, variables) VALUES (?, ?, ?, ?)",
        )
        .bind(call.queue_id)
        .bind(&call.from_name)
        .bind(to_json(&vec![destination])?)
        .bind(to_json(&call.variables)?)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        let attempt = new_attempt(&mut tx, member_id, node_id, MemberState::Waiting, true, 0).await?;
        let mut row = load_attempt(&mut tx, attempt.id).await?;
        row.attempt.member_call_id = Some(call.id.clone());
        save_attempt(&mut tx, &row).await?;
        tx.commit().await?;
        Ok(row.snapshot())
    }

    async fn distribute_direct(
        &self,
        node_id: &str,
        member_id: i64,
        communication_id: i64,
        agent_id: i64,
    ) -> Result<MemberAttempt> {
        let mut tx = self.pool.begin().await?;
        let active: Option<Option<i64>> =
            sqlx::query_scalar("SELECT active_attempt FROM members WHERE id = ?")
                .bind(member_id)
                .fetch_optional(&mut *tx)
                .await?;
        match active {
            None => return Err(DialerError::not_found(format!("member {}", member_id))),
            Some(Some(_)) => {
                return Err(DialerError::invalid_input(format!(
                    "member {} already has an active attempt",
                    member_id
                )));
            }
            Some(None) => {}
        }

        let agent = load_agent(&mut tx, agent_id).await?;
        let reserved: Option<i64> =
            sqlx::query_scalar("SELECT attempt_id FROM reservations WHERE agent_id = ?")
                .bind(agent_id)
                .fetch_optional(&mut *tx)
                .await?;
        if reserved.is_some() {
            return Err(DialerError::invalid_input(format!(
                "agent {} is reserved",
                agent_id
            )));
        }

        let attempt = new_attempt(
            &mut tx,
            member_id,
            node_id,
            MemberState::Waiting,
            true,
            communication_id.max(0) as usize,
        )
        .await?;
        sqlx::query(
            "INSERT INTO reservations (agent_id, attempt_id, node_id, pending) VALUES (?, ?, ?, 1)",
        )
        .bind(agent.id)
        .bind(attempt.id)
        .bind(node_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(attempt)
    }

    async fn get_timeouts(&self, node_id: &str) -> Result<Vec<AttemptTimeout>> {
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let rows = sqlx::query_as::<_, DbAttempt>(
            "SELECT id, node_id, state, fetched, agent_id, processing_deadline, data
             FROM attempts
             WHERE node_id = ? AND state = ? AND processing_deadline IS NOT NULL
               AND processing_deadline <= ?",
        )
        .bind(node_id)
        .bind(MemberState::Processing.as_str())
        .bind(now)
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let row = AttemptRow::decode(row)?;
            let attempt_id = row.attempt.id;
            let agent_id = row.attempt.agent_id;
            let (max_attempts, wait_between) =
                queue_retry_policy(&mut tx, row.attempt.queue_id).await;
            close_attempt(
                &mut tx,
                attempt_id,
                MEMBER_CAUSE_TIMEOUT,
                MemberState::Leaving,
                false,
                max_attempts,
                now + wait_between as i64 * 1000,
            )
            .await?;

            let agent = match agent_id {
                Some(id) => Some(bump_agent(&mut tx, id, AgentState::Waiting).await?),
                None => None,
            };
            out.push(AttemptTimeout {
                attempt_id,
                timestamp: now,
                result: MEMBER_CAUSE_TIMEOUT.to_string(),
                agent_id,
                agent_updated_at: agent.as_ref().map(|a| a.updated_at),
                user_id: agent.as_ref().map(|a| a.user_id),
                channel: agent.as_ref().map(|_| "call".to_string()),
                domain_id: agent.as_ref().map(|a| a.domain_id).unwrap_or_default(),
            });
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn save_to_history(&self) -> Result<Vec<HistoryAttempt>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query_as::<_, DbAttempt>(
            "SELECT id, node_id, state, fetched, agent_id, processing_deadline, data
             FROM attempts WHERE state IN (?, ?) ORDER BY id",
        )
        .bind(MemberState::Leaving.as_str())
        .bind(MemberState::Cancel.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let row = AttemptRow::decode(row)?;
            let entry = HistoryAttempt {
                id: row.attempt.id,
                result: row.attempt.result.clone().unwrap_or_default(),
            };
            sqlx::query(
                "INSERT OR REPLACE INTO attempt_history
                 (id, node_id, queue_id, member_id, result, leaving_at, data)
                 SELECT id, node_id, queue_id, member_id, ?, leaving_at, data
                 FROM attempts WHERE id = ?",
            )
            .bind(&entry.result)
            .bind(entry.id)
            .execute(&mut *tx)
            .await?;
            sqlx::query("DELETE FROM attempts WHERE id = ?")
                .bind(entry.id)
                .execute(&mut *tx)
                .await?;
            out.push(entry);
        }
        tx.commit().await?;
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

        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        if row.state != MemberState::Processing {
            return Err(DialerError::not_found(format!(
                "processing attempt {}",
                attempt_id
            )));
        }

        let deadline = now + renewal_sec as i64 * 1000;
        row.processing_deadline = Some(deadline);
        save_attempt(&mut tx, &row).await?;
        let user_id = match row.attempt.agent_id {
            Some(id) => load_agent(&mut tx, id).await.ok().map(|a| a.user_id),
            None => None,
        };
        tx.commit().await?;

        Ok(RenewalProcessing {
            attempt_id,
            queue_id: row.attempt.queue_id,
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
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let mut row = load_attempt(&mut tx, attempt_id).await?;
        if row.state.is_terminal() {
            return Err(DialerError::invalid_input(format!(
                "attempt {} already closed",
                attempt_id
            )));
        }

        row.attempt.variables.extend(result.variables.clone());
        save_attempt(&mut tx, &row).await?;
        if !result.description.is_empty() {
            sqlx::query("UPDATE attempts SET description = ? WHERE id = ?")
                .bind(&result.description)
                .bind(attempt_id)
                .execute(&mut *tx)
                .await?;
        }

        let status = if !result.status.is_empty() {
            result.status.clone()
        } else if result.success {
            MEMBER_CAUSE_SUCCESSFUL.to_string()
        } else {
            MEMBER_CAUSE_ABANDONED.to_string()
        };
        let (max_attempts, _) = queue_retry_policy(&mut tx, row.attempt.queue_id).await;
        let stop = close_attempt(
            &mut tx,
            attempt_id,
            &status,
            MemberState::Leaving,
            result.success,
            max_attempts,
            result.next_distribute_at.unwrap_or(now),
        )
        .await?;
        tx.commit().await?;

        Ok(AttemptReported {
            timestamp: now,
            queue_id: row.attempt.queue_id,
            agent_id: row.attempt.agent_id,
            member_stop_cause: stop,
        })
    }
}

#[async_trait]
impl QueueStore for SqliteStore {
    async fn get_queue(&self, queue_id: i64) -> Result<QueueSettings> {
        let mut conn = self.pool.acquire().await?;
        load_queue(&mut conn, queue_id).await
    }
}

#[async_trait]
impl ResourceStore for SqliteStore {
    async fn get_resource(&self, resource_id: i64) -> Result<OutboundResourceConfig> {
        let mut conn = self.pool.acquire().await?;
        load_resource(&mut conn, resource_id).await
    }

    async fn set_error(
        &self,
        resource_id: i64,
        _routing_id: Option<i64>,
        error_id: &str,
        _strategy: ResourceStrategy,
    ) -> Result<ResourceErrorResult> {
        let mut tx = self.pool.begin().await?;
        let mut resource = load_resource(&mut tx, resource_id).await?;

        resource.successively_errors = resource.successively_errors.saturating_add(1);
        let stopped = resource.max_successively_errors > 0
            && resource.successively_errors >= resource.max_successively_errors;
        if stopped {
            resource.enabled = false;
            resource.updated_at = get_millis().max(resource.updated_at + 1);
            debug!(
                "resource {} stopped after {} errors, last {}",
                resource_id, resource.successively_errors, error_id
            );
        }
        save_resource(&mut tx, &resource).await?;
        tx.commit().await?;

        Ok(ResourceErrorResult {
            count_successively_error: Some(resource.successively_errors),
            stopped: Some(stopped),
            un_reserve_resource_id: stopped.then_some(resource_id),
        })
    }

    async fn set_successively_errors(&self, resource_id: i64, count: u16) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut resource = load_resource(&mut tx, resource_id).await?;
        resource.successively_errors = count;
        save_resource(&mut tx, &resource).await?;
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl AgentStore for SqliteStore {
    async fn get_agent(&self, agent_id: i64) -> Result<AgentSnapshot> {
        let mut conn = self.pool.acquire().await?;
        load_agent(&mut conn, agent_id).await
    }

    async fn set_agent_state(
        &self,
        agent_id: i64,
        expected_updated_at: i64,
        state: &AgentState,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let mut agent = load_agent(&mut tx, agent_id).await?;
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
        agent.updated_at = get_millis().max(agent.updated_at + 1);
        save_agent(&mut tx, &agent).await?;

        if !state.is_distributable() {
            let offered = match state {
                AgentState::Offering { attempt_id, .. } => Some(*attempt_id),
                _ => None,
            };
            sqlx::query(
                "DELETE FROM reservations WHERE agent_id = ? AND (? IS NULL OR attempt_id != ?)",
            )
            .bind(agent_id)
            .bind(offered)
            .bind(offered)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(agent.updated_at)
    }

    async fn get_channel_timeouts(&self) -> Result<Vec<ChannelTimeout>> {
        let mut tx = self.pool.begin().await?;
        let now = get_millis();
        let expired: Vec<(i64, AgentState)> = load_agents(&mut tx)
            .await?
            .into_iter()
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
            let agent = bump_agent(&mut tx, agent_id, next).await?;
            out.push(ChannelTimeout {
                agent_id,
                user_id: agent.user_id,
                channel: "call".to_string(),
                domain_id: agent.domain_id,
                timestamp: agent.updated_at,
            });
        }
        tx.commit().await?;
        Ok(out)
    }

    async fn reserved_for_attempt_by_node(&self, node_id: &str) -> Result<Vec<AgentReservation>> {
        let mut tx = self.pool.begin().await?;
        let mut out = Vec::new();

        let pending = sqlx::query(
            "SELECT agent_id, attempt_id FROM reservations WHERE node_id = ? AND pending = 1",
        )
        .bind(node_id)
        .fetch_all(&mut *tx)
        .await?;
        for row in pending {
            let agent_id: i64 = row.try_get("agent_id")?;
            let attempt_id: i64 = row.try_get("attempt_id")?;
            let agent = load_agent(&mut tx, agent_id).await?;
            out.push(AgentReservation {
                attempt_id,
                agent_id,
                agent_updated_at: agent.updated_at,
            });
        }
        sqlx::query("UPDATE reservations SET pending = 0 WHERE node_id = ?")
            .bind(node_id)
            .execute(&mut *tx)
            .await?;

        let busy: HashSet<i64> = sqlx::query_scalar::<_, i64>(
            "SELECT agent_id FROM attempts WHERE agent_id IS NOT NULL AND state NOT IN (?, ?)",
        )
        .bind(MemberState::Leaving.as_str())
        .bind(MemberState::Cancel.as_str())
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();
        let mut reserved: HashSet<i64> =
            sqlx::query_scalar::<_, i64>("SELECT agent_id FROM reservations")
                .fetch_all(&mut *tx)
                .await?
                .into_iter()
                .collect();

        let waiting = sqlx::query_as::<_, DbAttempt>(
            "SELECT id, node_id, state, fetched, agent_id, processing_deadline, data
             FROM attempts
             WHERE node_id = ? AND state = ? AND agent_id IS NULL
               AND id NOT IN (SELECT attempt_id FROM reservations)
             ORDER BY id",
        )
        .bind(node_id)
        .bind(MemberState::WaitAgent.as_str())
        .fetch_all(&mut *tx)
        .await?;

        for row in waiting {
            let mut row = AttemptRow::decode(row)?;
            let candidates: Vec<i64> = sqlx::query_scalar(
                "SELECT agent_id FROM queue_agents WHERE queue_id = ? ORDER BY position",
            )
            .bind(row.attempt.queue_id)
            .fetch_all(&mut *tx)
            .await?;

            let mut chosen = None;
            for agent_id in candidates {
                if reserved.contains(&agent_id) || busy.contains(&agent_id) {
                    continue;
                }
                if let Ok(agent) = load_agent(&mut tx, agent_id).await {
                    if agent.state.is_distributable() {
                        chosen = Some(agent);
                        break;
                    }
                }
            }
            let Some(agent) = chosen else {
                continue;
            };

            sqlx::query(
                "INSERT INTO reservations (agent_id, attempt_id, node_id, pending) VALUES (?, ?, ?, 0)",
            )
            .bind(agent.id)
            .bind(row.attempt.id)
            .bind(node_id)
            .execute(&mut *tx)
            .await?;
            reserved.insert(agent.id);

            row.attempt.agent_id = Some(agent.id);
            row.attempt.agent_updated_at = Some(agent.updated_at);
            save_attempt(&mut tx, &row).await?;
            out.push(AgentReservation {
                attempt_id: row.attempt.id,
                agent_id: agent.id,
                agent_updated_at: agent.updated_at,
            });
        }

        tx.commit().await?;
        Ok(out)
    }

    async fn missed_attempt(&self, agent_id: i64, attempt_id: i64, cause: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO agent_missed_attempts (agent_id, attempt_id, cause, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(agent_id)
        .bind(attempt_id)
        .bind(cause)
        .bind(get_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
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
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
