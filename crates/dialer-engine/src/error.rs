use thiserror::Error;

/// Error types for attempt distribution
///
/// The variants follow how the engine reacts to a failure rather than which
/// subsystem raised it: unresolvable configuration fails the attempt, stale
/// versions are reloaded, infrastructure failures are retried on the next
/// tick, and protocol violations are logged and dropped.
///
/// # Examples
///
/// ```
/// use rvoip_dialer_engine::{DialerError, Result};
///
/// fn load_queue(id: i64) -> Result<()> {
///     Err(DialerError::not_found(format!("queue {}", id)))
/// }
///
/// match load_queue(7) {
///     Err(DialerError::NotFound(what)) => assert_eq!(what, "queue 7"),
///     _ => unreachable!(),
/// }
/// ```
#[derive(Error, Debug)]
pub enum DialerError {
    /// Queue, resource, agent or attempt id could not be resolved
    ///
    /// The attempt that referenced it is failed with a specific result
    /// cause and is never retried blindly.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Versioned write rejected because the caller holds an old `updated_at`
    ///
    /// The caller must re-fetch the object before retrying.
    #[error("Stale version for {entity} {id}: expected {expected}, found {actual}")]
    Stale {
        entity: &'static str,
        id: i64,
        expected: i64,
        actual: i64,
    },

    /// Persistence call failed
    #[error("Store error: {0}")]
    Store(String),

    /// Telephony control plane call failed (transport level)
    #[error("Telephony error: {0}")]
    Telephony(String),

    /// The telephony control plane refused or hung up a new call immediately
    #[error("Call failed: {cause}")]
    CallFailed { cause: String },

    /// Message bus publish failed
    #[error("Message bus error: {0}")]
    Bus(String),

    /// Resource exceeded its consecutive-error budget and is stopped
    #[error("Resource {id} circuit open")]
    CircuitOpen { id: i64 },

    /// Transition requested against a terminal or barred attempt
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Agent state change not allowed by the agent state machine
    #[error("Invalid transition for agent {agent_id}: {from} -> {to}")]
    InvalidTransition {
        agent_id: i64,
        from: String,
        to: String,
    },

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid input from an API caller
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Feature is stubbed (chat distribution)
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The node already holds as many live attempts as it is configured for
    #[error("Node at capacity: {0}")]
    Capacity(String),

    /// The engine is shutting down and refuses new work
    #[error("Shutting down: {0}")]
    Shutdown(String),

    /// Unexpected internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for DialerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Store(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for DialerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("json: {}", err))
    }
}

impl From<anyhow::Error> for DialerError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl DialerError {
    /// Create a new NotFound error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a new Store error
    ///
    /// ```
    /// use rvoip_dialer_engine::DialerError;
    ///
    /// let error = DialerError::store("connection reset");
    /// assert!(error.is_transient());
    /// ```
    pub fn store<S: Into<String>>(msg: S) -> Self {
        Self::Store(msg.into())
    }

    pub fn telephony<S: Into<String>>(msg: S) -> Self {
        Self::Telephony(msg.into())
    }

    pub fn call_failed<S: Into<String>>(cause: S) -> Self {
        Self::CallFailed {
            cause: cause.into(),
        }
    }

    pub fn bus<S: Into<String>>(msg: S) -> Self {
        Self::Bus(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn capacity<S: Into<String>>(msg: S) -> Self {
        Self::Capacity(msg.into())
    }

    pub fn shutdown<S: Into<String>>(msg: S) -> Self {
        Self::Shutdown(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Errors that are retried on the next scheduler tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Telephony(_) | Self::Bus(_) | Self::Stale { .. }
        )
    }

    /// Admission refused; the attempt should go back to the store
    pub fn is_refused(&self) -> bool {
        matches!(self, Self::Capacity(_) | Self::Shutdown(_))
    }

    /// Hangup cause to record on an attempt failed by this error
    pub fn hangup_cause(&self) -> Option<&str> {
        match self {
            Self::CallFailed { cause } => Some(cause.as_str()),
            _ => None,
        }
    }
}

/// Result type for dialer operations
pub type Result<T> = std::result::Result<T, DialerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DialerError::store("down").is_transient());
        assert!(DialerError::telephony("timeout").is_transient());
        assert!(
            DialerError::Stale {
                entity: "agent",
                id: 1,
                expected: 1,
                actual: 2
            }
            .is_transient()
        );
        assert!(!DialerError::not_found("queue 1").is_transient());
        assert!(!DialerError::CircuitOpen { id: 3 }.is_transient());
    }

    #[test]
    fn test_refused_admission() {
        assert!(DialerError::capacity("30000 attempts").is_refused());
        assert!(DialerError::shutdown("stopping").is_refused());
        assert!(!DialerError::store("down").is_refused());
    }

    #[test]
    fn test_call_failed_cause() {
        let err = DialerError::call_failed("USER_BUSY");
        assert_eq!(err.hangup_cause(), Some("USER_BUSY"));
        assert_eq!(err.to_string(), "Call failed: USER_BUSY");
        assert_eq!(DialerError::internal("x").hangup_cause(), None);
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DialerError = sqlx::Error::RowNotFound.into();
        assert!(matches!(err, DialerError::NotFound(_)));
    }
}
