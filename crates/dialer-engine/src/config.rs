use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DialerError, Result};

/// Dialer engine configuration
///
/// Every section carries defaults, so a TOML file only needs the values that
/// differ from them.
///
/// # Examples
///
/// ```
/// use rvoip_dialer_engine::prelude::DialerConfig;
///
/// let config = DialerConfig::default();
/// assert_eq!(config.dialing.polling_interval_ms, 500);
/// assert_eq!(config.cache.max_attempts, 30_000);
/// config.validate().expect("defaults are valid");
///
/// let config = DialerConfig::from_toml_str(r#"
/// [general]
/// node_id = "dialer-a"
///
/// [agents]
/// reporting_timeout_sec = 30
/// "#).unwrap();
/// assert_eq!(config.general.node_id, "dialer-a");
/// assert_eq!(config.agents.reporting_timeout_sec, 30);
/// assert_eq!(config.dialing.error_backoff_ms, 1000);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    pub general: GeneralConfig,
    pub dialing: DialingConfig,
    pub cache: CacheConfig,
    pub agents: AgentConfig,
    pub telephony: TelephonyConfig,
    pub logging: LoggingConfig,
}

/// Node identity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Name this node uses when reserving work in the shared store
    ///
    /// Two nodes must never share a node id: reservations are keyed by it.
    pub node_id: String,
}

/// Dialing scheduler timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialingConfig {
    /// Interval between two polling cycles
    pub polling_interval_ms: u64,

    /// Pause after a failed cycle before the next one
    pub error_backoff_ms: u64,

    /// Capacity of the queue manager admission channel
    pub input_buffer: usize,
}

/// Node-local cache sizes and expiry
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_queues: usize,
    pub max_attempts: usize,
    pub max_resources: usize,
    pub max_agents: usize,
    pub max_calls: usize,

    /// Entries older than this are dropped on read regardless of version
    pub expire_secs: u64,
}

/// Agent wrap-up defaults used when the queue does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Post-call reporting window
    pub reporting_timeout_sec: u32,

    /// Cool-down after a no-answer when the queue sets none
    pub no_answer_hold_sec: u32,

    /// Cool-down after a failed agent leg
    pub call_error_hold_sec: u32,
}

/// Telephony control plane connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelephonyConfig {
    /// How often pooled connections are health checked
    pub recheck_interval_ms: u64,

    /// Ringback played to inbound members while they wait for an agent
    pub default_ringtone: String,

    /// File name template for recorded calls (`{id}` is the call id)
    pub record_template: String,

    /// Cause sent when the engine hangs up a leg it no longer needs
    pub cancel_hangup_cause: String,
}

/// Logging defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            node_id: format!("dialer-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

impl Default for DialingConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 500,
            error_backoff_ms: 1000,
            input_buffer: 1024,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_queues: 10_000,
            max_attempts: 30_000,
            max_resources: 1_000,
            max_agents: 10_000,
            max_calls: 30_000,
            expire_secs: 60 * 60 * 24,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reporting_timeout_sec: 10,
            no_answer_hold_sec: 5,
            call_error_hold_sec: 0,
        }
    }
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            recheck_interval_ms: 5_000,
            default_ringtone: "local_stream://moh".to_string(),
            record_template: "/recordings/{id}.mp3".to_string(),
            cancel_hangup_cause: "ORIGINATOR_CANCEL".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl DialingConfig {
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl CacheConfig {
    pub fn expire(&self) -> Duration {
        Duration::from_secs(self.expire_secs)
    }
}

impl TelephonyConfig {
    pub fn recheck_interval(&self) -> Duration {
        Duration::from_millis(self.recheck_interval_ms)
    }
}

impl DialerConfig {
    /// Parse a TOML document, falling back to defaults for missing sections
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)
            .map_err(|e| DialerError::configuration(format!("invalid TOML: {}", e)))?;
        config.validate().map_err(DialerError::Configuration)?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DialerError::configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.general.node_id.trim().is_empty() {
            return Err("node_id cannot be empty".to_string());
        }

        if self.dialing.polling_interval_ms == 0 {
            return Err("polling_interval_ms must be greater than 0".to_string());
        }

        if self.dialing.input_buffer == 0 {
            return Err("input_buffer must be greater than 0".to_string());
        }

        if self.cache.max_queues == 0 || self.cache.max_attempts == 0 {
            return Err("cache sizes must be greater than 0".to_string());
        }

        if self.cache.max_resources == 0 || self.cache.max_agents == 0 || self.cache.max_calls == 0
        {
            return Err("cache sizes must be greater than 0".to_string());
        }

        if self.cache.expire_secs == 0 {
            return Err("expire_secs must be greater than 0".to_string());
        }

        if self.telephony.recheck_interval_ms == 0 {
            return Err("recheck_interval_ms must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = DialerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dialing.polling_interval(), Duration::from_millis(500));
        assert_eq!(config.dialing.error_backoff(), Duration::from_secs(1));
        assert_eq!(config.cache.max_queues, 10_000);
        assert_eq!(config.cache.expire(), Duration::from_secs(86_400));
        assert_eq!(config.agents.reporting_timeout_sec, 10);
        assert!(config.general.node_id.starts_with("dialer-"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = DialerConfig::from_toml_str(
            r#"
            [dialing]
            polling_interval_ms = 250

            [logging]
            filter = "rvoip_dialer_engine=debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.dialing.polling_interval_ms, 250);
        assert_eq!(config.dialing.error_backoff_ms, 1000);
        assert_eq!(config.logging.filter, "rvoip_dialer_engine=debug");
        assert_eq!(config.cache.max_attempts, 30_000);
    }

    #[test]
    fn test_validation_rejects_zero_interval() {
        let mut config = DialerConfig::default();
        config.dialing.polling_interval_ms = 0;
        assert!(config.validate().is_err());

        let err = DialerConfig::from_toml_str("[dialing]\npolling_interval_ms = 0\n").unwrap_err();
        assert!(matches!(err, DialerError::Configuration(_)));
    }

    #[test]
    fn test_validation_rejects_empty_node() {
        let mut config = DialerConfig::default();
        config.general.node_id = "  ".to_string();
        assert_eq!(config.validate().unwrap_err(), "node_id cannot be empty");
    }

    #[test]
    fn test_garbage_toml() {
        assert!(DialerConfig::from_toml_str("[general\nnode_id=").is_err());
    }
}
