use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::call::{CALL_DIRECTION_VARIABLE, CALL_DOMAIN_VARIABLE, CALL_GATEWAY_VARIABLE};

pub const SIP_ENDPOINT_PREFIX: &str = "sofia/sip";

/// How a resource is picked among the ones a queue may use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStrategy {
    #[default]
    Random,
    TopDown,
    ByLimit,
}

impl ResourceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::TopDown => "top_down",
            Self::ByLimit => "by_limit",
        }
    }
}

impl fmt::Display for ResourceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "random" => Ok(Self::Random),
            "top_down" => Ok(Self::TopDown),
            "by_limit" => Ok(Self::ByLimit),
            other => Err(format!("unknown resource strategy: {}", other)),
        }
    }
}

/// Outbound trunk configuration as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundResourceConfig {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    /// Concurrent calls, 0 is unlimited
    pub limit: u16,
    /// New calls per second, 0 is unlimited
    pub rps: u16,
    pub reserve: bool,
    pub updated_at: i64,
    #[serde(default)]
    pub variables: HashMap<String, String>,
    #[serde(default)]
    pub display_numbers: Vec<String>,
    #[serde(default)]
    pub successively_errors: u16,
    /// Circuit breaker threshold, 0 disables it
    #[serde(default)]
    pub max_successively_errors: u16,
    /// Hangup causes that do not count as errors, `x` matches any character
    #[serde(default)]
    pub error_ids: Vec<String>,
    #[serde(default)]
    pub dial_string: Option<String>,
    #[serde(default)]
    pub gateway: Option<SipGateway>,
}

impl OutboundResourceConfig {
    pub fn new<S: Into<String>>(id: i64, name: S, updated_at: i64) -> Self {
        Self {
            id,
            name: name.into(),
            enabled: true,
            limit: 0,
            rps: 0,
            reserve: false,
            updated_at,
            variables: HashMap::new(),
            display_numbers: Vec::new(),
            successively_errors: 0,
            max_successively_errors: 0,
            error_ids: Vec::new(),
            dial_string: None,
            gateway: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipGateway {
    pub id: i64,
    pub name: String,
    pub updated_at: i64,
    pub register: bool,
    pub proxy: String,
    pub host_name: Option<String>,
    pub username: Option<String>,
    pub account: Option<String>,
    pub password: Option<String>,
    pub domain_id: i64,
}

impl SipGateway {
    /// Channel variables for legs sent through this gateway
    ///
    /// Registered gateways authenticate with their credentials, the others
    /// only rewrite the invite domain.
    pub fn variables(&self) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert(CALL_DIRECTION_VARIABLE.to_string(), "outbound".to_string());

        match (&self.username, &self.password, &self.account) {
            (Some(username), Some(password), Some(account)) if self.register => {
                vars.insert("sip_auth_username".to_string(), username.clone());
                vars.insert("sip_auth_password".to_string(), password.clone());
                vars.insert("sip_from_uri".to_string(), account.clone());
            }
            _ => {
                if let Some(host) = &self.host_name {
                    vars.insert("sip_invite_domain".to_string(), host.clone());
                }
            }
        }

        vars
    }

    pub fn endpoint(&self, destination: &str) -> String {
        format!(
            "{}/{}@{}",
            SIP_ENDPOINT_PREFIX,
            destination.replace(' ', ""),
            self.proxy
        )
    }

    /// Full bridge string: leg variables in brackets followed by the endpoint
    pub fn bridge(
        &self,
        parent_id: &str,
        name: &str,
        destination: &str,
        display: &str,
        timeout: u16,
    ) -> String {
        let mut parts = vec![
            format!("originate_timeout={}", timeout),
            format!("cc_parent_id={}", parent_id),
            format!("origination_caller_id_number={}", display),
            "ignore_display_updates=true".to_string(),
            format!("effective_callee_id_name='{}'", name),
            format!("cc_to_number='{}'", destination),
            format!("{}={}", CALL_DOMAIN_VARIABLE, self.domain_id),
            format!("{}={}", CALL_GATEWAY_VARIABLE, self.id),
            "sip_copy_custom_headers=false".to_string(),
        ];

        let mut vars: Vec<_> = self.variables().into_iter().collect();
        vars.sort();
        for (key, value) in vars {
            parts.push(format!("{}='{}'", key, value));
        }

        format!("[{}]{}", parts.join(","), self.endpoint(destination))
    }
}

/// Verdict of the store after recording a dialing error
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceErrorResult {
    pub count_successively_error: Option<u16>,
    pub stopped: Option<bool>,
    pub un_reserve_resource_id: Option<i64>,
}

impl ResourceErrorResult {
    pub fn is_stopped(&self) -> bool {
        self.stopped.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(register: bool) -> SipGateway {
        SipGateway {
            id: 3,
            name: "gw".to_string(),
            updated_at: 1,
            register,
            proxy: "10.0.0.1:5060".to_string(),
            host_name: Some("carrier.example".to_string()),
            username: Some("user".to_string()),
            account: Some("sip:user@carrier.example".to_string()),
            password: Some("secret".to_string()),
            domain_id: 1,
        }
    }

    #[test]
    fn test_gateway_endpoint_strips_spaces() {
        assert_eq!(
            gateway(false).endpoint("+380 50 123"),
            "sofia/sip/+38050123@10.0.0.1:5060"
        );
    }

    #[test]
    fn test_registered_gateway_authenticates() {
        let vars = gateway(true).variables();
        assert_eq!(vars["sip_auth_username"], "user");
        assert!(!vars.contains_key("sip_invite_domain"));

        let vars = gateway(false).variables();
        assert_eq!(vars["sip_invite_domain"], "carrier.example");
        assert!(!vars.contains_key("sip_auth_username"));
    }

    #[test]
    fn test_bridge_string_shape() {
        let bridge = gateway(false).bridge("call-1", "John", "100", "200", 30);
        assert!(bridge.starts_with("[originate_timeout=30,cc_parent_id=call-1"));
        assert!(bridge.ends_with("]sofia/sip/100@10.0.0.1:5060"));
    }
}
