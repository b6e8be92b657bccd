//! Outbound dialing resources (trunks)

pub mod manager;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::model::{OutboundResourceConfig, SipGateway};

pub use manager::{DEFAULT_ENDPOINT_PATTERN, Endpoint, ResourceManager};

#[derive(Debug)]
struct RateWindow {
    started: Instant,
    count: u16,
}

/// In-flight calls and the current rate window of one trunk
///
/// Kept per resource id by the manager and shared by every snapshot of
/// that id, so a reload does not reset the count of held permits.
#[derive(Debug)]
pub struct ResourceUsage {
    active: AtomicU16,
    window: Mutex<RateWindow>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            active: AtomicU16::new(0),
            window: Mutex::new(RateWindow {
                started: Instant::now(),
                count: 0,
            }),
        }
    }
}

impl ResourceUsage {
    fn release(&self) {
        let _ = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                active.checked_sub(1)
            });
    }
}

/// Live resource built from a stored configuration snapshot
///
/// The snapshot is immutable; only the consecutive-error counter changes
/// while it is cached.
#[derive(Debug)]
pub struct Resource {
    config: OutboundResourceConfig,
    successively_errors: AtomicU16,
    usage: Arc<ResourceUsage>,
}

impl Resource {
    pub fn new(config: OutboundResourceConfig) -> Self {
        Self::with_usage(config, Arc::default())
    }

    pub fn with_usage(config: OutboundResourceConfig, usage: Arc<ResourceUsage>) -> Self {
        let errors = config.successively_errors;
        Self {
            config,
            successively_errors: AtomicU16::new(errors),
            usage,
        }
    }

    pub fn id(&self) -> i64 {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn updated_at(&self) -> i64 {
        self.config.updated_at
    }

    /// The caller carries a newer version than the cached snapshot
    pub fn is_expire(&self, updated_at: i64) -> bool {
        updated_at > self.config.updated_at
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_reserve(&self) -> bool {
        self.config.reserve
    }

    pub fn limit(&self) -> u16 {
        self.config.limit
    }

    pub fn rps(&self) -> u16 {
        self.config.rps
    }

    pub fn gateway(&self) -> Option<&SipGateway> {
        self.config.gateway.as_ref()
    }

    /// Resource variables, gateway variables underneath
    pub fn variables(&self) -> HashMap<String, String> {
        let mut vars = self
            .config
            .gateway
            .as_ref()
            .map(SipGateway::variables)
            .unwrap_or_default();
        vars.extend(self.config.variables.clone());
        vars
    }

    /// Dial string for `destination` through this resource
    pub fn dial_string(&self, destination: &str) -> String {
        match (&self.config.dial_string, &self.config.gateway) {
            (Some(template), _) => template.replace("{destination}", &destination.replace(' ', "")),
            (None, Some(gateway)) => gateway.endpoint(destination),
            (None, None) => destination.replace(' ', ""),
        }
    }

    /// Caller id shown to the member
    pub fn get_display(&self) -> Option<String> {
        self.config
            .display_numbers
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    pub fn successively_errors(&self) -> u16 {
        self.successively_errors.load(Ordering::SeqCst)
    }

    pub fn max_successively_errors(&self) -> u16 {
        self.config.max_successively_errors
    }

    pub(crate) fn set_successively_errors(&self, count: u16) {
        self.successively_errors.store(count, Ordering::SeqCst);
    }

    /// Whether a hangup cause counts against the error budget
    ///
    /// Causes listed in `error_ids` are suppressed, an `x` in a listed cause
    /// matches any single character (`4xx` suppresses every 4xx code).
    pub fn check_if_error(&self, cause: &str) -> bool {
        if cause.is_empty() {
            return false;
        }
        !self
            .config
            .error_ids
            .iter()
            .any(|pattern| cause_matches(pattern, cause))
    }

    /// Number of calls currently holding a permit
    pub fn active(&self) -> u16 {
        self.usage.active.load(Ordering::SeqCst)
    }

    /// Free concurrent slots, `u16::MAX` when unlimited
    pub fn free_capacity(&self) -> u16 {
        match self.config.limit {
            0 => u16::MAX,
            limit => limit.saturating_sub(self.active()),
        }
    }

    /// Reserve one call slot, `None` when the limit or the rate is exhausted
    ///
    /// A call refused by the limit does not count against the rate.
    pub fn take(self: &Arc<Self>) -> Option<ResourcePermit> {
        let limit = self.config.limit;
        self.usage
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (limit == 0 || active < limit).then_some(active + 1)
            })
            .ok()?;

        if self.config.rps > 0 {
            let mut window = self.usage.window.lock();
            if window.started.elapsed() >= Duration::from_secs(1) {
                window.started = Instant::now();
                window.count = 0;
            }
            if window.count >= self.config.rps {
                drop(window);
                self.usage.release();
                return None;
            }
            window.count += 1;
        }

        Some(ResourcePermit {
            resource: Arc::clone(self),
        })
    }
}

fn cause_matches(pattern: &str, cause: &str) -> bool {
    if pattern.len() != cause.len() {
        return false;
    }
    pattern
        .chars()
        .zip(cause.chars())
        .all(|(p, c)| p == 'x' || p == 'X' || p.eq_ignore_ascii_case(&c))
}

/// One in-flight call on a resource, released on drop
#[derive(Debug)]
pub struct ResourcePermit {
    resource: Arc<Resource>,
}

impl ResourcePermit {
    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }
}

impl Drop for ResourcePermit {
    fn drop(&mut self) {
        self.resource.usage.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(limit: u16, rps: u16) -> Arc<Resource> {
        let mut config = OutboundResourceConfig::new(1, "trunk", 1);
        config.limit = limit;
        config.rps = rps;
        config.error_ids = vec!["4xx".to_string(), "NO_ANSWER".to_string()];
        config.dial_string = Some("sofia/gateway/gw1/{destination}".to_string());
        Arc::new(Resource::new(config))
    }

    #[test]
    fn test_suppressed_causes() {
        let r = resource(0, 0);
        assert!(!r.check_if_error("486"));
        assert!(!r.check_if_error("NO_ANSWER"));
        assert!(r.check_if_error("503"));
        assert!(r.check_if_error("USER_BUSY"));
        assert!(!r.check_if_error(""));
    }

    #[test]
    fn test_limit_permits() {
        let r = resource(2, 0);
        let first = r.take().unwrap();
        let _second = r.take().unwrap();
        assert!(r.take().is_none());
        assert_eq!(r.free_capacity(), 0);

        drop(first);
        assert_eq!(r.active(), 1);
        assert!(r.take().is_some());
    }

    #[test]
    fn test_rate_window() {
        let r = resource(0, 1);
        let _first = r.take().unwrap();
        assert!(r.take().is_none());
        assert_eq!(r.active(), 1);
    }

    #[test]
    fn test_limit_refusal_keeps_rate_slot() {
        let r = resource(1, 2);
        let first = r.take().unwrap();
        assert!(r.take().is_none());
        assert!(r.take().is_none());

        drop(first);
        assert!(r.take().is_some());
    }

    #[test]
    fn test_usage_shared_between_snapshots() {
        let usage = Arc::new(ResourceUsage::default());
        let mut config = OutboundResourceConfig::new(1, "trunk", 10);
        config.limit = 1;
        let v10 = Arc::new(Resource::with_usage(config.clone(), usage.clone()));
        config.updated_at = 20;
        let v20 = Arc::new(Resource::with_usage(config, usage));

        let held = v10.take().unwrap();
        assert!(v20.take().is_none());
        assert_eq!(v20.free_capacity(), 0);

        drop(held);
        assert!(v20.take().is_some());
    }

    #[test]
    fn test_dial_string_template() {
        let r = resource(0, 0);
        assert_eq!(r.dial_string("+1 555"), "sofia/gateway/gw1/+1555");
        assert!(!r.is_expire(1));
        assert!(r.is_expire(2));
    }
}
