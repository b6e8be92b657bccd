use std::sync::Arc;

use dashmap::DashMap;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{Resource, ResourceUsage};
use crate::cache::ExpiringCache;
use crate::config::CacheConfig;
use crate::error::{DialerError, Result};
use crate::model::{ResourceErrorResult, ResourceStrategy};
use crate::store::Store;

/// Pattern used when a destination carries no routing pattern of its own
pub const DEFAULT_ENDPOINT_PATTERN: &str = "{dial_string}";

/// Dialable endpoint template
///
/// `{dial_string}` is replaced by the resource dial string and
/// `{destination}` by the member destination without spaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pattern: String,
}

impl Endpoint {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn parse(&self, dial_string: &str, destination: &str) -> String {
        self.pattern
            .replace("{dial_string}", dial_string)
            .replace("{destination}", &destination.replace(' ', ""))
    }
}

/// Owns the resource cache and the circuit breaker bookkeeping
pub struct ResourceManager {
    store: Arc<dyn Store>,
    resources: ExpiringCache<i64, Arc<Resource>>,
    endpoints: ExpiringCache<String, Arc<Endpoint>>,
    // permit accounting outlives cached snapshots
    usage: DashMap<i64, Arc<ResourceUsage>>,
    lock: Mutex<()>,
}

impl ResourceManager {
    pub fn new(store: Arc<dyn Store>, config: &CacheConfig) -> Self {
        Self {
            store,
            resources: ExpiringCache::new("resource", config.max_resources, config.expire()),
            endpoints: ExpiringCache::new("endpoint", config.max_resources, config.expire()),
            usage: DashMap::new(),
            lock: Mutex::new(()),
        }
    }

    /// Cached resource, reloaded when `updated_at` is newer than the cache
    ///
    /// A disabled (stopped) resource is never cached and fails with
    /// `CircuitOpen` until the store re-arms it.
    pub async fn get(&self, id: i64, updated_at: i64) -> Result<Arc<Resource>> {
        let _guard = self.lock.lock().await;

        if let Some(resource) = self.resources.get(&id) {
            if !resource.is_expire(updated_at) {
                return Ok(resource);
            }
        }

        let config = self.store.resources().get_resource(id).await?;
        if !config.enabled {
            self.resources.remove(&id);
            return Err(DialerError::CircuitOpen { id });
        }

        let usage = self.usage.entry(id).or_default().clone();
        let resource = Arc::new(Resource::with_usage(config, usage));
        self.resources.insert(id, resource.clone());
        debug!(
            "Add resource to cache ResourceId={} Name={}",
            resource.id(),
            resource.name()
        );
        Ok(resource)
    }

    pub fn remove_from_cache_by_id(&self, id: i64) {
        if self.resources.remove(&id).is_some() {
            debug!("Remove resource from cache ResourceId={}", id);
        }
    }

    pub fn cached(&self) -> usize {
        self.resources.len()
    }

    pub fn get_endpoint(&self, pattern: &str) -> Result<Arc<Endpoint>> {
        if let Some(endpoint) = self.endpoints.get(&pattern.to_string()) {
            return Ok(endpoint);
        }

        if !pattern.contains("{dial_string}") && !pattern.contains("{destination}") {
            return Err(DialerError::configuration(format!(
                "endpoint pattern \"{}\" has no placeholder",
                pattern
            )));
        }

        let endpoint = Arc::new(Endpoint {
            pattern: pattern.to_string(),
        });
        self.endpoints.insert(pattern.to_string(), endpoint.clone());
        Ok(endpoint)
    }

    /// Pick a resource among `ids` with `strategy`
    ///
    /// Resources that cannot be resolved (stopped, missing) and `exclude`
    /// are skipped. Reserve resources are only used when no regular one
    /// has free capacity.
    pub async fn select(
        &self,
        ids: &[i64],
        strategy: ResourceStrategy,
        exclude: Option<i64>,
    ) -> Option<Arc<Resource>> {
        let mut regular = Vec::new();
        let mut reserve = Vec::new();

        for id in ids.iter().copied().filter(|id| Some(*id) != exclude) {
            match self.get(id, 0).await {
                Ok(resource) if resource.free_capacity() == 0 => continue,
                Ok(resource) if resource.is_reserve() => reserve.push(resource),
                Ok(resource) => regular.push(resource),
                Err(e) => debug!("Skip ResourceId={}: {}", id, e),
            }
        }

        pick(regular, strategy).or_else(|| pick(reserve, strategy))
    }

    /// Report a failed call; returns the store verdict when the cause counts
    pub async fn report_error(
        &self,
        resource: &Resource,
        routing_id: Option<i64>,
        cause: &str,
    ) -> Result<Option<ResourceErrorResult>> {
        if !resource.check_if_error(cause) {
            debug!(
                "ResourceId={} cause {} is suppressed",
                resource.id(),
                cause
            );
            return Ok(None);
        }

        let verdict = self
            .store
            .resources()
            .set_error(resource.id(), routing_id, cause, ResourceStrategy::Random)
            .await?;

        if let Some(count) = verdict.count_successively_error {
            resource.set_successively_errors(count);
        }

        if verdict.is_stopped() {
            self.remove_from_cache_by_id(resource.id());
            warn!(
                "Resource {} [{}] stopped after {} successive errors, last cause {}",
                resource.name(),
                resource.id(),
                resource.successively_errors(),
                cause
            );
        } else {
            info!(
                "Resource {} [{}] error {} ({}/{})",
                resource.name(),
                resource.id(),
                cause,
                resource.successively_errors(),
                resource.max_successively_errors()
            );
        }

        if let Some(id) = verdict.un_reserve_resource_id {
            if id != resource.id() {
                self.remove_from_cache_by_id(id);
            }
        }

        Ok(Some(verdict))
    }

    /// Reset the error counter; no store write when it is already zero
    pub async fn report_success(&self, resource: &Resource) -> Result<()> {
        if resource.successively_errors() == 0 {
            return Ok(());
        }

        if let Err(e) = self
            .store
            .resources()
            .set_successively_errors(resource.id(), 0)
            .await
        {
            error!(
                "Reset errors of ResourceId={} failed: {}",
                resource.id(),
                e
            );
            return Err(e);
        }
        resource.set_successively_errors(0);
        debug!("ResourceId={} errors reset", resource.id());
        Ok(())
    }
}

fn pick(mut candidates: Vec<Arc<Resource>>, strategy: ResourceStrategy) -> Option<Arc<Resource>> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        ResourceStrategy::Random => {
            candidates.shuffle(&mut rand::thread_rng());
            candidates.into_iter().next()
        }
        ResourceStrategy::TopDown => candidates.into_iter().next(),
        ResourceStrategy::ByLimit => candidates.into_iter().max_by_key(|r| r.free_capacity()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutboundResourceConfig;
    use crate::store::MemoryStore;

    fn manager_with(configs: Vec<OutboundResourceConfig>) -> (Arc<MemoryStore>, ResourceManager) {
        let store = Arc::new(MemoryStore::new());
        for config in configs {
            store.add_resource(config);
        }
        let manager = ResourceManager::new(store.clone(), &CacheConfig::default());
        (store, manager)
    }

    #[tokio::test]
    async fn test_get_reloads_newer_version() {
        let (store, manager) = manager_with(vec![OutboundResourceConfig::new(1, "a", 10)]);
        let first = manager.get(1, 10).await.unwrap();
        let again = manager.get(1, 5).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let mut updated = OutboundResourceConfig::new(1, "a2", 20);
        updated.limit = 3;
        store.add_resource(updated);
        let reloaded = manager.get(1, 20).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert_eq!(reloaded.name(), "a2");
    }

    #[tokio::test]
    async fn test_permits_survive_reload() {
        let mut config = OutboundResourceConfig::new(1, "a", 10);
        config.limit = 1;
        let (store, manager) = manager_with(vec![config.clone()]);

        let v10 = manager.get(1, 10).await.unwrap();
        let held = v10.take().unwrap();

        config.updated_at = 20;
        store.add_resource(config);
        let v20 = manager.get(1, 20).await.unwrap();
        assert!(!Arc::ptr_eq(&v10, &v20));
        assert_eq!(v20.active(), 1);
        assert!(v20.take().is_none());
        assert!(
            manager
                .select(&[1], ResourceStrategy::TopDown, None)
                .await
                .is_none()
        );

        drop(held);
        assert!(v20.take().is_some());
    }

    #[tokio::test]
    async fn test_top_down_prefers_regular() {
        let mut reserve = OutboundResourceConfig::new(1, "backup", 1);
        reserve.reserve = true;
        let (_, manager) = manager_with(vec![
            reserve,
            OutboundResourceConfig::new(2, "main", 1),
            OutboundResourceConfig::new(3, "second", 1),
        ]);

        let picked = manager
            .select(&[1, 2, 3], ResourceStrategy::TopDown, None)
            .await
            .unwrap();
        assert_eq!(picked.id(), 2);

        let picked = manager
            .select(&[1, 2], ResourceStrategy::TopDown, Some(2))
            .await
            .unwrap();
        assert_eq!(picked.id(), 1);
    }

    #[tokio::test]
    async fn test_by_limit_picks_most_free() {
        let mut small = OutboundResourceConfig::new(1, "small", 1);
        small.limit = 2;
        let mut big = OutboundResourceConfig::new(2, "big", 1);
        big.limit = 10;
        let (_, manager) = manager_with(vec![small, big]);

        let picked = manager
            .select(&[1, 2], ResourceStrategy::ByLimit, None)
            .await
            .unwrap();
        assert_eq!(picked.id(), 2);
    }

    #[tokio::test]
    async fn test_suppressed_error_not_reported() {
        let mut config = OutboundResourceConfig::new(1, "a", 1);
        config.error_ids = vec!["NO_ANSWER".to_string()];
        config.max_successively_errors = 1;
        let (store, manager) = manager_with(vec![config]);

        let resource = manager.get(1, 1).await.unwrap();
        assert!(
            manager
                .report_error(&resource, None, "NO_ANSWER")
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(store.resource(1).unwrap().successively_errors, 0);
    }

    #[test]
    fn test_endpoint_parse() {
        let store = Arc::new(MemoryStore::new());
        let manager = ResourceManager::new(store, &CacheConfig::default());
        let endpoint = manager
            .get_endpoint("[cc_side=member]{dial_string}")
            .unwrap();
        assert_eq!(
            endpoint.parse("sofia/gateway/gw/100", "100"),
            "[cc_side=member]sofia/gateway/gw/100"
        );
        assert!(manager.get_endpoint("sofia/sip/static").is_err());
    }
}
