//! # Dialer Server
//!
//! Wires the managers of one dialer node together and owns their lifecycle.
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │              DialerServer               │
//! ├─────────────────────────────────────────┤
//! │        MemberApi  │  AgentApi           │
//! ├─────────────────────────────────────────┤
//! │    Dialing  →  QueueManager             │
//! ├─────────────────────────────────────────┤
//! │ AgentManager │ ResourceManager │ Calls  │
//! ├─────────────────────────────────────────┤
//! │        Store       │    MessageBus      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Examples
//!
//! ```rust,no_run
//! use rvoip_dialer_engine::call_manager::testing::MockCallCommands;
//! use rvoip_dialer_engine::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let mut server = DialerServerBuilder::new()
//!     .with_config(DialerConfig::default())
//!     .with_connection(MockCallCommands::new("node-1"))
//!     .build()
//!     .await?;
//!
//! server.start().await?;
//! // ... members are dialed, agents are offered ...
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Shutdown stops admission first, waits until every admitted attempt has
//! left, releases the members reserved for this node and only then closes
//! the telephony connections.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::agent::{AgentManager, AgentManagerImpl};
use crate::api::{AgentApi, MemberApi};
use crate::call_manager::{CallCommands, CallManager};
use crate::config::DialerConfig;
use crate::dialing::Dialing;
use crate::error::{DialerError, Result};
use crate::mq::{LocalBus, MessageBus};
use crate::queue::QueueManager;
use crate::resource::ResourceManager;
use crate::store::{MemoryStore, Store};

const LOCAL_BUS_CAPACITY: usize = 1024;

/// Install the global `fmt` subscriber
///
/// `RUST_LOG` wins over `filter`. A subscriber that is already installed is
/// left in place.
pub fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init();
}

/// One running dialer node
pub struct DialerServer {
    config: DialerConfig,
    store: Arc<dyn Store>,
    call_manager: Arc<CallManager>,
    agent_manager: Arc<dyn AgentManager>,
    queue_manager: Arc<QueueManager>,
    dialing: Arc<Dialing>,
    connections: Vec<Arc<dyn CallCommands>>,
    member_api: MemberApi,
    agent_api: AgentApi,
    running: bool,
}

impl DialerServer {
    pub fn new(
        config: DialerConfig,
        store: Arc<dyn Store>,
        bus: Arc<dyn MessageBus>,
        connections: Vec<Arc<dyn CallCommands>>,
    ) -> Result<Self> {
        config.validate().map_err(DialerError::configuration)?;

        let call_manager = CallManager::new(&config, bus.clone());
        let agent_manager: Arc<dyn AgentManager> = Arc::new(AgentManagerImpl::new(
            store.clone(),
            bus.clone(),
            &config.cache,
        ));
        let resource_manager = Arc::new(ResourceManager::new(store.clone(), &config.cache));
        let queue_manager = QueueManager::new(
            &config,
            store.clone(),
            bus,
            call_manager.clone(),
            agent_manager.clone(),
            resource_manager,
        );
        let dialing = Dialing::new(
            &config,
            store.clone(),
            queue_manager.clone(),
            agent_manager.clone(),
        );

        Ok(Self {
            member_api: MemberApi::new(queue_manager.clone()),
            agent_api: AgentApi::new(agent_manager.clone()),
            config,
            store,
            call_manager,
            agent_manager,
            queue_manager,
            dialing,
            connections,
            running: false,
        })
    }

    /// Bring the node up
    ///
    /// An unreachable store or telephony plane is fatal and nothing is left
    /// running.
    pub async fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(DialerError::internal("dialer server already started"));
        }

        self.store.ping().await?;
        info!("Store reachable");

        self.call_manager.start(self.connections.clone()).await?;
        info!(
            "Call manager started with {} connections",
            self.call_manager.count_connections()
        );

        if let Err(e) = self.queue_manager.start() {
            self.call_manager.stop().await;
            return Err(e);
        }
        self.dialing.start(CancellationToken::new());
        self.running = true;

        info!("Dialer node {} started", self.config.general.node_id);
        Ok(())
    }

    /// Drain and stop; calling it on a stopped server does nothing
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Ok(());
        }
        info!("Dialer node {} stopping", self.config.general.node_id);

        self.dialing.stop().await;
        self.call_manager.stop().await;
        self.running = false;

        info!("Dialer node {} stopped", self.config.general.node_id);
        Ok(())
    }

    /// Run until ctrl-c, then stop
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;
        self.display_info();

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
        self.stop().await
    }

    fn display_info(&self) {
        println!("\n📞 Dialer node {}", self.config.general.node_id);
        println!(
            "   polling every {:?}, {} telephony connections",
            self.config.dialing.polling_interval(),
            self.call_manager.count_connections()
        );
        println!("   press ctrl-c to drain and stop\n");
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn member_api(&self) -> &MemberApi {
        &self.member_api
    }

    pub fn agent_api(&self) -> &AgentApi {
        &self.agent_api
    }

    pub fn queue_manager(&self) -> &Arc<QueueManager> {
        &self.queue_manager
    }

    pub fn agent_manager(&self) -> &Arc<dyn AgentManager> {
        &self.agent_manager
    }

    pub fn dialing(&self) -> &Arc<Dialing> {
        &self.dialing
    }

    pub fn config(&self) -> &DialerConfig {
        &self.config
    }
}

/// Builder for DialerServer with fluent API
pub struct DialerServerBuilder {
    config: Option<DialerConfig>,
    store: Option<Arc<dyn Store>>,
    bus: Option<Arc<dyn MessageBus>>,
    connections: Vec<Arc<dyn CallCommands>>,
}

impl DialerServerBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            store: None,
            bus: None,
            connections: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: DialerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Shared store; an in-memory store is used when none is given
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Add a telephony control plane connection
    pub fn with_connection(mut self, connection: Arc<dyn CallCommands>) -> Self {
        self.connections.push(connection);
        self
    }

    pub async fn build(self) -> Result<DialerServer> {
        let config = self.config.unwrap_or_default();
        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryStore::new()),
        };
        let bus: Arc<dyn MessageBus> = match self.bus {
            Some(bus) => bus,
            None => LocalBus::new(LOCAL_BUS_CAPACITY),
        };

        DialerServer::new(config, store, bus, self.connections)
    }
}

impl Default for DialerServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call_manager::testing::MockCallCommands;

    #[tokio::test]
    async fn test_start_fails_without_connections() {
        let mut server = DialerServerBuilder::new().build().await.unwrap();
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, DialerError::Telephony(_)));
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut server = DialerServerBuilder::new()
            .with_connection(MockCallCommands::new("node-1"))
            .build()
            .await
            .unwrap();

        server.start().await.unwrap();
        assert!(server.is_running());
        assert!(server.start().await.is_err());

        server.stop().await.unwrap();
        assert!(!server.is_running());
        assert!(!server.queue_manager().is_accepting());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = DialerConfig::default();
        config.dialing.polling_interval_ms = 0;
        let result = DialerServerBuilder::new().with_config(config).build().await;
        assert!(matches!(result, Err(DialerError::Configuration(_))));
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        init_logging("info");
    }
}
