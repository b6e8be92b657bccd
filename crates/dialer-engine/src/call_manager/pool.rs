use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;
use tracing::{info, warn};

use super::CallCommands;
use crate::error::{DialerError, Result};

/// Pool of control plane connections, one per call-control node
#[derive(Default)]
pub struct ConnectionPool {
    connections: RwLock<Vec<Arc<dyn CallCommands>>>,
    next: AtomicUsize,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, connection: Arc<dyn CallCommands>) {
        let mut connections = self.connections.write();
        connections.retain(|c| c.id() != connection.id());
        connections.push(connection);
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|c| c.id() != id);
        before != connections.len()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    pub fn all(&self) -> Vec<Arc<dyn CallCommands>> {
        self.connections.read().clone()
    }

    pub fn get_round_robin(&self) -> Result<Arc<dyn CallCommands>> {
        let connections = self.connections.read();
        if connections.is_empty() {
            return Err(DialerError::telephony("no call control connection"));
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % connections.len();
        Ok(connections[index].clone())
    }

    /// Sticky selection by node id
    pub fn get_by_id(&self, id: &str) -> Result<Arc<dyn CallCommands>> {
        self.connections
            .read()
            .iter()
            .find(|c| c.id() == id)
            .cloned()
            .ok_or_else(|| DialerError::telephony(format!("no call control connection {}", id)))
    }

    /// Drop connections whose version query fails
    pub async fn recheck_connections(&self) -> usize {
        let mut removed = 0;
        for connection in self.all() {
            match connection.server_version().await {
                Ok(_) => {}
                Err(e) => {
                    warn!("Connection [{}] failed health check: {}", connection.id(), e);
                    if self.remove(connection.id()) {
                        removed += 1;
                        info!("Connection [{}] removed from pool", connection.id());
                    }
                }
            }
        }
        removed
    }
}
