//! Telephony control plane
//!
//! The engine never speaks the control plane wire protocol itself: every
//! call-control node is reached through a [`CallCommands`] connection kept in
//! a [`ConnectionPool`]. [`CallManager`] owns the pool and the cache of live
//! [`Call`] legs, and turns call events from the bus into leg state changes.

pub mod call;
pub mod manager;
pub mod pool;
pub mod testing;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::model::CallRequest;

pub use call::{Call, CallDirection, CallState};
pub use manager::CallManager;
pub use pool::ConnectionPool;

/// Commands one call-control node accepts
#[async_trait]
pub trait CallCommands: Send + Sync {
    /// Node id, used for sticky selection
    fn id(&self) -> &str;

    /// Originate a call; the second value is the cause when the node
    /// hung the call up before returning
    async fn new_call(&self, request: &CallRequest) -> Result<(String, Option<String>)>;

    async fn hangup_call(&self, id: &str, cause: &str) -> Result<()>;

    /// Put an existing call on hold in the queue with routing variables
    async fn join_queue(
        &self,
        id: &str,
        ringtone: &str,
        variables: HashMap<String, String>,
    ) -> Result<()>;

    async fn server_version(&self) -> Result<String>;

    /// Sessions per second the node accepts
    async fn remote_sps(&self) -> Result<u32>;
}
