//! Queues and the attempt dispatch loop
//!
//! A queue is a distribution policy over [`Attempt`]s. The variants differ in
//! the order they engage the member leg, the agent and the dialing resource,
//! and all of them share the call handling of [`calling::CallingQueue`].
//!
//! | variant | first leg | then |
//! |---|---|---|
//! | [`PreviewQueue`] | agent | member through the bound resource |
//! | [`InboundQueue`] | member (already parked) | agent |
//! | [`ProgressiveQueue`] | member through the bound resource | agent |

pub mod attempt;
pub mod calling;
pub mod inbound;
pub mod manager;
pub mod preview;
pub mod progressive;

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use crate::agent::Agent;
use crate::model::{CallEvent, QueueSettings, QueueType};

pub use attempt::{Attempt, AttemptEvent, AttemptLogEntry};
pub use calling::CallingQueue;
pub use inbound::InboundQueue;
pub use manager::QueueManager;
pub use preview::PreviewQueue;
pub use progressive::ProgressiveQueue;

/// Capabilities every queue variant provides to the queue manager
#[async_trait]
pub trait QueueObject: Send + Sync {
    fn settings(&self) -> &QueueSettings;

    fn id(&self) -> i64 {
        self.settings().id
    }

    fn name(&self) -> &str {
        &self.settings().name
    }

    fn domain_id(&self) -> i64 {
        self.settings().domain_id
    }

    fn type_name(&self) -> &'static str {
        self.settings().queue_type.as_str()
    }

    fn updated_at(&self) -> i64 {
        self.settings().updated_at
    }

    /// The caller carries a newer configuration version than this object
    fn is_expire(&self, updated_at: i64) -> bool {
        updated_at > self.updated_at()
    }

    /// Admission of an attempt into the working set of the queue
    async fn join_attempt(&self, attempt: Arc<Attempt>);

    /// The store reserved `agent` for `attempt`
    async fn route_agent_to_attempt(&self, attempt: Arc<Attempt>, agent: Arc<Agent>);

    /// A telephony leg of the attempt ended
    async fn set_hangup_call(&self, attempt: Arc<Attempt>, event: CallEvent);
}

/// Build the variant for `settings`
pub fn new_queue(manager: Weak<QueueManager>, settings: QueueSettings) -> Arc<dyn QueueObject> {
    let base = Arc::new(CallingQueue::new(manager, settings));
    match base.settings().queue_type {
        QueueType::Preview => Arc::new(PreviewQueue::new(base)),
        QueueType::Inbound => Arc::new(InboundQueue::new(base)),
        QueueType::Progressive => Arc::new(ProgressiveQueue::new(base)),
    }
}
